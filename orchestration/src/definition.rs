//! Pipeline definition: phases, work units and intra-phase dependency graphs
//!
//! A pipeline is an ordered list of phases. Each phase holds work units whose
//! dependencies form a DAG confined to that phase. Validation runs once,
//! before anything is dispatched, and rejects:
//! - empty pipelines/phases, duplicate phase names or unit ids
//! - dependencies on units outside the phase, self-dependencies, cycles
//! - declared inputs that are unknown, from a later phase, or never stored

use crate::error::{DefinitionError, DefinitionResult};
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// Unique identifier of a work unit (unique across the pipeline)
pub type UnitId = String;

/// Name of a phase
pub type PhaseName = String;

/// Kind of access a unit intends on a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOp {
    Read,
    #[default]
    Write,
}

impl std::fmt::Display for ClaimOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// A file a unit declares it will touch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIntent {
    pub path: String,
    #[serde(default)]
    pub op: ClaimOp,
}

impl FileIntent {
    pub fn write(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: ClaimOp::Write,
        }
    }

    pub fn read(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            op: ClaimOp::Read,
        }
    }
}

/// One schedulable task inside a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitSpec {
    pub id: UnitId,
    /// Task description handed to the executor
    pub task: String,
    /// Units in the same phase that must succeed first
    #[serde(default)]
    pub depends_on: Vec<UnitId>,
    /// Storage domain the unit's output is written to, if any
    #[serde(default)]
    pub output_domain: Option<String>,
    /// Units (same or earlier phase) whose stored outputs feed this unit's prompt
    #[serde(default)]
    pub inputs: Vec<UnitId>,
    /// Files the unit intends to touch
    #[serde(default)]
    pub files: Vec<FileIntent>,
    /// A failure of this unit aborts the whole pipeline
    #[serde(default)]
    pub critical: bool,
}

impl WorkUnitSpec {
    pub fn new(id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            depends_on: Vec::new(),
            output_domain: None,
            inputs: Vec::new(),
            files: Vec::new(),
            critical: false,
        }
    }

    /// Add a same-phase dependency
    pub fn depends_on(mut self, unit: impl Into<String>) -> Self {
        self.depends_on.push(unit.into());
        self
    }

    /// Store the unit's output under `domain`
    pub fn with_output_domain(mut self, domain: impl Into<String>) -> Self {
        self.output_domain = Some(domain.into());
        self
    }

    /// Feed another unit's stored output into this unit's prompt
    pub fn with_input(mut self, unit: impl Into<String>) -> Self {
        self.inputs.push(unit.into());
        self
    }

    pub fn with_file(mut self, intent: FileIntent) -> Self {
        self.files.push(intent);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// A named group of work units, gated as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: PhaseName,
    pub units: Vec<WorkUnitSpec>,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: Vec::new(),
        }
    }

    pub fn with_unit(mut self, unit: WorkUnitSpec) -> Self {
        self.units.push(unit);
        self
    }

    pub fn unit(&self, id: &str) -> Option<&WorkUnitSpec> {
        self.units.iter().find(|u| u.id == id)
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.iter().map(|u| u.id.clone()).collect()
    }
}

/// Ordered list of phases making up a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub phases: Vec<Phase>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    pub fn phase(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Locate a unit anywhere in the pipeline, returning its phase index too
    pub fn find_unit(&self, id: &str) -> Option<(usize, &WorkUnitSpec)> {
        self.phases
            .iter()
            .enumerate()
            .find_map(|(idx, p)| p.unit(id).map(|u| (idx, u)))
    }

    /// Validate structure and build each phase's dependency graph.
    ///
    /// Returns one graph per phase, in phase order.
    pub fn validate(&self) -> DefinitionResult<Vec<UnitGraph>> {
        if self.phases.is_empty() {
            return Err(DefinitionError::EmptyPipeline {
                pipeline: self.name.clone(),
            });
        }

        let mut phase_names = HashSet::new();
        let mut unit_phase: HashMap<&str, usize> = HashMap::new();
        for (idx, phase) in self.phases.iter().enumerate() {
            if !phase_names.insert(phase.name.as_str()) {
                return Err(DefinitionError::DuplicatePhase {
                    phase: phase.name.clone(),
                });
            }
            for unit in &phase.units {
                if unit_phase.insert(unit.id.as_str(), idx).is_some() {
                    return Err(DefinitionError::DuplicateUnit {
                        phase: phase.name.clone(),
                        unit: unit.id.clone(),
                    });
                }
            }
        }

        let mut graphs = Vec::with_capacity(self.phases.len());
        for (idx, phase) in self.phases.iter().enumerate() {
            graphs.push(UnitGraph::build(phase)?);

            for unit in &phase.units {
                for input in &unit.inputs {
                    let Some(&input_idx) = unit_phase.get(input.as_str()) else {
                        return Err(DefinitionError::UnknownInput {
                            unit: unit.id.clone(),
                            input: input.clone(),
                        });
                    };
                    if input_idx > idx {
                        return Err(DefinitionError::InputFromLaterPhase {
                            phase: phase.name.clone(),
                            unit: unit.id.clone(),
                            input: input.clone(),
                            input_phase: self.phases[input_idx].name.clone(),
                        });
                    }
                    let has_domain = self.phases[input_idx]
                        .unit(input)
                        .is_some_and(|u| u.output_domain.is_some());
                    if !has_domain {
                        return Err(DefinitionError::InputWithoutDomain {
                            unit: unit.id.clone(),
                            input: input.clone(),
                        });
                    }
                }
            }
        }

        Ok(graphs)
    }
}

/// Dependency DAG of the units in one phase.
///
/// Node indices follow declaration order, which is the tie-break for every
/// ordering this type produces.
#[derive(Debug, Clone)]
pub struct UnitGraph {
    phase: PhaseName,
    graph: DiGraph<UnitId, ()>,
    index: HashMap<UnitId, NodeIndex>,
}

impl UnitGraph {
    /// Build and validate the graph for a phase
    pub fn build(phase: &Phase) -> DefinitionResult<Self> {
        if phase.units.is_empty() {
            return Err(DefinitionError::EmptyPhase {
                phase: phase.name.clone(),
            });
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for unit in &phase.units {
            if index.contains_key(&unit.id) {
                return Err(DefinitionError::DuplicateUnit {
                    phase: phase.name.clone(),
                    unit: unit.id.clone(),
                });
            }
            let node = graph.add_node(unit.id.clone());
            index.insert(unit.id.clone(), node);
        }

        // Edge direction: dependency -> dependent
        for unit in &phase.units {
            let to = index[&unit.id];
            for dep in &unit.depends_on {
                if dep == &unit.id {
                    return Err(DefinitionError::SelfDependency {
                        phase: phase.name.clone(),
                        unit: unit.id.clone(),
                    });
                }
                let Some(&from) = index.get(dep) else {
                    return Err(DefinitionError::UnknownDependency {
                        phase: phase.name.clone(),
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                graph.update_edge(from, to, ());
            }
        }

        let cyclic: BTreeSet<String> = tarjan_scc(&graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .flatten()
            .map(|node| graph[node].clone())
            .collect();
        if !cyclic.is_empty() {
            return Err(DefinitionError::DependencyCycle {
                phase: phase.name.clone(),
                units: cyclic.into_iter().collect(),
            });
        }

        Ok(Self {
            phase: phase.name.clone(),
            graph,
            index,
        })
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, unit: &str) -> bool {
        self.index.contains_key(unit)
    }

    /// Direct dependencies of a unit, in declaration order
    pub fn dependencies(&self, unit: &str) -> Vec<UnitId> {
        self.neighbors(unit, Direction::Incoming)
    }

    /// Direct dependents of a unit, in declaration order
    pub fn dependents(&self, unit: &str) -> Vec<UnitId> {
        self.neighbors(unit, Direction::Outgoing)
    }

    fn neighbors(&self, unit: &str, dir: Direction) -> Vec<UnitId> {
        let Some(&node) = self.index.get(unit) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(node, dir).collect();
        nodes.sort();
        nodes.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Every unit reachable downstream of `unit`, in declaration order
    pub fn transitive_dependents(&self, unit: &str) -> Vec<UnitId> {
        let Some(&start) = self.index.get(unit) else {
            return Vec::new();
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Kahn topological order; among ready units, declaration order wins
    pub fn topological_order(&self) -> Vec<UnitId> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(node)) = ready.pop() {
            order.push(self.graph[node].clone());
            for next in self.graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
        order
    }

    /// Group units into waves: each wave depends only on earlier waves
    pub fn waves(&self) -> Vec<Vec<UnitId>> {
        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        let mut waves: Vec<Vec<UnitId>> = Vec::new();
        for id in self.topological_order() {
            let node = self.index[&id];
            let level = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|dep| depth[&dep] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, level);
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(id);
        }
        waves
    }
}
