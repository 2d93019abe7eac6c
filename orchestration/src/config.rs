//! Pipeline files
//!
//! A pipeline file is TOML holding the definition, orchestrator settings and
//! gate thresholds of one pipeline:
//!
//! ```toml
//! name = "payments-service"
//! reference_gates = true
//!
//! [orchestrator]
//! max_concurrency = 2
//!
//! [[phases]]
//! name = "design"
//!
//! [[phases.units]]
//! id = "api"
//! task = "Design the public API"
//! output_domain = "architecture"
//!
//! [gates.design]
//! min_composite = 0.80
//! ```
//!
//! With `reference_gates`, phases are mapped in order onto the reference
//! threshold progression and any `[gates.*]` entry replaces the mapped one.

use crate::definition::{Phase, PipelineDefinition};
use crate::error::{PersistenceError, PersistenceResult};
use crate::gate::GateTable;
use crate::orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Parsed pipeline file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    pub name: String,
    #[serde(default)]
    pub reference_gates: bool,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub gates: GateTable,
}

impl PipelineFile {
    pub fn load(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PersistenceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::parse(&content, path)?;
        debug!(path = %path.display(), pipeline = %file.name, phases = file.phases.len(), "Loaded pipeline file");
        Ok(file)
    }

    pub fn from_toml_str(content: &str) -> PersistenceResult<Self> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, path: &Path) -> PersistenceResult<Self> {
        toml::from_str(content).map_err(|source| PersistenceError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Gate table with reference mapping and explicit entries applied
    pub fn gate_table(&self) -> GateTable {
        let mut table = if self.reference_gates {
            GateTable::progression(self.phases.iter().map(|p| p.name.clone()))
        } else {
            GateTable::new()
        };
        for (phase, config) in self.gates.phases() {
            table.insert(phase.clone(), config.clone());
        }
        table
    }

    /// Split into definition, settings and gates, validating the definition
    /// and that every phase has a gate
    pub fn into_parts(self) -> PersistenceResult<(PipelineDefinition, OrchestratorConfig, GateTable)> {
        let gates = self.gate_table();
        let definition = PipelineDefinition {
            name: self.name,
            phases: self.phases,
        };
        definition.validate()?;
        gates.covers(&definition)?;
        self.orchestrator.validate()?;
        Ok((definition, self.orchestrator, gates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ClaimOp;
    use crate::error::DefinitionError;
    use crate::orchestrator::ClaimScope;

    const PIPELINE: &str = r#"
name = "payments"
reference_gates = true

[orchestrator]
max_concurrency = 2
claim_scope = "run"

[[phases]]
name = "design"

[[phases.units]]
id = "api"
task = "Design the API"
output_domain = "architecture"
files = [{ path = "docs/api.md" }]

[[phases.units]]
id = "schema"
task = "Design the schema"
depends_on = ["api"]
files = [{ path = "docs/api.md", op = "read" }]

[[phases]]
name = "implementation"

[[phases.units]]
id = "handlers"
task = "Implement handlers"
inputs = ["api"]
critical = true

[gates.implementation]
min_composite = 0.5
"#;

    #[test]
    fn test_parse_pipeline_file() {
        let file = PipelineFile::from_toml_str(PIPELINE).unwrap();
        assert_eq!(file.name, "payments");
        assert_eq!(file.orchestrator.max_concurrency, 2);
        assert_eq!(file.orchestrator.claim_scope, ClaimScope::Run);
        assert_eq!(file.orchestrator.max_retries, 3);
        assert_eq!(file.phases[0].units[0].files[0].op, ClaimOp::Write);
        assert_eq!(file.phases[0].units[1].files[0].op, ClaimOp::Read);
        assert!(file.phases[1].units[0].critical);
    }

    #[test]
    fn test_reference_mapping_with_explicit_override() {
        let file = PipelineFile::from_toml_str(PIPELINE).unwrap();
        let table = file.gate_table();
        // design is first in this pipeline and gets the first reference entry
        assert_eq!(table.get("design").unwrap().min_composite, 0.75);
        assert_eq!(table.get("implementation").unwrap().min_composite, 0.5);
    }

    #[test]
    fn test_into_parts_validates() {
        let (definition, config, gates) = PipelineFile::from_toml_str(PIPELINE)
            .unwrap()
            .into_parts()
            .unwrap();
        assert_eq!(definition.phases.len(), 2);
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(gates.len(), 2);
    }

    #[test]
    fn test_missing_gate_is_rejected() {
        let content = PIPELINE.replace("reference_gates = true", "reference_gates = false");
        let err = PipelineFile::from_toml_str(&content)
            .unwrap()
            .into_parts()
            .unwrap_err();
        assert!(matches!(
            err,
            PersistenceError::Definition(DefinitionError::MissingGate { ref phase }) if phase == "design"
        ));
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let err = PipelineFile::from_toml_str("name = ").unwrap_err();
        assert!(err.to_string().contains("<inline>"));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, PIPELINE).unwrap();
        let file = PipelineFile::load(&path).unwrap();
        assert_eq!(file.phases.len(), 2);
    }
}
