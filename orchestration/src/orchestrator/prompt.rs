//! Prompt assembly for dispatched units
//!
//! A prompt is the unit's task, the peer briefing, any upstream outputs the
//! unit declared as inputs, and remediation hints on retried attempts. A
//! storage miss never fails the unit; it becomes retrieval instructions.

use crate::collaborators::ArtifactStorage;
use crate::definition::{UnitId, WorkUnitSpec};
use crate::error::{StorageError, StorageResult};
use std::collections::HashMap;
use std::fmt::Write;
use tracing::{debug, warn};

/// An upstream output resolved for a prompt
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamInput {
    Available {
        unit: UnitId,
        domain: String,
        content: String,
        truncated: bool,
    },
    Missing {
        unit: UnitId,
        domain: String,
        reason: String,
    },
}

/// Resolve a unit's declared inputs from storage.
///
/// `domains` maps producer unit ids to their output domain. Unavailable
/// storage degrades to [`UpstreamInput::Missing`]; malformed data is returned
/// as an error for the caller to attribute.
pub async fn fetch_inputs(
    storage: &dyn ArtifactStorage,
    unit: &WorkUnitSpec,
    domains: &HashMap<UnitId, String>,
    max_chars: usize,
) -> StorageResult<Vec<UpstreamInput>> {
    let mut inputs = Vec::with_capacity(unit.inputs.len());
    for input in &unit.inputs {
        let Some(domain) = domains.get(input) else {
            inputs.push(UpstreamInput::Missing {
                unit: input.clone(),
                domain: String::new(),
                reason: "producer has no output domain".into(),
            });
            continue;
        };
        match storage.get(domain, input).await {
            Ok(Some(content)) => {
                let truncated = content.chars().count() > max_chars;
                let content = if truncated {
                    content.chars().take(max_chars).collect()
                } else {
                    content
                };
                inputs.push(UpstreamInput::Available {
                    unit: input.clone(),
                    domain: domain.clone(),
                    content,
                    truncated,
                });
            }
            Ok(None) => {
                debug!(unit = %unit.id, input = %input, %domain, "Upstream output not found");
                inputs.push(UpstreamInput::Missing {
                    unit: input.clone(),
                    domain: domain.clone(),
                    reason: "not found in storage".into(),
                });
            }
            Err(StorageError::Unavailable(reason)) => {
                warn!(unit = %unit.id, input = %input, %domain, %reason, "Storage unavailable, using fallback instructions");
                inputs.push(UpstreamInput::Missing {
                    unit: input.clone(),
                    domain: domain.clone(),
                    reason,
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(inputs)
}

/// Assemble the prompt handed to the executor
pub fn build_prompt(
    unit: &WorkUnitSpec,
    phase: &str,
    attempt: u32,
    briefing: &str,
    inputs: &[UpstreamInput],
    remediation: &[String],
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Task: {} (phase: {phase}, attempt {attempt})\n", unit.id);
    out.push_str(unit.task.trim());
    out.push_str("\n\n");

    out.push_str(briefing.trim_end());
    out.push_str("\n\n");

    if !inputs.is_empty() {
        out.push_str("## Upstream Inputs\n");
        for input in inputs {
            match input {
                UpstreamInput::Available {
                    unit,
                    domain,
                    content,
                    truncated,
                } => {
                    let _ = writeln!(out, "\n### {unit} ({domain})\n{}", content.trim_end());
                    if *truncated {
                        out.push_str("[output truncated]\n");
                    }
                }
                UpstreamInput::Missing {
                    unit,
                    domain,
                    reason,
                } => {
                    let _ = writeln!(
                        out,
                        "\n### {unit} ({domain})\nOutput unavailable ({reason}). Retrieve it yourself: look for the artifacts of unit '{unit}' under '{domain}', or reconstruct the decisions it made from the files it touched.",
                    );
                }
            }
        }
        out.push('\n');
    }

    if !remediation.is_empty() {
        out.push_str("## Remediation From Previous Attempt\nThe previous attempt failed its quality gate. Address each point:\n");
        for hint in remediation {
            let _ = writeln!(out, "- {hint}");
        }
        out.push('\n');
    }

    if !unit.files.is_empty() {
        out.push_str("## Files You Claimed\n");
        for file in &unit.files {
            let _ = writeln!(out, "- {} ({})", file.path, file.op);
        }
        out.push('\n');
    }

    out.push_str(
        "## Reporting\nEnd your output with labeled lines: `Decision:`, `Files created:`, `Files modified:` and `Finding:`.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryStorage;
    use crate::definition::FileIntent;
    use async_trait::async_trait;

    fn consumer() -> WorkUnitSpec {
        WorkUnitSpec::new("impl", "Implement the API")
            .with_input("design")
            .with_input("schema")
    }

    fn domains() -> HashMap<UnitId, String> {
        HashMap::from([
            ("design".to_string(), "architecture".to_string()),
            ("schema".to_string(), "data".to_string()),
        ])
    }

    #[tokio::test]
    async fn test_fetch_inputs_hit_and_miss() {
        let storage = InMemoryStorage::new();
        storage
            .put("architecture", "design", "Layered, REST")
            .await
            .unwrap();

        let inputs = fetch_inputs(&storage, &consumer(), &domains(), 100)
            .await
            .unwrap();
        assert!(matches!(&inputs[0], UpstreamInput::Available { content, .. } if content == "Layered, REST"));
        assert!(matches!(&inputs[1], UpstreamInput::Missing { unit, .. } if unit == "schema"));
    }

    #[tokio::test]
    async fn test_fetch_inputs_truncates() {
        let storage = InMemoryStorage::new();
        storage.put("architecture", "design", "abcdefgh").await.unwrap();
        let unit = WorkUnitSpec::new("impl", "t").with_input("design");
        let inputs = fetch_inputs(&storage, &unit, &domains(), 3).await.unwrap();
        assert_eq!(
            inputs[0],
            UpstreamInput::Available {
                unit: "design".into(),
                domain: "architecture".into(),
                content: "abc".into(),
                truncated: true,
            }
        );
    }

    struct BrokenStorage(StorageError);

    #[async_trait]
    impl ArtifactStorage for BrokenStorage {
        async fn put(&self, _: &str, _: &str, _: &str) -> StorageResult<()> {
            Err(self.0.clone())
        }
        async fn get(&self, _: &str, _: &str) -> StorageResult<Option<String>> {
            Err(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_unavailable_storage_degrades_to_missing() {
        let storage = BrokenStorage(StorageError::Unavailable("connection refused".into()));
        let inputs = fetch_inputs(&storage, &consumer(), &domains(), 100)
            .await
            .unwrap();
        assert!(inputs
            .iter()
            .all(|i| matches!(i, UpstreamInput::Missing { reason, .. } if reason == "connection refused")));
    }

    #[tokio::test]
    async fn test_malformed_storage_is_an_error() {
        let storage = BrokenStorage(StorageError::Malformed {
            domain: "architecture".into(),
            key: "design".into(),
            message: "not utf-8".into(),
        });
        assert!(fetch_inputs(&storage, &consumer(), &domains(), 100)
            .await
            .is_err());
    }

    #[test]
    fn test_prompt_sections() {
        let unit = consumer().with_file(FileIntent::write("src/api.rs"));
        let inputs = vec![
            UpstreamInput::Available {
                unit: "design".into(),
                domain: "architecture".into(),
                content: "Layered".into(),
                truncated: false,
            },
            UpstreamInput::Missing {
                unit: "schema".into(),
                domain: "data".into(),
                reason: "not found in storage".into(),
            },
        ];
        let hints = vec!["security score 0.60 below threshold 0.80: re-examine input validation".to_string()];
        let prompt = build_prompt(&unit, "implementation", 2, "## Situational Awareness\nquiet", &inputs, &hints);

        assert!(prompt.starts_with("# Task: impl (phase: implementation, attempt 2)"));
        assert!(prompt.contains("Implement the API"));
        assert!(prompt.contains("## Situational Awareness"));
        assert!(prompt.contains("### design (architecture)\nLayered"));
        assert!(prompt.contains("Retrieve it yourself"));
        assert!(prompt.contains("## Remediation From Previous Attempt"));
        assert!(prompt.contains("- src/api.rs (write)"));
        assert!(prompt.contains("`Decision:`"));
    }

    #[test]
    fn test_first_attempt_has_no_remediation_section() {
        let unit = WorkUnitSpec::new("a", "Do it");
        let prompt = build_prompt(&unit, "design", 1, "brief", &[], &[]);
        assert!(!prompt.contains("Remediation"));
        assert!(!prompt.contains("Upstream Inputs"));
    }
}
