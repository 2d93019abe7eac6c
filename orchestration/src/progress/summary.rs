//! Compact summaries extracted from unit output
//!
//! Executors are free-form, so extraction is heuristic: labeled lines such as
//! `Decision: use sqlite` or `- Files created: a.rs, b.rs` are collected
//! case-insensitively. When nothing is labeled, the first few non-empty
//! lines become key findings.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Labeled summary lines, optionally bulleted
static LABELED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*(?:[-*+]\s+)?(?P<label>files?\s+created|created|files?\s+modified|modified|decisions?|decided|key\s+findings?|findings?|found)\s*:\s*(?P<value>.+?)\s*$",
    )
    .expect("LABELED_LINE regex should compile")
});

/// Number of unlabeled lines kept as findings
const FALLBACK_FINDINGS: usize = 3;

/// Cap on a single summary entry
const MAX_ENTRY_CHARS: usize = 200;

/// Decisions, touched files and findings reported by a unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSummary {
    pub decisions: Vec<String>,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub key_findings: Vec<String>,
    /// Whether any labeled line was found
    pub labeled: bool,
}

impl OutputSummary {
    /// Extract a summary from raw executor output
    pub fn extract(output: &str) -> Self {
        let mut summary = Self::default();

        for caps in LABELED_LINE.captures_iter(output) {
            let label = caps["label"].to_lowercase();
            let value = caps["value"].trim();
            if value.is_empty() {
                continue;
            }
            summary.labeled = true;

            let label: String = label.split_whitespace().collect::<Vec<_>>().join(" ");
            match label.as_str() {
                "created" | "file created" | "files created" => {
                    push_files(&mut summary.files_created, value)
                }
                "modified" | "file modified" | "files modified" => {
                    push_files(&mut summary.files_modified, value)
                }
                "decision" | "decisions" | "decided" => {
                    push_unique(&mut summary.decisions, truncate(value))
                }
                _ => push_unique(&mut summary.key_findings, truncate(value)),
            }
        }

        if !summary.labeled {
            summary.key_findings = output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .take(FALLBACK_FINDINGS)
                .map(truncate)
                .collect();
        }

        summary
    }

    /// Created and modified files, deduplicated, in first-seen order
    pub fn files(&self) -> Vec<String> {
        let mut files = Vec::new();
        for f in self.files_created.iter().chain(&self.files_modified) {
            push_unique(&mut files, f.clone());
        }
        files
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
            && self.files_created.is_empty()
            && self.files_modified.is_empty()
            && self.key_findings.is_empty()
    }
}

fn push_files(into: &mut Vec<String>, value: &str) {
    for path in value.split(',') {
        let path = path.trim().trim_matches('`');
        if !path.is_empty() {
            push_unique(into, path.to_string());
        }
    }
}

fn push_unique(into: &mut Vec<String>, value: String) {
    if !into.contains(&value) {
        into.push(value);
    }
}

fn truncate(value: &str) -> String {
    if value.chars().count() <= MAX_ENTRY_CHARS {
        return value.to_string();
    }
    let cut: String = value.chars().take(MAX_ENTRY_CHARS).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_labeled_lines() {
        let output = "\
Wrote the storage layer.
- Decision: use sqlite for the cache
* Files created: src/cache.rs, `src/cache/schema.rs`
Modified: src/lib.rs
Key finding: the old cache leaked handles
";
        let summary = OutputSummary::extract(output);
        assert!(summary.labeled);
        assert_eq!(summary.decisions, vec!["use sqlite for the cache"]);
        assert_eq!(
            summary.files_created,
            vec!["src/cache.rs", "src/cache/schema.rs"]
        );
        assert_eq!(summary.files_modified, vec!["src/lib.rs"]);
        assert_eq!(summary.key_findings, vec!["the old cache leaked handles"]);
        assert_eq!(
            summary.files(),
            vec!["src/cache.rs", "src/cache/schema.rs", "src/lib.rs"]
        );
    }

    #[test]
    fn test_labels_are_case_insensitive() {
        let summary = OutputSummary::extract("DECIDED: ship it\nfound: a bug");
        assert_eq!(summary.decisions, vec!["ship it"]);
        assert_eq!(summary.key_findings, vec!["a bug"]);
    }

    #[test]
    fn test_unlabeled_output_falls_back_to_first_lines() {
        let summary = OutputSummary::extract("\nfirst\n\nsecond\nthird\nfourth\n");
        assert!(!summary.labeled);
        assert_eq!(summary.key_findings, vec!["first", "second", "third"]);
        assert!(summary.decisions.is_empty());
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let summary = OutputSummary::extract("Created: a.rs, a.rs\nModified: a.rs");
        assert_eq!(summary.files_created, vec!["a.rs"]);
        assert_eq!(summary.files(), vec!["a.rs"]);
    }

    #[test]
    fn test_long_entries_are_truncated() {
        let long = "x".repeat(500);
        let summary = OutputSummary::extract(&format!("Decision: {long}"));
        assert!(summary.decisions[0].ends_with("..."));
        assert_eq!(summary.decisions[0].chars().count(), MAX_ENTRY_CHARS + 3);
    }

    #[test]
    fn test_empty_output_gives_empty_summary() {
        assert!(OutputSummary::extract("").is_empty());
    }
}
