//! Progress tracking shared between concurrently running units
//!
//! - [`store`]: per-unit status records with forward-only transitions
//! - [`summary`]: decisions, files and findings extracted from unit output

pub mod store;
pub mod summary;

pub use store::{ProgressRecord, ProgressStore, SharedProgressStore, UnitStatus};
pub use summary::OutputSummary;
