//! Workflow registry: loads declarative YAML definitions and matches
//! parsed commands against them by intent, phrase, pattern, semantics, or
//! keywords.

pub mod loader;
pub mod registry;

pub use registry::{MatchStrategy, WorkflowMatch, WorkflowRegistry};
