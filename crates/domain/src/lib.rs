//! Shared domain types for the coxswain workspace: error taxonomy,
//! configuration, the turn document model, memory nodes, workflow
//! definitions, interventions, claims, and stage recipes.

pub mod claim;
pub mod config;
pub mod error;
pub mod intervention;
pub mod node;
pub mod recipe;
pub mod turn;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
