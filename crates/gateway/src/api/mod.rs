//! Inbound HTTP API.

pub mod admin;
pub mod chat;
pub mod permissions;
pub mod router;

pub use router::build_router;
