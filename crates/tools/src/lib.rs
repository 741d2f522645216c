//! Tool execution: permission gating (mode gate, repository scope, human
//! approval), the HTTP tool transport, claim extraction, and the workflow
//! step engine.

pub mod approval;
pub mod claims;
pub mod engine;
pub mod executor;
pub mod permissions;
pub mod transport;

pub use approval::{ApprovalDecision, ApprovalInfo, ApprovalStore};
pub use executor::{ExecutionOutcome, ExecutionStatus, ToolExecutor};
pub use permissions::{GateOutcome, PermissionGate};
pub use transport::{HttpToolTransport, ToolTransport};
