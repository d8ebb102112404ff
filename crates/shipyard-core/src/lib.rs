//! Core types and error definitions for the Shipyard build orchestrator.
//!
//! This crate provides the foundational types shared across all Shipyard crates:
//! the unified error type, the closed set of agent roles, the six build phases,
//! deliverables, and human-approval gates together with their collaborator
//! contracts.
//!
//! # Main types
//!
//! - [`ShipyardError`]: Unified error enum for all Shipyard subsystems.
//! - [`ShipyardResult`]: Convenience alias for `Result<T, ShipyardError>`.
//! - [`AgentType`]: Closed enumeration of agent roles.
//! - [`PhaseName`]: The six ordered build phases.
//! - [`Deliverable`] / [`DeliverableStore`]: Tracked phase outputs.
//! - [`Gate`] / [`GateStore`]: Human-approval gates.
//! - [`AutonomyLevel`]: Per-project escalation policy.

/// Agent role enumeration.
pub mod agent_type;
/// Human-approval gates and autonomy policy.
pub mod approval;
/// Deliverables and their stores.
pub mod deliverable;
/// Build phase names and statuses.
pub mod phase;

pub use agent_type::AgentType;
pub use approval::{
    approval_required, AutonomyLevel, Gate, GateStatus, GateStore, InMemoryGateStore,
};
pub use deliverable::{
    Deliverable, DeliverableKind, DeliverableStatus, DeliverableStore, InMemoryDeliverableStore,
};
pub use phase::{PhaseName, PhaseStatus};

// --- Error types ---

/// Top-level error type for Shipyard.
///
/// Variants follow the failure taxonomy: invariant violations fail loudly,
/// missing collaborators report `NotConfigured`, and everything else carries
/// the subsystem that produced it.
#[derive(Debug, thiserror::Error)]
pub enum ShipyardError {
    /// A required argument was empty or malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A hub-and-spoke routing rule was violated.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// An operation needed a collaborator that was never configured.
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// A referenced agent, task, phase, deliverable or gate does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An illegal phase state-machine operation.
    #[error("Phase error: {0}")]
    Phase(String),

    /// A phase failed its completion gate.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An error raised by an agent while running a task.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A bounded operation exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An error from the orchestration hub or decision engine.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`ShipyardError`].
pub type ShipyardResult<T> = Result<T, ShipyardError>;

/// Generate a fresh opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
