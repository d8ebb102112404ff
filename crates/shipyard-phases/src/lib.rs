//! Phase machinery for Shipyard builds.
//!
//! A build runs six phases in a fixed order. The [`PhaseManager`] enforces
//! that order, the [`PhaseValidator`] decides whether a phase may close, and
//! the [`PhaseTransitionService`] moves a project to the next phase while
//! archiving what the old one produced. [`BuildPipeline`] ties these to the
//! orchestrator so a build can be started and advanced from one place.
//!
//! # Main types
//!
//! - [`PhaseManager`]: Per-project phase state machine.
//! - [`PhaseValidator`]: Five-criterion completion gate.
//! - [`PhaseTransitionService`]: Validate, archive, notify, transition, report.
//! - [`BuildPipeline`]: Starts builds and advances them when phases are ready.
//! - [`PhaseArchive`] / [`JsonReportStore`]: File-system persistence.

/// Phase artifact archive.
pub mod archive;
/// Default deliverables and staffing per phase.
pub mod catalog;
/// Phase state machine.
pub mod manager;
/// Build driver.
pub mod pipeline;
/// Transition reports and their store.
pub mod report;
/// Phase transitions.
pub mod transition;
/// Completion criteria.
pub mod validator;

pub use archive::{ArchiveManifest, ArchivedArtifact, PhaseArchive};
pub use catalog::{default_deliverables, phase_agent_types, DeliverableTemplate};
pub use manager::{PhaseManager, PhaseRecord, QualitySnapshot};
pub use pipeline::{Advance, BuildPipeline};
pub use report::{JsonReportStore, TransitionReport};
pub use transition::{CompletedTransition, PhaseTransitionService};
pub use validator::{
    Criterion, CriterionResult, PhaseValidator, ValidationResult, ValidatorConfig,
    APPROVAL_GATE_KIND,
};
