use crate::manager::PhaseManager;
use serde::{Deserialize, Serialize};
use shipyard_core::{
    approval_required, DeliverableStore, Gate, GateStatus, GateStore, PhaseName, ShipyardResult,
};
use std::sync::Arc;
use tracing::{debug, info};

/// Default minimum line coverage, in percent.
pub const DEFAULT_COVERAGE_THRESHOLD: f64 = 90.0;

/// Default distance below the threshold that only warns.
pub const DEFAULT_COVERAGE_MARGIN: f64 = 10.0;

/// `context.kind` of gates that grant phase sign-off.
pub const APPROVAL_GATE_KIND: &str = "phase_approval";

/// Thresholds for the quality criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    pub coverage_threshold: f64,
    pub coverage_margin: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: DEFAULT_COVERAGE_THRESHOLD,
            coverage_margin: DEFAULT_COVERAGE_MARGIN,
        }
    }
}

impl ValidatorConfig {
    pub fn with_coverage_threshold(mut self, threshold: f64) -> Self {
        self.coverage_threshold = threshold;
        self
    }

    pub fn with_coverage_margin(mut self, margin: f64) -> Self {
        self.coverage_margin = margin;
        self
    }
}

/// The five completion criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Deliverables,
    Tests,
    Coverage,
    PendingGates,
    Approval,
}

/// Outcome of one criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub criterion: Criterion,
    pub passed: bool,
    pub detail: String,
}

/// Aggregate verdict on whether a phase may close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub phase: PhaseName,
    /// True iff there are no blockers.
    pub can_complete: bool,
    /// Fraction of criteria passed, in `[0, 1]`.
    pub score: f64,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    pub criteria: Vec<CriterionResult>,
    /// Sign-off is required at this autonomy level and has not been given.
    pub requires_approval: bool,
}

#[derive(Default)]
struct Verdict {
    criteria: Vec<CriterionResult>,
    blockers: Vec<String>,
    warnings: Vec<String>,
}

impl Verdict {
    fn pass(&mut self, criterion: Criterion, detail: impl Into<String>) {
        self.criteria.push(CriterionResult {
            criterion,
            passed: true,
            detail: detail.into(),
        });
    }

    fn pass_with_warning(&mut self, criterion: Criterion, detail: impl Into<String>) {
        let detail = detail.into();
        self.warnings.push(detail.clone());
        self.pass(criterion, detail);
    }

    fn warn(&mut self, criterion: Criterion, detail: impl Into<String>) {
        let detail = detail.into();
        self.warnings.push(detail.clone());
        self.criteria.push(CriterionResult {
            criterion,
            passed: false,
            detail,
        });
    }

    fn block(&mut self, criterion: Criterion, detail: impl Into<String>) {
        let detail = detail.into();
        self.blockers.push(detail.clone());
        self.criteria.push(CriterionResult {
            criterion,
            passed: false,
            detail,
        });
    }
}

/// Multi-criteria completion gate for phases.
pub struct PhaseValidator {
    deliverables: Arc<dyn DeliverableStore>,
    gates: Arc<dyn GateStore>,
    phases: Arc<PhaseManager>,
    config: ValidatorConfig,
}

impl PhaseValidator {
    pub fn new(
        deliverables: Arc<dyn DeliverableStore>,
        gates: Arc<dyn GateStore>,
        phases: Arc<PhaseManager>,
    ) -> Self {
        Self {
            deliverables,
            gates,
            phases,
            config: ValidatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ValidatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Evaluate every criterion for `phase` at the numeric autonomy `level`.
    ///
    /// Unmet approval only warns: it is satisfied by resolving a gate rather
    /// than by more work.
    pub async fn can_complete_phase(
        &self,
        project_id: &str,
        phase: PhaseName,
        level: u8,
    ) -> ShipyardResult<ValidationResult> {
        let mut verdict = Verdict::default();

        let deliverables = self.deliverables.list_for_phase(project_id, phase).await?;
        let incomplete: Vec<&str> = deliverables
            .iter()
            .filter(|d| !d.is_done())
            .map(|d| d.name.as_str())
            .collect();
        if incomplete.is_empty() {
            verdict.pass(
                Criterion::Deliverables,
                format!("{} deliverables complete", deliverables.len()),
            );
        } else {
            verdict.block(
                Criterion::Deliverables,
                format!("incomplete deliverables: {}", incomplete.join(", ")),
            );
        }

        let quality = self
            .phases
            .get_phase(project_id, phase)
            .map(|r| r.quality)
            .unwrap_or_default();
        match quality.failing_tests() {
            None => verdict.pass_with_warning(Criterion::Tests, "no test results recorded"),
            Some(0) => verdict.pass(Criterion::Tests, "all tests passing"),
            Some(failing) => verdict.block(Criterion::Tests, format!("{failing} tests failing")),
        }

        let threshold = self.config.coverage_threshold;
        match quality.coverage {
            None => verdict.pass_with_warning(Criterion::Coverage, "no coverage recorded"),
            Some(c) if c >= threshold => {
                verdict.pass(Criterion::Coverage, format!("coverage {c:.1}%"))
            }
            Some(c) if c >= threshold - self.config.coverage_margin => verdict.warn(
                Criterion::Coverage,
                format!("coverage {c:.1}% is below the {threshold:.0}% threshold"),
            ),
            Some(c) => verdict.block(
                Criterion::Coverage,
                format!("coverage {c:.1}% is far below the {threshold:.0}% threshold"),
            ),
        }

        let gates = self.gates.list_gates(project_id).await?;
        let pending = gates
            .iter()
            .filter(|g| g.is_pending() && g.phase() == Some(phase))
            .count();
        if pending == 0 {
            verdict.pass(Criterion::PendingGates, "no pending gates");
        } else {
            verdict.block(
                Criterion::PendingGates,
                format!("{pending} pending approval gates"),
            );
        }

        let required = approval_required(level, phase);
        let approved = gates.iter().any(|g| is_phase_approval(g, phase));
        let requires_approval = required && !approved;
        if requires_approval {
            verdict.warn(
                Criterion::Approval,
                format!("human approval required to close {phase} at autonomy level {level}"),
            );
        } else if required {
            verdict.pass(Criterion::Approval, "approved");
        } else {
            verdict.pass(Criterion::Approval, "approval not required");
        }

        let passed = verdict.criteria.iter().filter(|c| c.passed).count();
        let score = passed as f64 / verdict.criteria.len() as f64;
        let result = ValidationResult {
            phase,
            can_complete: verdict.blockers.is_empty(),
            score,
            blockers: verdict.blockers,
            warnings: verdict.warnings,
            criteria: verdict.criteria,
            requires_approval,
        };

        if result.can_complete {
            info!(
                project = %project_id,
                phase = %phase,
                score = result.score,
                "phase validation passed"
            );
        } else {
            debug!(
                project = %project_id,
                phase = %phase,
                blockers = ?result.blockers,
                "phase validation failed"
            );
        }
        Ok(result)
    }
}

/// An approved sign-off gate for `phase`.
pub fn is_phase_approval(gate: &Gate, phase: PhaseName) -> bool {
    gate.status == GateStatus::Approved
        && gate.phase() == Some(phase)
        && gate.context.get("kind").and_then(|k| k.as_str()) == Some(APPROVAL_GATE_KIND)
}
