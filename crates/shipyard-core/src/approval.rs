//! Human-approval gates and the autonomy policy that decides when to create them.
//!
//! These types live in `shipyard-core` so that both the orchestrator (which
//! escalates uncertain decisions) and the phase validator (which checks for
//! pending approvals) share them without depending on each other.

use crate::{PhaseName, ShipyardError, ShipyardResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// How aggressively a project escalates uncertain outcomes to humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutonomyLevel {
    Low,
    Medium,
    High,
}

impl AutonomyLevel {
    /// Confidence below which a decision is escalated. `None` means always escalate.
    pub fn escalation_threshold(&self) -> Option<f64> {
        match self {
            AutonomyLevel::Low => None,
            AutonomyLevel::Medium => Some(0.7),
            AutonomyLevel::High => Some(0.3),
        }
    }

    /// Whether a decision taken with `confidence` needs a human.
    pub fn should_escalate(&self, confidence: f64) -> bool {
        match self.escalation_threshold() {
            None => true,
            Some(threshold) => confidence < threshold,
        }
    }

    /// Map the numeric 1–5 project setting onto the escalation policy.
    pub fn from_numeric(level: u8) -> Self {
        match level {
            0..=2 => AutonomyLevel::Low,
            3 => AutonomyLevel::Medium,
            _ => AutonomyLevel::High,
        }
    }

    pub fn parse_level(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Some(AutonomyLevel::Low),
            "medium" => Some(AutonomyLevel::Medium),
            "high" => Some(AutonomyLevel::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for AutonomyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutonomyLevel::Low => write!(f, "low"),
            AutonomyLevel::Medium => write!(f, "medium"),
            AutonomyLevel::High => write!(f, "high"),
        }
    }
}

/// Whether closing `phase` needs human sign-off at the numeric autonomy `level`.
///
/// Levels 1–2 always require approval, level 3 from Deployment onward,
/// level 4 only for Deployment, level 5 never.
pub fn approval_required(level: u8, phase: PhaseName) -> bool {
    match level {
        0..=2 => true,
        3 => phase >= PhaseName::Deployment,
        4 => phase == PhaseName::Deployment,
        _ => false,
    }
}

/// Resolution status of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
}

/// A durable marker requiring human approval before the build proceeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    pub id: String,
    pub project_id: String,
    pub reason: String,
    pub context: serde_json::Value,
    pub agent_id: Option<String>,
    pub status: GateStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub reviewer: Option<String>,
}

impl Gate {
    /// Phase the gate was raised in, read from `context.phase`.
    pub fn phase(&self) -> Option<PhaseName> {
        self.context
            .get("phase")
            .and_then(|v| v.as_str())
            .and_then(PhaseName::parse_name)
    }

    pub fn is_pending(&self) -> bool {
        self.status == GateStatus::Pending
    }
}

/// Creates and tracks human-approval gates.
#[async_trait]
pub trait GateStore: Send + Sync {
    /// Create a pending gate and return its id.
    async fn create_gate(
        &self,
        project_id: &str,
        reason: &str,
        context: serde_json::Value,
        agent_id: Option<&str>,
    ) -> ShipyardResult<String>;

    /// Pending gates of a project, oldest first.
    async fn get_pending_gates(&self, project_id: &str) -> ShipyardResult<Vec<Gate>>;

    /// Every gate of a project regardless of status, oldest first.
    async fn list_gates(&self, project_id: &str) -> ShipyardResult<Vec<Gate>>;

    /// Record a human decision on a pending gate.
    async fn resolve_gate(&self, gate_id: &str, approved: bool, reviewer: &str)
        -> ShipyardResult<Gate>;
}

/// Process-local gate store.
pub struct InMemoryGateStore {
    gates: RwLock<Vec<Gate>>,
}

impl InMemoryGateStore {
    pub fn new() -> Self {
        Self {
            gates: RwLock::new(Vec::new()),
        }
    }

    /// Total number of gates ever created.
    pub fn gate_count(&self) -> usize {
        self.gates.read().len()
    }
}

impl Default for InMemoryGateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GateStore for InMemoryGateStore {
    async fn create_gate(
        &self,
        project_id: &str,
        reason: &str,
        context: serde_json::Value,
        agent_id: Option<&str>,
    ) -> ShipyardResult<String> {
        let gate = Gate {
            id: crate::new_id(),
            project_id: project_id.to_string(),
            reason: reason.to_string(),
            context,
            agent_id: agent_id.map(str::to_string),
            status: GateStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            reviewer: None,
        };
        let id = gate.id.clone();
        self.gates.write().push(gate);
        Ok(id)
    }

    async fn get_pending_gates(&self, project_id: &str) -> ShipyardResult<Vec<Gate>> {
        Ok(self
            .gates
            .read()
            .iter()
            .filter(|g| g.project_id == project_id && g.is_pending())
            .cloned()
            .collect())
    }

    async fn list_gates(&self, project_id: &str) -> ShipyardResult<Vec<Gate>> {
        Ok(self
            .gates
            .read()
            .iter()
            .filter(|g| g.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn resolve_gate(
        &self,
        gate_id: &str,
        approved: bool,
        reviewer: &str,
    ) -> ShipyardResult<Gate> {
        let mut gates = self.gates.write();
        let gate = gates
            .iter_mut()
            .find(|g| g.id == gate_id)
            .ok_or_else(|| ShipyardError::NotFound(format!("gate {gate_id}")))?;
        if !gate.is_pending() {
            return Err(ShipyardError::InvalidArgument(format!(
                "gate {gate_id} is already resolved"
            )));
        }
        gate.status = if approved {
            GateStatus::Approved
        } else {
            GateStatus::Rejected
        };
        gate.resolved_at = Some(Utc::now());
        gate.reviewer = Some(reviewer.to_string());
        Ok(gate.clone())
    }
}
