use crate::catalog::{default_deliverables, phase_agent_types};
use crate::manager::PhaseManager;
use crate::report::TransitionReport;
use crate::transition::PhaseTransitionService;
use crate::validator::{PhaseValidator, APPROVAL_GATE_KIND};
use serde_json::json;
use shipyard_core::{Gate, GateStatus, PhaseName, PhaseStatus, ShipyardError, ShipyardResult};
use shipyard_orchestrator::Orchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// What `advance_if_ready` did.
#[derive(Debug, Clone)]
pub enum Advance {
    /// The phase cannot close yet.
    Blocked {
        phase: PhaseName,
        blockers: Vec<String>,
        warnings: Vec<String>,
    },
    /// A sign-off gate for the phase is pending.
    AwaitingApproval { phase: PhaseName, gate_id: String },
    /// The next phase started and its deliverable tasks were queued.
    Transitioned {
        report: Box<TransitionReport>,
        report_path: PathBuf,
        tasks: Vec<String>,
    },
    /// Maintenance closed and the project is complete.
    Finished,
}

/// Drives one project through all six phases.
pub struct BuildPipeline {
    orchestrator: Arc<Orchestrator>,
    phases: Arc<PhaseManager>,
    validator: Arc<PhaseValidator>,
    transitions: PhaseTransitionService,
    approval_level: u8,
}

impl BuildPipeline {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        phases: Arc<PhaseManager>,
        validator: Arc<PhaseValidator>,
        transitions: PhaseTransitionService,
        approval_level: u8,
    ) -> Self {
        Self {
            orchestrator,
            phases,
            validator,
            transitions,
            approval_level,
        }
    }

    pub fn approval_level(&self) -> u8 {
        self.approval_level
    }

    pub fn transitions(&self) -> &PhaseTransitionService {
        &self.transitions
    }

    fn project_id(&self) -> &str {
        self.orchestrator.project_id()
    }

    /// Start Workshopping and queue its deliverable tasks.
    pub async fn start_build(&self) -> ShipyardResult<Vec<String>> {
        let first = PhaseName::first();
        self.phases.start_phase(self.project_id(), first).await?;
        self.orchestrator.set_phase(Some(first));
        for agent in self.orchestrator.agents().await {
            if phase_agent_types(first).contains(&agent.agent_type) {
                self.phases.assign_agent(self.project_id(), first, &agent.id)?;
            }
        }
        let tasks = self.seed_phase(first).await?;
        info!(project = %self.project_id(), tasks = tasks.len(), "build started");
        Ok(tasks)
    }

    /// Seed the default deliverables of a phase if it has none, then queue a
    /// task for each pending one.
    pub async fn seed_phase(&self, phase: PhaseName) -> ShipyardResult<Vec<String>> {
        let store = self
            .orchestrator
            .deliverable_store()
            .ok_or_else(|| ShipyardError::NotConfigured("deliverable store".into()))?;
        let mut deliverables = store.list_for_phase(self.project_id(), phase).await?;
        if deliverables.is_empty() {
            for deliverable in default_deliverables(self.project_id(), phase) {
                store.upsert(deliverable).await?;
            }
            deliverables = store.list_for_phase(self.project_id(), phase).await?;
        }
        self.orchestrator.plan_phase(phase, &deliverables).await
    }

    /// Open a fresh sign-off gate for `phase`.
    pub async fn request_approval(&self, phase: PhaseName) -> ShipyardResult<String> {
        self.orchestrator
            .escalate_to_human(
                &format!("sign-off required to close {phase}"),
                json!({
                    "phase": phase,
                    "kind": APPROVAL_GATE_KIND,
                    "approval_level": self.approval_level,
                }),
                None,
            )
            .await
    }

    /// The newest sign-off gate raised for `phase`.
    async fn latest_approval(&self, phase: PhaseName) -> ShipyardResult<Option<Gate>> {
        let gates = self
            .orchestrator
            .gate_store()
            .ok_or_else(|| ShipyardError::NotConfigured("gate store".into()))?
            .list_gates(self.project_id())
            .await?;
        Ok(gates
            .into_iter()
            .filter(|g| {
                g.phase() == Some(phase)
                    && g.context.get("kind").and_then(|k| k.as_str()) == Some(APPROVAL_GATE_KIND)
            })
            .max_by_key(|g| g.created_at))
    }

    /// Close the active phase if it is ready and move on.
    ///
    /// The newest sign-off gate decides approval: pending waits, rejected
    /// blocks until someone calls [`BuildPipeline::request_approval`] again.
    pub async fn advance_if_ready(&self) -> ShipyardResult<Advance> {
        if self.orchestrator.is_complete() {
            return Ok(Advance::Finished);
        }
        let project_id = self.project_id().to_string();
        let record = self
            .phases
            .active_phase(&project_id)
            .ok_or_else(|| ShipyardError::Phase(format!("{project_id} has no active phase")))?;
        let phase = record.name;

        if record.status == PhaseStatus::Blocked {
            return Ok(Advance::Blocked {
                phase,
                blockers: record.blocked_reason.into_iter().collect(),
                warnings: Vec::new(),
            });
        }

        let approval = self.latest_approval(phase).await?;
        if let Some(gate) = approval.as_ref().filter(|g| g.is_pending()) {
            return Ok(Advance::AwaitingApproval {
                phase,
                gate_id: gate.id.clone(),
            });
        }

        let validation = self
            .validator
            .can_complete_phase(&project_id, phase, self.approval_level)
            .await?;
        if !validation.can_complete {
            return Ok(Advance::Blocked {
                phase,
                blockers: validation.blockers,
                warnings: validation.warnings,
            });
        }

        if validation.requires_approval {
            if let Some(gate) = approval.filter(|g| g.status == GateStatus::Rejected) {
                let reviewer = gate.reviewer.unwrap_or_else(|| "reviewer".to_string());
                return Ok(Advance::Blocked {
                    phase,
                    blockers: vec![format!("sign-off for {phase} rejected by {reviewer}")],
                    warnings: validation.warnings,
                });
            }
            let gate_id = self.request_approval(phase).await?;
            info!(project = %project_id, phase = %phase, gate_id = %gate_id, "awaiting sign-off");
            return Ok(Advance::AwaitingApproval { phase, gate_id });
        }

        if phase.next().is_none() {
            self.phases.complete_phase(&project_id, phase).await?;
            self.orchestrator.mark_complete("all phases completed").await;
            return Ok(Advance::Finished);
        }

        let transition = self
            .transitions
            .transition(phase, self.approval_level)
            .await?;
        let tasks = self.seed_phase(transition.report.to).await?;
        Ok(Advance::Transitioned {
            report: Box::new(transition.report),
            report_path: transition.report_path,
            tasks,
        })
    }
}
