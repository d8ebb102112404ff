use crate::archive::{ArchiveManifest, PhaseArchive};
use crate::catalog::phase_agent_types;
use crate::manager::PhaseManager;
use crate::report::{JsonReportStore, TransitionReport};
use crate::validator::{PhaseValidator, ValidationResult};
use chrono::Utc;
use serde_json::json;
use shipyard_core::{PhaseName, PhaseStatus, ShipyardError, ShipyardResult};
use shipyard_events::{Event, EventType};
use shipyard_orchestrator::{MessageType, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A transition that went through every step.
#[derive(Debug, Clone)]
pub struct CompletedTransition {
    pub report: TransitionReport,
    pub report_path: PathBuf,
    pub manifest: ArchiveManifest,
}

/// Moves one project from a finished phase to the next.
///
/// Steps run in order: validate, archive, notify agents, transition, staff
/// the new phase, write the report. A failure once the phase manager has
/// transitioned is rolled back, so callers see either the old phase or the
/// new one. `PhaseCompleted`, `PhaseStarted` and `PhaseTransitioned` are
/// published only once the report is saved; a failure after validation
/// publishes one `Error` event instead.
pub struct PhaseTransitionService {
    orchestrator: Arc<Orchestrator>,
    phases: Arc<PhaseManager>,
    validator: Arc<PhaseValidator>,
    archive: PhaseArchive,
    reports: JsonReportStore,
}

impl PhaseTransitionService {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        phases: Arc<PhaseManager>,
        validator: Arc<PhaseValidator>,
        archive: PhaseArchive,
        reports: JsonReportStore,
    ) -> Self {
        Self {
            orchestrator,
            phases,
            validator,
            archive,
            reports,
        }
    }

    pub fn reports(&self) -> &JsonReportStore {
        &self.reports
    }

    pub fn archive(&self) -> &PhaseArchive {
        &self.archive
    }

    /// Close `from` and open its successor at the numeric autonomy `level`.
    pub async fn transition(
        &self,
        from: PhaseName,
        level: u8,
    ) -> ShipyardResult<CompletedTransition> {
        let project_id = self.orchestrator.project_id().to_string();
        let to = from
            .next()
            .ok_or_else(|| ShipyardError::Phase(format!("{from} is the last phase")))?;
        if self.phases.status(&project_id, from) != PhaseStatus::InProgress {
            return Err(ShipyardError::Phase(format!("{from} is not in progress")));
        }

        let validation = self
            .validator
            .can_complete_phase(&project_id, from, level)
            .await?;
        if !validation.can_complete {
            warn!(
                project = %project_id,
                phase = %from,
                blockers = ?validation.blockers,
                "transition blocked"
            );
            self.publish(
                EventType::PhaseBlocked,
                &project_id,
                json!({
                    "phase": from,
                    "blockers": validation.blockers,
                    "warnings": validation.warnings,
                }),
            )
            .await;
            return Err(ShipyardError::Validation(format!(
                "{from} cannot complete: {}",
                validation.blockers.join("; ")
            )));
        }

        let deliverables = match self.orchestrator.deliverable_store() {
            Some(store) => store.list_for_phase(&project_id, from).await,
            None => Err(ShipyardError::NotConfigured("deliverable store".into())),
        };
        let deliverables = match deliverables {
            Ok(deliverables) => deliverables,
            Err(e) => return Err(self.failed(&project_id, from, to, e).await),
        };
        let manifest = match self
            .archive
            .archive_phase(&project_id, from, &deliverables)
            .await
        {
            Ok(manifest) => manifest,
            Err(e) => return Err(self.failed(&project_id, from, to, e).await),
        };

        if let Err(e) = self.notify_agents(from, to).await {
            self.discard_archive(&project_id, from).await;
            return Err(self.failed(&project_id, from, to, e).await);
        }

        if !self.phases.close_phase(&project_id, from) {
            self.discard_archive(&project_id, from).await;
            let e = ShipyardError::Phase(format!("{from} could not be completed"));
            return Err(self.failed(&project_id, from, to, e).await);
        }
        if let Err(e) = self.phases.advance(&project_id, from, to) {
            self.phases.reopen_phase(&project_id, from);
            self.discard_archive(&project_id, from).await;
            return Err(self.failed(&project_id, from, to, e).await);
        }

        match self
            .finish(&project_id, from, to, validation, &deliverables, &manifest)
            .await
        {
            Ok((report, report_path)) => {
                self.orchestrator.set_phase(Some(to));
                info!(
                    project = %project_id,
                    from = %from,
                    to = %to,
                    report = %report_path.display(),
                    "phase transitioned"
                );
                self.phases.announce_completed(&project_id, from).await;
                self.phases.announce_started(&project_id, to).await;
                self.publish(
                    EventType::PhaseTransitioned,
                    &project_id,
                    json!({
                        "from": from,
                        "to": to,
                        "report": report_path,
                        "agents": report.new_phase_agents,
                    }),
                )
                .await;
                Ok(CompletedTransition {
                    report,
                    report_path,
                    manifest,
                })
            }
            Err(e) => {
                error!(
                    project = %project_id,
                    from = %from,
                    to = %to,
                    error = %e,
                    "transition failed, reverting"
                );
                self.phases.revert_transition(&project_id, from, to);
                self.discard_archive(&project_id, from).await;
                self.notify_reverted(from, to).await;
                Err(self.failed(&project_id, from, to, e).await)
            }
        }
    }

    /// Publish the `Error` event for a transition that did not happen and
    /// hand the error back.
    async fn failed(
        &self,
        project_id: &str,
        from: PhaseName,
        to: PhaseName,
        error: ShipyardError,
    ) -> ShipyardError {
        self.publish(
            EventType::Error,
            project_id,
            json!({
                "stage": "phase_transition",
                "from": from,
                "to": to,
                "error": error.to_string(),
            }),
        )
        .await;
        error
    }

    /// Steps after the phase manager has moved on: staff, report, persist.
    async fn finish(
        &self,
        project_id: &str,
        from: PhaseName,
        to: PhaseName,
        validation: ValidationResult,
        deliverables: &[shipyard_core::Deliverable],
        manifest: &ArchiveManifest,
    ) -> ShipyardResult<(TransitionReport, PathBuf)> {
        let staff = phase_agent_types(to);
        let mut new_phase_agents = Vec::new();
        for agent in self.orchestrator.agents().await {
            if agent.status.is_selectable() && staff.contains(&agent.agent_type) {
                self.phases.assign_agent(project_id, to, &agent.id)?;
                new_phase_agents.push(agent.id);
            }
        }

        let achievements: Vec<String> = deliverables
            .iter()
            .filter(|d| d.is_done())
            .map(|d| d.name.clone())
            .collect();
        let summary = format!(
            "{from} closed with {} deliverables (score {:.2}, {} warnings); {to} starts with {} agents",
            achievements.len(),
            validation.score,
            validation.warnings.len(),
            new_phase_agents.len(),
        );
        let report = TransitionReport {
            project_id: project_id.to_string(),
            from,
            to,
            achievements,
            next_checklist: to.checklist().iter().map(|s| (*s).to_string()).collect(),
            new_phase_agents,
            validation,
            archived_files: manifest.file_count(),
            summary,
            created_at: Utc::now(),
        };
        let path = self.reports.save_report(&report).await?;
        Ok((report, path))
    }

    async fn notify_agents(&self, from: PhaseName, to: PhaseName) -> ShipyardResult<()> {
        let hub = self.orchestrator.hub_id().to_string();
        let payload = json!({
            "from": from,
            "to": to,
            "checklist": to.checklist(),
        });
        for agent in self.orchestrator.agents().await {
            self.orchestrator
                .route_message(&hub, &agent.id, MessageType::PhaseChange, payload.clone())
                .await?;
        }
        Ok(())
    }

    async fn notify_reverted(&self, from: PhaseName, to: PhaseName) {
        let hub = self.orchestrator.hub_id().to_string();
        let payload = json!({ "reverted": { "from": from, "to": to }, "phase": from });
        for agent in self.orchestrator.agents().await {
            if let Err(e) = self
                .orchestrator
                .route_message(&hub, &agent.id, MessageType::Notification, payload.clone())
                .await
            {
                warn!(agent_id = %agent.id, error = %e, "failed to announce reverted transition");
            }
        }
    }

    async fn discard_archive(&self, project_id: &str, phase: PhaseName) {
        if let Err(e) = self.archive.remove(project_id, phase).await {
            warn!(project = %project_id, phase = %phase, error = %e, "failed to discard archive");
        }
    }

    async fn publish(&self, event_type: EventType, project_id: &str, data: serde_json::Value) {
        self.orchestrator
            .events()
            .publish(Event::new(event_type, project_id).with_data(data))
            .await;
    }
}
