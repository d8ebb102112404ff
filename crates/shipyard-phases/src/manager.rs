use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shipyard_core::{PhaseName, PhaseStatus, ShipyardError, ShipyardResult};
use shipyard_events::{Event, EventBus, EventType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Test and coverage figures recorded for a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualitySnapshot {
    pub tests_total: Option<u32>,
    pub tests_passed: Option<u32>,
    /// Line coverage in percent.
    pub coverage: Option<f64>,
}

impl QualitySnapshot {
    pub fn with_tests(mut self, passed: u32, total: u32) -> Self {
        self.tests_passed = Some(passed);
        self.tests_total = Some(total);
        self
    }

    pub fn with_coverage(mut self, coverage: f64) -> Self {
        self.coverage = Some(coverage);
        self
    }

    /// Failing tests, if any were recorded.
    pub fn failing_tests(&self) -> Option<u32> {
        match (self.tests_total, self.tests_passed) {
            (Some(total), Some(passed)) => Some(total.saturating_sub(passed)),
            _ => None,
        }
    }
}

/// One phase of one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: String,
    pub project_id: String,
    pub name: PhaseName,
    pub status: PhaseStatus,
    pub assigned_agents: Vec<String>,
    pub quality: QualitySnapshot,
    pub blocked_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    fn new(project_id: &str, name: PhaseName) -> Self {
        Self {
            id: shipyard_core::new_id(),
            project_id: project_id.to_string(),
            name,
            status: PhaseStatus::InProgress,
            assigned_agents: Vec::new(),
            quality: QualitySnapshot::default(),
            blocked_reason: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, PhaseStatus::InProgress | PhaseStatus::Blocked)
    }
}

/// Phase state machine for every project in the process.
///
/// Phases run strictly in order: a phase can start only when its predecessor
/// is the most recently completed one, and Workshopping is always first.
pub struct PhaseManager {
    events: Arc<EventBus>,
    projects: RwLock<HashMap<String, Vec<PhaseRecord>>>,
}

impl PhaseManager {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            events,
            projects: RwLock::new(HashMap::new()),
        }
    }

    async fn emit(&self, event_type: EventType, project_id: &str, data: serde_json::Value) {
        self.events
            .publish(Event::new(event_type, project_id).with_data(data))
            .await;
    }

    /// Begin a phase. Fails if it would skip a phase or another phase is active.
    pub async fn start_phase(
        &self,
        project_id: &str,
        name: PhaseName,
    ) -> ShipyardResult<PhaseRecord> {
        let record = self.open_phase(project_id, name)?;
        self.announce_started(project_id, name).await;
        Ok(record)
    }

    /// Complete an in-progress phase. Returns `false` for phases that do not
    /// exist or are not in progress.
    pub async fn complete_phase(&self, project_id: &str, name: PhaseName) -> ShipyardResult<bool> {
        let completed = self.close_phase(project_id, name);
        if completed {
            self.announce_completed(project_id, name).await;
        }
        Ok(completed)
    }

    /// Move from a completed phase to its successor, starting the successor.
    ///
    /// Publishes only `PhaseStarted`; the transition event is left to the
    /// caller.
    pub async fn transition_phase(
        &self,
        project_id: &str,
        from: PhaseName,
        to: PhaseName,
    ) -> ShipyardResult<PhaseRecord> {
        let record = self.advance(project_id, from, to)?;
        self.announce_started(project_id, to).await;
        Ok(record)
    }

    /// Create the record for a phase that is allowed to start. Publishes nothing.
    fn open_phase(&self, project_id: &str, name: PhaseName) -> ShipyardResult<PhaseRecord> {
        let mut projects = self.projects.write();
        let records = projects.entry(project_id.to_string()).or_default();
        check_can_start(records, name)?;
        let record = PhaseRecord::new(project_id, name);
        records.push(record.clone());
        info!(project = %project_id, phase = %name, "phase started");
        Ok(record)
    }

    /// Mark an in-progress phase completed. Publishes nothing.
    pub(crate) fn close_phase(&self, project_id: &str, name: PhaseName) -> bool {
        let mut projects = self.projects.write();
        match find_mut(&mut projects, project_id, name) {
            Some(record) if record.status == PhaseStatus::InProgress => {
                record.status = PhaseStatus::Completed;
                record.completed_at = Some(Utc::now());
                info!(project = %project_id, phase = %name, "phase completed");
                true
            }
            _ => false,
        }
    }

    /// Start the successor of a completed phase. Publishes nothing.
    pub(crate) fn advance(
        &self,
        project_id: &str,
        from: PhaseName,
        to: PhaseName,
    ) -> ShipyardResult<PhaseRecord> {
        if from.next() != Some(to) {
            return Err(ShipyardError::Phase(format!(
                "cannot transition from {from} to {to}; phases run in order"
            )));
        }
        let from_completed = self
            .get_phase(project_id, from)
            .is_some_and(|r| r.status == PhaseStatus::Completed);
        if !from_completed {
            return Err(ShipyardError::Phase(format!(
                "cannot leave {from} before it is completed"
            )));
        }
        self.open_phase(project_id, to)
    }

    pub(crate) async fn announce_started(&self, project_id: &str, name: PhaseName) {
        self.emit(EventType::PhaseStarted, project_id, json!({ "phase": name }))
            .await;
    }

    pub(crate) async fn announce_completed(&self, project_id: &str, name: PhaseName) {
        self.emit(EventType::PhaseCompleted, project_id, json!({ "phase": name }))
            .await;
    }

    /// Stop work on an in-progress phase.
    pub async fn block_phase(&self, project_id: &str, name: PhaseName, reason: &str) -> bool {
        let blocked = {
            let mut projects = self.projects.write();
            match find_mut(&mut projects, project_id, name) {
                Some(record) if record.status == PhaseStatus::InProgress => {
                    record.status = PhaseStatus::Blocked;
                    record.blocked_reason = Some(reason.to_string());
                    true
                }
                _ => false,
            }
        };
        if blocked {
            warn!(project = %project_id, phase = %name, reason = %reason, "phase blocked");
            self.emit(
                EventType::PhaseBlocked,
                project_id,
                json!({ "phase": name, "reason": reason }),
            )
            .await;
        }
        blocked
    }

    /// Return a blocked phase to work.
    pub fn resume_phase(&self, project_id: &str, name: PhaseName) -> bool {
        let mut projects = self.projects.write();
        match find_mut(&mut projects, project_id, name) {
            Some(record) if record.status == PhaseStatus::Blocked => {
                record.status = PhaseStatus::InProgress;
                record.blocked_reason = None;
                info!(project = %project_id, phase = %name, "phase resumed");
                true
            }
            _ => false,
        }
    }

    /// Undo a transition: drop the successor and reopen the source phase.
    pub(crate) fn revert_transition(&self, project_id: &str, from: PhaseName, to: PhaseName) {
        let mut projects = self.projects.write();
        if let Some(records) = projects.get_mut(project_id) {
            records.retain(|r| r.name != to);
            if let Some(record) = records.iter_mut().find(|r| r.name == from) {
                record.status = PhaseStatus::InProgress;
                record.completed_at = None;
            }
        }
        warn!(project = %project_id, from = %from, to = %to, "phase transition reverted");
    }

    /// Reopen a phase completed by a transition that never got past completion.
    pub(crate) fn reopen_phase(&self, project_id: &str, name: PhaseName) {
        let mut projects = self.projects.write();
        if let Some(record) = find_mut(&mut projects, project_id, name) {
            if record.status == PhaseStatus::Completed {
                record.status = PhaseStatus::InProgress;
                record.completed_at = None;
            }
        }
    }

    pub fn assign_agent(
        &self,
        project_id: &str,
        name: PhaseName,
        agent_id: &str,
    ) -> ShipyardResult<()> {
        let mut projects = self.projects.write();
        let record = find_mut(&mut projects, project_id, name)
            .ok_or_else(|| ShipyardError::NotFound(format!("phase {name} of {project_id}")))?;
        if !record.assigned_agents.iter().any(|a| a == agent_id) {
            record.assigned_agents.push(agent_id.to_string());
        }
        Ok(())
    }

    pub fn record_quality(
        &self,
        project_id: &str,
        name: PhaseName,
        quality: QualitySnapshot,
    ) -> ShipyardResult<()> {
        let mut projects = self.projects.write();
        let record = find_mut(&mut projects, project_id, name)
            .ok_or_else(|| ShipyardError::NotFound(format!("phase {name} of {project_id}")))?;
        record.quality = quality;
        Ok(())
    }

    pub fn get_phase(&self, project_id: &str, name: PhaseName) -> Option<PhaseRecord> {
        self.projects
            .read()
            .get(project_id)
            .and_then(|records| records.iter().find(|r| r.name == name).cloned())
    }

    /// Every phase of a project in the order they started.
    pub fn phases(&self, project_id: &str) -> Vec<PhaseRecord> {
        self.projects
            .read()
            .get(project_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The in-progress or blocked phase, if any.
    pub fn active_phase(&self, project_id: &str) -> Option<PhaseRecord> {
        self.projects
            .read()
            .get(project_id)
            .and_then(|records| records.iter().find(|r| r.is_active()).cloned())
    }

    pub fn last_completed(&self, project_id: &str) -> Option<PhaseName> {
        self.projects
            .read()
            .get(project_id)
            .and_then(|records| last_completed(records))
    }

    /// Status of a named phase; `NotStarted` when it has no record.
    pub fn status(&self, project_id: &str, name: PhaseName) -> PhaseStatus {
        self.get_phase(project_id, name)
            .map_or(PhaseStatus::NotStarted, |r| r.status)
    }
}

fn find_mut<'a>(
    projects: &'a mut HashMap<String, Vec<PhaseRecord>>,
    project_id: &str,
    name: PhaseName,
) -> Option<&'a mut PhaseRecord> {
    projects
        .get_mut(project_id)
        .and_then(|records| records.iter_mut().find(|r| r.name == name))
}

fn last_completed(records: &[PhaseRecord]) -> Option<PhaseName> {
    records
        .iter()
        .filter(|r| r.status == PhaseStatus::Completed)
        .max_by_key(|r| r.name)
        .map(|r| r.name)
}

fn check_can_start(records: &[PhaseRecord], name: PhaseName) -> ShipyardResult<()> {
    if let Some(active) = records.iter().find(|r| r.is_active()) {
        return Err(ShipyardError::Phase(format!(
            "cannot start {name} while {} is still {:?}",
            active.name, active.status
        )));
    }
    if records.iter().any(|r| r.name == name) {
        return Err(ShipyardError::Phase(format!("{name} was already started")));
    }
    match last_completed(records) {
        None if name == PhaseName::first() => Ok(()),
        None => Err(ShipyardError::Phase(format!(
            "cannot start {name}: the first phase is {}",
            PhaseName::first()
        ))),
        Some(done) if done.next() == Some(name) => Ok(()),
        Some(done) => Err(ShipyardError::Phase(format!(
            "cannot start {name} after {done}; phases cannot be skipped"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PhaseManager {
        PhaseManager::new(Arc::new(EventBus::new()))
    }

    #[tokio::test]
    async fn test_first_phase_must_be_workshopping() {
        for name in PhaseName::ORDER.iter().skip(1) {
            let manager = manager();
            assert!(matches!(
                manager.start_phase("p1", *name).await,
                Err(ShipyardError::Phase(_))
            ));
        }
        let manager = manager();
        let record = manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        assert_eq!(record.status, PhaseStatus::InProgress);
    }

    #[tokio::test]
    async fn test_cannot_skip_or_run_two_phases() {
        let manager = manager();
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        assert!(manager.start_phase("p1", PhaseName::Implementation).await.is_err());
        assert!(manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap());
        assert!(manager.start_phase("p1", PhaseName::Testing).await.is_err());
        assert!(manager.start_phase("p1", PhaseName::Workshopping).await.is_err());
        manager.start_phase("p1", PhaseName::Implementation).await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_only_in_progress() {
        let manager = manager();
        assert!(!manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap());
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        assert!(manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap());
        assert!(!manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_rules() {
        let manager = manager();
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        // Source not completed yet.
        assert!(manager
            .transition_phase("p1", PhaseName::Workshopping, PhaseName::Implementation)
            .await
            .is_err());
        manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap();
        // Not the successor.
        assert!(manager
            .transition_phase("p1", PhaseName::Workshopping, PhaseName::Testing)
            .await
            .is_err());
        let record = manager
            .transition_phase("p1", PhaseName::Workshopping, PhaseName::Implementation)
            .await
            .unwrap();
        assert_eq!(record.name, PhaseName::Implementation);
        assert_eq!(
            manager.active_phase("p1").unwrap().name,
            PhaseName::Implementation
        );
    }

    #[tokio::test]
    async fn test_block_and_resume() {
        let manager = manager();
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        assert!(manager.block_phase("p1", PhaseName::Workshopping, "waiting on client").await);
        assert_eq!(manager.status("p1", PhaseName::Workshopping), PhaseStatus::Blocked);
        assert!(!manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap());
        assert!(manager.resume_phase("p1", PhaseName::Workshopping));
        assert!(!manager.resume_phase("p1", PhaseName::Workshopping));
        assert!(manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap());
    }

    #[tokio::test]
    async fn test_revert_transition() {
        let manager = manager();
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap();
        manager
            .transition_phase("p1", PhaseName::Workshopping, PhaseName::Implementation)
            .await
            .unwrap();
        manager.revert_transition("p1", PhaseName::Workshopping, PhaseName::Implementation);

        assert_eq!(manager.phases("p1").len(), 1);
        assert_eq!(
            manager.status("p1", PhaseName::Workshopping),
            PhaseStatus::InProgress
        );
        assert_eq!(
            manager.status("p1", PhaseName::Implementation),
            PhaseStatus::NotStarted
        );
    }

    #[tokio::test]
    async fn test_agents_and_quality() {
        let manager = manager();
        assert!(manager.assign_agent("p1", PhaseName::Testing, "q1").is_err());
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        manager.assign_agent("p1", PhaseName::Workshopping, "w1").unwrap();
        manager.assign_agent("p1", PhaseName::Workshopping, "w1").unwrap();
        manager
            .record_quality(
                "p1",
                PhaseName::Workshopping,
                QualitySnapshot::default().with_tests(9, 10).with_coverage(88.0),
            )
            .unwrap();
        let record = manager.get_phase("p1", PhaseName::Workshopping).unwrap();
        assert_eq!(record.assigned_agents, vec!["w1"]);
        assert_eq!(record.quality.failing_tests(), Some(1));
    }

    #[tokio::test]
    async fn test_projects_are_independent() {
        let manager = manager();
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        manager.start_phase("p2", PhaseName::Workshopping).await.unwrap();
        assert_eq!(manager.phases("p1").len(), 1);
        assert!(manager.last_completed("p2").is_none());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let events = Arc::new(EventBus::new());
        let manager = PhaseManager::new(events.clone());
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        manager.complete_phase("p1", PhaseName::Workshopping).await.unwrap();
        let history = events.get_history("p1", None, 10);
        assert_eq!(history[0].event_type, EventType::PhaseCompleted);
        assert_eq!(history[1].event_type, EventType::PhaseStarted);
    }

    #[tokio::test]
    async fn test_quiet_steps_publish_nothing() {
        let events = Arc::new(EventBus::new());
        let manager = PhaseManager::new(events.clone());
        manager.start_phase("p1", PhaseName::Workshopping).await.unwrap();
        assert!(manager.close_phase("p1", PhaseName::Workshopping));
        manager
            .advance("p1", PhaseName::Workshopping, PhaseName::Implementation)
            .unwrap();
        assert_eq!(
            manager.status("p1", PhaseName::Implementation),
            PhaseStatus::InProgress
        );
        assert_eq!(events.get_history("p1", None, 10).len(), 1);
    }
}
