use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of event types published during a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentRegistered,
    AgentUnregistered,
    AgentPaused,
    AgentResumed,
    AgentStopped,
    TaskCreated,
    TaskAssigned,
    TaskStarted,
    TaskCompleted,
    TaskRetried,
    TaskFailed,
    MessageRouted,
    SpecialistConsulted,
    DecisionMade,
    GateCreated,
    GateResolved,
    DeliverableCompleted,
    PhaseStarted,
    PhaseCompleted,
    PhaseBlocked,
    PhaseTransitioned,
    ProjectCompleted,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentRegistered => "agent_registered",
            EventType::AgentUnregistered => "agent_unregistered",
            EventType::AgentPaused => "agent_paused",
            EventType::AgentResumed => "agent_resumed",
            EventType::AgentStopped => "agent_stopped",
            EventType::TaskCreated => "task_created",
            EventType::TaskAssigned => "task_assigned",
            EventType::TaskStarted => "task_started",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskRetried => "task_retried",
            EventType::TaskFailed => "task_failed",
            EventType::MessageRouted => "message_routed",
            EventType::SpecialistConsulted => "specialist_consulted",
            EventType::DecisionMade => "decision_made",
            EventType::GateCreated => "gate_created",
            EventType::GateResolved => "gate_resolved",
            EventType::DeliverableCompleted => "deliverable_completed",
            EventType::PhaseStarted => "phase_started",
            EventType::PhaseCompleted => "phase_completed",
            EventType::PhaseBlocked => "phase_blocked",
            EventType::PhaseTransitioned => "phase_transitioned",
            EventType::ProjectCompleted => "project_completed",
            EventType::Error => "error",
        }
    }

    /// Terminal failures that operators must see.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventType::TaskFailed | EventType::PhaseBlocked | EventType::Error
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single published state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: EventType,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, project_id: impl Into<String>) -> Self {
        Self {
            id: shipyard_core::new_id(),
            event_type,
            project_id: project_id.into(),
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
            agent_id: None,
            task_id: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = Event::new(EventType::TaskAssigned, "p1")
            .with_agent("backend-1")
            .with_task("t1")
            .with_data(serde_json::json!({"priority": 5}));

        assert_eq!(event.project_id, "p1");
        assert_eq!(event.agent_id.as_deref(), Some("backend-1"));
        assert_eq!(event.task_id.as_deref(), Some("t1"));
        assert_eq!(event.data["priority"], 5);
    }

    #[test]
    fn test_event_type_serialization() {
        let json = serde_json::to_string(&EventType::PhaseTransitioned).unwrap();
        assert_eq!(json, "\"phase_transitioned\"");
        assert_eq!(EventType::PhaseTransitioned.to_string(), "phase_transitioned");
    }

    #[test]
    fn test_failure_types() {
        assert!(EventType::TaskFailed.is_failure());
        assert!(EventType::Error.is_failure());
        assert!(!EventType::TaskRetried.is_failure());
    }
}
