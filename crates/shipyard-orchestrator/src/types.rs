use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{AgentType, PhaseName};

/// Free-form key/value bag carried by tasks, agents and project state.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key linking a task to the deliverable it produces.
pub const META_DELIVERABLE_ID: &str = "deliverable_id";
/// Metadata key linking a follow-up task to the task whose completion created it.
pub const META_PREVIOUS_TASK_ID: &str = "previous_task_id";
/// Metadata key listing files a follow-up task should start from.
pub const META_REFERENCED_FILES: &str = "referenced_files";

/// Status of a task in the execution queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed { reason: String },
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed { .. })
    }
}

/// A unit of work routed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub description: String,
    /// Role that should run the task. Classified on enqueue when absent.
    pub agent_type: Option<AgentType>,
    /// Higher is more urgent.
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: shipyard_core::new_id(),
            task_type: task_type.into(),
            description: description.into(),
            agent_type: None,
            priority: 0,
            payload: serde_json::Value::Null,
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn deliverable_id(&self) -> Option<&str> {
        self.metadata
            .get(META_DELIVERABLE_ID)
            .and_then(|v| v.as_str())
    }

    pub fn previous_task_id(&self) -> Option<&str> {
        self.metadata
            .get(META_PREVIOUS_TASK_ID)
            .and_then(|v| v.as_str())
    }

    /// Files carried forward from earlier tasks.
    pub fn referenced_files(&self) -> Vec<String> {
        self.metadata
            .get(META_REFERENCED_FILES)
            .and_then(|v| v.as_array())
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Outcome reported by an agent after running a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default)]
    pub steps: Vec<String>,
    /// Paths of files the agent produced.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Agent's self-assessed confidence in `[0, 1]`.
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl TaskResult {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.steps.push(step.into());
        self
    }

    pub fn with_artifact(mut self, path: impl Into<String>) -> Self {
        self.artifacts.push(path.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Lifecycle status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Active,
    Paused,
    Stopped,
}

impl AgentStatus {
    /// Whether the agent may receive new assignments.
    pub fn is_selectable(&self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Active)
    }
}

/// Snapshot of a registered agent's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    /// Outstanding assignments.
    pub load: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Mutable state of the single project an orchestrator owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    pub project_id: String,
    pub goal: String,
    /// `None` until the first phase starts ("initialization").
    pub current_phase: Option<PhaseName>,
    pub active_task_id: Option<String>,
    pub active_agent_id: Option<String>,
    pub completed_task_ids: Vec<String>,
    pub pending_task_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub is_complete: bool,
    pub last_updated: DateTime<Utc>,
}

impl ProjectState {
    pub fn new(project_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            goal: goal.into(),
            current_phase: None,
            active_task_id: None,
            active_agent_id: None,
            completed_task_ids: Vec::new(),
            pending_task_ids: Vec::new(),
            metadata: Metadata::new(),
            is_complete: false,
            last_updated: Utc::now(),
        }
    }

    pub fn phase_label(&self) -> &'static str {
        self.current_phase
            .as_ref()
            .map_or("initialization", PhaseName::as_str)
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Kind of hub-routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    HelpRequest,
    HelpResponse,
    TaskAssignment,
    StatusUpdate,
    PhaseChange,
    Notification,
}

/// A message buffered for its recipient. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_type: String,
    pub recipient_id: String,
    pub recipient_type: String,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Id of the hub that stamped the message.
    pub routed_through: String,
}

/// Aggregate task counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}
