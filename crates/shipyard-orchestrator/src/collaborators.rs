//! Contracts for the external services the orchestrator consults.
//!
//! None of these are required to construct an [`Orchestrator`](crate::Orchestrator).
//! Operations that need a missing collaborator fail with
//! [`ShipyardError::NotConfigured`](shipyard_core::ShipyardError::NotConfigured),
//! except decision logging, where a missing logger is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{AgentType, ShipyardResult};

/// Raw reply from the decision model.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmReply {
    /// Free text, possibly wrapping JSON in prose or code fences.
    Text(String),
    /// Already-parsed structured output.
    Structured(serde_json::Value),
}

/// The model that decides what happens after each completed task.
#[async_trait]
pub trait LlmDecider: Send + Sync {
    async fn query(&self, prompt: &str) -> ShipyardResult<LlmReply>;

    /// Score how confident the model is in a result, in `[0, 1]`.
    async fn evaluate_confidence(&self, payload: &serde_json::Value) -> ShipyardResult<f64>;
}

/// One persisted decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    pub task_id: Option<String>,
    /// `create_task`, `escalate_to_human`, `project_complete` or `wait_for_more_tasks`.
    pub decision_type: String,
    pub reasoning: String,
    pub confidence: f64,
    /// Whether the autonomy policy turned this decision into an escalation.
    pub escalated: bool,
    #[serde(default)]
    pub context: serde_json::Value,
}

/// Best-effort sink for decisions.
#[async_trait]
pub trait DecisionLogger: Send + Sync {
    async fn log(&self, entry: DecisionEntry) -> ShipyardResult<()>;
}

/// Query against the solution knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeQuery {
    pub query: String,
    pub agent_type: Option<AgentType>,
    pub task_type: Option<String>,
    pub technology: Option<String>,
    pub limit: usize,
}

impl KnowledgeQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            agent_type: None,
            task_type: None,
            technology: None,
            limit: 3,
        }
    }

    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_technology(mut self, technology: impl Into<String>) -> Self {
        self.technology = Some(technology.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// A previously successful solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub title: String,
    pub problem: String,
    pub solution: String,
    #[serde(default)]
    pub when_to_try: String,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub similarity: f64,
}

#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn search(&self, query: &KnowledgeQuery) -> ShipyardResult<Vec<KnowledgeEntry>>;
}

/// A request to run one tool on the orchestrator's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
        }
    }

    /// Shorthand for a `read_file` request.
    pub fn read_file(path: impl Into<String>) -> Self {
        Self::new("read_file", serde_json::json!({ "path": path.into() }))
    }
}

/// Outcome of a tool call. `allowed` is false when policy refused it outright.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub message: Option<String>,
    pub allowed: bool,
}

impl ToolResponse {
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result,
            message: None,
            allowed: true,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: serde_json::Value::Null,
            message: Some(message.into()),
            allowed: true,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: serde_json::Value::Null,
            message: Some(message.into()),
            allowed: false,
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, request: ToolRequest) -> ShipyardResult<ToolResponse>;
}
