use crate::types::{Task, TaskResult};
use async_trait::async_trait;
use shipyard_core::{AgentType, ShipyardResult};

/// A worker that executes tasks for one role.
///
/// Agents never talk to each other directly; everything they need arrives in
/// the task, and everything they want to say goes back through the hub.
/// Implementations must be safe to invoke concurrently for different tasks.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry id. Must be non-empty and unique within an orchestrator.
    fn id(&self) -> &str;

    fn agent_type(&self) -> AgentType;

    /// Run one task to completion. An `Err` counts as a retryable failure.
    async fn run_task(&self, task: &Task) -> ShipyardResult<TaskResult>;
}
