//! Hub-and-spoke orchestration engine with a priority task queue, an
//! LLM-mediated decision loop, and a worker pool.
//!
//! The [`Orchestrator`] owns one project's agent registry, task queue and
//! state. Agents never message each other; every message passes through the
//! hub. After each completed task the decision engine asks the configured
//! [`LlmDecider`] what happens next and either queues a follow-up, opens a
//! human-approval gate, marks the project complete, or waits.
//!
//! # Main types
//!
//! - [`Orchestrator`]: The hub: registry, queue, routing, escalation, decisions.
//! - [`TaskExecutor`]: Worker pool that runs queued tasks on agents with timeouts and retries.
//! - [`TaskQueue`]: Lock-protected priority queue, FIFO within a priority.
//! - [`AgentMonitor`]: Agent status, load and counters.
//! - [`SpecialistClassifier`] / [`KeywordClassifier`]: Maps task text to agent roles.
//! - [`Decision`]: The four actions the decision engine can take.
//! - [`Agent`]: Contract for task-running workers.

/// Agent contract.
pub mod agent;
/// Specialist classification of task text.
pub mod classifier;
/// Contracts for LLM, logging, knowledge and tool collaborators.
pub mod collaborators;
/// Decision parsing and prompt construction.
pub mod decision;
/// JSONL decision log.
pub mod decision_log;
/// The orchestrator hub.
pub mod engine;
/// Worker pool.
pub mod executor;
/// Sandboxed artifact reader.
pub mod file_tool;
/// Agent registry and load tracking.
pub mod monitor;
/// Priority task queue.
pub mod task_queue;
/// Tasks, results, agents, messages and project state.
pub mod types;
/// Per-deliverable verification failure tracking.
pub mod verification;

pub use agent::Agent;
pub use classifier::{infer_agent_type, KeywordClassifier, SpecialistClassifier};
pub use collaborators::{
    DecisionEntry, DecisionLogger, KnowledgeBase, KnowledgeEntry, KnowledgeQuery, LlmDecider,
    LlmReply, ToolExecutor, ToolRequest, ToolResponse,
};
pub use decision::{parse_decision, Decision, ParsedDecision, ProjectContext};
pub use decision_log::{read_decision_log, JsonlDecisionLogger};
pub use engine::{
    DecisionOutcome, HelpRequest, Orchestrator, OrchestratorConfig, SpecialistRoute,
    VerificationOutcome, DEFAULT_HUB_ID,
};
pub use executor::{ExecutorConfig, ExecutorStats, TaskExecutor, TaskOutcome};
pub use file_tool::FileToolExecutor;
pub use monitor::AgentMonitor;
pub use task_queue::TaskQueue;
pub use types::{
    AgentInfo, AgentStatus, Message, MessageType, ProjectState, Task, TaskResult, TaskStatus,
    TaskSummary,
};
pub use verification::VerificationTracker;
