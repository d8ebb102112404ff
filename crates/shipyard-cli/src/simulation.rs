//! In-process build simulation: scripted agents and a rule-based decider
//! standing in for real workers and an LLM.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use shipyard_core::{AgentType, PhaseName, ShipyardResult};
use shipyard_orchestrator::{Agent, LlmDecider, LlmReply, Task, TaskResult};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent that writes a placeholder artifact for every task it receives.
pub struct SimulatedAgent {
    id: String,
    agent_type: AgentType,
    workspace: PathBuf,
    delay: Duration,
}

impl SimulatedAgent {
    pub fn new(agent_type: AgentType, workspace: impl Into<PathBuf>) -> Self {
        Self {
            id: format!("{agent_type}-sim"),
            agent_type,
            workspace: workspace.into(),
            delay: Duration::from_millis(20),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// File an artifact path resolves to: paths without an extension are
/// directories and get a README.
pub fn artifact_file(artifact_path: &str) -> String {
    if Path::new(artifact_path).extension().is_some() {
        artifact_path.to_string()
    } else {
        format!("{}/README.md", artifact_path.trim_end_matches('/'))
    }
}

#[async_trait]
impl Agent for SimulatedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn run_task(&self, task: &Task) -> ShipyardResult<TaskResult> {
        tokio::time::sleep(self.delay).await;

        let relative = match task.payload.get("artifact_path").and_then(|p| p.as_str()) {
            Some(path) => artifact_file(path),
            None => format!("notes/{}.md", task.id),
        };
        let target = self.workspace.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = format!(
            "# {}\n\nProduced by {} for task {}.\n",
            task.description, self.id, task.id
        );
        tokio::fs::write(&target, body).await?;

        Ok(TaskResult::success()
            .with_step(format!("wrote {relative}"))
            .with_artifact(relative)
            .with_confidence(0.85)
            .with_summary(format!("{} finished {}", self.agent_type, task.task_type)))
    }
}

/// One follow-up the decider schedules when a completed task mentions `trigger`.
struct FollowUp {
    trigger: &'static str,
    agent_type: AgentType,
    description: &'static str,
}

const FOLLOW_UPS: &[FollowUp] = &[
    FollowUp {
        trigger: "backend_service",
        agent_type: AgentType::Qa,
        description: "Write API contract tests for the backend service",
    },
    FollowUp {
        trigger: "frontend_app",
        agent_type: AgentType::Designer,
        description: "Review the frontend against the design system",
    },
    FollowUp {
        trigger: "deployment_config",
        agent_type: AgentType::Documentation,
        description: "Document the deployment runbook",
    },
];

/// Rule-based stand-in for the LLM: each follow-up fires once, otherwise it
/// waits for the phase's own deliverable tasks.
pub struct PlaybookDecider {
    fired: Mutex<HashSet<&'static str>>,
}

impl PlaybookDecider {
    pub fn new() -> Self {
        Self {
            fired: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for PlaybookDecider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmDecider for PlaybookDecider {
    async fn query(&self, prompt: &str) -> ShipyardResult<LlmReply> {
        let completed = completed_section(prompt);
        let follow_up = {
            let mut fired = self.fired.lock();
            FOLLOW_UPS
                .iter()
                .find(|f| completed.contains(f.trigger) && fired.insert(f.trigger))
        };
        let reply = match follow_up {
            Some(f) => json!({
                "action": "create_task",
                "next_agent_type": f.agent_type,
                "task_description": f.description,
                "priority": 4,
                "reasoning": format!("{} finished; {} should follow up", f.trigger, f.agent_type),
                "confidence": 0.8,
            }),
            None => json!({
                "action": "wait_for_more_tasks",
                "reasoning": "remaining work is covered by phase deliverables",
                "confidence": 0.9,
            }),
        };
        Ok(LlmReply::Structured(reply))
    }

    async fn evaluate_confidence(&self, _payload: &serde_json::Value) -> ShipyardResult<f64> {
        Ok(0.8)
    }
}

/// The part of a decision prompt describing the task that just finished.
fn completed_section(prompt: &str) -> &str {
    const HEADER: &str = "## Task just finished";
    let Some(start) = prompt.find(HEADER) else {
        return "";
    };
    let rest = &prompt[start + HEADER.len()..];
    let end = rest.find("\n## ").unwrap_or(rest.len());
    &rest[..end]
}

/// Quality figures the simulation reports for a phase before advancing.
pub fn simulated_coverage(phase: PhaseName) -> f64 {
    match phase {
        PhaseName::Workshopping => 100.0,
        PhaseName::Testing => 94.0,
        _ => 91.5,
    }
}
