//! Decision parsing and prompt construction for the post-task decision loop.

use crate::classifier::SpecialistClassifier;
use crate::collaborators::{KnowledgeEntry, LlmReply};
use crate::types::{Task, TaskResult};
use serde::{Deserialize, Serialize};
use shipyard_core::AgentType;
use std::fmt::Write as _;

/// Priority given to follow-up tasks when the model does not name one.
pub const DEFAULT_FOLLOW_UP_PRIORITY: i32 = 5;

/// Longest excerpt of a single artifact embedded in a prompt.
pub const MAX_EXCERPT_CHARS: usize = 2000;

/// How many completed tasks the prompt summarizes.
pub const HISTORY_WINDOW: usize = 5;

/// What the orchestrator does after a task completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    CreateTask {
        agent_type: AgentType,
        description: String,
        context: serde_json::Value,
        priority: i32,
        /// Files the follow-up should start from.
        files: Vec<String>,
    },
    Escalate {
        reason: String,
    },
    Complete,
    Wait,
}

impl Decision {
    /// Wire name of the action, as used in prompts and decision logs.
    pub fn action(&self) -> &'static str {
        match self {
            Decision::CreateTask { .. } => "create_task",
            Decision::Escalate { .. } => "escalate_to_human",
            Decision::Complete => "project_complete",
            Decision::Wait => "wait_for_more_tasks",
        }
    }
}

/// A decision together with what the model said about it.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDecision {
    pub decision: Decision,
    pub reasoning: String,
    pub confidence: Option<f64>,
    /// Set when the reply could not be used and the decision fell back to `Wait`.
    pub parse_error: Option<String>,
}

impl ParsedDecision {
    fn fallback(error: impl Into<String>) -> Self {
        Self {
            decision: Decision::Wait,
            reasoning: String::new(),
            confidence: None,
            parse_error: Some(error.into()),
        }
    }
}

/// Parse a model reply. Never fails: anything unusable becomes `Wait`.
///
/// A `create_task` without an agent type is classified from its description.
/// An agent type that is present but unknown is not guessed at.
pub fn parse_decision(reply: &LlmReply, classifier: &dyn SpecialistClassifier) -> ParsedDecision {
    let value = match reply {
        LlmReply::Structured(value) => value.clone(),
        LlmReply::Text(text) => match extract_json(text) {
            Some(value) => value,
            None => return ParsedDecision::fallback("reply contains no JSON object"),
        },
    };
    let Some(object) = value.as_object() else {
        return ParsedDecision::fallback("reply is not a JSON object");
    };

    let reasoning = str_field(&value, &["reasoning", "reason", "rationale"])
        .unwrap_or_default()
        .to_string();
    let confidence = object
        .get("confidence")
        .and_then(|v| v.as_f64())
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0));

    let Some(action) = object.get("action").and_then(|v| v.as_str()) else {
        return ParsedDecision::fallback("reply has no action");
    };

    let decision = match action.trim().to_lowercase().as_str() {
        "create_task" => {
            let Some(description) = str_field(&value, &["task_description", "description"])
                .map(str::trim)
                .filter(|d| !d.is_empty())
            else {
                return ParsedDecision::fallback("create_task without a description");
            };
            let agent_type = match str_field(&value, &["next_agent_type", "agent_type"]) {
                Some(name) => match AgentType::parse_type(name) {
                    Some(agent_type) => agent_type,
                    None => {
                        return ParsedDecision::fallback(format!("unknown agent type '{name}'"))
                    }
                },
                None => classifier
                    .classify(description)
                    .first()
                    .copied()
                    .unwrap_or(AgentType::Backend),
            };
            let priority = object
                .get("priority")
                .and_then(|v| v.as_i64())
                .and_then(|p| i32::try_from(p).ok())
                .unwrap_or(DEFAULT_FOLLOW_UP_PRIORITY);
            let files = ["files", "referenced_files"]
                .iter()
                .find_map(|key| object.get(*key).and_then(|v| v.as_array()))
                .map(|files| {
                    files
                        .iter()
                        .filter_map(|f| f.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            Decision::CreateTask {
                agent_type,
                description: description.to_string(),
                context: object
                    .get("context")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null),
                priority,
                files,
            }
        }
        "escalate_to_human" | "escalate" => Decision::Escalate {
            reason: str_field(&value, &["reason", "escalation_reason"])
                .map(str::to_string)
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| {
                    if reasoning.is_empty() {
                        "model requested human review".to_string()
                    } else {
                        reasoning.clone()
                    }
                }),
        },
        "project_complete" | "complete" => Decision::Complete,
        "wait_for_more_tasks" | "wait" => Decision::Wait,
        other => return ParsedDecision::fallback(format!("unknown action '{other}'")),
    };

    ParsedDecision {
        decision,
        reasoning,
        confidence,
        parse_error: None,
    }
}

fn str_field<'a>(value: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| value.get(*key).and_then(|v| v.as_str()))
}

/// Pull the first JSON object out of free text, tolerating code fences and prose.
fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Digest of a finished task for the prompt's history section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDigest {
    pub task_id: String,
    pub agent_type: Option<AgentType>,
    pub description: String,
    pub success: bool,
}

/// Project snapshot the decision prompt is built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectContext {
    pub project_id: String,
    pub goal: String,
    pub phase: String,
    /// Most recent last.
    pub recent_tasks: Vec<TaskDigest>,
    pub roster: serde_json::Value,
    pub queue_depth: usize,
    pub completed_count: usize,
}

/// An artifact excerpt read for the prompt.
#[derive(Debug, Clone)]
pub struct ArtifactExcerpt {
    pub path: String,
    pub content: String,
}

impl ArtifactExcerpt {
    pub fn new(path: impl Into<String>, content: &str) -> Self {
        Self {
            path: path.into(),
            content: truncate_chars(content, MAX_EXCERPT_CHARS),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte, _)) => format!("{}\n... (truncated)", &text[..byte]),
        None => text.to_string(),
    }
}

/// Build the natural-language prompt for the decision model.
pub fn build_decision_prompt(
    context: &ProjectContext,
    task: &Task,
    result: &TaskResult,
    artifacts: &[ArtifactExcerpt],
    hints: &[KnowledgeEntry],
) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "You coordinate a team of specialist agents building a software project."
    );
    let _ = writeln!(prompt, "\n## Project\nGoal: {}", context.goal);
    let _ = writeln!(prompt, "Current phase: {}", context.phase);
    let _ = writeln!(
        prompt,
        "Completed tasks: {} | Queued tasks: {}",
        context.completed_count, context.queue_depth
    );

    let _ = writeln!(prompt, "\n## Task just finished");
    let _ = writeln!(prompt, "Id: {}", task.id);
    let _ = writeln!(
        prompt,
        "Agent: {}",
        task.agent_type.map_or("unassigned", |t| t.as_str())
    );
    let _ = writeln!(prompt, "Description: {}", task.description);
    let _ = writeln!(
        prompt,
        "Outcome: {}",
        if result.success { "success" } else { "failure" }
    );
    if let Some(summary) = &result.summary {
        let _ = writeln!(prompt, "Summary: {summary}");
    }
    for step in &result.steps {
        let _ = writeln!(prompt, "- step: {step}");
    }
    for error in &result.errors {
        let _ = writeln!(prompt, "- error: {error}");
    }

    if !artifacts.is_empty() {
        let _ = writeln!(prompt, "\n## Artifacts");
        for artifact in artifacts {
            let _ = writeln!(prompt, "### {}\n```\n{}\n```", artifact.path, artifact.content);
        }
    }

    if !context.recent_tasks.is_empty() {
        let _ = writeln!(prompt, "\n## Recent history");
        for digest in &context.recent_tasks {
            let _ = writeln!(
                prompt,
                "- [{}] {} ({}): {}",
                if digest.success { "ok" } else { "failed" },
                digest.task_id,
                digest.agent_type.map_or("unassigned", |t| t.as_str()),
                digest.description
            );
        }
    }

    let _ = writeln!(prompt, "\n## Team\n{}", context.roster);

    if !hints.is_empty() {
        let _ = writeln!(prompt, "\n## Solutions that worked before");
        for hint in hints.iter().take(3) {
            let _ = writeln!(
                prompt,
                "- {}: {} -> {} (try when: {}, used {} times)",
                hint.title, hint.problem, hint.solution, hint.when_to_try, hint.success_count
            );
        }
    }

    let agent_types: Vec<&str> = AgentType::ALL.iter().map(|t| t.as_str()).collect();
    let _ = writeln!(
        prompt,
        "\n## Respond\nReply with one JSON object. Fields: \"action\" (one of create_task, \
         escalate_to_human, project_complete, wait_for_more_tasks), \"reasoning\", \
         \"confidence\" (0 to 1). For create_task also give \"next_agent_type\" (one of {}), \
         \"task_description\", optional \"priority\", \"context\" and \"files\". For \
         escalate_to_human give \"reason\".",
        agent_types.join(", ")
    );
    prompt
}
