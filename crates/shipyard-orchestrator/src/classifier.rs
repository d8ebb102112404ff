//! Specialist classification: which agent role should run a task.

use crate::types::Task;
use regex::Regex;
use shipyard_core::{AgentType, ShipyardError, ShipyardResult};

/// Maps free task text to candidate agent roles.
pub trait SpecialistClassifier: Send + Sync {
    /// Candidate roles in preference order. Never empty.
    fn classify(&self, text: &str) -> Vec<AgentType>;
}

struct Rule {
    pattern: Regex,
    candidates: Vec<AgentType>,
}

/// Keyword heuristics over task text. The first matching rule wins; text that
/// matches nothing falls back to the backend/frontend generalist pair.
pub struct KeywordClassifier {
    rules: Vec<Rule>,
    fallback: Vec<AgentType>,
}

const DEFAULT_RULES: &[(&str, &[AgentType])] = &[
    (
        r"(?i)\b(security|secure|auth\w*|login|oauth|jwt|encrypt\w*|vulnerab\w*|permissions?|secrets?)\b",
        &[AgentType::Security],
    ),
    (
        r"(?i)\b(deploy\w*|docker\w*|kubernetes|k8s|helm|infrastructure|containers?|ci/cd|terraform)\b",
        &[AgentType::DevOps],
    ),
    (
        r"(?i)\b(api|apis|endpoints?|database\w*|db|sql|schema|migrations?|backend|server)\b",
        &[AgentType::Backend],
    ),
    (
        r"(?i)\b(ui|ux|frontend|front-end|components?|css|layout|pages?|screens?|styling|mockups?)\b",
        &[AgentType::Frontend, AgentType::Designer],
    ),
    (
        r"(?i)\b(tests?|testing|qa|coverage|e2e|regression)\b",
        &[AgentType::Qa],
    ),
    (
        r"(?i)\b(docs?|documentation|readme|guides?|changelog)\b",
        &[AgentType::Documentation],
    ),
    (
        r"(?i)\b(git|github|pr|prs|pull requests?|branch\w*|commits?|merge)\b",
        &[AgentType::Vcs],
    ),
    (
        r"(?i)\b(workshop\w*|requirements?|brief|stakeholders?)\b",
        &[AgentType::Workshopper],
    ),
    (
        r"(?i)\b(plan|planning|roadmap|milestones?|backlog)\b",
        &[AgentType::ProjectManager],
    ),
];

impl KeywordClassifier {
    /// Classifier with the built-in rule table.
    pub fn new() -> Self {
        let rules = DEFAULT_RULES
            .iter()
            .filter_map(|(pattern, candidates)| {
                Regex::new(pattern).ok().map(|pattern| Rule {
                    pattern,
                    candidates: candidates.to_vec(),
                })
            })
            .collect();
        Self {
            rules,
            fallback: vec![AgentType::Backend, AgentType::Frontend],
        }
    }

    /// Add a rule evaluated before the existing ones.
    pub fn with_priority_rule(
        mut self,
        pattern: &str,
        candidates: Vec<AgentType>,
    ) -> ShipyardResult<Self> {
        if candidates.is_empty() {
            return Err(ShipyardError::InvalidArgument(
                "classifier rule needs at least one candidate".into(),
            ));
        }
        let pattern = Regex::new(pattern).map_err(|e| {
            ShipyardError::Config(format!("invalid classifier pattern '{pattern}': {e}"))
        })?;
        self.rules.insert(
            0,
            Rule {
                pattern,
                candidates,
            },
        );
        Ok(self)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecialistClassifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Vec<AgentType> {
        self.rules
            .iter()
            .find(|rule| rule.pattern.is_match(text))
            .map(|rule| rule.candidates.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Text a classifier sees for a task: type, description, and string metadata.
pub fn classification_text(task: &Task) -> String {
    let mut parts = vec![task.task_type.clone(), task.description.clone()];
    if let Some(description) = task.payload.get("description").and_then(|v| v.as_str()) {
        parts.push(description.to_string());
    }
    parts.extend(
        task.metadata
            .values()
            .filter_map(|v| v.as_str().map(str::to_string)),
    );
    parts.join(" ")
}

/// Pick the role for an unassigned task: the first candidate.
pub fn infer_agent_type(classifier: &dyn SpecialistClassifier, task: &Task) -> AgentType {
    classifier
        .classify(&classification_text(task))
        .first()
        .copied()
        .unwrap_or(AgentType::Backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first(text: &str) -> AgentType {
        KeywordClassifier::new().classify(text)[0]
    }

    #[test]
    fn test_all_default_rules_compile() {
        assert_eq!(KeywordClassifier::new().rule_count(), DEFAULT_RULES.len());
    }

    #[test]
    fn test_security_keywords() {
        assert_eq!(first("Add OAuth login flow"), AgentType::Security);
        assert_eq!(first("Harden authentication"), AgentType::Security);
        assert_eq!(first("rotate secrets"), AgentType::Security);
    }

    #[test]
    fn test_devops_keywords() {
        assert_eq!(first("Write a Dockerfile"), AgentType::DevOps);
        assert_eq!(first("deploy to staging"), AgentType::DevOps);
    }

    #[test]
    fn test_backend_keywords() {
        assert_eq!(first("Design the REST API"), AgentType::Backend);
        assert_eq!(first("create database schema"), AgentType::Backend);
    }

    #[test]
    fn test_frontend_keywords_yield_designer_pair() {
        let candidates = KeywordClassifier::new().classify("Build the settings page UI");
        assert_eq!(candidates, vec![AgentType::Frontend, AgentType::Designer]);
    }

    #[test]
    fn test_qa_docs_vcs_keywords() {
        assert_eq!(first("increase test coverage"), AgentType::Qa);
        assert_eq!(first("update the README"), AgentType::Documentation);
        assert_eq!(first("open a pull request"), AgentType::Vcs);
    }

    #[test]
    fn test_workshop_and_planning_keywords() {
        assert_eq!(first("Gather requirements"), AgentType::Workshopper);
        assert_eq!(first("Draft the roadmap"), AgentType::ProjectManager);
    }

    #[test]
    fn test_rule_order_security_wins() {
        // Matches both security and backend; security is listed first.
        assert_eq!(first("auth API endpoint"), AgentType::Security);
    }

    #[test]
    fn test_word_boundaries() {
        // "rapid" contains "api" and "protest" contains "test".
        assert_eq!(
            KeywordClassifier::new().classify("rapid protest"),
            vec![AgentType::Backend, AgentType::Frontend]
        );
    }

    #[test]
    fn test_fallback_pair() {
        let candidates = KeywordClassifier::new().classify("make it nicer");
        assert_eq!(candidates, vec![AgentType::Backend, AgentType::Frontend]);
    }

    #[test]
    fn test_priority_rule() {
        let classifier = KeywordClassifier::new()
            .with_priority_rule(r"(?i)\bwiki\b", vec![AgentType::Documentation])
            .unwrap();
        assert_eq!(classifier.classify("deploy the wiki")[0], AgentType::Documentation);
        assert!(KeywordClassifier::new().with_priority_rule("(", vec![AgentType::Qa]).is_err());
        assert!(KeywordClassifier::new().with_priority_rule("x", vec![]).is_err());
    }

    #[test]
    fn test_infer_uses_metadata() {
        let task = Task::new("generic", "do the thing")
            .with_metadata("hint", serde_json::json!("kubernetes manifests"));
        let classifier = KeywordClassifier::new();
        assert_eq!(infer_agent_type(&classifier, &task), AgentType::DevOps);
    }
}
