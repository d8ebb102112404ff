use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Role of an agent in the build fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Runs the requirements workshop with the user and writes the brief.
    Workshopper,
    /// Breaks the brief into a plan and tracks deliverables.
    ProjectManager,
    /// Server-side code, APIs, and data storage.
    Backend,
    /// Client-side code and UI wiring.
    Frontend,
    /// Visual and interaction design.
    Designer,
    /// Security review, auth, and secrets handling.
    Security,
    /// Build, packaging, and deployment.
    #[serde(rename = "devops")]
    DevOps,
    /// Test authoring and quality assurance.
    Qa,
    /// User and developer documentation.
    Documentation,
    /// Version control, branches, and pull requests.
    Vcs,
}

impl AgentType {
    /// Every role, in declaration order.
    pub const ALL: [AgentType; 10] = [
        AgentType::Workshopper,
        AgentType::ProjectManager,
        AgentType::Backend,
        AgentType::Frontend,
        AgentType::Designer,
        AgentType::Security,
        AgentType::DevOps,
        AgentType::Qa,
        AgentType::Documentation,
        AgentType::Vcs,
    ];

    /// Stable wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Workshopper => "workshopper",
            AgentType::ProjectManager => "project_manager",
            AgentType::Backend => "backend",
            AgentType::Frontend => "frontend",
            AgentType::Designer => "designer",
            AgentType::Security => "security",
            AgentType::DevOps => "devops",
            AgentType::Qa => "qa",
            AgentType::Documentation => "documentation",
            AgentType::Vcs => "vcs",
        }
    }

    /// Lenient parse accepting the wire name plus common aliases.
    pub fn parse_type(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        let agent_type = match normalized.as_str() {
            "workshopper" | "workshop" => AgentType::Workshopper,
            "project_manager" | "pm" | "planner" => AgentType::ProjectManager,
            "backend" | "backend_developer" | "backend_dev" => AgentType::Backend,
            "frontend" | "frontend_developer" | "frontend_dev" => AgentType::Frontend,
            "designer" | "ui_designer" | "ux" => AgentType::Designer,
            "security" | "security_specialist" | "security_expert" => AgentType::Security,
            "devops" | "dev_ops" | "devops_engineer" => AgentType::DevOps,
            "qa" | "qa_engineer" | "tester" => AgentType::Qa,
            "documentation" | "docs" | "technical_writer" => AgentType::Documentation,
            "vcs" | "git" | "github" | "github_specialist" => AgentType::Vcs,
            _ => return None,
        };
        Some(agent_type)
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = crate::ShipyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_type(s).ok_or_else(|| {
            crate::ShipyardError::InvalidArgument(format!("unknown agent type '{s}'"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_serde() {
        for agent_type in AgentType::ALL {
            let json = serde_json::to_string(&agent_type).unwrap();
            assert_eq!(json, format!("\"{agent_type}\""));
        }
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(AgentType::parse_type("Project Manager"), Some(AgentType::ProjectManager));
        assert_eq!(AgentType::parse_type("github_specialist"), Some(AgentType::Vcs));
        assert_eq!(AgentType::parse_type("dev-ops"), Some(AgentType::DevOps));
        assert_eq!(AgentType::parse_type("tester"), Some(AgentType::Qa));
        assert_eq!(AgentType::parse_type("astronaut"), None);
    }

    #[test]
    fn test_from_str_error() {
        let err = "nobody".parse::<AgentType>().unwrap_err();
        assert!(matches!(err, crate::ShipyardError::InvalidArgument(_)));
    }
}
