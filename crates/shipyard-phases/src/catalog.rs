//! Default deliverables and staffing for each phase.

use shipyard_core::{AgentType, Deliverable, DeliverableKind, PhaseName};

/// Template for a deliverable seeded when a phase starts.
#[derive(Debug, Clone, Copy)]
pub struct DeliverableTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: DeliverableKind,
    pub owner: AgentType,
    /// Artifact location relative to the project workspace.
    pub artifact_path: &'static str,
}

const fn template(
    name: &'static str,
    description: &'static str,
    kind: DeliverableKind,
    owner: AgentType,
    artifact_path: &'static str,
) -> DeliverableTemplate {
    DeliverableTemplate {
        name,
        description,
        kind,
        owner,
        artifact_path,
    }
}

const WORKSHOPPING: &[DeliverableTemplate] = &[
    template(
        "requirements_brief",
        "Write the requirements brief from the project goal",
        DeliverableKind::Document,
        AgentType::Workshopper,
        "docs/requirements.md",
    ),
    template(
        "project_plan",
        "Break the brief into milestones and owners",
        DeliverableKind::Document,
        AgentType::ProjectManager,
        "docs/plan.md",
    ),
];

const IMPLEMENTATION: &[DeliverableTemplate] = &[
    template(
        "backend_service",
        "Implement the backend API and data storage",
        DeliverableKind::Code,
        AgentType::Backend,
        "src/backend",
    ),
    template(
        "frontend_app",
        "Implement the frontend UI",
        DeliverableKind::Code,
        AgentType::Frontend,
        "src/frontend",
    ),
    template(
        "security_review",
        "Review authentication and secrets handling",
        DeliverableKind::Document,
        AgentType::Security,
        "docs/security-review.md",
    ),
];

const TESTING: &[DeliverableTemplate] = &[template(
    "test_suite",
    "Write unit and integration tests",
    DeliverableKind::Test,
    AgentType::Qa,
    "tests",
)];

const DEPLOYMENT: &[DeliverableTemplate] = &[
    template(
        "deployment_config",
        "Write container and infrastructure configuration",
        DeliverableKind::Config,
        AgentType::DevOps,
        "deploy",
    ),
    template(
        "release_pr",
        "Open the release pull request",
        DeliverableKind::Document,
        AgentType::Vcs,
        "docs/release.md",
    ),
];

const MONITORING: &[DeliverableTemplate] = &[template(
    "monitoring_config",
    "Configure health checks and alerting",
    DeliverableKind::Config,
    AgentType::DevOps,
    "deploy/monitoring",
)];

const MAINTENANCE: &[DeliverableTemplate] = &[template(
    "user_guide",
    "Write the user and operator guide",
    DeliverableKind::Document,
    AgentType::Documentation,
    "docs/guide.md",
)];

/// Templates for the deliverables of `phase`.
pub fn templates(phase: PhaseName) -> &'static [DeliverableTemplate] {
    match phase {
        PhaseName::Workshopping => WORKSHOPPING,
        PhaseName::Implementation => IMPLEMENTATION,
        PhaseName::Testing => TESTING,
        PhaseName::Deployment => DEPLOYMENT,
        PhaseName::Monitoring => MONITORING,
        PhaseName::Maintenance => MAINTENANCE,
    }
}

/// Fresh pending deliverables of `phase` for a project.
pub fn default_deliverables(project_id: &str, phase: PhaseName) -> Vec<Deliverable> {
    templates(phase)
        .iter()
        .map(|t| {
            Deliverable::new(project_id, phase, t.name, t.kind)
                .with_description(t.description)
                .with_owner(t.owner)
                .with_artifact_path(t.artifact_path)
        })
        .collect()
}

/// Agent roles that staff a phase.
pub fn phase_agent_types(phase: PhaseName) -> &'static [AgentType] {
    match phase {
        PhaseName::Workshopping => &[AgentType::Workshopper, AgentType::ProjectManager],
        PhaseName::Implementation => &[
            AgentType::ProjectManager,
            AgentType::Backend,
            AgentType::Frontend,
            AgentType::Designer,
            AgentType::Security,
            AgentType::Vcs,
        ],
        PhaseName::Testing => &[AgentType::Qa, AgentType::Backend, AgentType::Frontend],
        PhaseName::Deployment => &[AgentType::DevOps, AgentType::Security, AgentType::Vcs],
        PhaseName::Monitoring => &[AgentType::DevOps],
        PhaseName::Maintenance => &[
            AgentType::Documentation,
            AgentType::Backend,
            AgentType::Frontend,
        ],
    }
}
