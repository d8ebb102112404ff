use serde::{Deserialize, Serialize};

/// The six build phases, in their fixed total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Workshopping,
    Implementation,
    Testing,
    Deployment,
    Monitoring,
    Maintenance,
}

impl PhaseName {
    /// All phases in pipeline order.
    pub const ORDER: [PhaseName; 6] = [
        PhaseName::Workshopping,
        PhaseName::Implementation,
        PhaseName::Testing,
        PhaseName::Deployment,
        PhaseName::Monitoring,
        PhaseName::Maintenance,
    ];

    /// Zero-based position in the pipeline.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The phase that must follow this one, if any.
    pub fn next(&self) -> Option<PhaseName> {
        Self::ORDER.get(self.index() + 1).copied()
    }

    /// The phase that must precede this one, if any.
    pub fn previous(&self) -> Option<PhaseName> {
        self.index().checked_sub(1).map(|i| Self::ORDER[i])
    }

    /// The first phase of every build.
    pub fn first() -> PhaseName {
        PhaseName::Workshopping
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseName::Workshopping => "workshopping",
            PhaseName::Implementation => "implementation",
            PhaseName::Testing => "testing",
            PhaseName::Deployment => "deployment",
            PhaseName::Monitoring => "monitoring",
            PhaseName::Maintenance => "maintenance",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        Self::ORDER
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
    }

    /// Default checklist handed to agents entering this phase.
    pub fn checklist(&self) -> &'static [&'static str] {
        match self {
            PhaseName::Workshopping => &[
                "Capture project goal and constraints",
                "Write requirements brief",
                "Agree on scope with stakeholders",
            ],
            PhaseName::Implementation => &[
                "Set up repository and branch strategy",
                "Implement backend services",
                "Implement frontend",
                "Review security-sensitive code",
            ],
            PhaseName::Testing => &[
                "Write unit and integration tests",
                "Reach coverage threshold",
                "Fix failing tests",
            ],
            PhaseName::Deployment => &[
                "Build release artifacts",
                "Provision infrastructure",
                "Deploy and smoke test",
            ],
            PhaseName::Monitoring => &[
                "Configure health checks",
                "Set up alerting",
                "Review first-week metrics",
            ],
            PhaseName::Maintenance => &[
                "Triage incoming issues",
                "Apply dependency updates",
                "Keep documentation current",
            ],
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a phase instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    InProgress,
    Completed,
    Blocked,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_strict() {
        for pair in PhaseName::ORDER.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert_eq!(pair[1].previous(), Some(pair[0]));
        }
    }

    #[test]
    fn test_ends_of_pipeline() {
        assert_eq!(PhaseName::first(), PhaseName::Workshopping);
        assert_eq!(PhaseName::Workshopping.previous(), None);
        assert_eq!(PhaseName::Maintenance.next(), None);
    }

    #[test]
    fn test_parse_name() {
        assert_eq!(PhaseName::parse_name("Testing"), Some(PhaseName::Testing));
        assert_eq!(PhaseName::parse_name(" deployment "), Some(PhaseName::Deployment));
        assert_eq!(PhaseName::parse_name("initialization"), None);
    }

    #[test]
    fn test_every_phase_has_checklist() {
        for phase in PhaseName::ORDER {
            assert!(!phase.checklist().is_empty());
        }
    }
}
