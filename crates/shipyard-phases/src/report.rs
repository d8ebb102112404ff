use crate::validator::ValidationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{PhaseName, ShipyardResult};
use std::path::{Path, PathBuf};

/// Summary written for every completed phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionReport {
    pub project_id: String,
    pub from: PhaseName,
    pub to: PhaseName,
    /// Names of the deliverables the finished phase produced.
    pub achievements: Vec<String>,
    /// Checklist handed to the agents of the next phase.
    pub next_checklist: Vec<String>,
    pub new_phase_agents: Vec<String>,
    pub validation: ValidationResult,
    /// Files copied into the phase archive.
    pub archived_files: usize,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

/// JSON file store for transition reports under `<data_dir>/reports`.
pub struct JsonReportStore {
    base_dir: PathBuf,
}

impl JsonReportStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("reports"),
        }
    }

    /// Save a report and return the path it was written to.
    pub async fn save_report(&self, report: &TransitionReport) -> ShipyardResult<PathBuf> {
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let timestamp = report.created_at.format("%Y%m%d_%H%M%S_%3f");
        let filename = format!("{}_{}_{timestamp}.json", report.project_id, report.from);
        let path = self.base_dir.join(filename);

        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }

    /// The most recent report of a project.
    pub async fn load_latest(&self, project_id: &str) -> ShipyardResult<Option<TransitionReport>> {
        let mut reports = Vec::new();
        for path in self.list_reports_for(&format!("{project_id}_")).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let report: TransitionReport = serde_json::from_str(&content)?;
            reports.push(report);
        }
        Ok(reports.into_iter().max_by_key(|r| r.created_at))
    }

    /// All report files, sorted by name.
    pub async fn list_reports(&self) -> ShipyardResult<Vec<PathBuf>> {
        self.list_reports_for("").await
    }

    async fn list_reports_for(&self, prefix: &str) -> ShipyardResult<Vec<PathBuf>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir).await?;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.ends_with(".json") && name.starts_with(prefix) {
                    entries.push(path);
                }
            }
        }

        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(project: &str, from: PhaseName) -> TransitionReport {
        let to = from.next().unwrap_or(from);
        TransitionReport {
            project_id: project.to_string(),
            from,
            to,
            achievements: vec!["requirements_brief".into()],
            next_checklist: to.checklist().iter().map(|s| s.to_string()).collect(),
            new_phase_agents: vec![],
            validation: ValidationResult {
                phase: from,
                can_complete: true,
                score: 1.0,
                blockers: vec![],
                warnings: vec![],
                criteria: vec![],
                requires_approval: false,
            },
            archived_files: 0,
            summary: format!("{from} complete"),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonReportStore::new(dir.path());

        let path = store
            .save_report(&report("p1", PhaseName::Workshopping))
            .await
            .unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("reports")));

        let mut later = report("p1", PhaseName::Implementation);
        later.created_at += chrono::Duration::seconds(1);
        store.save_report(&later).await.unwrap();

        let latest = store.load_latest("p1").await.unwrap().unwrap();
        assert_eq!(latest.from, PhaseName::Implementation);
        assert_eq!(store.list_reports().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_latest_scoped_to_project() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonReportStore::new(dir.path());
        assert!(store.load_latest("p1").await.unwrap().is_none());

        store
            .save_report(&report("p2", PhaseName::Workshopping))
            .await
            .unwrap();
        assert!(store.load_latest("p1").await.unwrap().is_none());
    }
}
