use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::{Deliverable, PhaseName, ShipyardError, ShipyardResult};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Name of the manifest written next to archived artifacts.
pub const MANIFEST_FILE: &str = "manifest.json";

/// One artifact copied into the archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedArtifact {
    pub deliverable_id: String,
    pub name: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Files copied, counting every file under a directory artifact.
    pub files: usize,
}

/// Record of a phase's archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub project_id: String,
    pub phase: PhaseName,
    pub archived_at: DateTime<Utc>,
    pub artifacts: Vec<ArchivedArtifact>,
    /// Deliverables whose artifact was missing or unusable.
    pub skipped: Vec<String>,
}

impl ArchiveManifest {
    pub fn file_count(&self) -> usize {
        self.artifacts.iter().map(|a| a.files).sum()
    }
}

/// Copies deliverable artifacts out of a project workspace into
/// `<data_dir>/archive/<project>/<phase>/`.
pub struct PhaseArchive {
    workspace: PathBuf,
    archive_root: PathBuf,
}

impl PhaseArchive {
    pub fn new(workspace: impl Into<PathBuf>, data_dir: impl AsRef<Path>) -> Self {
        Self {
            workspace: workspace.into(),
            archive_root: data_dir.as_ref().join("archive"),
        }
    }

    pub fn phase_dir(&self, project_id: &str, phase: PhaseName) -> PathBuf {
        self.archive_root.join(project_id).join(phase.as_str())
    }

    /// Archive every deliverable artifact of a phase and write the manifest.
    ///
    /// Missing artifacts are skipped with a warning; I/O failures while
    /// copying an existing artifact abort the archive.
    pub async fn archive_phase(
        &self,
        project_id: &str,
        phase: PhaseName,
        deliverables: &[Deliverable],
    ) -> ShipyardResult<ArchiveManifest> {
        let target = self.phase_dir(project_id, phase);
        tokio::fs::create_dir_all(&target).await?;

        let mut manifest = ArchiveManifest {
            project_id: project_id.to_string(),
            phase,
            archived_at: Utc::now(),
            artifacts: Vec::new(),
            skipped: Vec::new(),
        };

        for deliverable in deliverables {
            let Some(relative) = deliverable.artifact_path.as_deref() else {
                manifest.skipped.push(deliverable.name.clone());
                continue;
            };
            if !is_contained(relative) {
                warn!(
                    deliverable = %deliverable.name,
                    path = %relative,
                    "artifact path leaves the workspace"
                );
                manifest.skipped.push(deliverable.name.clone());
                continue;
            }
            let source = self.workspace.join(relative);
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                warn!(
                    deliverable = %deliverable.name,
                    path = %source.display(),
                    "artifact missing, not archived"
                );
                manifest.skipped.push(deliverable.name.clone());
                continue;
            }
            let destination = target.join(relative);
            let files = copy_tree(&source, &destination).await?;
            manifest.artifacts.push(ArchivedArtifact {
                deliverable_id: deliverable.id.clone(),
                name: deliverable.name.clone(),
                source,
                destination,
                files,
            });
        }

        let json = serde_json::to_string_pretty(&manifest)?;
        tokio::fs::write(target.join(MANIFEST_FILE), json).await?;

        info!(
            project = %project_id,
            phase = %phase,
            artifacts = manifest.artifacts.len(),
            skipped = manifest.skipped.len(),
            "phase archived"
        );
        Ok(manifest)
    }

    /// Read a phase's manifest, if it was archived.
    pub async fn load_manifest(
        &self,
        project_id: &str,
        phase: PhaseName,
    ) -> ShipyardResult<Option<ArchiveManifest>> {
        let path = self.phase_dir(project_id, phase).join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Delete a phase's archive.
    pub async fn remove(&self, project_id: &str, phase: PhaseName) -> ShipyardResult<()> {
        let dir = self.phase_dir(project_id, phase);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

fn is_contained(relative: &str) -> bool {
    let path = Path::new(relative);
    !relative.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Copy a file or directory tree, returning the number of files copied.
async fn copy_tree(source: &Path, destination: &Path) -> ShipyardResult<usize> {
    let metadata = tokio::fs::metadata(source).await?;
    if metadata.is_file() {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, destination).await?;
        return Ok(1);
    }
    if !metadata.is_dir() {
        return Err(ShipyardError::InvalidArgument(format!(
            "{} is neither a file nor a directory",
            source.display()
        )));
    }

    let mut copied = 0;
    let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let dest = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((path, dest));
            } else {
                tokio::fs::copy(&path, &dest).await?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}
