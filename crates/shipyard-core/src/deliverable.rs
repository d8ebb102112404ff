//! Deliverables: the units of required output tracked to completion within a phase.

use crate::{AgentType, PhaseName, ShipyardError, ShipyardResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Kind of output a deliverable represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverableKind {
    Document,
    Code,
    Test,
    Config,
}

/// Completion status of a deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverableStatus {
    Pending,
    InProgress,
    Completed,
    Validated,
    Failed,
}

/// A required output of a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: String,
    pub project_id: String,
    pub phase: PhaseName,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: DeliverableKind,
    pub status: DeliverableStatus,
    /// Role expected to produce this deliverable; inferred when absent.
    #[serde(default)]
    pub owner: Option<AgentType>,
    /// Path of the produced artifact, once known.
    #[serde(default)]
    pub artifact_path: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Deliverable {
    pub fn new(
        project_id: impl Into<String>,
        phase: PhaseName,
        name: impl Into<String>,
        kind: DeliverableKind,
    ) -> Self {
        Self {
            id: crate::new_id(),
            project_id: project_id.into(),
            phase,
            name: name.into(),
            description: String::new(),
            kind,
            status: DeliverableStatus::Pending,
            owner: None,
            artifact_path: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_owner(mut self, owner: AgentType) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_artifact_path(mut self, path: impl Into<String>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }

    /// Completed or validated deliverables count as done for phase gating.
    pub fn is_done(&self) -> bool {
        matches!(
            self.status,
            DeliverableStatus::Completed | DeliverableStatus::Validated
        )
    }

    pub fn is_pending(&self) -> bool {
        self.status == DeliverableStatus::Pending
    }
}

/// Storage for deliverables, keyed by id.
#[async_trait]
pub trait DeliverableStore: Send + Sync {
    /// Insert or replace a deliverable.
    async fn upsert(&self, deliverable: Deliverable) -> ShipyardResult<()>;

    async fn get(&self, id: &str) -> ShipyardResult<Option<Deliverable>>;

    /// All deliverables of one phase of a project, in creation order.
    async fn list_for_phase(
        &self,
        project_id: &str,
        phase: PhaseName,
    ) -> ShipyardResult<Vec<Deliverable>>;

    /// Change a deliverable's status. Fails with `NotFound` for unknown ids.
    async fn update_status(
        &self,
        id: &str,
        status: DeliverableStatus,
        artifact_path: Option<String>,
    ) -> ShipyardResult<Deliverable>;

    /// Mark a deliverable completed, recording its artifact path if given.
    async fn mark_completed(
        &self,
        id: &str,
        artifact_path: Option<String>,
    ) -> ShipyardResult<Deliverable> {
        self.update_status(id, DeliverableStatus::Completed, artifact_path)
            .await
    }
}

/// Process-local deliverable store.
pub struct InMemoryDeliverableStore {
    items: RwLock<HashMap<String, Deliverable>>,
}

impl InMemoryDeliverableStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored deliverables across all projects.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl Default for InMemoryDeliverableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliverableStore for InMemoryDeliverableStore {
    async fn upsert(&self, deliverable: Deliverable) -> ShipyardResult<()> {
        if deliverable.id.is_empty() {
            return Err(ShipyardError::InvalidArgument(
                "deliverable id must not be empty".into(),
            ));
        }
        self.items
            .write()
            .insert(deliverable.id.clone(), deliverable);
        Ok(())
    }

    async fn get(&self, id: &str) -> ShipyardResult<Option<Deliverable>> {
        Ok(self.items.read().get(id).cloned())
    }

    async fn list_for_phase(
        &self,
        project_id: &str,
        phase: PhaseName,
    ) -> ShipyardResult<Vec<Deliverable>> {
        let mut items: Vec<Deliverable> = self
            .items
            .read()
            .values()
            .filter(|d| d.project_id == project_id && d.phase == phase)
            .cloned()
            .collect();
        items.sort_by_key(|d| d.created_at);
        Ok(items)
    }

    async fn update_status(
        &self,
        id: &str,
        status: DeliverableStatus,
        artifact_path: Option<String>,
    ) -> ShipyardResult<Deliverable> {
        let mut items = self.items.write();
        let deliverable = items
            .get_mut(id)
            .ok_or_else(|| ShipyardError::NotFound(format!("deliverable {id}")))?;
        deliverable.status = status;
        if artifact_path.is_some() {
            deliverable.artifact_path = artifact_path;
        }
        if matches!(
            status,
            DeliverableStatus::Completed | DeliverableStatus::Validated
        ) {
            deliverable.completed_at = Some(Utc::now());
        }
        Ok(deliverable.clone())
    }
}
