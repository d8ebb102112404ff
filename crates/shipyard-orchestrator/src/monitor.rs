use crate::agent::Agent;
use crate::types::{AgentInfo, AgentStatus, Metadata};
use chrono::Utc;
use shipyard_core::AgentType;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct Entry {
    agent: Arc<dyn Agent>,
    info: AgentInfo,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    /// Registration order, used as the final selection tie-break.
    order: Vec<String>,
}

/// Registry of live agents with their status, load and counters.
pub struct AgentMonitor {
    registry: RwLock<Registry>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Add an agent. Returns false if its id is already registered.
    pub async fn register(&self, agent: Arc<dyn Agent>) -> bool {
        let mut registry = self.registry.write().await;
        let id = agent.id().to_string();
        if registry.entries.contains_key(&id) {
            return false;
        }
        let info = AgentInfo {
            id: id.clone(),
            agent_type: agent.agent_type(),
            status: AgentStatus::Idle,
            current_task_id: None,
            load: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            registered_at: Utc::now(),
            metadata: Metadata::new(),
        };
        registry.entries.insert(id.clone(), Entry { agent, info });
        registry.order.push(id);
        true
    }

    /// Remove an agent, returning its last state.
    pub async fn unregister(&self, id: &str) -> Option<AgentInfo> {
        let mut registry = self.registry.write().await;
        let entry = registry.entries.remove(id)?;
        registry.order.retain(|existing| existing != id);
        Some(entry.info)
    }

    /// The agent instance behind an id, for dispatch.
    pub async fn instance(&self, id: &str) -> Option<Arc<dyn Agent>> {
        let registry = self.registry.read().await;
        registry.entries.get(id).map(|e| e.agent.clone())
    }

    pub async fn get_state(&self, id: &str) -> Option<AgentInfo> {
        let registry = self.registry.read().await;
        registry.entries.get(id).map(|e| e.info.clone())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.registry.read().await.entries.contains_key(id)
    }

    /// All agents in registration order.
    pub async fn snapshot(&self) -> Vec<AgentInfo> {
        let registry = self.registry.read().await;
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id))
            .map(|e| e.info.clone())
            .collect()
    }

    pub async fn agents_of_type(&self, agent_type: AgentType) -> Vec<AgentInfo> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|info| info.agent_type == agent_type)
            .collect()
    }

    pub async fn agent_count(&self) -> usize {
        self.registry.read().await.entries.len()
    }

    /// Pick the best selectable agent among `types`, never `exclude`.
    ///
    /// Paused and stopped agents are skipped. Idle agents sort before busy ones,
    /// then lower load wins, then earlier registration.
    pub async fn select(&self, types: &[AgentType], exclude: Option<&str>) -> Option<AgentInfo> {
        let registry = self.registry.read().await;
        registry
            .order
            .iter()
            .enumerate()
            .filter_map(|(position, id)| registry.entries.get(id).map(|e| (position, &e.info)))
            .filter(|(_, info)| {
                types.contains(&info.agent_type)
                    && info.status.is_selectable()
                    && exclude != Some(info.id.as_str())
            })
            .min_by_key(|(position, info)| (info.status != AgentStatus::Idle, info.load, *position))
            .map(|(_, info)| info.clone())
    }

    /// Mark an agent as working on a task.
    pub async fn start_task(&self, id: &str, task_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        match registry.entries.get_mut(id) {
            Some(entry) => {
                let info = &mut entry.info;
                info.current_task_id = Some(task_id.to_string());
                info.load += 1;
                if info.status == AgentStatus::Idle {
                    info.status = AgentStatus::Active;
                }
                true
            }
            None => false,
        }
    }

    /// Release an agent from a task and record its outcome.
    pub async fn finish_task(&self, id: &str, task_id: &str, success: bool) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.entries.get_mut(id) {
            let info = &mut entry.info;
            info.load = info.load.saturating_sub(1);
            if info.current_task_id.as_deref() == Some(task_id) {
                info.current_task_id = None;
            }
            if success {
                info.completed_tasks += 1;
            } else {
                info.failed_tasks += 1;
            }
            if info.status == AgentStatus::Active && info.load == 0 {
                info.status = AgentStatus::Idle;
            }
        }
    }

    /// Force a status. Returns false for unknown agents.
    pub async fn set_status(&self, id: &str, status: AgentStatus) -> bool {
        let mut registry = self.registry.write().await;
        match registry.entries.get_mut(id) {
            Some(entry) => {
                entry.info.status = status;
                true
            }
            None => false,
        }
    }

    /// Attach a metadata value to an agent.
    pub async fn set_metadata(&self, id: &str, key: &str, value: serde_json::Value) -> bool {
        let mut registry = self.registry.write().await;
        match registry.entries.get_mut(id) {
            Some(entry) => {
                entry.info.metadata.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Serialize the roster as JSON (for prompts and dashboards).
    pub async fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot().await;
        let active = agents
            .iter()
            .filter(|a| a.status == AgentStatus::Active)
            .count();
        serde_json::json!({
            "agents": agents,
            "total": agents.len(),
            "active": active,
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Task, TaskResult};
    use async_trait::async_trait;
    use shipyard_core::ShipyardResult;

    struct Stub {
        id: String,
        agent_type: AgentType,
    }

    #[async_trait]
    impl Agent for Stub {
        fn id(&self) -> &str {
            &self.id
        }

        fn agent_type(&self) -> AgentType {
            self.agent_type
        }

        async fn run_task(&self, _task: &Task) -> ShipyardResult<TaskResult> {
            Ok(TaskResult::success())
        }
    }

    fn stub(id: &str, agent_type: AgentType) -> Arc<dyn Agent> {
        Arc::new(Stub {
            id: id.to_string(),
            agent_type,
        })
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let monitor = AgentMonitor::new();
        assert!(monitor.register(stub("b1", AgentType::Backend)).await);
        assert!(!monitor.register(stub("b1", AgentType::Backend)).await);
        assert_eq!(monitor.agent_count().await, 1);

        let info = monitor.unregister("b1").await.unwrap();
        assert_eq!(info.status, AgentStatus::Idle);
        assert!(monitor.unregister("b1").await.is_none());
        assert!(monitor.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_and_finish_task() {
        let monitor = AgentMonitor::new();
        monitor.register(stub("q1", AgentType::Qa)).await;

        monitor.start_task("q1", "t1").await;
        let state = monitor.get_state("q1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Active);
        assert_eq!(state.current_task_id.as_deref(), Some("t1"));
        assert_eq!(state.load, 1);

        monitor.finish_task("q1", "t1", true).await;
        let state = monitor.get_state("q1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Idle);
        assert!(state.current_task_id.is_none());
        assert_eq!(state.load, 0);
        assert_eq!(state.completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_select_prefers_idle_then_load() {
        let monitor = AgentMonitor::new();
        monitor.register(stub("b1", AgentType::Backend)).await;
        monitor.register(stub("b2", AgentType::Backend)).await;
        monitor.register(stub("f1", AgentType::Frontend)).await;

        monitor.start_task("b1", "t1").await;
        let chosen = monitor.select(&[AgentType::Backend], None).await.unwrap();
        assert_eq!(chosen.id, "b2");

        monitor.start_task("b2", "t2").await;
        monitor.start_task("b2", "t3").await;
        let chosen = monitor.select(&[AgentType::Backend], None).await.unwrap();
        assert_eq!(chosen.id, "b1");

        let chosen = monitor
            .select(&[AgentType::Backend, AgentType::Frontend], None)
            .await
            .unwrap();
        assert_eq!(chosen.id, "f1");
    }

    #[tokio::test]
    async fn test_select_ties_break_on_registration_order() {
        let monitor = AgentMonitor::new();
        monitor.register(stub("s2", AgentType::Security)).await;
        monitor.register(stub("s1", AgentType::Security)).await;
        assert_eq!(
            monitor.select(&[AgentType::Security], None).await.unwrap().id,
            "s2"
        );
    }

    #[tokio::test]
    async fn test_select_honours_exclusion() {
        let monitor = AgentMonitor::new();
        monitor.register(stub("s1", AgentType::Security)).await;
        monitor.register(stub("s2", AgentType::Security)).await;
        let chosen = monitor.select(&[AgentType::Security], Some("s1")).await.unwrap();
        assert_eq!(chosen.id, "s2");
        assert!(monitor.select(&[AgentType::Qa], Some("s1")).await.is_none());
    }

    #[tokio::test]
    async fn test_select_skips_paused() {
        let monitor = AgentMonitor::new();
        monitor.register(stub("d1", AgentType::DevOps)).await;
        monitor.set_status("d1", AgentStatus::Paused).await;
        assert!(monitor.select(&[AgentType::DevOps], None).await.is_none());
        assert!(monitor.select(&[AgentType::Qa], None).await.is_none());
    }

    #[tokio::test]
    async fn test_paused_agent_stays_paused_after_finishing() {
        let monitor = AgentMonitor::new();
        monitor.register(stub("w1", AgentType::Workshopper)).await;
        monitor.start_task("w1", "t1").await;
        monitor.set_status("w1", AgentStatus::Paused).await;
        monitor.finish_task("w1", "t1", false).await;
        let state = monitor.get_state("w1").await.unwrap();
        assert_eq!(state.status, AgentStatus::Paused);
        assert_eq!(state.failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_to_json() {
        let monitor = AgentMonitor::new();
        monitor.register(stub("b1", AgentType::Backend)).await;
        monitor
            .set_metadata("b1", "model", serde_json::json!("small"))
            .await;
        let json = monitor.to_json().await;
        assert!(json["agents"].is_array());
        assert_eq!(json["total"], 1);
        assert_eq!(json["agents"][0]["metadata"]["model"], "small");
    }
}
