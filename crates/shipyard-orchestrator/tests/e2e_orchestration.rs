//! End-to-end tests for the orchestrator: hub routing, the decision loop,
//! deliverable verification and the worker pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use shipyard_core::{
    AgentType, Deliverable, DeliverableKind, DeliverableStatus, DeliverableStore, Gate, GateStore,
    InMemoryDeliverableStore, InMemoryGateStore, PhaseName, ShipyardError, ShipyardResult,
};
use shipyard_events::{EventBus, EventType};
use shipyard_orchestrator::{
    read_decision_log, Agent, Decision, DecisionEntry, DecisionLogger, ExecutorConfig,
    FileToolExecutor, JsonlDecisionLogger, KnowledgeBase, KnowledgeEntry, KnowledgeQuery,
    LlmDecider, LlmReply, MessageType, Orchestrator, OrchestratorConfig, Task, TaskExecutor,
    TaskOutcome, TaskResult, TaskStatus, DEFAULT_HUB_ID,
};
use std::sync::Arc;
use std::time::Duration;

// --- Test doubles ---

struct ScriptedAgent {
    id: String,
    agent_type: AgentType,
    result: TaskResult,
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn run_task(&self, _task: &Task) -> ShipyardResult<TaskResult> {
        Ok(self.result.clone())
    }
}

struct FailingAgent;

#[async_trait]
impl Agent for FailingAgent {
    fn id(&self) -> &str {
        "broken"
    }

    fn agent_type(&self) -> AgentType {
        AgentType::Backend
    }

    async fn run_task(&self, _task: &Task) -> ShipyardResult<TaskResult> {
        Err(ShipyardError::Agent("compiler crashed".into()))
    }
}

fn agent(id: &str, agent_type: AgentType, result: TaskResult) -> Arc<dyn Agent> {
    Arc::new(ScriptedAgent {
        id: id.into(),
        agent_type,
        result,
    })
}

/// Replies with a fixed value and remembers every prompt.
struct MockLlm {
    reply: LlmReply,
    prompts: Mutex<Vec<String>>,
}

impl MockLlm {
    fn new(reply: LlmReply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmDecider for MockLlm {
    async fn query(&self, prompt: &str) -> ShipyardResult<LlmReply> {
        self.prompts.lock().push(prompt.to_string());
        Ok(self.reply.clone())
    }

    async fn evaluate_confidence(&self, _payload: &serde_json::Value) -> ShipyardResult<f64> {
        Ok(0.9)
    }
}

struct DownLlm;

#[async_trait]
impl LlmDecider for DownLlm {
    async fn query(&self, _prompt: &str) -> ShipyardResult<LlmReply> {
        Err(ShipyardError::Agent("provider unavailable".into()))
    }

    async fn evaluate_confidence(&self, _payload: &serde_json::Value) -> ShipyardResult<f64> {
        Ok(0.9)
    }
}

struct StaticKnowledge;

#[async_trait]
impl KnowledgeBase for StaticKnowledge {
    async fn search(&self, _query: &KnowledgeQuery) -> ShipyardResult<Vec<KnowledgeEntry>> {
        Ok((0..5)
            .map(|i| KnowledgeEntry {
                title: format!("hint-{i}"),
                problem: "slow queries".into(),
                solution: "add an index".into(),
                when_to_try: "p95 above budget".into(),
                success_count: i,
                similarity: 0.8,
            })
            .collect())
    }
}

struct RecordingLogger(Mutex<Vec<DecisionEntry>>);

#[async_trait]
impl DecisionLogger for RecordingLogger {
    async fn log(&self, entry: DecisionEntry) -> ShipyardResult<()> {
        self.0.lock().push(entry);
        Ok(())
    }
}

struct BrokenLogger;

#[async_trait]
impl DecisionLogger for BrokenLogger {
    async fn log(&self, _entry: DecisionEntry) -> ShipyardResult<()> {
        Err(ShipyardError::Orchestrator("disk full".into()))
    }
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig::new("p1", "A collaborative todo app")
}

fn create_pm_task_reply() -> LlmReply {
    LlmReply::Text(
        r#"{"action":"create_task","next_agent_type":"project_manager","task_description":"Plan milestones from the workshop output","reasoning":"requirements are complete","confidence":0.9}"#
            .into(),
    )
}

// --- Hub-and-spoke routing ---

#[tokio::test]
async fn test_scenario_b_direct_agent_message_is_rejected() {
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new()));
    orch.register_agent(agent("a1", AgentType::Backend, TaskResult::success()))
        .await
        .unwrap();
    orch.register_agent(agent("a2", AgentType::Security, TaskResult::success()))
        .await
        .unwrap();

    let err = orch
        .route_message("a1", "a2", MessageType::HelpRequest, json!({"q": "review?"}))
        .await
        .unwrap_err();
    assert!(matches!(err, ShipyardError::PolicyViolation(_)));
    assert!(orch.pending_messages("a2").is_empty());
}

#[tokio::test]
async fn test_hub_may_message_anyone_and_agents_may_message_hub() {
    let events = Arc::new(EventBus::new());
    let orch = Orchestrator::new(config(), events.clone());
    orch.register_agent(agent("a1", AgentType::Qa, TaskResult::success()))
        .await
        .unwrap();

    let to_agent = orch
        .route_message(DEFAULT_HUB_ID, "a1", MessageType::StatusUpdate, json!({}))
        .await
        .unwrap();
    assert_eq!(to_agent.routed_through, DEFAULT_HUB_ID);
    assert_eq!(to_agent.sender_type, "hub");
    assert_eq!(to_agent.recipient_type, "qa");

    // Unknown recipients are still buffered when the hub sends.
    orch.route_message(DEFAULT_HUB_ID, "nobody", MessageType::Notification, json!({}))
        .await
        .unwrap();
    assert_eq!(orch.pending_messages("nobody").len(), 1);

    orch.route_message("a1", DEFAULT_HUB_ID, MessageType::HelpResponse, json!({"ok": true}))
        .await
        .unwrap();
    assert_eq!(orch.take_messages(DEFAULT_HUB_ID).len(), 1);
    assert!(orch.take_messages(DEFAULT_HUB_ID).is_empty());

    let routed = events.get_history("p1", Some(EventType::MessageRouted), 10);
    assert_eq!(routed.len(), 3);
}

#[tokio::test]
async fn test_empty_participants_are_invalid() {
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new()));
    assert!(matches!(
        orch.route_message("", DEFAULT_HUB_ID, MessageType::Notification, json!({}))
            .await,
        Err(ShipyardError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_route_collaboration_prefers_idle_then_load() {
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new()));
    for (id, agent_type) in [
        ("fe1", AgentType::Frontend),
        ("de1", AgentType::Designer),
        ("fe2", AgentType::Frontend),
    ] {
        orch.register_agent(agent(id, agent_type, TaskResult::success()))
            .await
            .unwrap();
    }
    let mut t1 = Task::new("ui", "one");
    orch.assign_task(&mut t1, "fe1").await.unwrap();
    let mut t2 = Task::new("ui", "two");
    orch.assign_task(&mut t2, "de1").await.unwrap();

    let request = shipyard_orchestrator::HelpRequest::new("be1", "which component library?");
    let route = orch
        .route_collaboration(&request, &[AgentType::Frontend, AgentType::Designer])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(route.specialist_id, "fe2");

    orch.pause_agent("fe2").await.unwrap();
    let route = orch
        .route_collaboration(&request, &[AgentType::Frontend, AgentType::Designer])
        .await
        .unwrap()
        .unwrap();
    // Both remaining candidates are busy with one task; registration order decides.
    assert_eq!(route.specialist_id, "fe1");

    assert!(orch
        .route_collaboration(&request, &[AgentType::DevOps])
        .await
        .unwrap()
        .is_none());
}

// --- Decision loop ---

#[tokio::test]
async fn test_scenario_c_workshop_completion_creates_pm_task() {
    let llm = MockLlm::new(create_pm_task_reply());
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new())).with_llm(llm.clone());

    let task = Task::new("workshop", "Run the requirements workshop")
        .with_agent_type(AgentType::Workshopper);
    let result = TaskResult::success().with_summary("captured 12 user stories");

    let outcome = orch.on_task_completed(&task, &result).await.unwrap();
    assert!(!outcome.escalated);
    assert_eq!(orch.queue_len(), 1);

    let created = orch.dequeue_task().unwrap();
    assert_eq!(Some(created.id.clone()), outcome.created_task_id);
    assert_eq!(created.agent_type, Some(AgentType::ProjectManager));
    assert_eq!(created.previous_task_id(), Some(task.id.as_str()));
    assert_eq!(created.metadata["created_by"], "decision_engine");
    assert!(orch.dequeue_task().is_none());

    let prompt = llm.prompts.lock()[0].clone();
    assert!(prompt.contains("A collaborative todo app"));
    assert!(prompt.contains("captured 12 user stories"));
}

#[tokio::test]
async fn test_unparsable_reply_waits_and_reports() {
    let events = Arc::new(EventBus::new());
    let orch = Orchestrator::new(config(), events.clone())
        .with_llm(MockLlm::new(LlmReply::Text("let me think about it".into())));
    let task = Task::new("implement", "api");

    let outcome = orch
        .on_task_completed(&task, &TaskResult::success())
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Wait);
    assert_eq!(orch.queue_len(), 0);
    assert_eq!(
        events.get_history("p1", Some(EventType::Error), 10).len(),
        1
    );
    assert_eq!(
        events
            .get_history("p1", Some(EventType::DecisionMade), 10)
            .len(),
        1
    );
}

#[tokio::test]
async fn test_llm_failure_publishes_error_and_propagates() {
    let events = Arc::new(EventBus::new());
    let orch = Orchestrator::new(config(), events.clone()).with_llm(Arc::new(DownLlm));
    let task = Task::new("implement", "api");
    assert!(orch
        .on_task_completed(&task, &TaskResult::success())
        .await
        .is_err());
    assert_eq!(events.get_history("p1", Some(EventType::Error), 10).len(), 1);
    // The completion itself is still recorded.
    assert_eq!(orch.state().completed_task_ids, vec![task.id]);
}

#[tokio::test]
async fn test_prompt_embeds_artifacts_and_three_hints() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("requirements.md"), "# Stories\n- add todo").unwrap();

    let llm = MockLlm::new(LlmReply::Structured(json!({"action": "wait_for_more_tasks"})));
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new()))
        .with_llm(llm.clone())
        .with_tool_executor(Arc::new(FileToolExecutor::new(dir.path())))
        .with_knowledge_base(Arc::new(StaticKnowledge));

    let task = Task::new("workshop", "Gather requirements").with_agent_type(AgentType::Workshopper);
    let result = TaskResult::success()
        .with_artifact("requirements.md")
        .with_artifact("missing.md");
    orch.on_task_completed(&task, &result).await.unwrap();

    let prompt = llm.prompts.lock()[0].clone();
    assert!(prompt.contains("- add todo"));
    assert!(!prompt.contains("### missing.md"));
    assert!(prompt.contains("hint-2"));
    assert!(!prompt.contains("hint-3"));
}

#[tokio::test]
async fn test_follow_up_carries_referenced_files() {
    let llm = MockLlm::new(LlmReply::Structured(json!({
        "action": "create_task",
        "next_agent_type": "qa",
        "task_description": "Test the list endpoint",
        "files": ["tests/plan.md"],
        "priority": 8,
        "confidence": 0.95,
    })));
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new())).with_llm(llm);
    let task = Task::new("implement", "list endpoint").with_agent_type(AgentType::Backend);
    let result = TaskResult::success().with_artifact("src/list.rs");

    orch.on_task_completed(&task, &result).await.unwrap();
    let created = orch.dequeue_task().unwrap();
    assert_eq!(created.priority, 8);
    assert_eq!(created.referenced_files(), vec!["tests/plan.md", "src/list.rs"]);
}

#[tokio::test]
async fn test_decisions_are_logged_and_logger_errors_are_swallowed() {
    let logger = Arc::new(RecordingLogger(Mutex::new(Vec::new())));
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new()))
        .with_llm(MockLlm::new(create_pm_task_reply()))
        .with_decision_logger(logger.clone());
    let task = Task::new("workshop", "kickoff").with_agent_type(AgentType::Workshopper);
    orch.on_task_completed(&task, &TaskResult::success())
        .await
        .unwrap();
    {
        let entries = logger.0.lock();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision_type, "create_task");
        assert_eq!(entries[0].task_id.as_deref(), Some(task.id.as_str()));
    }

    let orch = Orchestrator::new(config(), Arc::new(EventBus::new()))
        .with_llm(MockLlm::new(create_pm_task_reply()))
        .with_decision_logger(Arc::new(BrokenLogger));
    assert!(orch
        .on_task_completed(&task, &TaskResult::success())
        .await
        .is_ok());
}

#[tokio::test]
async fn test_jsonl_logger_records_decisions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decisions.jsonl");
    let logger = Arc::new(JsonlDecisionLogger::new(&path));
    let orch = Orchestrator::new(config(), Arc::new(EventBus::new()))
        .with_llm(MockLlm::new(LlmReply::Structured(json!({
            "action": "project_complete",
            "reasoning": "shipped",
            "confidence": 0.99,
        }))))
        .with_decision_logger(logger.clone());

    orch.on_task_completed(&Task::new("maintain", "final"), &TaskResult::success())
        .await
        .unwrap();
    logger.close().await;

    let entries = read_decision_log(&path).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision_type, "project_complete");
    assert!(orch.is_complete());
}

// --- Deliverable verification ---

#[tokio::test]
async fn test_scenario_e_three_failures_open_one_gate() {
    let gates = Arc::new(InMemoryGateStore::new());
    let orch =
        Orchestrator::new(config(), Arc::new(EventBus::new())).with_gate_store(gates.clone());
    let task = Task::new("deliverable", "write the API spec")
        .with_agent_type(AgentType::Backend)
        .with_metadata("deliverable_id", json!("d-api"));

    let first = orch.record_verification_failure(&task, "missing file").await.unwrap();
    assert!(first.gate_id.is_none());
    assert!(first.retry_task_id.is_some());
    let second = orch.record_verification_failure(&task, "missing file").await.unwrap();
    assert!(second.gate_id.is_none());
    let third = orch.record_verification_failure(&task, "missing file").await.unwrap();
    let gate_id = third.gate_id.expect("third failure escalates");
    assert_eq!(gates.gate_count(), 1);

    let fourth = orch.record_verification_failure(&task, "missing file").await.unwrap();
    assert!(fourth.gate_id.is_none());
    assert!(fourth.retry_task_id.is_none());
    assert_eq!(gates.gate_count(), 1);

    // Once a human resolves the gate, counting starts over.
    orch.resolve_gate(&gate_id, true, "lead").await.unwrap();
    let fifth = orch.record_verification_failure(&task, "missing file").await.unwrap();
    assert!(fifth.gate_id.is_none());
    assert_eq!(fifth.failures, 1);
    assert_eq!(gates.gate_count(), 1);
}

/// Gate store that takes a while to create gates.
struct SlowGateStore {
    inner: InMemoryGateStore,
    delay: Duration,
}

#[async_trait]
impl GateStore for SlowGateStore {
    async fn create_gate(
        &self,
        project_id: &str,
        reason: &str,
        context: serde_json::Value,
        agent_id: Option<&str>,
    ) -> ShipyardResult<String> {
        tokio::time::sleep(self.delay).await;
        self.inner.create_gate(project_id, reason, context, agent_id).await
    }

    async fn get_pending_gates(&self, project_id: &str) -> ShipyardResult<Vec<Gate>> {
        self.inner.get_pending_gates(project_id).await
    }

    async fn list_gates(&self, project_id: &str) -> ShipyardResult<Vec<Gate>> {
        self.inner.list_gates(project_id).await
    }

    async fn resolve_gate(
        &self,
        gate_id: &str,
        approved: bool,
        reviewer: &str,
    ) -> ShipyardResult<Gate> {
        self.inner.resolve_gate(gate_id, approved, reviewer).await
    }
}

#[tokio::test]
async fn test_failures_while_gate_is_raised_do_not_retry() {
    let gates = Arc::new(SlowGateStore {
        inner: InMemoryGateStore::new(),
        delay: Duration::from_millis(30),
    });
    let orch =
        Orchestrator::new(config(), Arc::new(EventBus::new())).with_gate_store(gates.clone());
    let task = Task::new("deliverable", "write the API spec")
        .with_agent_type(AgentType::Backend)
        .with_metadata("deliverable_id", json!("d-api"));

    orch.record_verification_failure(&task, "missing file").await.unwrap();
    orch.record_verification_failure(&task, "missing file").await.unwrap();
    assert_eq!(orch.queue_len(), 2);

    let (a, b, c) = tokio::join!(
        orch.record_verification_failure(&task, "missing file"),
        orch.record_verification_failure(&task, "missing file"),
        orch.record_verification_failure(&task, "missing file"),
    );
    let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.gate_id.is_some()).count(), 1);
    assert!(outcomes.iter().all(|o| o.retry_task_id.is_none()));
    assert_eq!(gates.inner.gate_count(), 1);
    assert_eq!(orch.queue_len(), 2);
}

#[tokio::test]
async fn test_executor_completes_linked_deliverable() {
    let store = Arc::new(InMemoryDeliverableStore::new());
    let orch = Arc::new(
        Orchestrator::new(config(), Arc::new(EventBus::new()))
            .with_deliverable_store(store.clone())
            .with_llm(MockLlm::new(LlmReply::Structured(json!({"action": "wait"})))),
    );
    orch.register_agent(agent(
        "w1",
        AgentType::Workshopper,
        TaskResult::success().with_artifact("docs/requirements.md"),
    ))
    .await
    .unwrap();

    let deliverable = Deliverable::new(
        "p1",
        PhaseName::Workshopping,
        "requirements",
        DeliverableKind::Document,
    )
    .with_owner(AgentType::Workshopper);
    store.upsert(deliverable.clone()).await.unwrap();
    orch.plan_phase(PhaseName::Workshopping, &[deliverable.clone()])
        .await
        .unwrap();

    let executor = TaskExecutor::new(orch.clone(), ExecutorConfig::default());
    let task = orch.dequeue_task().unwrap();
    assert_eq!(executor.process_task(task).await, TaskOutcome::Completed);

    let stored = store.get(&deliverable.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliverableStatus::Completed);
    assert_eq!(stored.artifact_path.as_deref(), Some("docs/requirements.md"));
}

#[tokio::test]
async fn test_executor_escalates_unverifiable_deliverable() {
    let store = Arc::new(InMemoryDeliverableStore::new());
    let gates = Arc::new(InMemoryGateStore::new());
    let orch = Arc::new(
        Orchestrator::new(config(), Arc::new(EventBus::new()))
            .with_deliverable_store(store.clone())
            .with_gate_store(gates.clone())
            .with_llm(MockLlm::new(LlmReply::Structured(json!({"action": "wait"})))),
    );
    orch.register_agent(agent(
        "b1",
        AgentType::Backend,
        TaskResult::failure("tests did not compile"),
    ))
    .await
    .unwrap();
    let deliverable =
        Deliverable::new("p1", PhaseName::Implementation, "api", DeliverableKind::Code)
            .with_owner(AgentType::Backend);
    store.upsert(deliverable.clone()).await.unwrap();
    orch.set_phase(Some(PhaseName::Implementation));
    orch.plan_phase(PhaseName::Implementation, &[deliverable])
        .await
        .unwrap();

    let executor = TaskExecutor::new(orch.clone(), ExecutorConfig::default());
    while let Some(task) = orch.dequeue_task() {
        executor.process_task(task).await;
    }

    let pending = gates.get_pending_gates("p1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].phase(), Some(PhaseName::Implementation));
    assert_eq!(orch.task_summary().completed, 3);
}

// --- Worker pool ---

#[tokio::test]
async fn test_exhausted_retries_fail_with_one_event() {
    let events = Arc::new(EventBus::new());
    let orch = Arc::new(Orchestrator::new(config(), events.clone()));
    orch.register_agent(Arc::new(FailingAgent)).await.unwrap();
    let id = orch
        .enqueue_task(Task::new("implement", "api").with_agent_type(AgentType::Backend))
        .await
        .unwrap();

    let max_retries = 3;
    let executor = TaskExecutor::new(
        orch.clone(),
        ExecutorConfig::default().with_max_retries(max_retries),
    );
    let mut outcomes = Vec::new();
    while let Some(task) = orch.dequeue_task() {
        outcomes.push(executor.process_task(task).await);
    }

    assert_eq!(outcomes.len(), max_retries as usize + 1);
    assert_eq!(outcomes.last(), Some(&TaskOutcome::Failed));
    assert!(matches!(
        orch.get_task(&id).unwrap().status,
        TaskStatus::Failed { .. }
    ));
    assert_eq!(
        events.get_history("p1", Some(EventType::TaskFailed), 100).len(),
        1
    );
    assert_eq!(
        events.get_history("p1", Some(EventType::TaskRetried), 100).len(),
        max_retries as usize
    );
    assert_eq!(orch.agent_state("broken").await.unwrap().failed_tasks, 4);
}

#[tokio::test]
async fn test_workers_drain_queue_in_background() {
    let orch = Arc::new(
        Orchestrator::new(config(), Arc::new(EventBus::new()))
            .with_llm(MockLlm::new(LlmReply::Structured(json!({"action": "wait"})))),
    );
    orch.register_agent(agent("b1", AgentType::Backend, TaskResult::success()))
        .await
        .unwrap();
    orch.register_agent(agent("b2", AgentType::Backend, TaskResult::success()))
        .await
        .unwrap();
    for i in 0..10 {
        orch.enqueue_task(
            Task::new("implement", format!("endpoint {i}")).with_agent_type(AgentType::Backend),
        )
        .await
        .unwrap();
    }

    let executor = Arc::new(TaskExecutor::new(
        orch.clone(),
        ExecutorConfig::default()
            .with_workers(3)
            .with_poll_interval(Duration::from_millis(5)),
    ));
    executor.start();
    for _ in 0..400 {
        if orch.task_summary().completed == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    executor.stop().await;

    assert_eq!(orch.task_summary().completed, 10);
    assert_eq!(orch.queue_len(), 0);
}
