use crate::agent::Agent;
use crate::classifier::{infer_agent_type, KeywordClassifier, SpecialistClassifier};
use crate::collaborators::{
    DecisionEntry, DecisionLogger, KnowledgeBase, KnowledgeEntry, KnowledgeQuery, LlmDecider,
    ToolExecutor, ToolRequest, ToolResponse,
};
use crate::decision::{
    build_decision_prompt, parse_decision, ArtifactExcerpt, Decision, ProjectContext, TaskDigest,
    HISTORY_WINDOW,
};
use crate::monitor::AgentMonitor;
use crate::task_queue::TaskQueue;
use crate::types::{
    AgentInfo, AgentStatus, Message, MessageType, ProjectState, Task, TaskResult, TaskStatus,
    TaskSummary, META_DELIVERABLE_ID, META_PREVIOUS_TASK_ID, META_REFERENCED_FILES,
};
use crate::verification::{VerificationTracker, VerificationVerdict, DEFAULT_VERIFICATION_THRESHOLD};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use shipyard_core::{
    AgentType, AutonomyLevel, Deliverable, DeliverableStatus, DeliverableStore, GateStore,
    PhaseName, ShipyardError, ShipyardResult,
};
use shipyard_events::{Event, EventBus, EventType};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Id of the hub when none is configured.
pub const DEFAULT_HUB_ID: &str = "orchestrator";

/// Priority of tasks created for phase deliverables.
pub const DELIVERABLE_TASK_PRIORITY: i32 = 10;

/// Artifacts read back for one decision prompt.
pub const MAX_ARTIFACTS_PER_DECISION: usize = 5;

/// Settings for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub project_id: String,
    pub goal: String,
    pub autonomy: AutonomyLevel,
    pub hub_id: String,
    /// Failed verifications of one deliverable before a gate is raised.
    pub verification_threshold: u32,
}

impl OrchestratorConfig {
    pub fn new(project_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            goal: goal.into(),
            autonomy: AutonomyLevel::Medium,
            hub_id: DEFAULT_HUB_ID.to_string(),
            verification_threshold: DEFAULT_VERIFICATION_THRESHOLD,
        }
    }

    pub fn with_autonomy(mut self, autonomy: AutonomyLevel) -> Self {
        self.autonomy = autonomy;
        self
    }

    pub fn with_hub_id(mut self, hub_id: impl Into<String>) -> Self {
        self.hub_id = hub_id.into();
        self
    }

    pub fn with_verification_threshold(mut self, threshold: u32) -> Self {
        self.verification_threshold = threshold;
        self
    }
}

/// Where a help request ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialistRoute {
    pub specialist_id: String,
    pub agent_type: AgentType,
    pub message_id: String,
}

/// A request from one agent for another agent's expertise.
#[derive(Debug, Clone)]
pub struct HelpRequest {
    pub requester_id: String,
    pub question: String,
    pub context: serde_json::Value,
}

impl HelpRequest {
    pub fn new(requester_id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            requester_id: requester_id.into(),
            question: question.into(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Result of one pass of the decision loop.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    /// The decision that was executed, after the autonomy policy.
    pub decision: Decision,
    pub reasoning: String,
    pub confidence: f64,
    /// True when a low-confidence decision was turned into an escalation.
    pub escalated: bool,
    pub created_task_id: Option<String>,
    pub gate_id: Option<String>,
}

/// Result of recording a failed deliverable verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub failures: u32,
    /// Gate created by this call, if the threshold was just reached.
    pub gate_id: Option<String>,
    /// Retry task enqueued for the deliverable, if any.
    pub retry_task_id: Option<String>,
}

/// The hub. Owns the agent registry, the task queue and the project state,
/// and decides what happens after each completed task.
///
/// Agents never talk to each other: every message is routed here, and either
/// comes from the hub or is addressed to it.
pub struct Orchestrator {
    config: OrchestratorConfig,
    events: Arc<EventBus>,
    queue: TaskQueue,
    monitor: AgentMonitor,
    classifier: Arc<dyn SpecialistClassifier>,
    tasks: RwLock<HashMap<String, Task>>,
    history: RwLock<Vec<TaskDigest>>,
    state: RwLock<ProjectState>,
    mailboxes: RwLock<HashMap<String, Vec<Message>>>,
    verification: VerificationTracker,
    llm: Option<Arc<dyn LlmDecider>>,
    gates: Option<Arc<dyn GateStore>>,
    decision_logger: Option<Arc<dyn DecisionLogger>>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    tools: Option<Arc<dyn ToolExecutor>>,
    deliverables: Option<Arc<dyn DeliverableStore>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, events: Arc<EventBus>) -> Self {
        let state = ProjectState::new(config.project_id.clone(), config.goal.clone());
        let verification = VerificationTracker::new(config.verification_threshold);
        Self {
            config,
            events,
            queue: TaskQueue::new(),
            monitor: AgentMonitor::new(),
            classifier: Arc::new(KeywordClassifier::new()),
            tasks: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            state: RwLock::new(state),
            mailboxes: RwLock::new(HashMap::new()),
            verification,
            llm: None,
            gates: None,
            decision_logger: None,
            knowledge: None,
            tools: None,
            deliverables: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SpecialistClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmDecider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_gate_store(mut self, gates: Arc<dyn GateStore>) -> Self {
        self.gates = Some(gates);
        self
    }

    pub fn with_decision_logger(mut self, logger: Arc<dyn DecisionLogger>) -> Self {
        self.decision_logger = Some(logger);
        self
    }

    pub fn with_knowledge_base(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn with_tool_executor(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_deliverable_store(mut self, deliverables: Arc<dyn DeliverableStore>) -> Self {
        self.deliverables = Some(deliverables);
        self
    }

    pub fn project_id(&self) -> &str {
        &self.config.project_id
    }

    pub fn hub_id(&self) -> &str {
        &self.config.hub_id
    }

    pub fn autonomy(&self) -> AutonomyLevel {
        self.config.autonomy
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn gate_store(&self) -> Option<&Arc<dyn GateStore>> {
        self.gates.as_ref()
    }

    pub fn deliverable_store(&self) -> Option<&Arc<dyn DeliverableStore>> {
        self.deliverables.as_ref()
    }

    async fn emit(&self, event: Event) {
        self.events.publish(event).await;
    }

    fn event(&self, event_type: EventType) -> Event {
        Event::new(event_type, self.config.project_id.clone())
    }

    // --- Agent registry ---

    /// Register an agent. Returns `false` if its id is already taken.
    pub async fn register_agent(&self, agent: Arc<dyn Agent>) -> ShipyardResult<bool> {
        let id = agent.id().to_string();
        if id.trim().is_empty() {
            return Err(ShipyardError::InvalidArgument("agent id is empty".into()));
        }
        let agent_type = agent.agent_type();
        if !self.monitor.register(agent).await {
            debug!(agent_id = %id, "agent already registered");
            return Ok(false);
        }
        info!(agent_id = %id, agent = %agent_type, "agent registered");
        self.emit(
            self.event(EventType::AgentRegistered)
                .with_agent(id)
                .with_data(json!({ "agent_type": agent_type })),
        )
        .await;
        Ok(true)
    }

    /// Remove an agent. Returns `false` if it was not registered.
    pub async fn unregister_agent(&self, id: &str) -> ShipyardResult<bool> {
        if id.trim().is_empty() {
            return Err(ShipyardError::InvalidArgument("agent id is empty".into()));
        }
        let Some(info) = self.monitor.unregister(id).await else {
            return Ok(false);
        };
        self.mailboxes.write().remove(id);
        info!(agent_id = %id, agent = %info.agent_type, "agent unregistered");
        self.emit(self.event(EventType::AgentUnregistered).with_agent(id))
            .await;
        Ok(true)
    }

    pub async fn agent(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.monitor.instance(id).await
    }

    pub async fn agent_state(&self, id: &str) -> Option<AgentInfo> {
        self.monitor.get_state(id).await
    }

    /// All registered agents in registration order.
    pub async fn agents(&self) -> Vec<AgentInfo> {
        self.monitor.snapshot().await
    }

    pub async fn agents_of_type(&self, agent_type: AgentType) -> Vec<AgentInfo> {
        self.monitor.agents_of_type(agent_type).await
    }

    /// Roster as JSON, as embedded in decision prompts.
    pub async fn roster(&self) -> serde_json::Value {
        self.monitor.to_json().await
    }

    /// Best available agent of one role.
    pub async fn select_agent(&self, agent_type: AgentType) -> Option<AgentInfo> {
        self.monitor.select(&[agent_type], None).await
    }

    /// Take an agent out of selection. Its current task keeps running.
    pub async fn pause_agent(&self, id: &str) -> ShipyardResult<bool> {
        if !self.monitor.set_status(id, AgentStatus::Paused).await {
            return Ok(false);
        }
        info!(agent_id = %id, "agent paused");
        self.emit(self.event(EventType::AgentPaused).with_agent(id))
            .await;
        Ok(true)
    }

    pub async fn resume_agent(&self, id: &str) -> ShipyardResult<bool> {
        let Some(state) = self.monitor.get_state(id).await else {
            return Ok(false);
        };
        if state.status == AgentStatus::Stopped {
            return Ok(false);
        }
        let status = if state.load > 0 {
            AgentStatus::Active
        } else {
            AgentStatus::Idle
        };
        self.monitor.set_status(id, status).await;
        info!(agent_id = %id, "agent resumed");
        self.emit(self.event(EventType::AgentResumed).with_agent(id))
            .await;
        Ok(true)
    }

    /// Permanently retire an agent without unregistering it.
    pub async fn stop_agent(&self, id: &str) -> ShipyardResult<bool> {
        if !self.monitor.set_status(id, AgentStatus::Stopped).await {
            return Ok(false);
        }
        info!(agent_id = %id, "agent stopped");
        self.emit(self.event(EventType::AgentStopped).with_agent(id))
            .await;
        Ok(true)
    }

    // --- Task queue ---

    /// Queue a task. Unassigned tasks are classified to a role first.
    pub async fn enqueue_task(&self, mut task: Task) -> ShipyardResult<String> {
        if task.id.trim().is_empty() {
            return Err(ShipyardError::InvalidArgument("task id is empty".into()));
        }
        let agent_type = match task.agent_type {
            Some(agent_type) => agent_type,
            None => {
                let inferred = infer_agent_type(self.classifier.as_ref(), &task);
                task.agent_type = Some(inferred);
                inferred
            }
        };
        task.status = TaskStatus::Pending;
        task.assigned_agent_id = None;

        let id = task.id.clone();
        let priority = task.priority;
        let description = task.description.clone();
        self.tasks.write().insert(id.clone(), task.clone());
        {
            let mut state = self.state.write();
            if !state.pending_task_ids.contains(&id) {
                state.pending_task_ids.push(id.clone());
            }
            state.touch();
        }
        self.queue.push(task);

        debug!(task_id = %id, agent = %agent_type, priority, "task enqueued");
        self.emit(
            self.event(EventType::TaskCreated)
                .with_task(id.clone())
                .with_data(json!({
                    "agent_type": agent_type,
                    "priority": priority,
                    "description": description,
                })),
        )
        .await;
        Ok(id)
    }

    /// Pop the most urgent task, or `None` on an empty queue.
    pub fn dequeue_task(&self) -> Option<Task> {
        self.queue.pop()
    }

    pub fn peek_task(&self) -> Option<Task> {
        self.queue.peek()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Return a dequeued task that was never dispatched. It keeps its
    /// status and emits no event.
    pub fn restore_task(&self, task: Task) {
        debug!(task_id = %task.id, "task returned to queue");
        self.queue.push(task);
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.read().get(id).cloned()
    }

    pub fn task_summary(&self) -> TaskSummary {
        let tasks = self.tasks.read();
        let mut summary = TaskSummary {
            total: tasks.len(),
            ..Default::default()
        };
        for task in tasks.values() {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Assigned => summary.assigned += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed { .. } => summary.failed += 1,
                TaskStatus::Blocked => summary.blocked += 1,
            }
        }
        summary
    }

    /// Bind a task to an agent and mark both busy.
    pub async fn assign_task(&self, task: &mut Task, agent_id: &str) -> ShipyardResult<()> {
        if !self.monitor.start_task(agent_id, &task.id).await {
            return Err(ShipyardError::NotFound(format!("agent '{agent_id}'")));
        }
        task.assigned_agent_id = Some(agent_id.to_string());
        task.status = TaskStatus::Assigned;
        self.tasks.write().insert(task.id.clone(), task.clone());
        {
            let mut state = self.state.write();
            state.active_task_id = Some(task.id.clone());
            state.active_agent_id = Some(agent_id.to_string());
            state.pending_task_ids.retain(|id| id != &task.id);
            state.touch();
        }
        debug!(task_id = %task.id, agent_id = %agent_id, "task assigned");
        self.emit(
            self.event(EventType::TaskAssigned)
                .with_task(task.id.clone())
                .with_agent(agent_id),
        )
        .await;
        Ok(())
    }

    pub async fn mark_in_progress(&self, task: &mut Task) {
        task.status = TaskStatus::InProgress;
        self.tasks.write().insert(task.id.clone(), task.clone());
        let mut event = self.event(EventType::TaskStarted).with_task(task.id.clone());
        if let Some(agent_id) = &task.assigned_agent_id {
            event = event.with_agent(agent_id.clone());
        }
        self.emit(event).await;
    }

    /// Mark a task completed and release its agent.
    pub async fn complete_task(&self, task: &mut Task, result: &TaskResult) {
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        self.tasks.write().insert(task.id.clone(), task.clone());
        if let Some(agent_id) = &task.assigned_agent_id {
            self.monitor.finish_task(agent_id, &task.id, true).await;
        }
        self.record_completion(task, result);

        info!(task_id = %task.id, success = result.success, "task completed");
        let mut event = self
            .event(EventType::TaskCompleted)
            .with_task(task.id.clone())
            .with_data(json!({
                "success": result.success,
                "artifacts": result.artifacts,
                "summary": result.summary,
            }));
        if let Some(agent_id) = &task.assigned_agent_id {
            event = event.with_agent(agent_id.clone());
        }
        self.emit(event).await;
    }

    /// Put a failed attempt back in the queue.
    pub async fn requeue_task(&self, mut task: Task, reason: &str, attempt: u32) {
        if let Some(agent_id) = task.assigned_agent_id.take() {
            self.monitor.finish_task(&agent_id, &task.id, false).await;
        }
        task.status = TaskStatus::Pending;
        let id = task.id.clone();
        self.tasks.write().insert(id.clone(), task.clone());
        {
            let mut state = self.state.write();
            if state.active_task_id.as_deref() == Some(id.as_str()) {
                state.active_task_id = None;
            }
            if !state.pending_task_ids.contains(&id) {
                state.pending_task_ids.push(id.clone());
            }
            state.touch();
        }
        self.queue.push(task);

        warn!(task_id = %id, attempt, reason = %reason, "task failed, retrying");
        self.emit(
            self.event(EventType::TaskRetried)
                .with_task(id)
                .with_data(json!({ "reason": reason, "attempt": attempt })),
        )
        .await;
    }

    /// Terminally fail a task. Publishes exactly one `TaskFailed` event;
    /// failing an already-terminal task does nothing.
    pub async fn fail_task(&self, task: &mut Task, reason: &str) {
        let already_terminal = self
            .tasks
            .read()
            .get(&task.id)
            .is_some_and(|t| t.status.is_terminal());
        if already_terminal {
            return;
        }
        if let Some(agent_id) = &task.assigned_agent_id {
            self.monitor.finish_task(agent_id, &task.id, false).await;
        }
        task.status = TaskStatus::Failed {
            reason: reason.to_string(),
        };
        task.completed_at = Some(Utc::now());
        self.tasks.write().insert(task.id.clone(), task.clone());
        {
            let mut state = self.state.write();
            state.pending_task_ids.retain(|id| id != &task.id);
            if state.active_task_id.as_deref() == Some(task.id.as_str()) {
                state.active_task_id = None;
            }
            state.touch();
        }
        self.history.write().push(TaskDigest {
            task_id: task.id.clone(),
            agent_type: task.agent_type,
            description: task.description.clone(),
            success: false,
        });

        error!(task_id = %task.id, reason = %reason, "task failed permanently");
        let mut event = self
            .event(EventType::TaskFailed)
            .with_task(task.id.clone())
            .with_data(json!({ "reason": reason }));
        if let Some(agent_id) = &task.assigned_agent_id {
            event = event.with_agent(agent_id.clone());
        }
        self.emit(event).await;
    }

    /// Idempotently note a completed task in project state and history.
    fn record_completion(&self, task: &Task, result: &TaskResult) {
        {
            let mut state = self.state.write();
            if state.completed_task_ids.contains(&task.id) {
                return;
            }
            state.completed_task_ids.push(task.id.clone());
            state.pending_task_ids.retain(|id| id != &task.id);
            if state.active_task_id.as_deref() == Some(task.id.as_str()) {
                state.active_task_id = None;
                state.active_agent_id = None;
            }
            state.touch();
        }
        self.history.write().push(TaskDigest {
            task_id: task.id.clone(),
            agent_type: task.agent_type,
            description: task.description.clone(),
            success: result.success,
        });
    }

    // --- Project state ---

    pub fn state(&self) -> ProjectState {
        self.state.read().clone()
    }

    pub fn current_phase(&self) -> Option<PhaseName> {
        self.state.read().current_phase
    }

    pub fn set_phase(&self, phase: Option<PhaseName>) {
        let mut state = self.state.write();
        state.current_phase = phase;
        state.touch();
    }

    pub fn is_complete(&self) -> bool {
        self.state.read().is_complete
    }

    /// Mark the project finished and tell observers.
    pub async fn mark_complete(&self, reason: &str) {
        {
            let mut state = self.state.write();
            if state.is_complete {
                return;
            }
            state.is_complete = true;
            state.touch();
        }
        info!(project = %self.config.project_id, reason = %reason, "project complete");
        self.emit(
            self.event(EventType::ProjectCompleted)
                .with_data(json!({ "reason": reason })),
        )
        .await;
    }

    /// The last few finished tasks, oldest first.
    pub fn recent_history(&self, limit: usize) -> Vec<TaskDigest> {
        let history = self.history.read();
        history[history.len().saturating_sub(limit)..].to_vec()
    }

    pub async fn project_context(&self) -> ProjectContext {
        let roster = self.monitor.to_json().await;
        let state = self.state();
        ProjectContext {
            project_id: state.project_id.clone(),
            goal: state.goal.clone(),
            phase: state.phase_label().to_string(),
            recent_tasks: self.recent_history(HISTORY_WINDOW),
            roster,
            queue_depth: self.queue.len(),
            completed_count: state.completed_task_ids.len(),
        }
    }

    // --- Hub-and-spoke messaging ---

    /// Route a message through the hub and buffer it for the recipient.
    ///
    /// The hub may message anyone. Anyone else may only message the hub.
    pub async fn route_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        message_type: MessageType,
        payload: serde_json::Value,
    ) -> ShipyardResult<Message> {
        if sender_id.trim().is_empty() || recipient_id.trim().is_empty() {
            return Err(ShipyardError::InvalidArgument(
                "message sender and recipient are required".into(),
            ));
        }
        let hub = self.config.hub_id.as_str();
        if sender_id != hub && recipient_id != hub {
            warn!(sender = %sender_id, recipient = %recipient_id, "direct agent message rejected");
            return Err(ShipyardError::PolicyViolation(format!(
                "'{sender_id}' cannot message '{recipient_id}' directly; route through '{hub}'"
            )));
        }

        let message = Message {
            id: shipyard_core::new_id(),
            sender_id: sender_id.to_string(),
            sender_type: self.participant_type(sender_id).await,
            recipient_id: recipient_id.to_string(),
            recipient_type: self.participant_type(recipient_id).await,
            message_type,
            payload,
            timestamp: Utc::now(),
            routed_through: hub.to_string(),
        };
        self.mailboxes
            .write()
            .entry(recipient_id.to_string())
            .or_default()
            .push(message.clone());

        debug!(
            message_id = %message.id,
            sender = %sender_id,
            recipient = %recipient_id,
            "message routed"
        );
        self.emit(self.event(EventType::MessageRouted).with_data(json!({
            "message_id": message.id,
            "sender_id": sender_id,
            "recipient_id": recipient_id,
            "message_type": message_type,
        })))
        .await;
        Ok(message)
    }

    async fn participant_type(&self, id: &str) -> String {
        if id == self.config.hub_id {
            return "hub".to_string();
        }
        match self.monitor.get_state(id).await {
            Some(info) => info.agent_type.to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Messages waiting for a recipient, oldest first.
    pub fn pending_messages(&self, recipient_id: &str) -> Vec<Message> {
        self.mailboxes
            .read()
            .get(recipient_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drain a recipient's mailbox.
    pub fn take_messages(&self, recipient_id: &str) -> Vec<Message> {
        self.mailboxes
            .write()
            .remove(recipient_id)
            .unwrap_or_default()
    }

    /// Ask the least busy specialist of one role for help.
    ///
    /// Returns `None` when no selectable specialist of that role exists.
    pub async fn consult_specialist(
        &self,
        requester_id: &str,
        specialist_type: AgentType,
        question: &str,
        context: serde_json::Value,
    ) -> ShipyardResult<Option<SpecialistRoute>> {
        let request = HelpRequest::new(requester_id, question).with_context(context);
        let route = self.deliver_help(&request, &[specialist_type]).await?;
        if let Some(route) = &route {
            self.emit(
                self.event(EventType::SpecialistConsulted)
                    .with_agent(route.specialist_id.clone())
                    .with_data(json!({
                        "requester_id": requester_id,
                        "specialist_type": specialist_type,
                        "message_id": route.message_id,
                    })),
            )
            .await;
        } else {
            info!(
                requester = %requester_id,
                specialist = %specialist_type,
                "no specialist available"
            );
        }
        Ok(route)
    }

    /// Route a help request to the best specialist across several roles.
    ///
    /// Returns `None` when no selectable specialist of any role exists.
    pub async fn route_collaboration(
        &self,
        request: &HelpRequest,
        candidate_types: &[AgentType],
    ) -> ShipyardResult<Option<SpecialistRoute>> {
        let route = self.deliver_help(request, candidate_types).await?;
        if route.is_none() {
            info!(
                requester = %request.requester_id,
                candidates = ?candidate_types,
                "no specialist for collaboration"
            );
        }
        Ok(route)
    }

    async fn deliver_help(
        &self,
        request: &HelpRequest,
        candidate_types: &[AgentType],
    ) -> ShipyardResult<Option<SpecialistRoute>> {
        if request.requester_id.trim().is_empty() {
            return Err(ShipyardError::InvalidArgument("requester id is empty".into()));
        }
        let Some(specialist) = self
            .monitor
            .select(candidate_types, Some(request.requester_id.as_str()))
            .await
        else {
            return Ok(None);
        };
        let message = self
            .route_message(
                &self.config.hub_id,
                &specialist.id,
                MessageType::HelpRequest,
                json!({
                    "requester_id": request.requester_id,
                    "question": request.question,
                    "context": request.context,
                }),
            )
            .await?;
        Ok(Some(SpecialistRoute {
            specialist_id: specialist.id,
            agent_type: specialist.agent_type,
            message_id: message.id,
        }))
    }

    // --- Escalation ---

    /// Whether a decision with this confidence needs a human under the
    /// project's autonomy level.
    pub fn should_escalate(&self, confidence: f64) -> bool {
        self.config.autonomy.should_escalate(confidence)
    }

    /// Pause the named agent (if any) and open a human-approval gate.
    pub async fn escalate_to_human(
        &self,
        reason: &str,
        context: serde_json::Value,
        agent_id: Option<&str>,
    ) -> ShipyardResult<String> {
        let gates = self
            .gates
            .as_ref()
            .ok_or_else(|| ShipyardError::NotConfigured("gate store".into()))?;

        if let Some(agent_id) = agent_id {
            if !self.pause_agent(agent_id).await? {
                warn!(agent_id = %agent_id, "escalating for an unknown agent");
            }
        }

        let mut context = match context {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("details".into(), other);
                map
            }
        };
        if !context.contains_key("phase") {
            if let Some(phase) = self.current_phase() {
                context.insert("phase".into(), json!(phase));
            }
        }

        let gate_id = gates
            .create_gate(
                &self.config.project_id,
                reason,
                serde_json::Value::Object(context),
                agent_id,
            )
            .await?;

        warn!(gate_id = %gate_id, reason = %reason, "escalated to human");
        let mut event = self
            .event(EventType::GateCreated)
            .with_data(json!({ "gate_id": gate_id, "reason": reason }));
        if let Some(agent_id) = agent_id {
            event = event.with_agent(agent_id);
        }
        self.emit(event).await;
        Ok(gate_id)
    }

    /// Record a human decision on a gate.
    pub async fn resolve_gate(
        &self,
        gate_id: &str,
        approved: bool,
        reviewer: &str,
    ) -> ShipyardResult<shipyard_core::Gate> {
        let gates = self
            .gates
            .as_ref()
            .ok_or_else(|| ShipyardError::NotConfigured("gate store".into()))?;
        let gate = gates.resolve_gate(gate_id, approved, reviewer).await?;
        info!(gate_id = %gate_id, approved, reviewer = %reviewer, "gate resolved");
        self.emit(
            self.event(EventType::GateResolved).with_data(json!({
                "gate_id": gate_id,
                "approved": approved,
                "reviewer": reviewer,
            })),
        )
        .await;
        Ok(gate)
    }

    // --- Collaborators ---

    /// Hand a decision to the logger. A missing logger is a no-op and logger
    /// errors are only reported.
    pub async fn log_decision(&self, entry: DecisionEntry) {
        let Some(logger) = &self.decision_logger else {
            return;
        };
        if let Err(e) = logger.log(entry).await {
            warn!(error = %e, "failed to log decision");
        }
    }

    pub async fn evaluate_confidence(&self, payload: &serde_json::Value) -> ShipyardResult<f64> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| ShipyardError::NotConfigured("LLM decider".into()))?;
        Ok(llm.evaluate_confidence(payload).await?.clamp(0.0, 1.0))
    }

    pub async fn search_knowledge(
        &self,
        query: &KnowledgeQuery,
    ) -> ShipyardResult<Vec<KnowledgeEntry>> {
        let knowledge = self
            .knowledge
            .as_ref()
            .ok_or_else(|| ShipyardError::NotConfigured("knowledge base".into()))?;
        knowledge.search(query).await
    }

    pub async fn execute_tool(&self, request: ToolRequest) -> ShipyardResult<ToolResponse> {
        let tools = self
            .tools
            .as_ref()
            .ok_or_else(|| ShipyardError::NotConfigured("tool executor".into()))?;
        tools.execute(request).await
    }

    // --- Decision engine ---

    /// Decide and carry out what happens after a task completes.
    ///
    /// This is the only path by which new work is created mid-build.
    pub async fn on_task_completed(
        &self,
        task: &Task,
        result: &TaskResult,
    ) -> ShipyardResult<DecisionOutcome> {
        self.record_completion(task, result);
        let llm = self
            .llm
            .clone()
            .ok_or_else(|| ShipyardError::NotConfigured("LLM decider".into()))?;

        let context = self.project_context().await;
        let artifacts = self.read_artifacts(&result.artifacts).await;
        let hints = self.knowledge_hints(task).await;
        let prompt = build_decision_prompt(&context, task, result, &artifacts, &hints);

        let reply = match llm.query(&prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "decision query failed");
                self.emit(
                    self.event(EventType::Error)
                        .with_task(task.id.clone())
                        .with_data(json!({ "stage": "decision_query", "error": e.to_string() })),
                )
                .await;
                return Err(e);
            }
        };

        let parsed = parse_decision(&reply, self.classifier.as_ref());
        if let Some(error) = &parsed.parse_error {
            warn!(task_id = %task.id, error = %error, "unusable decision, waiting");
            self.emit(
                self.event(EventType::Error)
                    .with_task(task.id.clone())
                    .with_data(json!({ "stage": "decision_parse", "error": error })),
            )
            .await;
        }

        let confidence = match parsed.confidence.or(result.confidence) {
            Some(confidence) => confidence,
            None => match llm.evaluate_confidence(&json!(result)).await {
                Ok(confidence) => confidence.clamp(0.0, 1.0),
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "confidence evaluation failed");
                    0.0
                }
            },
        };

        let mut decision = parsed.decision;
        let mut escalated = false;
        if matches!(decision, Decision::CreateTask { .. } | Decision::Complete)
            && self.should_escalate(confidence)
        {
            escalated = true;
            decision = Decision::Escalate {
                reason: format!(
                    "{} needs review at confidence {confidence:.2} ({} autonomy): {}",
                    decision.action(),
                    self.config.autonomy,
                    parsed.reasoning
                ),
            };
        }

        info!(
            task_id = %task.id,
            action = decision.action(),
            confidence,
            escalated,
            "decision made"
        );
        self.log_decision(DecisionEntry {
            timestamp: Utc::now(),
            project_id: self.config.project_id.clone(),
            task_id: Some(task.id.clone()),
            decision_type: decision.action().to_string(),
            reasoning: parsed.reasoning.clone(),
            confidence,
            escalated,
            context: json!({
                "phase": context.phase,
                "agent_type": task.agent_type,
                "queue_depth": context.queue_depth,
            }),
        })
        .await;

        let mut outcome = DecisionOutcome {
            decision: decision.clone(),
            reasoning: parsed.reasoning,
            confidence,
            escalated,
            created_task_id: None,
            gate_id: None,
        };

        match decision {
            Decision::CreateTask {
                agent_type,
                description,
                context: task_context,
                priority,
                files,
            } => {
                let mut referenced = files;
                for artifact in &result.artifacts {
                    if !referenced.contains(artifact) {
                        referenced.push(artifact.clone());
                    }
                }
                let task_type = task_context
                    .get("task_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("follow_up")
                    .to_string();
                let follow_up = Task::new(task_type, description)
                    .with_agent_type(agent_type)
                    .with_priority(priority)
                    .with_payload(task_context)
                    .with_metadata(META_PREVIOUS_TASK_ID, json!(task.id))
                    .with_metadata("decision_reasoning", json!(outcome.reasoning))
                    .with_metadata("decision_confidence", json!(confidence))
                    .with_metadata(META_REFERENCED_FILES, json!(referenced))
                    .with_metadata("created_by", json!("decision_engine"));
                outcome.created_task_id = Some(self.enqueue_task(follow_up).await?);
            }
            Decision::Escalate { reason } => {
                let gate_id = self
                    .escalate_to_human(
                        &reason,
                        json!({
                            "task_id": task.id,
                            "confidence": confidence,
                            "source": "decision_engine",
                        }),
                        None,
                    )
                    .await?;
                outcome.gate_id = Some(gate_id);
            }
            Decision::Complete => {
                self.mark_complete(&outcome.reasoning).await;
            }
            Decision::Wait => {}
        }

        self.emit(
            self.event(EventType::DecisionMade)
                .with_task(task.id.clone())
                .with_data(json!({
                    "action": outcome.decision.action(),
                    "reasoning": outcome.reasoning,
                    "confidence": confidence,
                    "escalated": escalated,
                    "created_task_id": outcome.created_task_id,
                    "gate_id": outcome.gate_id,
                })),
        )
        .await;
        Ok(outcome)
    }

    /// Best-effort artifact reads; failures only shrink the prompt.
    async fn read_artifacts(&self, paths: &[String]) -> Vec<ArtifactExcerpt> {
        let Some(tools) = &self.tools else {
            return Vec::new();
        };
        let mut excerpts = Vec::new();
        for path in paths.iter().take(MAX_ARTIFACTS_PER_DECISION) {
            match tools.execute(ToolRequest::read_file(path.clone())).await {
                Ok(response) if response.success => {
                    if let Some(content) = response.result.get("content").and_then(|c| c.as_str()) {
                        excerpts.push(ArtifactExcerpt::new(path.clone(), content));
                    }
                }
                Ok(response) => {
                    debug!(path = %path, message = ?response.message, "artifact not readable");
                }
                Err(e) => debug!(path = %path, error = %e, "artifact read failed"),
            }
        }
        excerpts
    }

    async fn knowledge_hints(&self, task: &Task) -> Vec<KnowledgeEntry> {
        let Some(knowledge) = &self.knowledge else {
            return Vec::new();
        };
        let mut query = KnowledgeQuery::new(task.description.clone())
            .with_task_type(task.task_type.clone())
            .with_limit(3);
        if let Some(agent_type) = task.agent_type {
            query = query.with_agent_type(agent_type);
        }
        match knowledge.search(&query).await {
            Ok(mut entries) => {
                entries.truncate(3);
                entries
            }
            Err(e) => {
                warn!(error = %e, "knowledge search failed");
                Vec::new()
            }
        }
    }

    // --- Deliverables ---

    /// Queue one task per pending deliverable of a phase.
    pub async fn plan_phase(
        &self,
        phase: PhaseName,
        deliverables: &[Deliverable],
    ) -> ShipyardResult<Vec<String>> {
        let mut created = Vec::new();
        for deliverable in deliverables.iter().filter(|d| d.is_pending()) {
            let task_id = self.enqueue_task(deliverable_task(phase, deliverable)).await?;
            if let Some(store) = &self.deliverables {
                store
                    .update_status(&deliverable.id, DeliverableStatus::InProgress, None)
                    .await?;
            }
            created.push(task_id);
        }
        info!(phase = %phase, tasks = created.len(), "phase planned");
        Ok(created)
    }

    /// Mark a deliverable produced by a successful task as completed.
    pub async fn mark_deliverable_completed(
        &self,
        deliverable_id: &str,
        artifact_path: Option<String>,
    ) -> ShipyardResult<Deliverable> {
        let store = self
            .deliverables
            .as_ref()
            .ok_or_else(|| ShipyardError::NotConfigured("deliverable store".into()))?;
        let deliverable = store.mark_completed(deliverable_id, artifact_path).await?;
        self.verification.record_success(deliverable_id);
        info!(deliverable_id = %deliverable_id, name = %deliverable.name, "deliverable completed");
        self.emit(self.event(EventType::DeliverableCompleted).with_data(json!({
            "deliverable_id": deliverable_id,
            "name": deliverable.name,
            "phase": deliverable.phase,
        })))
        .await;
        Ok(deliverable)
    }

    /// Record that a deliverable task finished without producing a verified
    /// result. Below the threshold the deliverable is retried; at the
    /// threshold one gate is raised and no further gate is raised while it
    /// stays pending.
    pub async fn record_verification_failure(
        &self,
        task: &Task,
        reason: &str,
    ) -> ShipyardResult<VerificationOutcome> {
        let deliverable_id = task
            .deliverable_id()
            .ok_or_else(|| {
                ShipyardError::InvalidArgument(format!("task {} has no deliverable", task.id))
            })?
            .to_string();

        let verdict = self.verification.record_failure(&deliverable_id);
        warn!(
            deliverable_id = %deliverable_id,
            verdict = ?verdict,
            reason = %reason,
            "deliverable verification failed"
        );

        let mut outcome = VerificationOutcome::default();
        match verdict {
            VerificationVerdict::Continue { failures } => {
                outcome.failures = failures;
                outcome.retry_task_id = Some(self.retry_deliverable(task).await?);
            }
            VerificationVerdict::Escalate { failures } => {
                outcome.failures = failures;
                let gate = self
                    .escalate_to_human(
                        &format!(
                            "deliverable {deliverable_id} failed verification {failures} times: {reason}"
                        ),
                        json!({
                            "deliverable_id": deliverable_id,
                            "failures": failures,
                            "task_id": task.id,
                        }),
                        None,
                    )
                    .await;
                match gate {
                    Ok(gate_id) => {
                        self.verification.attach_gate(&deliverable_id, gate_id.clone());
                        outcome.gate_id = Some(gate_id);
                    }
                    Err(e) => {
                        self.verification.release(&deliverable_id);
                        return Err(e);
                    }
                }
            }
            VerificationVerdict::Pending { failures } => {
                outcome.failures = failures;
                debug!(deliverable_id = %deliverable_id, "gate being raised, not retrying");
            }
            VerificationVerdict::GateOpen { gate_id, failures } => {
                outcome.failures = failures;
                if !self.gate_is_pending(&gate_id).await? {
                    self.verification.gate_resolved(&deliverable_id);
                    outcome.failures = self.verification.failures(&deliverable_id);
                    outcome.retry_task_id = Some(self.retry_deliverable(task).await?);
                }
            }
        }
        Ok(outcome)
    }

    async fn gate_is_pending(&self, gate_id: &str) -> ShipyardResult<bool> {
        let gates = self
            .gates
            .as_ref()
            .ok_or_else(|| ShipyardError::NotConfigured("gate store".into()))?;
        let pending = gates.get_pending_gates(&self.config.project_id).await?;
        Ok(pending.iter().any(|g| g.id == gate_id))
    }

    async fn retry_deliverable(&self, task: &Task) -> ShipyardResult<String> {
        let mut retry = Task::new(task.task_type.clone(), task.description.clone())
            .with_priority(task.priority)
            .with_payload(task.payload.clone());
        retry.agent_type = task.agent_type;
        retry.metadata = task.metadata.clone();
        retry
            .metadata
            .insert(META_PREVIOUS_TASK_ID.into(), json!(task.id));
        self.enqueue_task(retry).await
    }
}

/// Task that produces one deliverable.
fn deliverable_task(phase: PhaseName, deliverable: &Deliverable) -> Task {
    let description = if deliverable.description.is_empty() {
        format!("Produce {} for the {phase} phase", deliverable.name)
    } else {
        format!("{}: {}", deliverable.name, deliverable.description)
    };
    let mut task = Task::new("deliverable", description)
        .with_priority(DELIVERABLE_TASK_PRIORITY)
        .with_payload(json!({
            "deliverable": deliverable.name,
            "kind": deliverable.kind,
            "artifact_path": deliverable.artifact_path,
        }))
        .with_metadata(META_DELIVERABLE_ID, json!(deliverable.id))
        .with_metadata("phase", json!(phase));
    task.agent_type = deliverable.owner;
    task
}
