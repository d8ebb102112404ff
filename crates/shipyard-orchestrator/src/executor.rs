use crate::engine::Orchestrator;
use crate::types::{Task, TaskResult};
use parking_lot::Mutex;
use shipyard_core::{AgentType, ShipyardError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workers: usize,
    /// Hard ceiling on one `run_task` call. Exceeding it is a failure.
    pub task_timeout: Duration,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            task_timeout: Duration::from_secs(60),
            max_retries: 3,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ExecutorConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// How one dispatch attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Failed and put back in the queue; `attempt` failures so far.
    Retried { attempt: u32 },
    /// Failed for the last time.
    Failed,
    /// No agent of the task's role could take it. The task is parked until
    /// one becomes available and its retry budget is untouched.
    Deferred,
}

/// Counters exposed for monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub deferred: u64,
}

/// Pool of workers that pull tasks from the orchestrator's queue and run
/// them on registered agents.
///
/// Agents are looked up by id on every dispatch; the executor never owns them.
pub struct TaskExecutor {
    orchestrator: Arc<Orchestrator>,
    config: ExecutorConfig,
    attempts: Mutex<HashMap<String, u32>>,
    parked: Mutex<Vec<Task>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    deferred: AtomicU64,
}

impl TaskExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>, config: ExecutorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            orchestrator,
            config,
            attempts: Mutex::new(HashMap::new()),
            parked: Mutex::new(Vec::new()),
            shutdown,
            workers: Mutex::new(Vec::new()),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            completed: self.completed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }

    /// Tasks waiting for an agent of their role to become available.
    pub fn parked_count(&self) -> usize {
        self.parked.lock().len()
    }

    /// Move parked tasks whose role has a selectable agent again back into
    /// the queue. Returns how many were released.
    pub async fn release_parked(&self) -> usize {
        let parked: Vec<Task> = std::mem::take(&mut *self.parked.lock());
        if parked.is_empty() {
            return 0;
        }
        let mut waiting = Vec::new();
        let mut released = 0;
        for task in parked {
            let agent_type = task.agent_type.unwrap_or(AgentType::Backend);
            if self.orchestrator.select_agent(agent_type).await.is_some() {
                self.orchestrator.restore_task(task);
                released += 1;
            } else {
                waiting.push(task);
            }
        }
        self.parked.lock().extend(waiting);
        if released > 0 {
            debug!(released, "parked tasks released");
        }
        released
    }

    pub fn is_running(&self) -> bool {
        !self.workers.lock().is_empty()
    }

    /// Spawn the worker loops. Calling it while running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);
        for worker_id in 0..self.config.workers.max(1) {
            let executor = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            workers.push(tokio::spawn(async move {
                executor.worker_loop(worker_id, shutdown).await;
            }));
        }
        info!(workers = workers.len(), "task executor started");
    }

    /// Signal every worker to stop. In-flight tasks are abandoned.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in &workers {
            handle.abort();
        }
        for handle in workers {
            // Cancellation is the expected outcome here.
            let _ = handle.await;
        }
        info!("task executor stopped");
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.release_parked().await;
            match self.orchestrator.dequeue_task() {
                Some(task) => {
                    self.process_task(task).await;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        debug!(worker_id, "worker stopped");
    }

    /// Run one dequeued task to an outcome: completed, retried or failed.
    pub async fn process_task(&self, mut task: Task) -> TaskOutcome {
        let agent_type = task.agent_type.unwrap_or(AgentType::Backend);

        let Some(info) = self.orchestrator.select_agent(agent_type).await else {
            return self.park(task, agent_type);
        };
        let Some(agent) = self.orchestrator.agent(&info.id).await else {
            return self.park(task, agent_type);
        };
        match self.orchestrator.assign_task(&mut task, &info.id).await {
            Ok(()) => {}
            // Unregistered between selection and assignment.
            Err(ShipyardError::NotFound(_)) => return self.park(task, agent_type),
            Err(e) => return self.handle_failure(task, &e.to_string()).await,
        }
        self.orchestrator.mark_in_progress(&mut task).await;

        debug!(task_id = %task.id, agent_id = %info.id, "running task");
        match tokio::time::timeout(self.config.task_timeout, agent.run_task(&task)).await {
            Ok(Ok(result)) => self.handle_success(task, result).await,
            Ok(Err(e)) => self.handle_failure(task, &e.to_string()).await,
            Err(_) => {
                let reason = ShipyardError::Timeout(format!(
                    "task exceeded {}s",
                    self.config.task_timeout.as_secs_f64()
                ))
                .to_string();
                self.handle_failure(task, &reason).await
            }
        }
    }

    fn park(&self, task: Task, agent_type: AgentType) -> TaskOutcome {
        debug!(task_id = %task.id, agent = %agent_type, "no available agent, parking task");
        self.parked.lock().push(task);
        self.deferred.fetch_add(1, Ordering::Relaxed);
        TaskOutcome::Deferred
    }

    async fn handle_success(&self, mut task: Task, result: TaskResult) -> TaskOutcome {
        self.attempts.lock().remove(&task.id);
        self.orchestrator.complete_task(&mut task, &result).await;
        self.completed.fetch_add(1, Ordering::Relaxed);

        if let Some(deliverable_id) = task.deliverable_id().map(str::to_string) {
            if result.success {
                match self
                    .orchestrator
                    .mark_deliverable_completed(&deliverable_id, result.artifacts.first().cloned())
                    .await
                {
                    Ok(_) => {}
                    Err(ShipyardError::NotConfigured(_)) => {
                        debug!(
                            deliverable_id = %deliverable_id,
                            "no deliverable store, not tracking"
                        );
                    }
                    Err(e) => {
                        warn!(
                            deliverable_id = %deliverable_id,
                            error = %e,
                            "could not complete deliverable"
                        );
                    }
                }
            } else {
                let reason = if result.errors.is_empty() {
                    "agent reported failure".to_string()
                } else {
                    result.errors.join("; ")
                };
                if let Err(e) = self
                    .orchestrator
                    .record_verification_failure(&task, &reason)
                    .await
                {
                    warn!(
                        deliverable_id = %deliverable_id,
                        error = %e,
                        "could not record verification failure"
                    );
                }
            }
        }

        if let Err(e) = self.orchestrator.on_task_completed(&task, &result).await {
            warn!(task_id = %task.id, error = %e, "decision step failed");
        }
        TaskOutcome::Completed
    }

    async fn handle_failure(&self, mut task: Task, reason: &str) -> TaskOutcome {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(task.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if attempt <= self.config.max_retries {
            self.orchestrator.requeue_task(task, reason, attempt).await;
            self.retried.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Retried { attempt }
        } else {
            self.attempts.lock().remove(&task.id);
            self.orchestrator.fail_task(&mut task, reason).await;
            self.failed.fetch_add(1, Ordering::Relaxed);
            TaskOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::engine::OrchestratorConfig;
    use crate::types::TaskStatus;
    use async_trait::async_trait;
    use shipyard_core::ShipyardResult;
    use shipyard_events::{EventBus, EventType};

    struct Flaky {
        id: String,
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl Agent for Flaky {
        fn id(&self) -> &str {
            &self.id
        }

        fn agent_type(&self) -> AgentType {
            AgentType::Backend
        }

        async fn run_task(&self, _task: &Task) -> ShipyardResult<TaskResult> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(ShipyardError::Agent("boom".into()));
            }
            Ok(TaskResult::success())
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Agent for Sleepy {
        fn id(&self) -> &str {
            "sleepy"
        }

        fn agent_type(&self) -> AgentType {
            AgentType::Backend
        }

        async fn run_task(&self, _task: &Task) -> ShipyardResult<TaskResult> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(TaskResult::success())
        }
    }

    fn orchestrator() -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            OrchestratorConfig::new("p1", "goal"),
            Arc::new(EventBus::new()),
        ))
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Flaky {
            id: "b1".into(),
            failures_left: Mutex::new(2),
        }))
        .await
        .unwrap();
        orch.enqueue_task(Task::new("implement", "api")).await.unwrap();
        let executor = TaskExecutor::new(orch.clone(), ExecutorConfig::default());

        let task = orch.dequeue_task().unwrap();
        assert_eq!(executor.process_task(task).await, TaskOutcome::Retried { attempt: 1 });
        let task = orch.dequeue_task().unwrap();
        assert_eq!(executor.process_task(task).await, TaskOutcome::Retried { attempt: 2 });
        let task = orch.dequeue_task().unwrap();
        assert_eq!(executor.process_task(task).await, TaskOutcome::Completed);
        assert_eq!(
            executor.stats(),
            ExecutorStats {
                completed: 1,
                retried: 2,
                failed: 0,
                deferred: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Sleepy)).await.unwrap();
        orch.enqueue_task(Task::new("implement", "slow api")).await.unwrap();
        let executor = TaskExecutor::new(
            orch.clone(),
            ExecutorConfig::default()
                .with_task_timeout(Duration::from_millis(20))
                .with_max_retries(0),
        );
        let task = orch.dequeue_task().unwrap();
        assert_eq!(executor.process_task(task).await, TaskOutcome::Failed);
        let failed = orch
            .events()
            .get_history("p1", Some(EventType::TaskFailed), 10);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].data["reason"]
            .as_str()
            .unwrap()
            .contains("exceeded"));
    }

    #[tokio::test]
    async fn test_no_agent_parks_task_without_retry() {
        let orch = orchestrator();
        let id = orch.enqueue_task(Task::new("implement", "api")).await.unwrap();
        let executor =
            TaskExecutor::new(orch.clone(), ExecutorConfig::default().with_max_retries(0));

        let task = orch.dequeue_task().unwrap();
        assert_eq!(executor.process_task(task).await, TaskOutcome::Deferred);
        assert_eq!(executor.parked_count(), 1);
        assert_eq!(executor.release_parked().await, 0);
        assert_eq!(orch.get_task(&id).unwrap().status, TaskStatus::Pending);
        assert!(orch.dequeue_task().is_none());

        orch.register_agent(Arc::new(Flaky {
            id: "b1".into(),
            failures_left: Mutex::new(0),
        }))
        .await
        .unwrap();
        assert_eq!(executor.release_parked().await, 1);
        assert_eq!(executor.parked_count(), 0);
        let task = orch.dequeue_task().unwrap();
        assert_eq!(executor.process_task(task).await, TaskOutcome::Completed);

        let events = orch.events();
        assert!(events.get_history("p1", Some(EventType::TaskRetried), 10).is_empty());
        assert!(events.get_history("p1", Some(EventType::TaskFailed), 10).is_empty());
        assert_eq!(executor.stats().deferred, 1);
    }

    #[tokio::test]
    async fn test_paused_agent_holds_work_until_resumed() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Flaky {
            id: "b1".into(),
            failures_left: Mutex::new(0),
        }))
        .await
        .unwrap();
        orch.pause_agent("b1").await.unwrap();
        let executor = Arc::new(TaskExecutor::new(
            orch.clone(),
            ExecutorConfig::default().with_poll_interval(Duration::from_millis(5)),
        ));
        executor.start();
        let id = orch.enqueue_task(Task::new("implement", "api")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orch.get_task(&id).unwrap().status, TaskStatus::Pending);
        assert_eq!(executor.stats().failed, 0);
        assert_eq!(executor.stats().retried, 0);

        orch.resume_agent("b1").await.unwrap();
        for _ in 0..200 {
            if executor.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        executor.stop().await;
        assert_eq!(orch.get_task(&id).unwrap().status, TaskStatus::Completed);
        assert!(orch
            .events()
            .get_history("p1", Some(EventType::TaskFailed), 10)
            .is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let orch = orchestrator();
        orch.register_agent(Arc::new(Flaky {
            id: "b1".into(),
            failures_left: Mutex::new(0),
        }))
        .await
        .unwrap();
        let executor = Arc::new(TaskExecutor::new(
            orch.clone(),
            ExecutorConfig::default()
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(5)),
        ));
        executor.start();
        assert!(executor.is_running());
        orch.enqueue_task(Task::new("implement", "api")).await.unwrap();

        for _ in 0..200 {
            if executor.stats().completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(executor.stats().completed, 1);
        executor.stop().await;
        assert!(!executor.is_running());
    }
}
