//! Job intake and graph draining over a bounded worker pool.

use chrono::Utc;
use futures::FutureExt as _;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use warden_core::remote::ApiFactory;
use warden_core::store::Store;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EventChannel, JobEvent};
use crate::graph::{Guard, NodeId, TaskGraph, TaskNode};
use crate::job::{JobId, JobStatus, JobSummary};
use crate::lock::{LockManager, LockRequest, ObjectLockManager, OwnerId, UnlockTask};
use crate::task::{TaskContext, TaskStatus};

/// What one worker reported back for its node.
enum NodeOutcome {
    Leaf(StdResult<(), String>),
    Expanded(StdResult<TaskGraph, String>),
}

/// Accepts task graphs and drains them over a bounded worker pool.
///
/// Worker capacity is process wide: every job draws from the same
/// semaphore, so a burst of submissions cannot oversubscribe the broker.
pub struct JobEngine {
    config: EngineConfig,
    locks: Arc<dyn LockManager>,
    store: Arc<dyn Store>,
    apis: Arc<dyn ApiFactory>,
    events: EventChannel,
    permits: Arc<Semaphore>,
    jobs: RwLock<HashMap<JobId, JobSummary>>,
    completion: Notify,
    stopped: AtomicBool,
}

impl JobEngine {
    /// Creates an engine that discards progress events.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        apis: Arc<dyn ApiFactory>,
    ) -> Arc<Self> {
        Self::build(config, store, apis, EventChannel::disabled())
    }

    /// Creates an engine and the receiving end of its progress events.
    #[must_use]
    pub fn with_events(
        config: EngineConfig,
        store: Arc<dyn Store>,
        apis: Arc<dyn ApiFactory>,
    ) -> (Arc<Self>, UnboundedReceiver<JobEvent>) {
        let (events, receiver) = EventChannel::channel();
        (Self::build(config, store, apis, events), receiver)
    }

    fn build(
        config: EngineConfig,
        store: Arc<dyn Store>,
        apis: Arc<dyn ApiFactory>,
        events: EventChannel,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Arc::new(Self {
            locks: ObjectLockManager::new(),
            config,
            store,
            apis,
            events,
            permits,
            jobs: RwLock::new(HashMap::new()),
            completion: Notify::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// The engine's lock registry.
    #[must_use]
    pub fn locks(&self) -> Arc<dyn LockManager> {
        Arc::clone(&self.locks)
    }

    /// Validates, locks and queues one job, returning its id.
    ///
    /// The whole lock set is acquired here, before the job exists, so a
    /// submission that cannot get its locks leaves no trace. On success a
    /// release task guarded on completion joins the graph; the locks stay
    /// held until every other node has finished.
    ///
    /// # Errors
    /// Returns [`EngineError::CyclicGraph`] for a cyclic graph,
    /// [`EngineError::LockContention`] when the lock set cannot be
    /// acquired within the configured wait, or
    /// [`EngineError::EngineStopped`] after shutdown began.
    pub async fn submit<T: Into<String>>(
        self: &Arc<Self>,
        name: T,
        mut graph: TaskGraph,
        locks: &[LockRequest],
    ) -> Result<JobId> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::EngineStopped);
        }
        if graph.has_cycles() {
            return Err(EngineError::CyclicGraph);
        }

        let owner = OwnerId::new();
        let handles = self
            .locks
            .acquire_all(owner, locks, self.config.lock_wait())
            .await?;
        if !handles.is_empty() {
            graph.append_task(
                Arc::new(UnlockTask::new(Arc::clone(&self.locks), handles)),
                Guard::OnCompletion,
            );
        }

        let job = JobId::new();
        let name = name.into();
        let summary = JobSummary {
            id: job,
            name: name.clone(),
            status: JobStatus::Pending,
            failure: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.jobs.write().await.insert(job, summary);
        debug!(%job, name = %name, nodes = graph.node_count(), "job accepted");

        let engine = Arc::clone(self);
        drop(tokio::spawn(async move {
            engine.drive(job, name, graph).await;
        }));
        Ok(job)
    }

    /// Current status of one job.
    ///
    /// # Errors
    /// Returns [`EngineError::JobNotFound`] for an unknown id.
    pub async fn status(&self, job: JobId) -> Result<JobStatus> {
        self.jobs
            .read()
            .await
            .get(&job)
            .map(|summary| summary.status)
            .ok_or(EngineError::JobNotFound(job))
    }

    /// Full snapshot of one job.
    ///
    /// # Errors
    /// Returns [`EngineError::JobNotFound`] for an unknown id.
    pub async fn summary(&self, job: JobId) -> Result<JobSummary> {
        self.jobs
            .read()
            .await
            .get(&job)
            .cloned()
            .ok_or(EngineError::JobNotFound(job))
    }

    /// Every known job, newest first.
    pub async fn list(&self) -> Vec<JobSummary> {
        let mut jobs: Vec<JobSummary> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|left, right| right.created_at.cmp(&left.created_at));
        jobs
    }

    /// Waits until the job reaches a terminal status and returns it.
    ///
    /// # Errors
    /// Returns [`EngineError::JobNotFound`] for an unknown id.
    pub async fn wait(&self, job: JobId) -> Result<JobStatus> {
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let status = self.status(job).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            notified.await;
        }
    }

    /// Stops intake and waits for every accepted job to finish.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        loop {
            let notified = self.completion.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let draining = self
                .jobs
                .read()
                .await
                .values()
                .any(|summary| !summary.status.is_terminal());
            if !draining {
                return;
            }
            notified.await;
        }
    }

    async fn drive(self: Arc<Self>, job: JobId, name: String, mut graph: TaskGraph) {
        self.set_status(job, JobStatus::Running, None).await;
        self.events.emit(JobEvent::JobStarted { job, name });

        let mut statuses: HashMap<NodeId, TaskStatus> = graph
            .node_ids()
            .into_iter()
            .map(|node| (node, TaskStatus::Pending))
            .collect();
        let mut join_set: JoinSet<(NodeId, NodeOutcome)> = JoinSet::new();
        let mut failure: Option<String> = None;

        loop {
            self.propagate_skips(job, &graph, &mut statuses);

            if join_set.is_empty() && statuses.values().all(|status| status.is_terminal()) {
                break;
            }

            for node in Self::eligible(&graph, &statuses) {
                if join_set.len() >= self.config.max_concurrent_tasks {
                    break;
                }

                statuses.insert(node, TaskStatus::Running);
                let task = graph.node(node).name();
                self.events.emit(JobEvent::TaskStarted {
                    job,
                    task: task.clone(),
                });

                let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                    statuses.insert(node, TaskStatus::Failed);
                    failure.get_or_insert_with(|| format!("{task}: worker pool is closed"));
                    self.events.emit(JobEvent::TaskFinished {
                        job,
                        task,
                        status: TaskStatus::Failed,
                        error: Some("worker pool is closed".to_owned()),
                    });
                    continue;
                };

                let ctx = TaskContext {
                    job,
                    store: Arc::clone(&self.store),
                    apis: Arc::clone(&self.apis),
                    events: self.events.clone(),
                    remote_timeout: self.config.remote_timeout(),
                };
                let work = graph.node(node).clone();
                join_set.spawn(async move {
                    // Panics become ordinary failures so guards still
                    // settle and cleanup nodes still run.
                    let outcome = match work {
                        TaskNode::Leaf(task) => {
                            let result = AssertUnwindSafe(task.execute(&ctx)).catch_unwind().await;
                            NodeOutcome::Leaf(match result {
                                Ok(Ok(())) => Ok(()),
                                Ok(Err(error)) => Err(error.to_string()),
                                Err(_panic) => Err("task panicked".to_owned()),
                            })
                        }
                        TaskNode::Meta(task) => {
                            let result = AssertUnwindSafe(task.expand(&ctx)).catch_unwind().await;
                            NodeOutcome::Expanded(match result {
                                Ok(Ok(subgraph)) => Ok(subgraph),
                                Ok(Err(error)) => Err(error.to_string()),
                                Err(_panic) => Err("expansion panicked".to_owned()),
                            })
                        }
                    };
                    drop(permit);
                    (node, outcome)
                });
            }

            match join_set.join_next().await {
                Some(Ok((node, outcome))) => {
                    self.finish_node(job, node, outcome, &mut graph, &mut statuses, &mut failure);
                }
                Some(Err(join_error)) => {
                    // Panics are caught inside the worker, so this future
                    // was torn down from outside; the lost-node sweep will
                    // settle its status.
                    warn!(%job, error = %join_error, "worker future lost");
                }
                None => {
                    self.fail_lost_nodes(job, &graph, &mut statuses, &mut failure);
                }
            }
        }

        let status = if failure.is_none() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        self.set_status(job, status, failure.clone()).await;
        self.events.emit(JobEvent::JobFinished {
            job,
            status,
            failure,
        });
        self.completion.notify_waiters();
    }

    /// Pending nodes whose every incoming guard is met.
    fn eligible(graph: &TaskGraph, statuses: &HashMap<NodeId, TaskStatus>) -> Vec<NodeId> {
        graph
            .node_ids()
            .into_iter()
            .filter(|&node| {
                statuses.get(&node) == Some(&TaskStatus::Pending)
                    && graph.incoming(node).iter().all(|&(pred, guard)| {
                        let pred_status = statuses.get(&pred).copied();
                        match guard {
                            Guard::OnSuccess => pred_status == Some(TaskStatus::Succeeded),
                            Guard::OnCompletion => pred_status.is_some_and(TaskStatus::is_terminal),
                        }
                    })
            })
            .collect()
    }

    /// Marks pending nodes with an unmeetable on-success guard as skipped,
    /// sweeping until nothing changes since skips poison transitively.
    fn propagate_skips(
        &self,
        job: JobId,
        graph: &TaskGraph,
        statuses: &mut HashMap<NodeId, TaskStatus>,
    ) {
        loop {
            let mut changed = false;
            for node in graph.node_ids() {
                if statuses.get(&node) != Some(&TaskStatus::Pending) {
                    continue;
                }
                let unmeetable = graph.incoming(node).iter().any(|&(pred, guard)| {
                    guard == Guard::OnSuccess
                        && matches!(
                            statuses.get(&pred),
                            Some(TaskStatus::Failed | TaskStatus::Skipped)
                        )
                });
                if unmeetable {
                    statuses.insert(node, TaskStatus::Skipped);
                    self.events.emit(JobEvent::TaskFinished {
                        job,
                        task: graph.node(node).name(),
                        status: TaskStatus::Skipped,
                        error: None,
                    });
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn finish_node(
        &self,
        job: JobId,
        node: NodeId,
        outcome: NodeOutcome,
        graph: &mut TaskGraph,
        statuses: &mut HashMap<NodeId, TaskStatus>,
        failure: &mut Option<String>,
    ) {
        let task = graph.node(node).name();
        let (status, error) = match outcome {
            NodeOutcome::Leaf(Ok(())) => (TaskStatus::Succeeded, None),
            NodeOutcome::Leaf(Err(error)) => (TaskStatus::Failed, Some(error)),
            NodeOutcome::Expanded(Ok(subgraph)) => {
                if subgraph.has_cycles() {
                    (
                        TaskStatus::Failed,
                        Some("expansion produced a cyclic graph".to_owned()),
                    )
                } else {
                    if subgraph.is_empty() {
                        debug!(%job, task = %task, "already converged, nothing to expand");
                    }
                    for added in graph.splice(node, subgraph) {
                        statuses.insert(added, TaskStatus::Pending);
                    }
                    (TaskStatus::Succeeded, None)
                }
            }
            NodeOutcome::Expanded(Err(error)) => (TaskStatus::Failed, Some(error)),
        };

        statuses.insert(node, status);
        if status == TaskStatus::Failed {
            debug!(%job, task = %task, error = ?error, "task failed");
            if failure.is_none() {
                *failure = error.clone().map(|message| format!("{task}: {message}"));
            }
        }
        self.events.emit(JobEvent::TaskFinished {
            job,
            task,
            status,
            error,
        });
    }

    /// Settles nodes stranded without workers so guards still resolve and
    /// cleanup nodes still get their turn.
    fn fail_lost_nodes(
        &self,
        job: JobId,
        graph: &TaskGraph,
        statuses: &mut HashMap<NodeId, TaskStatus>,
        failure: &mut Option<String>,
    ) {
        let mut lost: Vec<NodeId> = statuses
            .iter()
            .filter(|(_, status)| **status == TaskStatus::Running)
            .map(|(node, _)| *node)
            .collect();
        if lost.is_empty() {
            lost = statuses
                .iter()
                .filter(|(_, status)| !status.is_terminal())
                .map(|(node, _)| *node)
                .collect();
        }
        for node in lost {
            let task = graph.node(node).name();
            warn!(%job, task = %task, "task lost without an outcome");
            statuses.insert(node, TaskStatus::Failed);
            failure.get_or_insert_with(|| format!("{task}: lost without an outcome"));
            self.events.emit(JobEvent::TaskFinished {
                job,
                task,
                status: TaskStatus::Failed,
                error: Some("lost without an outcome".to_owned()),
            });
        }
    }

    async fn set_status(&self, job: JobId, status: JobStatus, failure: Option<String>) {
        let mut jobs = self.jobs.write().await;
        if let Some(summary) = jobs.get_mut(&job) {
            summary.status = status;
            if failure.is_some() {
                summary.failure = failure;
            }
            if status.is_terminal() {
                summary.completed_at = Some(Utc::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::testing::NoRemotes;
    use crate::task::Task;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use warden_core::Result as CoreResult;
    use warden_core::{EntityId, Error as CoreError, MemoryStore, ObjectKind, ObjectRef};

    type RunLog = Arc<StdMutex<Vec<String>>>;

    struct Recorder {
        label: String,
        log: RunLog,
        fail: bool,
    }

    impl Recorder {
        fn ok(label: &str, log: &RunLog) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_owned(),
                log: Arc::clone(log),
                fail: false,
            })
        }

        fn failing(label: &str, log: &RunLog) -> Arc<Self> {
            Arc::new(Self {
                label: label.to_owned(),
                log: Arc::clone(log),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Task for Recorder {
        fn name(&self) -> String {
            self.label.clone()
        }

        async fn execute(&self, _ctx: &TaskContext) -> CoreResult<()> {
            self.log.lock().unwrap().push(self.label.clone());
            if self.fail {
                return Err(CoreError::Other(format!("{} went wrong", self.label)));
            }
            Ok(())
        }
    }

    fn engine() -> Arc<JobEngine> {
        JobEngine::new(
            EngineConfig {
                max_concurrent_tasks: 4,
                lock_wait_secs: 1,
                remote_timeout_secs: 1,
            },
            MemoryStore::new(),
            Arc::new(NoRemotes),
        )
    }

    fn connector_ref(id: u64) -> ObjectRef {
        ObjectRef::new(ObjectKind::Connector, EntityId(id), "vc")
    }

    #[tokio::test]
    async fn test_linear_graph_drains_in_dependency_order() {
        let engine = engine();
        let log: RunLog = Arc::default();

        let mut graph = TaskGraph::new();
        let first = graph.add_task(Recorder::ok("first", &log));
        let second = graph.add_task(Recorder::ok("second", &log));
        let third = graph.add_task(Recorder::ok("third", &log));
        graph.add_edge(first, second, Guard::OnSuccess);
        graph.add_edge(second, third, Guard::OnSuccess);

        let job = engine.submit("linear", graph, &[]).await.unwrap();
        let status = engine.wait(job).await.unwrap();

        assert_eq!(status, JobStatus::Succeeded);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_but_cleanup_runs() {
        let engine = engine();
        let log: RunLog = Arc::default();

        let mut graph = TaskGraph::new();
        let broken = graph.add_task(Recorder::failing("broken", &log));
        let dependent = graph.add_task(Recorder::ok("dependent", &log));
        let cleanup = graph.add_task(Recorder::ok("cleanup", &log));
        graph.add_edge(broken, dependent, Guard::OnSuccess);
        graph.add_edge(broken, cleanup, Guard::OnCompletion);

        let job = engine.submit("partial failure", graph, &[]).await.unwrap();
        let status = engine.wait(job).await.unwrap();

        assert_eq!(status, JobStatus::Failed);
        let ran = log.lock().unwrap().clone();
        assert!(ran.contains(&"cleanup".to_owned()));
        assert!(!ran.contains(&"dependent".to_owned()));

        let summary = engine.summary(job).await.unwrap();
        assert_eq!(summary.failure.as_deref(), Some("broken: broken went wrong"));
        assert!(summary.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cyclic_graph_is_rejected_at_submit() {
        let engine = engine();
        let log: RunLog = Arc::default();

        let mut graph = TaskGraph::new();
        let node_a = graph.add_task(Recorder::ok("a-node", &log));
        let node_b = graph.add_task(Recorder::ok("b-node", &log));
        graph.add_edge(node_a, node_b, Guard::OnSuccess);
        graph.add_edge(node_b, node_a, Guard::OnSuccess);

        let denied = engine.submit("cyclic", graph, &[]).await;
        assert!(matches!(denied, Err(EngineError::CyclicGraph)));
        assert!(engine.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_job_locks_release_when_the_job_ends() {
        let engine = engine();
        let log: RunLog = Arc::default();

        let mut graph = TaskGraph::new();
        graph.add_task(Recorder::ok("work", &log));
        let locks = vec![LockRequest::exclusive(connector_ref(7))];

        let job = engine.submit("locked", graph, &locks).await.unwrap();
        engine.wait(job).await.unwrap();

        assert!(engine.locks().inspect(&connector_ref(7)).await.is_none());
    }

    #[tokio::test]
    async fn test_lock_contention_surfaces_as_retryable() {
        let engine = engine();
        let owner = OwnerId::new();
        let _held = engine
            .locks()
            .try_acquire(owner, &LockRequest::exclusive(connector_ref(7)))
            .await
            .unwrap();

        let log: RunLog = Arc::default();
        let mut graph = TaskGraph::new();
        graph.add_task(Recorder::ok("never runs", &log));

        let denied = engine
            .submit(
                "contended",
                graph,
                &[LockRequest::exclusive(connector_ref(7))],
            )
            .await;
        match denied {
            Err(error) => assert!(error.is_retryable()),
            Ok(_) => panic!("submission should have hit lock contention"),
        }
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_work() {
        let engine = engine();
        engine.shutdown().await;

        let graph = TaskGraph::new();
        let denied = engine.submit("late", graph, &[]).await;
        assert!(matches!(denied, Err(EngineError::EngineStopped)));
    }

    #[tokio::test]
    async fn test_wait_on_unknown_job_errors() {
        let engine = engine();
        let missing = engine.wait(JobId::new()).await;
        assert!(matches!(missing, Err(EngineError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn test_parallel_branches_both_run() {
        let engine = engine();
        let log: RunLog = Arc::default();

        let mut graph = TaskGraph::new();
        let root = graph.add_task(Recorder::ok("root", &log));
        let left = graph.add_task(Recorder::ok("left", &log));
        let right = graph.add_task(Recorder::ok("right", &log));
        graph.add_edge(root, left, Guard::OnSuccess);
        graph.add_edge(root, right, Guard::OnSuccess);

        let job = engine.submit("fan out", graph, &[]).await.unwrap();
        let status = engine.wait(job).await.unwrap();

        assert_eq!(status, JobStatus::Succeeded);
        let ran = log.lock().unwrap().clone();
        assert_eq!(ran.first().map(String::as_str), Some("root"));
        assert_eq!(ran.len(), 3);
    }

    #[tokio::test]
    async fn test_panicking_task_fails_without_poisoning_the_job_loop() {
        struct Panics;

        #[async_trait]
        impl Task for Panics {
            fn name(&self) -> String {
                "panics".to_owned()
            }

            async fn execute(&self, _ctx: &TaskContext) -> CoreResult<()> {
                panic!("boom");
            }
        }

        let engine = engine();
        let log: RunLog = Arc::default();

        let mut graph = TaskGraph::new();
        let bad = graph.add_task(Arc::new(Panics));
        let cleanup = graph.add_task(Recorder::ok("cleanup", &log));
        graph.add_edge(bad, cleanup, Guard::OnCompletion);

        let job = engine.submit("panicky", graph, &[]).await.unwrap();
        let status = engine.wait(job).await.unwrap();

        assert_eq!(status, JobStatus::Failed);
        assert!(log.lock().unwrap().contains(&"cleanup".to_owned()));
        let summary = engine.summary(job).await.unwrap();
        assert_eq!(summary.failure.as_deref(), Some("panics: task panicked"));
    }
}
