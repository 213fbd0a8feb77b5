//! Worker pools which run engine jobs away from the driver.

use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, unbounded, Receiver, Select, Sender};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::ProgressBar;
use log::{debug, error, trace};
use serde_json::Value;

use super::DispatchError;
use crate::job::{run_timed, Engine, EngineError, Job};

/// Index of a worker node.
pub type NodeId = usize;

/// What came back from one job.
#[derive(Debug)]
pub struct JobOutcome {
    /// The engine's result.
    pub result: Result<Value, EngineError>,
    /// Time the job took on the node.
    pub elapsed: Duration,
}

/// A submitted job which hasn't been waited on.
#[derive(Debug)]
pub struct JobHandle {
    node: NodeId,
    command: String,
    receiver: Receiver<JobOutcome>,
}

impl JobHandle {
    /// A handle which completes when `receiver` yields.
    pub fn new(node: NodeId, command: impl Into<String>, receiver: Receiver<JobOutcome>) -> Self {
        Self {
            node,
            command: command.into(),
            receiver,
        }
    }

    /// The node running the job.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The engine command being run.
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Shared flag which stops a wait early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicCell<bool>>);

impl CancelToken {
    /// A token which hasn't been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop any wait holding this token.
    pub fn cancel(&self) {
        self.0.store(true);
    }

    /// Whether [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load()
    }
}

/// How long to wait for a batch of jobs.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    /// Give up after this long.
    pub timeout: Option<Duration>,
    /// Give up when this is cancelled.
    pub cancel: Option<CancelToken>,
    /// How often to check the timeout and cancellation.
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            cancel: None,
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl Display for WaitPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.timeout {
            Some(timeout) => write!(f, "wait up to {timeout:?}")?,
            None => write!(f, "wait indefinitely")?,
        }
        if self.cancel.is_some() {
            write!(f, " unless cancelled")?;
        }
        Ok(())
    }
}

/// Wait for every handle, returning outcomes in handle order whatever order the jobs finish in.
///
/// # Errors
///
/// Returns [`DispatchError::Timeout`] or [`DispatchError::Cancelled`] if the policy stops the
/// wait early. Jobs already running are left to finish.
pub fn wait_for_all(
    handles: Vec<JobHandle>,
    policy: &WaitPolicy,
    progress: &ProgressBar,
) -> Result<Vec<JobOutcome>, DispatchError> {
    let total = handles.len();
    let start = Instant::now();
    let mut outcomes: Vec<Option<JobOutcome>> = (0..total).map(|_| None).collect();
    let mut remaining = total;

    while remaining > 0 {
        let completed = total - remaining;
        if policy.cancel.as_ref().map_or(false, CancelToken::is_cancelled) {
            return Err(DispatchError::Cancelled { completed, total });
        }
        if let Some(timeout) = policy.timeout {
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(DispatchError::Timeout {
                    completed,
                    total,
                    elapsed,
                });
            }
        }

        let mut select = Select::new();
        let mut waiting = Vec::with_capacity(remaining);
        for (idx, handle) in handles.iter().enumerate() {
            if outcomes[idx].is_none() {
                select.recv(&handle.receiver);
                waiting.push(idx);
            }
        }
        let operation = match select.select_timeout(policy.poll_interval) {
            Ok(operation) => operation,
            Err(_) => continue,
        };
        let idx = waiting[operation.index()];
        let handle = &handles[idx];
        let outcome = operation
            .recv(&handle.receiver)
            .unwrap_or_else(|_| JobOutcome {
                result: Err(EngineError::WorkerLost {
                    command: handle.command.clone(),
                    node: handle.node,
                }),
                elapsed: Duration::default(),
            });
        trace!("job {} on node {} finished", idx, handle.node);
        outcomes[idx] = Some(outcome);
        remaining -= 1;
        progress.inc(1);
    }

    Ok(outcomes.into_iter().flatten().collect())
}

/// Somewhere to run engine jobs concurrently.
pub trait WorkerPool: Send + Sync {
    /// The nodes jobs can be submitted to.
    fn list_nodes(&self) -> Vec<NodeId>;

    /// Start `job` on `node` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NodeUnavailable`] if the node can't take jobs.
    fn submit(&self, node: NodeId, job: Job) -> Result<JobHandle, DispatchError>;

    /// Block until every handle has completed, keeping handle order.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy stops the wait early.
    fn wait_all(
        &self,
        handles: Vec<JobHandle>,
        policy: &WaitPolicy,
        progress: &ProgressBar,
    ) -> Result<Vec<JobOutcome>, DispatchError> {
        wait_for_all(handles, policy, progress)
    }
}

struct WorkOrder {
    job: Job,
    reply: Sender<JobOutcome>,
}

/// A pool of threads in this process, each calling the same engine.
pub struct LocalWorkerPool {
    senders: Vec<Sender<WorkOrder>>,
    workers: Vec<JoinHandle<()>>,
}

impl LocalWorkerPool {
    /// Start `num_workers` threads calling `engine`, or only logging calls when `dry_run`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Spawn`] if a thread can't be started.
    pub fn new(
        engine: Arc<dyn Engine>,
        num_workers: usize,
        dry_run: bool,
    ) -> Result<Self, DispatchError> {
        let num_workers = num_workers.max(1);
        let mut senders = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for node in 0..num_workers {
            let (tx, rx) = unbounded::<WorkOrder>();
            let engine = Arc::clone(&engine);
            let worker = thread::Builder::new()
                .name(format!("engine-{node}"))
                .spawn(move || {
                    for WorkOrder { job, reply } in rx.iter() {
                        trace!("node {} running {}", node, job.command);
                        let (result, elapsed) = run_timed(engine.as_ref(), &job, dry_run);
                        // the driver may have stopped waiting
                        let _ = reply.send(JobOutcome { result, elapsed });
                    }
                })
                .map_err(|source| DispatchError::Spawn { node, source })?;
            senders.push(tx);
            workers.push(worker);
        }
        debug!("started {} engine workers", num_workers);
        Ok(Self { senders, workers })
    }
}

impl WorkerPool for LocalWorkerPool {
    fn list_nodes(&self) -> Vec<NodeId> {
        (0..self.senders.len()).collect()
    }

    fn submit(&self, node: NodeId, job: Job) -> Result<JobHandle, DispatchError> {
        let sender = self
            .senders
            .get(node)
            .ok_or(DispatchError::NodeUnavailable { node })?;
        let (reply, receiver) = bounded(1);
        let command = job.command.clone();
        sender
            .send(WorkOrder { job, reply })
            .map_err(|_| DispatchError::NodeUnavailable { node })?;
        Ok(JobHandle::new(node, command, receiver))
    }
}

impl Drop for LocalWorkerPool {
    fn drop(&mut self) {
        // closing the queues lets each worker finish what it has and exit
        self.senders.clear();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("an engine worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{inputs::engine_args, test_common::FakeEngine};
    use serde_json::json;

    fn job(n: u64) -> Job {
        Job::new("sleep", engine_args([("ms", json!(n))]))
    }

    fn sleepy_engine() -> FakeEngine {
        FakeEngine::new().on("sleep", |job| {
            let ms = job.args["ms"].as_u64().unwrap();
            thread::sleep(Duration::from_millis(ms));
            Ok(json!(ms))
        })
    }

    #[test]
    fn test_outcomes_keep_submission_order() {
        let pool = LocalWorkerPool::new(Arc::new(sleepy_engine()), 4, false).unwrap();
        let delays = [40, 5, 25, 0];
        let handles = delays
            .iter()
            .enumerate()
            .map(|(i, &ms)| pool.submit(i % 4, job(ms)).unwrap())
            .collect();
        let outcomes = pool
            .wait_all(handles, &WaitPolicy::default(), &ProgressBar::hidden())
            .unwrap();
        let values: Vec<_> = outcomes.into_iter().map(|o| o.result.unwrap()).collect();
        assert_eq!(values, vec![json!(40), json!(5), json!(25), json!(0)]);
    }

    #[test]
    fn test_timeout() {
        let pool = LocalWorkerPool::new(Arc::new(sleepy_engine()), 1, false).unwrap();
        let handles = vec![pool.submit(0, job(0)).unwrap(), pool.submit(0, job(500)).unwrap()];
        let policy = WaitPolicy {
            timeout: Some(Duration::from_millis(50)),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        };
        match pool.wait_all(handles, &policy, &ProgressBar::hidden()) {
            Err(DispatchError::Timeout {
                completed, total, ..
            }) => {
                assert_eq!(total, 2);
                assert!(completed <= 1);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel() {
        let pool = LocalWorkerPool::new(Arc::new(sleepy_engine()), 1, false).unwrap();
        let handles = vec![pool.submit(0, job(300)).unwrap()];
        let token = CancelToken::new();
        token.cancel();
        let policy = WaitPolicy {
            cancel: Some(token),
            ..Default::default()
        };
        assert!(matches!(
            pool.wait_all(handles, &policy, &ProgressBar::hidden()),
            Err(DispatchError::Cancelled {
                completed: 0,
                total: 1
            })
        ));
    }

    #[test]
    fn test_unknown_node() {
        let pool = LocalWorkerPool::new(Arc::new(FakeEngine::new()), 2, false).unwrap();
        assert_eq!(pool.list_nodes(), vec![0, 1]);
        assert!(matches!(
            pool.submit(7, job(0)),
            Err(DispatchError::NodeUnavailable { node: 7 })
        ));
    }

    #[test]
    fn test_dry_run_pool_skips_engine() {
        let engine = Arc::new(FakeEngine::new());
        let pool = LocalWorkerPool::new(engine.clone(), 2, true).unwrap();
        let handles = vec![pool.submit(0, job(1)).unwrap(), pool.submit(1, job(1)).unwrap()];
        let outcomes = pool
            .wait_all(handles, &WaitPolicy::default(), &ProgressBar::hidden())
            .unwrap();
        assert!(outcomes.iter().all(|o| o.result.as_ref().unwrap().is_null()));
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_worker_survives_engine_panic() {
        let engine = sleepy_engine().on("explode", |_| panic!("segfault in engine"));
        let pool = LocalWorkerPool::new(Arc::new(engine), 1, false).unwrap();
        // the healthy job is queued behind the panicking one on the same node
        let handles = vec![
            pool.submit(0, Job::new("explode", Default::default())).unwrap(),
            pool.submit(0, job(1)).unwrap(),
        ];
        let outcomes = pool
            .wait_all(handles, &WaitPolicy::default(), &ProgressBar::hidden())
            .unwrap();
        match &outcomes[0].result {
            Err(EngineError::Panicked { command, message }) => {
                assert_eq!(command, "explode");
                assert_eq!(message, "segfault in engine");
            }
            other => panic!("expected Panicked, got {other:?}"),
        }
        assert_eq!(outcomes[1].result.as_ref().unwrap(), &json!(1));

        // and the node still takes work
        let handles = vec![pool.submit(0, job(2)).unwrap()];
        let outcomes = pool
            .wait_all(handles, &WaitPolicy::default(), &ProgressBar::hidden())
            .unwrap();
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &json!(2));
    }
}
