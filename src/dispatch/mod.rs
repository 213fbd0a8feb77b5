//! Fanning a task out over the sub-datasets of a sharded dataset and folding the per-shard
//! results back together.

use std::{
    fmt::{Display, Formatter},
    sync::Arc,
    time::Duration,
};

use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use serde_json::Value;

use crate::{context::Context, inputs::Inputs, job::Executor};

mod consolidate;
mod error;
mod pool;

pub use consolidate::{consolidate, Consolidated, ShardFailure, ShardReturn};
pub use error::DispatchError;
pub use pool::{
    wait_for_all, CancelToken, JobHandle, JobOutcome, LocalWorkerPool, NodeId, WaitPolicy,
    WorkerPool,
};

/// Inputs which can be re-targeted at one sub-dataset.
pub trait ShardableInputs: Inputs + Clone {
    /// The registered name of the dataset the inputs apply to.
    fn dataset_name(&self) -> &str;

    /// A copy of these inputs applied to the sub-dataset `shard` instead.
    fn for_shard(&self, shard: &str) -> Self;
}

/// One shard's share of a sharded task.
#[derive(Debug, Clone)]
pub struct WorkItem<I> {
    /// Position of the shard within the dataset.
    pub index: usize,
    /// The sub-dataset.
    pub shard: String,
    /// Inputs re-targeted at the shard.
    pub inputs: I,
}

/// Options for a [`ClusterDispatcher`]
#[derive(Builder, Debug, Clone)]
pub struct DispatchConfig {
    /// Give up waiting for shards after this long.
    #[builder(default)]
    pub timeout: Option<Duration>,

    /// How often to check for timeout and cancellation while waiting.
    #[builder(default = "Duration::from_millis(250)")]
    pub poll_interval: Duration,

    /// Whether to draw a progress bar while waiting.
    #[builder(default = "true")]
    pub draw_progress: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(250),
            draw_progress: true,
        }
    }
}

impl Display for DispatchConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.timeout {
            Some(timeout) => writeln!(f, "Will give up on shards after {timeout:?}.")?,
            None => writeln!(f, "Will wait for every shard.")?,
        }
        writeln!(
            f,
            "{} draw progress bars.",
            if self.draw_progress { "Will" } else { "Will not" }
        )?;
        Ok(())
    }
}

/// Runs a task over every shard of a dataset on a [`WorkerPool`].
#[derive(Clone)]
pub struct ClusterDispatcher {
    pool: Arc<dyn WorkerPool>,
    config: DispatchConfig,
    cancel: Option<CancelToken>,
}

impl ClusterDispatcher {
    /// A dispatcher submitting to `pool`.
    pub fn new(pool: Arc<dyn WorkerPool>, config: DispatchConfig) -> Self {
        Self {
            pool,
            config,
            cancel: None,
        }
    }

    /// Stop waiting for shards when `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// One work item per sub-dataset, in shard order.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Context`] if the dataset isn't registered, or
    /// [`DispatchError::NotAShardedDataset`] if it has no sub-datasets.
    pub fn generate_jobs<I: ShardableInputs>(
        &self,
        ctx: &Context,
        inputs: &I,
    ) -> Result<Vec<WorkItem<I>>, DispatchError> {
        let dataset = ctx.get_dataset(inputs.dataset_name())?;
        if !dataset.is_sharded() {
            return Err(DispatchError::NotAShardedDataset {
                name: dataset.name.clone(),
            });
        }
        Ok(dataset
            .shards
            .iter()
            .enumerate()
            .map(|(index, shard)| WorkItem {
                index,
                shard: shard.clone(),
                inputs: inputs.for_shard(shard),
            })
            .collect())
    }

    fn progress_bar(&self, len: usize, message: &str) -> ProgressBar {
        let draw_target = if self.config.draw_progress {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let progress = ProgressBar::with_draw_target(Some(len as u64), draw_target);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({pos}/{len}) ({eta:5})",
        ) {
            progress.set_style(style.progress_chars("=> "));
        }
        progress.set_message(message.to_string());
        progress
    }

    /// Run every work item on the pool, returning one result per item in item order. Shards are
    /// handed to nodes round-robin. A failed shard doesn't stop the others, and neither does a
    /// node refusing its share.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool has no nodes, every submission was refused, or the wait is
    /// stopped by timeout or cancellation.
    pub fn execute_jobs<I: Inputs>(
        &self,
        items: &[WorkItem<I>],
        executor: &mut Executor,
    ) -> Result<Vec<Result<Value, ShardFailure>>, DispatchError> {
        let nodes = self.pool.list_nodes();
        if nodes.is_empty() {
            return Err(DispatchError::NoNodes);
        }
        let mut results: Vec<Option<Result<Value, ShardFailure>>> =
            (0..items.len()).map(|_| None).collect();
        let mut handles = Vec::with_capacity(items.len());
        // (item, command) of each handle
        let mut submitted = Vec::with_capacity(items.len());
        let mut refused = None;
        for (n, item) in items.iter().enumerate() {
            let job = item.inputs.to_job();
            let node = nodes[n % nodes.len()];
            match self.pool.submit(node, job.clone()) {
                Ok(handle) => {
                    executor.record_call(&job);
                    submitted.push((n, job.command));
                    handles.push(handle);
                }
                Err(e) => {
                    warn!("shard {} ({}) was not submitted: {}", item.index, item.shard, e);
                    results[n] = Some(Err(ShardFailure {
                        shard: item.shard.clone(),
                        cause: e.to_string(),
                    }));
                    refused.get_or_insert(e);
                }
            }
        }
        if handles.is_empty() {
            if let Some(e) = refused {
                return Err(e);
            }
        }
        info!(
            "dispatched {} of {} shard jobs over {} nodes",
            handles.len(),
            items.len(),
            nodes.len()
        );

        let policy = WaitPolicy {
            timeout: self.config.timeout,
            cancel: self.cancel.clone(),
            poll_interval: self.config.poll_interval,
        };
        let message = submitted
            .first()
            .map(|(_, command)| command.clone())
            .unwrap_or_default();
        let progress = self.progress_bar(handles.len(), &message);
        let outcomes = self.pool.wait_all(handles, &policy, &progress)?;
        progress.finish();

        for (outcome, (n, command)) in outcomes.into_iter().zip(submitted) {
            let item = &items[n];
            executor.record(&command, outcome.elapsed);
            results[n] = Some(outcome.result.map_err(|e| {
                warn!("shard {} ({}) failed: {}", item.index, item.shard, e);
                ShardFailure {
                    shard: item.shard.clone(),
                    cause: e.to_string(),
                }
            }));
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Partition, execute and consolidate in one go. `shard_return` interprets each shard's
    /// engine result for consolidation.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`ClusterDispatcher::generate_jobs`],
    /// [`ClusterDispatcher::execute_jobs`] or [`consolidate`].
    pub fn dispatch<I, F>(
        &self,
        ctx: &Context,
        inputs: &I,
        executor: &mut Executor,
        shard_return: F,
    ) -> Result<Consolidated, DispatchError>
    where
        I: ShardableInputs,
        F: Fn(Value) -> ShardReturn,
    {
        let items = self.generate_jobs(ctx, inputs)?;
        let shards: Vec<String> = items.iter().map(|item| item.shard.clone()).collect();
        let results = self
            .execute_jobs(&items, executor)?
            .into_iter()
            .map(|result| result.map(&shard_return))
            .collect();
        consolidate(results, &shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        inputs::{engine_args, EngineArgs},
        job::{EngineError, ExecutorConfig, Job},
        test_common::{sharded_context, FakeEngine},
    };
    use serde_json::json;
    use std::{path::Path, thread};

    #[derive(Debug, Clone)]
    struct CountInputs {
        vis: String,
        target: String,
    }

    impl Inputs for CountInputs {
        fn command(&self) -> &str {
            "count"
        }
        fn fields(&self) -> EngineArgs {
            engine_args([("vis", json!(self.target))])
        }
        fn output_dir(&self) -> &Path {
            Path::new("/tmp")
        }
    }

    impl ShardableInputs for CountInputs {
        fn dataset_name(&self) -> &str {
            &self.vis
        }
        fn for_shard(&self, shard: &str) -> Self {
            Self {
                target: shard.to_string(),
                ..self.clone()
            }
        }
    }

    fn inputs() -> CountInputs {
        CountInputs {
            vis: "ds1".into(),
            target: "ds1.mms".into(),
        }
    }

    fn dispatcher(engine: Arc<FakeEngine>, workers: usize) -> ClusterDispatcher {
        let pool = LocalWorkerPool::new(engine, workers, false).unwrap();
        ClusterDispatcher::new(
            Arc::new(pool),
            DispatchConfigBuilder::default()
                .draw_progress(false)
                .build()
                .unwrap(),
        )
    }

    fn shard_index(job: &Job) -> u64 {
        let vis = job.args["vis"].as_str().unwrap();
        vis.rsplit('.').next().unwrap().parse().unwrap()
    }

    #[test]
    fn test_generate_jobs() {
        let ctx = sharded_context("ds1", 3);
        let d = dispatcher(Arc::new(FakeEngine::new()), 2);
        let items = d.generate_jobs(&ctx, &inputs()).unwrap();
        assert_eq!(items.len(), 3);
        for (i, item) in items.iter().enumerate() {
            assert_eq!(item.index, i);
            assert_eq!(item.inputs.target, item.shard);
            assert!(item.shard.ends_with(&format!("{i:04}")));
        }
    }

    #[test]
    fn test_unsharded_dataset() {
        let mut ctx = sharded_context("ds1", 2);
        ctx.register(crate::context::Dataset::new("ds2", "/data/ds2.ms"))
            .unwrap();
        let d = dispatcher(Arc::new(FakeEngine::new()), 2);
        let plain = CountInputs {
            vis: "ds2".into(),
            target: "/data/ds2.ms".into(),
        };
        assert!(matches!(
            d.generate_jobs(&ctx, &plain),
            Err(DispatchError::NotAShardedDataset { .. })
        ));
        let missing = CountInputs {
            vis: "ds9".into(),
            target: String::new(),
        };
        assert!(matches!(
            d.generate_jobs(&ctx, &missing),
            Err(DispatchError::Context(_))
        ));
    }

    #[test]
    fn test_results_in_shard_order_despite_delays() {
        // later shards finish first
        let engine = FakeEngine::new().on("count", |job| {
            let idx = shard_index(job);
            thread::sleep(Duration::from_millis(10 * (8 - idx)));
            Ok(json!({ "rows": idx }))
        });
        let ctx = sharded_context("ds1", 8);
        let d = dispatcher(Arc::new(engine), 8);
        let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
        let items = d.generate_jobs(&ctx, &inputs()).unwrap();
        let results = d.execute_jobs(&items, &mut exec).unwrap();
        let rows: Vec<u64> = results
            .iter()
            .map(|r| r.as_ref().unwrap()["rows"].as_u64().unwrap())
            .collect();
        assert_eq!(rows, (0..8).collect::<Vec<_>>());
        assert!(exec.durations().contains_key("count"));
        assert_eq!(exec.history().len(), 8);
    }

    #[test]
    fn test_consolidation_ignores_completion_order() {
        let run = |delays: Vec<u64>| {
            let engine = FakeEngine::new().on("count", move |job| {
                let idx = shard_index(job);
                thread::sleep(Duration::from_millis(delays[idx as usize]));
                Ok(json!({ "rows": idx * 2, "field": { "name": "NGC253", "rows": 1 } }))
            });
            let ctx = sharded_context("ds1", 5);
            let d = dispatcher(Arc::new(engine), 5);
            let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
            d.dispatch(&ctx, &inputs(), &mut exec, ShardReturn::from)
                .unwrap()
        };
        let canonical = run(vec![0; 5]);
        assert_eq!(
            canonical,
            Consolidated::Counts(
                json!({"rows": 20, "field": {"name": "NGC253", "rows": 5}})
                    .as_object()
                    .unwrap()
                    .clone()
            )
        );
        for seed in 0..10_u64 {
            let delays = (0..5_u64)
                .map(|i| ((i * 7 + seed * 3) % 5) * 4)
                .collect::<Vec<_>>();
            assert_eq!(run(delays), canonical, "ordering {seed}");
        }
    }

    #[test]
    fn test_panicking_shard_spares_its_node() {
        let engine = FakeEngine::new().on("count", |job| {
            if shard_index(job) == 0 {
                panic!("engine crashed");
            }
            Ok(json!(true))
        });
        let ctx = sharded_context("ds1", 4);
        // shards 0 and 2 share node 0
        let d = dispatcher(Arc::new(engine), 2);
        let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
        for _ in 0..2 {
            match d.dispatch(&ctx, &inputs(), &mut exec, ShardReturn::from).unwrap() {
                Consolidated::Bool { success, failures } => {
                    assert!(!success);
                    assert_eq!(failures.len(), 1);
                    assert!(failures[0].shard.ends_with("0000"));
                    assert!(failures[0].cause.contains("engine crashed"));
                }
                other => panic!("expected Bool, got {other:?}"),
            }
        }
    }

    /// A pool whose node `refuse` takes no jobs.
    struct RefusingPool {
        inner: LocalWorkerPool,
        refuse: Vec<NodeId>,
    }

    impl WorkerPool for RefusingPool {
        fn list_nodes(&self) -> Vec<NodeId> {
            self.inner.list_nodes()
        }

        fn submit(&self, node: NodeId, job: Job) -> Result<JobHandle, DispatchError> {
            if self.refuse.contains(&node) {
                return Err(DispatchError::NodeUnavailable { node });
            }
            self.inner.submit(node, job)
        }
    }

    fn refusing_dispatcher(refuse: Vec<NodeId>) -> ClusterDispatcher {
        let engine = FakeEngine::new().on("count", |job| Ok(json!({ "rows": shard_index(job) })));
        let inner = LocalWorkerPool::new(Arc::new(engine), 2, false).unwrap();
        ClusterDispatcher::new(
            Arc::new(RefusingPool { inner, refuse }),
            DispatchConfigBuilder::default()
                .draw_progress(false)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_refused_submission_fails_only_its_shards() {
        let ctx = sharded_context("ds1", 4);
        let d = refusing_dispatcher(vec![1]);
        let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
        let items = d.generate_jobs(&ctx, &inputs()).unwrap();
        let results = d.execute_jobs(&items, &mut exec).unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap(), &json!({"rows": 0}));
        assert_eq!(results[2].as_ref().unwrap(), &json!({"rows": 2}));
        for idx in [1, 3] {
            let failure = results[idx].as_ref().unwrap_err();
            assert!(failure.shard.ends_with(&format!("{idx:04}")));
            assert!(failure.cause.contains("no longer accepting"), "{}", failure.cause);
        }
        // only submitted jobs are recorded
        assert_eq!(exec.history().len(), 2);
    }

    #[test]
    fn test_every_submission_refused() {
        let ctx = sharded_context("ds1", 3);
        let d = refusing_dispatcher(vec![0, 1]);
        let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
        let items = d.generate_jobs(&ctx, &inputs()).unwrap();
        assert!(matches!(
            d.execute_jobs(&items, &mut exec),
            Err(DispatchError::NodeUnavailable { node: 0 })
        ));
        assert!(exec.history().is_empty());
    }

    #[test]
    fn test_failed_shard_is_isolated() {
        let engine = FakeEngine::new().on("count", |job| {
            if shard_index(job) == 2 {
                Err(EngineError::Failed {
                    command: "count".into(),
                    message: "table is locked".into(),
                })
            } else {
                Ok(json!(true))
            }
        });
        let ctx = sharded_context("ds1", 5);
        let d = dispatcher(Arc::new(engine), 3);
        let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
        let result = d
            .dispatch(&ctx, &inputs(), &mut exec, ShardReturn::from)
            .unwrap();
        match result {
            Consolidated::Bool { success, failures } => {
                assert!(!success);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].shard.ends_with("0002"));
                assert!(failures[0].cause.contains("table is locked"));
            }
            other => panic!("expected Bool, got {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_sums_counts() {
        let engine = FakeEngine::new().on("count", |job| {
            Ok(json!({ "flagged": shard_index(job) + 3, "total": 10 }))
        });
        let ctx = sharded_context("ds1", 3);
        let d = dispatcher(Arc::new(engine), 2);
        let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
        let result = d
            .dispatch(&ctx, &inputs(), &mut exec, ShardReturn::from)
            .unwrap();
        assert_eq!(
            result,
            Consolidated::Counts(
                json!({"flagged": 12, "total": 30})
                    .as_object()
                    .unwrap()
                    .clone()
            )
        );
    }

    #[test]
    fn test_cancelled_dispatch() {
        let engine = FakeEngine::new().on("count", |_| {
            thread::sleep(Duration::from_millis(200));
            Ok(json!(true))
        });
        let ctx = sharded_context("ds1", 2);
        let token = CancelToken::new();
        let d = dispatcher(Arc::new(engine), 2).with_cancel_token(token.clone());
        token.cancel();
        let mut exec = Executor::new(Arc::new(FakeEngine::new()), ExecutorConfig::default());
        assert!(matches!(
            d.dispatch(&ctx, &inputs(), &mut exec, ShardReturn::from),
            Err(DispatchError::Cancelled { .. })
        ));
    }
}
