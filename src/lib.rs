#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! casapipe is a library for sequencing radio interferometry data reduction tasks into
//! pipelines. It describes a unit of work ([`Inputs`]), runs it against an external numeric
//! engine ([`Task`], [`Job`], [`Executor`]), and folds the effects of each task into a shared
//! [`Context`] through its [`Results`].
//!
//! Tasks whose data is split into sub-datasets can fan out across a pool of engine workers with
//! the [`ClusterDispatcher`], and imaging tasks drive an [`IterationSequence`] which re-images
//! until a heuristic decides the residuals have converged.
//!
//! # Examples
//!
//! Here's an example of splitting the target fields out of a dataset and replacing it in the
//! context.
//!
//! ```rust
//! use casapipe::{
//!     job::EngineError, tasks::split::{SplitInputsBuilder, SplitTask}, Context, Dataset, Engine,
//!     Executor, ExecutorConfig, Field, Job, Results, Task, Value,
//! };
//! use std::sync::Arc;
//! use tempfile::tempdir;
//!
//! // an engine which creates the requested output dataset on disk
//! struct Mkdir;
//! impl Engine for Mkdir {
//!     fn call(&self, job: &Job) -> Result<Value, EngineError> {
//!         if let Some(Value::String(out)) = job.args.get("outputvis") {
//!             std::fs::create_dir_all(out).unwrap();
//!         }
//!         Ok(Value::Null)
//!     }
//! }
//!
//! let tmp_dir = tempdir().unwrap();
//! let mut context = Context::new(tmp_dir.path());
//! context
//!     .register(
//!         Dataset::new("ds1", tmp_dir.path().join("ds1"))
//!             .with_fields(vec![Field::new("NGC253", &["TARGET"])]),
//!     )
//!     .unwrap();
//!
//! let mut executor = Executor::new(Arc::new(Mkdir), ExecutorConfig::default());
//!
//! let inputs = SplitInputsBuilder::default()
//!     .vis("ds1")
//!     .replace(true)
//!     .build(&context)
//!     .unwrap();
//! let task = SplitTask::new(inputs);
//! let mut results = task.execute(&context, &mut executor).unwrap();
//! results.merge_with_context(&mut context).unwrap();
//!
//! assert!(context.get_dataset("ds1").is_err());
//! assert!(context.get_dataset("ds1_split").is_ok());
//! ```

pub mod clean;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod inputs;
pub mod job;
pub mod pipeline;
pub mod task;
pub mod tasks;

cfg_if::cfg_if! {
    if #[cfg(feature = "cli")] {
        pub mod cli;
    }
}

#[cfg(test)]
pub(crate) mod test_common;

pub use clean::{
    CleanConfig, CleanConfigBuilder, ImageStore, IterationSequence, IterationStats, Mask,
    MaskThresholdHeuristic, SequenceState, StopPredicate, StopReason,
};
pub use context::{
    CalApplication, CalLibrary, Context, ContextError, Dataset, Field, ImageRecord,
    ImagingTarget, Spw,
};
pub use dispatch::{
    consolidate, CancelToken, ClusterDispatcher, Consolidated, DispatchConfig,
    DispatchConfigBuilder, DispatchError, LocalWorkerPool, ShardFailure, ShardReturn,
    ShardableInputs, WaitPolicy, WorkItem, WorkerPool,
};
pub use engine::CommandEngine;
pub use error::PipelineError;
pub use inputs::{EngineArgs, Inputs};
pub use job::{Engine, Executor, ExecutorConfig, ExecutorConfigBuilder, Job};
pub use pipeline::{FnStage, Pipeline, PipelineReport, Stage, StageFactory, StageSummary};
pub use serde_json::{Map, Value};
pub use task::{OutputNotProduced, Results, ResultsHeader, StageOutcome, Task};

/// Time the evaluation of the enclosed statements, adding the elapsed time to the entry `$name`
/// of the `HashMap<String, Duration>` given by `$durs`. Evaluates to the value of the last
/// statement.
#[macro_export]
macro_rules! with_increment_duration {
    ($durs:expr, $name:expr, $($s:stmt);+ $(;)?) => {
        {
            let _now = std::time::Instant::now();
            let _res = {
                $(
                    $s
                )*
            };
            *$durs
                .entry($name.into())
                .or_insert(std::time::Duration::default()) += _now.elapsed();
            _res
        }
    };
}
