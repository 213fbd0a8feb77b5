//! Engine calls and the executor which runs them on the driver.

use std::{
    any::Any,
    collections::HashMap,
    fmt::{Display, Formatter},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use derive_builder::Builder;
use itertools::Itertools;
use log::{debug, error, info};
use serde_json::Value;
use thiserror::Error;

use crate::{error::PipelineError, inputs::EngineArgs, with_increment_duration};

/// Errors reported by an [`Engine`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine ran the command and reported a failure.
    #[error("{command} failed: {message}")]
    Failed {
        /// engine command
        command: String,
        /// the engine's explanation
        message: String,
    },
    /// The engine process could not be started.
    #[error("could not start {program}: {source}")]
    Spawn {
        /// program that was run
        program: String,
        /// underlying error
        source: std::io::Error,
    },
    /// The engine process exited unsuccessfully.
    #[error("{command} exited with {status}: {stderr}")]
    NonZeroExit {
        /// engine command
        command: String,
        /// exit status as reported by the os
        status: String,
        /// captured standard error
        stderr: String,
    },
    /// The engine's result could not be decoded.
    #[error("{command} returned output which is not JSON: {source}")]
    BadOutput {
        /// engine command
        command: String,
        /// decode error
        source: serde_json::Error,
    },
    /// The engine panicked while running the command.
    #[error("{command} panicked: {message}")]
    Panicked {
        /// engine command
        command: String,
        /// the panic payload, if it was a string
        message: String,
    },
    /// The worker running the call went away before replying.
    #[error("worker {node} stopped before {command} completed")]
    WorkerLost {
        /// engine command
        command: String,
        /// the worker node
        node: usize,
    },
}

/// A single call into the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Name of the engine command.
    pub command: String,
    /// Keyword arguments.
    pub args: EngineArgs,
}

impl Job {
    /// Create a job for `command` with `args`.
    pub fn new(command: impl Into<String>, args: EngineArgs) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

fn render_arg(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({})",
            self.command,
            self.args
                .iter()
                .map(|(k, v)| format!("{k}={}", render_arg(v)))
                .join(", ")
        )
    }
}

/// Something that can run engine commands.
///
/// Implementations must be callable from several worker threads at once.
pub trait Engine: Send + Sync {
    /// Run `job`, returning the engine's result.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] if the command could not be run or reported failure.
    fn call(&self, job: &Job) -> Result<Value, EngineError>;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".into())
}

/// Run `job` once. A dry run logs the call and returns `null` without touching the engine. A
/// panic in the engine becomes [`EngineError::Panicked`] for this job only.
pub(crate) fn call_engine(
    engine: &dyn Engine,
    job: &Job,
    dry_run: bool,
) -> Result<Value, EngineError> {
    if dry_run {
        info!("dry run: {}", job);
        return Ok(Value::Null);
    }
    debug!("calling {}", job);
    panic::catch_unwind(AssertUnwindSafe(|| engine.call(job))).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!("{} panicked: {}", job.command, message);
        Err(EngineError::Panicked {
            command: job.command.clone(),
            message,
        })
    })
}

/// [`call_engine`], timed.
pub(crate) fn run_timed(
    engine: &dyn Engine,
    job: &Job,
    dry_run: bool,
) -> (Result<Value, EngineError>, Duration) {
    let now = Instant::now();
    let result = call_engine(engine, job, dry_run);
    (result, now.elapsed())
}

/// Options for an [`Executor`]
#[derive(Builder, Debug, Clone)]
pub struct ExecutorConfig {
    /// Log calls without running them.
    #[builder(default = "false")]
    pub dry_run: bool,
    /// Keep a history of every call made, in call order.
    #[builder(default = "true")]
    pub record_history: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            record_history: true,
        }
    }
}

impl Display for ExecutorConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} run engine calls.",
            if self.dry_run { "Will not" } else { "Will" }
        )?;
        writeln!(
            f,
            "{} keep a history of engine calls.",
            if self.record_history { "Will" } else { "Will not" }
        )?;
        Ok(())
    }
}

/// Runs jobs on the driver and keeps the accounting for every call made during a pipeline run,
/// including calls that sharded stages ran on workers.
pub struct Executor {
    engine: Arc<dyn Engine>,
    config: ExecutorConfig,
    durations: HashMap<String, Duration>,
    history: Vec<String>,
}

impl Executor {
    /// Create an executor calling `engine`.
    pub fn new(engine: Arc<dyn Engine>, config: ExecutorConfig) -> Self {
        Self {
            engine,
            config,
            durations: HashMap::new(),
            history: Vec::new(),
        }
    }

    /// The engine this executor calls.
    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.engine)
    }

    /// Whether calls are only being logged.
    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Run `job`, keeping the engine's own error.
    ///
    /// # Errors
    ///
    /// Returns the [`EngineError`] from the engine.
    pub fn call(&mut self, job: &Job) -> Result<Value, EngineError> {
        self.record_call(job);
        let dry_run = self.config.dry_run;
        with_increment_duration!(
            self.durations,
            job.command.as_str(),
            call_engine(self.engine.as_ref(), job, dry_run)
        )
    }

    /// Run `job` on behalf of a task.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::EngineInvocation`] naming the job if the engine fails.
    pub fn execute(&mut self, job: &Job) -> Result<Value, PipelineError> {
        self.call(job)
            .map_err(|source| PipelineError::EngineInvocation {
                job: job.to_string(),
                source,
            })
    }

    /// Note a job that is about to run elsewhere.
    pub fn record_call(&mut self, job: &Job) {
        if self.config.record_history {
            self.history.push(job.to_string());
        }
    }

    /// Add time spent running `command` on a worker.
    pub fn record(&mut self, command: &str, elapsed: Duration) {
        *self
            .durations
            .entry(command.to_string())
            .or_insert(Duration::default()) += elapsed;
    }

    /// Total time spent in each engine command.
    pub fn durations(&self) -> &HashMap<String, Duration> {
        &self.durations
    }

    /// Every call made so far, rendered.
    pub fn history(&self) -> &[String] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{inputs::engine_args, test_common::FakeEngine};
    use serde_json::json;

    #[test]
    fn test_job_display() {
        let job = Job::new(
            "mstransform",
            engine_args([
                ("vis", json!("ds1.ms")),
                ("spw", json!("0,1")),
                ("keepflags", json!(false)),
                ("width", json!([2, 4])),
            ]),
        );
        assert_eq!(
            job.to_string(),
            "mstransform(vis='ds1.ms', spw='0,1', keepflags=false, width=[2,4])"
        );
    }

    #[test]
    fn test_execute_records_durations_and_history() {
        let engine = FakeEngine::new().on("listobs", |_| Ok(json!({"nrows": 12})));
        let mut exec = Executor::new(Arc::new(engine), ExecutorConfig::default());

        let job = Job::new("listobs", engine_args([("vis", json!("ds1.ms"))]));
        assert_eq!(exec.execute(&job).unwrap(), json!({"nrows": 12}));
        assert_eq!(exec.execute(&job).unwrap(), json!({"nrows": 12}));

        assert!(exec.durations().contains_key("listobs"));
        assert_eq!(exec.history().len(), 2);
        assert_eq!(exec.history()[0], "listobs(vis='ds1.ms')");
    }

    #[test]
    fn test_execute_wraps_engine_failure() {
        let engine = FakeEngine::new().on("gaincal", |job| {
            Err(EngineError::Failed {
                command: job.command.clone(),
                message: "no unflagged data".into(),
            })
        });
        let mut exec = Executor::new(Arc::new(engine), ExecutorConfig::default());
        let job = Job::new("gaincal", engine_args([("vis", json!("ds1.ms"))]));

        match exec.execute(&job) {
            Err(PipelineError::EngineInvocation { job, .. }) => {
                assert_eq!(job, "gaincal(vis='ds1.ms')")
            }
            other => panic!("expected EngineInvocation, got {other:?}"),
        }
    }

    #[test]
    fn test_dry_run_skips_engine() {
        let engine = Arc::new(FakeEngine::new());
        let config = ExecutorConfigBuilder::default()
            .dry_run(true)
            .build()
            .unwrap();
        let mut exec = Executor::new(engine.clone(), config);
        let job = Job::new("flagdata", engine_args([("mode", json!("summary"))]));

        assert_eq!(exec.execute(&job).unwrap(), Value::Null);
        assert!(engine.calls().is_empty());
        assert_eq!(exec.history().len(), 1);
    }

    #[test]
    fn test_run_timed_dry_run() {
        let engine = FakeEngine::new();
        let job = Job::new("tclean", EngineArgs::new());
        let (result, _) = run_timed(&engine, &job, true);
        assert_eq!(result.unwrap(), Value::Null);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_engine_panic_becomes_error() {
        let engine = FakeEngine::new()
            .on("tclean", |_| panic!("major cycle blew up"))
            .on("listobs", |_| Ok(json!({"nrows": 3})));
        let mut exec = Executor::new(Arc::new(engine), ExecutorConfig::default());

        match exec.call(&Job::new("tclean", EngineArgs::new())) {
            Err(EngineError::Panicked { command, message }) => {
                assert_eq!(command, "tclean");
                assert_eq!(message, "major cycle blew up");
            }
            other => panic!("expected Panicked, got {other:?}"),
        }
        // the executor is still usable
        assert_eq!(
            exec.call(&Job::new("listobs", EngineArgs::new())).unwrap(),
            json!({"nrows": 3})
        );
        assert_eq!(exec.history().to_vec(), vec!["tclean()", "listobs()"]);
        assert!(exec.durations().contains_key("tclean"));
    }
}
