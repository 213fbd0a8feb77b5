//! Running a list of stages against one context, in order.

use std::{
    fmt::{Display, Formatter},
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    context::Context,
    error::PipelineError,
    job::Executor,
    task::{Results, StageOutcome, Task},
};

/// A task with its types erased, so that stages of different kinds can share a pipeline.
pub trait Stage {
    /// Name of the task run by this stage.
    fn task_name(&self) -> &str;

    /// Execute the task and merge its results into `ctx`.
    ///
    /// # Errors
    ///
    /// Returns whatever the task or the merge returned.
    fn run_stage(
        &self,
        ctx: &mut Context,
        executor: &mut Executor,
    ) -> Result<StageOutcome, PipelineError>;
}

impl<T: Task> Stage for T {
    fn task_name(&self) -> &str {
        self.name()
    }

    fn run_stage(
        &self,
        ctx: &mut Context,
        executor: &mut Executor,
    ) -> Result<StageOutcome, PipelineError> {
        let mut results = self.execute(ctx, executor)?;
        for warning in &results.header().warnings {
            warn!("{}: {}", self.name(), warning);
        }
        results.merge_with_context(ctx)?;
        Ok(results.outcome())
    }
}

/// Makes a [`Stage`] once the stages before it have run, so its inputs see their effects.
pub trait StageFactory {
    /// Name of the task the stage will run.
    fn task_name(&self) -> &str;

    /// Resolve the stage's inputs against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidInputs`] if the inputs can't be resolved.
    fn build(&self, ctx: &Context) -> Result<Box<dyn Stage>, PipelineError>;
}

/// A [`StageFactory`] from a closure.
pub struct FnStage<F> {
    name: String,
    build: F,
}

impl<F> FnStage<F>
where
    F: Fn(&Context) -> Result<Box<dyn Stage>, PipelineError>,
{
    /// A factory for stages of task `name`, made by `build`.
    pub fn new(name: impl Into<String>, build: F) -> Self {
        Self {
            name: name.into(),
            build,
        }
    }
}

impl<F> StageFactory for FnStage<F>
where
    F: Fn(&Context) -> Result<Box<dyn Stage>, PipelineError>,
{
    fn task_name(&self) -> &str {
        &self.name
    }

    fn build(&self, ctx: &Context) -> Result<Box<dyn Stage>, PipelineError> {
        (self.build)(ctx)
    }
}

/// How one stage of a run went.
#[derive(Debug, Clone)]
pub struct StageSummary {
    /// Stage number.
    pub stage: usize,
    /// Task the stage ran.
    pub task: String,
    /// What came of it.
    pub outcome: StageOutcome,
    /// Wall time, including input resolution and the merge.
    pub duration: Duration,
}

/// Everything a [`Pipeline::run`] did.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Summaries of the stages which were attempted, in order.
    pub stages: Vec<StageSummary>,
    /// The error which stopped the run early, if any.
    pub aborted: Option<PipelineError>,
}

impl PipelineReport {
    /// Stages which failed.
    pub fn failed(&self) -> impl Iterator<Item = &StageSummary> {
        self.stages
            .iter()
            .filter(|s| matches!(s.outcome, StageOutcome::Failed(_)))
    }

    /// Whether every stage ran and none failed.
    pub fn is_success(&self) -> bool {
        self.aborted.is_none() && self.failed().next().is_none()
    }
}

impl Display for PipelineReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for summary in &self.stages {
            writeln!(
                f,
                "stage {:>2} {:<10} {:>10.3?} {}",
                summary.stage, summary.task, summary.duration, summary.outcome
            )?;
        }
        if let Some(aborted) = &self.aborted {
            writeln!(f, "aborted: {aborted}")?;
        }
        Ok(())
    }
}

/// An ordered list of stages.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn StageFactory>>,
}

impl Pipeline {
    /// A pipeline with no stages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn push(&mut self, stage: Box<dyn StageFactory>) {
        self.stages.push(stage);
    }

    /// Append a stage, builder style.
    pub fn with_stage(mut self, stage: impl StageFactory + 'static) -> Self {
        self.push(Box::new(stage));
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether there are no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Task names, in the order they will run.
    pub fn task_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.task_name()).collect()
    }

    /// Run every stage in order against `ctx`.
    ///
    /// A stage which fails leaves the context as it was and the run carries on. An error which
    /// leaves the context in doubt (see [`PipelineError::is_fatal`]) stops the run.
    pub fn run(&self, ctx: &mut Context, executor: &mut Executor) -> PipelineReport {
        let mut report = PipelineReport::default();
        for factory in &self.stages {
            let stage = ctx.next_stage();
            let task = factory.task_name().to_string();
            info!("stage {} ({}) starting", stage, task);
            let start = Instant::now();
            let result = factory
                .build(ctx)
                .and_then(|runner| runner.run_stage(ctx, executor));
            let duration = start.elapsed();
            let (outcome, fatal) = match result {
                Ok(outcome) => (outcome, None),
                Err(e) if e.is_fatal() => {
                    error!("stage {} ({}) failed fatally: {}", stage, task, e);
                    (StageOutcome::Failed(e.to_string()), Some(e))
                }
                Err(e) => {
                    error!("stage {} ({}) failed: {}", stage, task, e);
                    (StageOutcome::Failed(e.to_string()), None)
                }
            };
            info!("stage {} ({}) {} in {:?}", stage, task, outcome, duration);
            report.stages.push(StageSummary {
                stage,
                task,
                outcome,
                duration,
            });
            if let Some(e) = fatal {
                report.aborted = Some(e);
                break;
            }
        }
        report
    }
}
