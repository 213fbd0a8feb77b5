//! The task contract: prepare work against a read-only context, analyse it, and hand back
//! results that know how to fold themselves into the context.

use std::{
    fmt::{Debug, Display, Formatter},
    path::PathBuf,
};

use log::{debug, error};

use crate::{context::Context, error::PipelineError, inputs::Inputs, job::Executor};

/// A product a task was expected to write but didn't.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNotProduced {
    /// Where the product should have been.
    pub expected_path: PathBuf,
}

impl Display for OutputNotProduced {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "expected output {} was not produced", self.expected_path.display())
    }
}

/// Bookkeeping shared by every kind of results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultsHeader {
    /// Name of the task that produced the results.
    pub task: String,
    /// Stage number the task ran as.
    pub stage: usize,
    /// Set when an expected product is missing. Such results merge as a no-op.
    pub missing_output: Option<OutputNotProduced>,
    /// Problems which didn't stop the task.
    pub warnings: Vec<String>,
    merged: bool,
}

impl ResultsHeader {
    /// A fresh header for `task` running as `stage`.
    pub fn new(task: impl Into<String>, stage: usize) -> Self {
        Self {
            task: task.into(),
            stage,
            ..Default::default()
        }
    }

    /// Whether these results have been merged.
    pub fn is_merged(&self) -> bool {
        self.merged
    }
}

/// How a stage went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Everything worked.
    Succeeded,
    /// The stage ran but with warnings or missing products.
    Partial(String),
    /// The stage failed; the pipeline carried on without its effects.
    Failed(String),
}

impl Display for StageOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Partial(why) => write!(f, "partial: {why}"),
            Self::Failed(why) => write!(f, "failed: {why}"),
        }
    }
}

/// The outcome of a task, not yet reflected in the context.
pub trait Results: Debug {
    /// Shared bookkeeping.
    fn header(&self) -> &ResultsHeader;

    /// Shared bookkeeping, mutably.
    fn header_mut(&mut self) -> &mut ResultsHeader;

    /// Apply this task's effects to `ctx`. Only ever called through
    /// [`Results::merge_with_context`], at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the context refuses a registration.
    fn apply_to_context(&mut self, ctx: &mut Context) -> Result<(), PipelineError>;

    /// Fold these results into `ctx`. Results with a missing product are logged and merge as a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::AlreadyMerged`] on a second merge, or whatever
    /// [`Results::apply_to_context`] returns.
    fn merge_with_context(&mut self, ctx: &mut Context) -> Result<(), PipelineError> {
        let header = self.header();
        if header.merged {
            return Err(PipelineError::AlreadyMerged {
                task: header.task.clone(),
                stage: header.stage,
            });
        }
        if let Some(missing) = &header.missing_output {
            error!(
                "stage {} ({}): {}, not merging",
                header.stage, header.task, missing
            );
            self.header_mut().merged = true;
            return Ok(());
        }
        debug!("merging stage {} ({})", header.stage, header.task);
        self.apply_to_context(ctx)?;
        self.header_mut().merged = true;
        Ok(())
    }

    /// A summary of how the task went.
    fn outcome(&self) -> StageOutcome {
        let header = self.header();
        if let Some(missing) = &header.missing_output {
            StageOutcome::Partial(missing.to_string())
        } else if !header.warnings.is_empty() {
            StageOutcome::Partial(header.warnings.join("; "))
        } else {
            StageOutcome::Succeeded
        }
    }
}

/// A unit of pipeline work.
pub trait Task {
    /// What the task needs.
    type Inputs: Inputs;
    /// What the task produces.
    type Results: Results;

    /// Short name used in logs and summaries.
    fn name(&self) -> &str;

    /// The fully resolved inputs.
    fn inputs(&self) -> &Self::Inputs;

    /// Do the work. The context is only read here; all changes wait for the merge.
    ///
    /// # Errors
    ///
    /// Returns an error if an engine call or dispatch fails.
    fn prepare(&self, ctx: &Context, executor: &mut Executor)
        -> Result<Self::Results, PipelineError>;

    /// Inspect what `prepare` produced, e.g. checking for missing products.
    ///
    /// # Errors
    ///
    /// Returns an error if the results can't be interpreted.
    fn analyse(&self, results: Self::Results) -> Result<Self::Results, PipelineError> {
        Ok(results)
    }

    /// [`Task::prepare`] followed by [`Task::analyse`].
    ///
    /// # Errors
    ///
    /// Returns the first error from either step.
    fn execute(
        &self,
        ctx: &Context,
        executor: &mut Executor,
    ) -> Result<Self::Results, PipelineError> {
        let results = self.prepare(ctx, executor)?;
        self.analyse(results)
    }
}
