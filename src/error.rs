//! Errors that can occur while running a pipeline.

use thiserror::Error;

use crate::{
    clean::IterationFatalError, context::ContextError, dispatch::DispatchError, job::EngineError,
};

/// Errors raised while interpreting the command line.
#[derive(Error, Debug)]
pub enum CLIError {
    #[error("Invalid Command Line Argument {option}: expected {expected}, received {received}")]
    /// An argument was given a value of the wrong form.
    InvalidCommandLineArgument {
        /// The name of the option
        option: String,
        /// what the option expects
        expected: String,
        /// what was given
        received: String,
    },
}

/// An error from any part of a pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A single engine call failed.
    #[error("engine call {job} failed: {source}")]
    EngineInvocation {
        /// the rendered call, e.g. `mstransform(vis='ds1.ms')`
        job: String,
        /// what went wrong in the engine
        source: EngineError,
    },

    /// Inputs could not be resolved against the context.
    #[error("invalid inputs for {task}: {reason}")]
    InvalidInputs {
        /// the task whose inputs were being built
        task: String,
        /// why resolution failed
        reason: String,
    },

    #[error(transparent)]
    /// A registry operation on the [`crate::Context`] failed.
    Context(#[from] ContextError),

    #[error(transparent)]
    /// Sharded dispatch could not complete.
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    /// A clean sequence aborted part-way through.
    Iteration(#[from] IterationFatalError),

    /// The same results were merged into the context twice.
    #[error("results of {task} (stage {stage}) have already been merged into the context")]
    AlreadyMerged {
        /// the task that produced the results
        task: String,
        /// the stage number the results belong to
        stage: usize,
    },

    /// A recipe file could not be read or understood.
    #[error("could not read recipe {path}: {message}")]
    Config {
        /// path to the recipe
        path: String,
        /// parser or filesystem message
        message: String,
    },

    #[error(transparent)]
    /// Filesystem errors.
    Io(#[from] std::io::Error),

    #[error(transparent)]
    /// Error derived from [`CLIError`]
    CLIError(#[from] CLIError),

    #[cfg(feature = "cli")]
    #[error(transparent)]
    /// Error derived from [`clap::Error`]
    ClapError(#[from] clap::Error),

    #[error("Dry run")]
    /// The command line asked for a summary only.
    DryRun {},
}

impl PipelineError {
    /// Whether this error must stop the whole pipeline rather than just the current stage.
    ///
    /// Failed merges leave the context in a state later stages can not trust, and a clean
    /// sequence that fails part-way leaves half-written image products behind.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Context(_) | Self::Iteration(_) | Self::AlreadyMerged { .. }
        )
    }

    pub(crate) fn invalid_inputs(task: &str, reason: impl ToString) -> Self {
        Self::InvalidInputs {
            task: task.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::Context(ContextError::NotFound {
            kind: "dataset",
            name: "ds1".into()
        })
        .is_fatal());
        assert!(PipelineError::AlreadyMerged {
            task: "split".into(),
            stage: 1
        }
        .is_fatal());
        assert!(!PipelineError::invalid_inputs("split", "no vis").is_fatal());
        assert!(!PipelineError::Dispatch(DispatchError::NoNodes).is_fatal());
    }

    #[test]
    fn test_invalid_inputs_message() {
        let err = PipelineError::invalid_inputs("gaincal", "no fields with intent PHASE");
        assert_eq!(
            err.to_string(),
            "invalid inputs for gaincal: no fields with intent PHASE"
        );
    }
}
