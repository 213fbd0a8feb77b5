//! Errors from iterative imaging.

use thiserror::Error;

use crate::job::EngineError;

/// Something went wrong within one pass of a clean sequence.
#[derive(Error, Debug)]
pub enum CleanError {
    /// The imaging call failed.
    #[error("{job} failed: {source}")]
    Engine {
        /// the rendered call
        job: String,
        /// what went wrong
        source: EngineError,
    },

    /// An image product couldn't be read or written.
    #[error("image {name}: {reason}")]
    Image {
        /// image name
        name: String,
        /// why
        reason: String,
    },

    /// An image had an unexpected shape.
    #[error("image {name} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        /// image name
        name: String,
        /// (height, width) found
        found: (usize, usize),
        /// (height, width) expected
        expected: (usize, usize),
    },

    /// No statistics can be taken from an image.
    #[error("image {name} has no finite pixels")]
    NoFinitePixels {
        /// image name
        name: String,
    },
}

/// A clean sequence stopped part-way. The products of earlier passes are left as they are.
#[derive(Error, Debug)]
#[error("clean of {imagename} failed at iteration {iteration}: {cause}")]
pub struct IterationFatalError {
    /// Base name of the images.
    pub imagename: String,
    /// The pass which failed.
    pub iteration: usize,
    /// What went wrong.
    #[source]
    pub cause: CleanError,
}
