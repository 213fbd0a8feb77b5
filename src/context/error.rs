//! Errors from the context registry.

use thiserror::Error;

/// Registry operations on a [`super::Context`] that could not be completed.
#[derive(Error, Debug)]
pub enum ContextError {
    /// The name is already taken.
    #[error("{kind} {name} is already registered")]
    DuplicateRegistration {
        /// what sort of entry, e.g. `"dataset"`
        kind: &'static str,
        /// the name that clashed
        name: String,
    },

    /// Nothing is registered under the name.
    #[error("no {kind} named {name} is registered")]
    NotFound {
        /// what sort of entry, e.g. `"dataset"`
        kind: &'static str,
        /// the name that was looked up
        name: String,
    },

    /// Sub-datasets could not be listed.
    #[error("could not list sub-datasets of {path}: {message}")]
    Discovery {
        /// the dataset path
        path: String,
        /// glob error
        message: String,
    },

    /// A context snapshot could not be written or read.
    #[error("context snapshot {path}: {message}")]
    Snapshot {
        /// snapshot path
        path: String,
        /// underlying error
        message: String,
    },
}
