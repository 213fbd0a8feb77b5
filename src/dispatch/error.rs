//! Errors from sharded dispatch.

use std::time::Duration;

use thiserror::Error;

use crate::context::ContextError;

/// Why a sharded dispatch could not produce a consolidated result.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// The dataset has no sub-datasets to fan out over.
    #[error("{name} is not a sharded dataset")]
    NotAShardedDataset {
        /// dataset name
        name: String,
    },

    #[error(transparent)]
    /// The dataset could not be looked up.
    Context(#[from] ContextError),

    /// The pool has nowhere to run jobs.
    #[error("the worker pool has no nodes")]
    NoNodes,

    /// A worker thread could not be started.
    #[error("could not start worker {node}: {source}")]
    Spawn {
        /// node index
        node: usize,
        /// os error
        source: std::io::Error,
    },

    /// A node stopped accepting jobs.
    #[error("worker {node} is no longer accepting jobs")]
    NodeUnavailable {
        /// node index
        node: usize,
    },

    /// The wait policy's timeout expired.
    #[error("timed out after {elapsed:?} with {completed} of {total} shard jobs complete")]
    Timeout {
        /// jobs finished before the timeout
        completed: usize,
        /// jobs submitted
        total: usize,
        /// time spent waiting
        elapsed: Duration,
    },

    /// The wait was cancelled.
    #[error("cancelled with {completed} of {total} shard jobs complete")]
    Cancelled {
        /// jobs finished before cancellation
        completed: usize,
        /// jobs submitted
        total: usize,
    },

    /// Results and shards don't line up.
    #[error("got {results} shard results for {shards} shards")]
    ShardCountMismatch {
        /// number of results
        results: usize,
        /// number of shards
        shards: usize,
    },

    /// Mapping results could not be summed.
    #[error("can not sum shard results at {key}: {found}")]
    UnsupportedShape {
        /// dotted path to the offending key
        key: String,
        /// what was found there
        found: String,
    },
}
