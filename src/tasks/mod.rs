//! Concrete pipeline tasks.
//!
//! Each task comes as an inputs type built against the [`crate::Context`], a [`crate::Task`]
//! that runs it, and results which fold its effects back into the context.

pub mod flagdata;
pub mod gaincal;
pub mod split;
pub mod tclean;

use std::path::Path;

use crate::task::OutputNotProduced;

/// `Some` if `path` doesn't exist.
pub(crate) fn check_output(path: &Path) -> Option<OutputNotProduced> {
    if path.exists() {
        None
    } else {
        Some(OutputNotProduced {
            expected_path: path.to_path_buf(),
        })
    }
}
