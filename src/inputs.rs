//! Task inputs and their conversion into engine calls.

use std::{fmt::Debug, path::Path};

use indexmap::IndexMap;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::{context::Context, error::PipelineError, job::Job};

/// Keyword arguments for an engine command, in the order they were resolved.
pub type EngineArgs = IndexMap<String, Value>;

lazy_static! {
    static ref RE_DATASET_SUFFIX: Regex =
        Regex::new(r"^(?P<stem>.*?)(?P<ext>\.m?ms)?$").unwrap();
}

/// A complete description of one unit of work, with every parameter resolved.
///
/// Implementors are built through a `*InputsBuilder` whose `build` method takes the
/// [`Context`] so that unspecified parameters can be defaulted from the registered datasets.
pub trait Inputs: Debug {
    /// The engine command these inputs drive.
    fn command(&self) -> &str;

    /// Every resolved parameter, including pipeline bookkeeping the engine doesn't accept.
    fn fields(&self) -> EngineArgs;

    /// Keys of [`Inputs::fields`] that are pipeline bookkeeping.
    fn pipeline_only_keys(&self) -> &'static [&'static str] {
        &[]
    }

    /// Where any products of the task are written.
    fn output_dir(&self) -> &Path;

    /// The arguments to pass to the engine. Never contains a pipeline-only key.
    fn to_engine_args(&self) -> EngineArgs {
        strip_keys(self.fields(), self.pipeline_only_keys())
    }

    /// The engine call described by these inputs.
    fn to_job(&self) -> Job {
        Job::new(self.command(), self.to_engine_args())
    }
}

/// Remove `keys` from `args`, keeping the order of everything else.
pub fn strip_keys(mut args: EngineArgs, keys: &[&str]) -> EngineArgs {
    for key in keys {
        args.shift_remove(*key);
    }
    args
}

/// Collect `(key, value)` pairs into [`EngineArgs`].
pub fn engine_args<I, K>(pairs: I) -> EngineArgs
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// The name of a derived dataset, e.g. `ds1.ms` with suffix `split` becomes `ds1_split.ms`.
pub fn derived_name(name: &str, suffix: &str) -> String {
    match RE_DATASET_SUFFIX.captures(name) {
        Some(caps) => format!(
            "{}_{}{}",
            &caps["stem"],
            suffix,
            caps.name("ext").map_or("", |m| m.as_str())
        ),
        None => format!("{name}_{suffix}"),
    }
}

/// Split a comma separated selection like `"0,2, 3"` into its parts.
pub fn selection_items(selection: &str) -> Vec<&str> {
    selection
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Resolve the dataset a single-dataset task operates on. An explicit name must be registered;
/// without one, the context must hold exactly one dataset.
///
/// # Errors
///
/// Returns [`PipelineError::InvalidInputs`] if the name is unknown or no default can be chosen.
pub fn resolve_vis(task: &str, ctx: &Context, vis: Option<&String>) -> Result<String, PipelineError> {
    match vis {
        Some(vis) => ctx
            .get_dataset(vis)
            .map(|ds| ds.name.clone())
            .map_err(|e| PipelineError::invalid_inputs(task, e)),
        None => {
            let names = ctx.dataset_names();
            match names.as_slice() {
                [only] => Ok(only.to_string()),
                [] => Err(PipelineError::invalid_inputs(
                    task,
                    "no datasets are registered",
                )),
                _ => Err(PipelineError::invalid_inputs(
                    task,
                    format!(
                        "vis must be given when several datasets are registered ({})",
                        names.iter().join(", ")
                    ),
                )),
            }
        }
    }
}
