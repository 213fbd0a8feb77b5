//! Flag, or summarise the flags of, a dataset. Sharded datasets are handled one sub-dataset per
//! worker through the [`ClusterDispatcher`].

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use log::{info, warn};
use serde_json::{json, Value};

use crate::{
    context::Context,
    dispatch::{consolidate, ClusterDispatcher, Consolidated, ShardReturn, ShardableInputs},
    error::PipelineError,
    inputs::{engine_args, resolve_vis, EngineArgs, Inputs},
    job::Executor,
    task::{Results, ResultsHeader, Task},
};

const TASK: &str = "flagdata";

/// Flagging modes the engine understands.
pub const FLAG_MODES: &[&str] = &[
    "summary", "manual", "clip", "quack", "shadow", "elevation", "tfcrop", "rflag", "extend",
    "unflag",
];

/// Inputs of a [`FlagdataTask`], built with [`FlagdataInputsBuilder::build`].
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(skip))]
pub struct FlagdataInputs {
    /// Registered name of the dataset. Defaults to the only registered dataset.
    #[builder(setter(into))]
    pub vis: String,

    /// The dataset, or one of its sub-datasets, the engine works on.
    #[builder(setter(skip))]
    pub target: String,

    /// One of [`FLAG_MODES`]. Defaults to `summary`.
    #[builder(setter(into))]
    pub mode: String,

    /// Field selection, empty for all.
    #[builder(setter(into))]
    pub field: String,

    /// Spectral window selection, empty for all.
    #[builder(setter(into))]
    pub spw: String,

    /// Whether to flag auto-correlations.
    pub autocorr: bool,

    /// Where any flag backups go. Defaults to the context's output directory.
    #[builder(setter(into))]
    pub output_dir: PathBuf,
}

impl FlagdataInputsBuilder {
    /// Resolve every parameter not given explicitly against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidInputs`] if `vis` can't be resolved or the mode is
    /// unknown.
    pub fn build(&self, ctx: &Context) -> Result<FlagdataInputs, PipelineError> {
        let vis = resolve_vis(TASK, ctx, self.vis.as_ref())?;
        let dataset = ctx
            .get_dataset(&vis)
            .map_err(|e| PipelineError::invalid_inputs(TASK, e))?;
        let mode = self.mode.clone().unwrap_or_else(|| "summary".into());
        if !FLAG_MODES.contains(&mode.as_str()) {
            return Err(PipelineError::invalid_inputs(
                TASK,
                format!("unknown mode {mode}, expected one of {}", FLAG_MODES.join(", ")),
            ));
        }
        Ok(FlagdataInputs {
            target: dataset.path.display().to_string(),
            vis,
            mode,
            field: self.field.clone().unwrap_or_default(),
            spw: self.spw.clone().unwrap_or_default(),
            autocorr: self.autocorr.unwrap_or(false),
            output_dir: self
                .output_dir
                .clone()
                .unwrap_or_else(|| ctx.output_dir().to_path_buf()),
        })
    }
}

impl FlagdataInputs {
    /// Whether the engine reports flag counts rather than flagging.
    pub fn is_summary(&self) -> bool {
        self.mode == "summary"
    }
}

impl Inputs for FlagdataInputs {
    fn command(&self) -> &str {
        "flagdata"
    }

    fn fields(&self) -> EngineArgs {
        engine_args([
            ("vis", json!(self.target)),
            ("mode", json!(self.mode)),
            ("field", json!(self.field)),
            ("spw", json!(self.spw)),
            ("autocorr", json!(self.autocorr)),
            ("flagbackup", json!(!self.is_summary())),
            ("output_dir", json!(self.output_dir.display().to_string())),
        ])
    }

    fn pipeline_only_keys(&self) -> &'static [&'static str] {
        &["output_dir"]
    }

    fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

impl ShardableInputs for FlagdataInputs {
    fn dataset_name(&self) -> &str {
        &self.vis
    }

    fn for_shard(&self, shard: &str) -> Self {
        Self {
            target: shard.to_string(),
            ..self.clone()
        }
    }
}

/// How to read one engine result. Summaries are counters; any other mode reports success,
/// where an empty answer means nothing went wrong.
fn shard_return(summary: bool) -> impl Fn(Value) -> ShardReturn {
    move |value| match value {
        Value::Null if !summary => ShardReturn::Bool(true),
        Value::Object(map) if !summary && map.is_empty() => ShardReturn::Bool(true),
        other => ShardReturn::from(other),
    }
}

/// Results of a [`FlagdataTask`].
#[derive(Debug, Clone)]
pub struct FlagdataResults {
    header: ResultsHeader,
    /// The dataset that was flagged.
    pub vis: String,
    /// The flagging mode.
    pub mode: String,
    /// What the engine reported, over every shard.
    pub consolidated: Consolidated,
}

impl Results for FlagdataResults {
    fn header(&self) -> &ResultsHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResultsHeader {
        &mut self.header
    }

    fn apply_to_context(&mut self, ctx: &mut Context) -> Result<(), PipelineError> {
        if let Consolidated::Counts(summary) = &self.consolidated {
            if let (Some(flagged), Some(total)) = (
                summary.get("flagged").and_then(Value::as_f64),
                summary.get("total").and_then(Value::as_f64),
            ) {
                if total > 0.0 {
                    info!("{}: {:.2}% flagged", self.vis, 100.0 * flagged / total);
                }
            }
            ctx.dataset_mut(&self.vis)?.flag_summary = Some(summary.clone());
        }
        Ok(())
    }
}

/// Runs the engine's `flagdata`, across the workers of `dispatcher` when the dataset is sharded.
pub struct FlagdataTask {
    inputs: FlagdataInputs,
    dispatcher: Option<ClusterDispatcher>,
}

impl FlagdataTask {
    /// A task flagging according to `inputs`, on the driver only.
    pub fn new(inputs: FlagdataInputs) -> Self {
        Self {
            inputs,
            dispatcher: None,
        }
    }

    /// Fan sharded datasets out with `dispatcher`.
    pub fn with_dispatcher(mut self, dispatcher: ClusterDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }
}

impl Task for FlagdataTask {
    type Inputs = FlagdataInputs;
    type Results = FlagdataResults;

    fn name(&self) -> &str {
        TASK
    }

    fn inputs(&self) -> &FlagdataInputs {
        &self.inputs
    }

    fn prepare(
        &self,
        ctx: &Context,
        executor: &mut Executor,
    ) -> Result<FlagdataResults, PipelineError> {
        let dataset = ctx
            .get_dataset(&self.inputs.vis)
            .map_err(|e| PipelineError::invalid_inputs(TASK, e))?;
        let interpret = shard_return(self.inputs.is_summary());

        let consolidated = match &self.dispatcher {
            Some(dispatcher) if dataset.is_sharded() => {
                info!(
                    "{} {} over {} sub-datasets",
                    TASK,
                    self.inputs.mode,
                    dataset.shards.len()
                );
                dispatcher.dispatch(ctx, &self.inputs, executor, interpret)?
            }
            _ => {
                if dataset.is_sharded() {
                    warn!(
                        "{} is sharded but no workers are available, running on the driver",
                        dataset.name
                    );
                }
                let value = executor.execute(&self.inputs.to_job())?;
                consolidate(vec![Ok(interpret(value))], &[self.inputs.target.clone()])?
            }
        };

        let mut header = ResultsHeader::new(TASK, ctx.stage_number());
        for failure in consolidated.failures() {
            header.warnings.push(failure.to_string());
        }
        match &consolidated {
            Consolidated::Named(by_shard) if self.inputs.is_summary() => {
                let odd_shape = by_shard
                    .values()
                    .any(|r| matches!(r, Ok(ret) if !matches!(ret, ShardReturn::Count(_))));
                if odd_shape {
                    header
                        .warnings
                        .push("shards disagreed on the shape of the summary".into());
                } else {
                    // only failures kept the counts from being summed
                    header.warnings.push(format!(
                        "summary of {} not kept, {} of {} shards failed",
                        self.inputs.vis,
                        by_shard.values().filter(|r| r.is_err()).count(),
                        by_shard.len()
                    ));
                }
            }
            _ => {}
        }
        Ok(FlagdataResults {
            header,
            vis: self.inputs.vis.clone(),
            mode: self.inputs.mode.clone(),
            consolidated,
        })
    }
}
