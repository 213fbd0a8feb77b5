//! Copy a selection of a dataset into a new dataset, optionally replacing the original.

use std::path::PathBuf;

use derive_builder::Builder;
use log::info;
use serde_json::json;

use super::check_output;
use crate::{
    context::{Context, Dataset, Field, Spw},
    error::PipelineError,
    inputs::{derived_name, engine_args, resolve_vis, selection_items, EngineArgs, Inputs},
    job::Executor,
    task::{Results, ResultsHeader, Task},
};

const TASK: &str = "split";

/// Inputs of a [`SplitTask`], built with [`SplitInputsBuilder::build`].
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(skip))]
pub struct SplitInputs {
    /// Registered name of the dataset to split. Defaults to the only registered dataset.
    #[builder(setter(into))]
    pub vis: String,

    /// Where `vis` lives.
    #[builder(setter(skip))]
    pub vis_path: PathBuf,

    /// Name of the new dataset, written inside `output_dir`. Defaults to `<vis>_split`.
    #[builder(setter(into))]
    pub outputvis: String,

    /// Intent selecting fields and spectral windows. Defaults to `TARGET`.
    #[builder(setter(into))]
    pub intent: String,

    /// Field selection. Defaults to the fields observed with `intent`.
    #[builder(setter(into))]
    pub field: String,

    /// Spectral window selection. Defaults to the windows carrying `intent`.
    #[builder(setter(into))]
    pub spw: String,

    /// Data column to copy.
    #[builder(setter(into))]
    pub datacolumn: String,

    /// Whether the new dataset takes the place of `vis` in the context.
    pub replace: bool,

    /// Where the new dataset is written. Defaults to the context's output directory.
    #[builder(setter(into))]
    pub output_dir: PathBuf,
}

impl SplitInputsBuilder {
    /// Resolve every parameter not given explicitly against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidInputs`] if `vis` can't be resolved, or if the dataset
    /// has fields but none match the intent.
    pub fn build(&self, ctx: &Context) -> Result<SplitInputs, PipelineError> {
        let vis = resolve_vis(TASK, ctx, self.vis.as_ref())?;
        let dataset = ctx
            .get_dataset(&vis)
            .map_err(|e| PipelineError::invalid_inputs(TASK, e))?;
        let intent = self.intent.clone().unwrap_or_else(|| "TARGET".into());

        let field = match &self.field {
            Some(field) => field.clone(),
            None => dataset.field_selection(&intent),
        };
        if field.is_empty() && !dataset.fields.is_empty() {
            return Err(PipelineError::invalid_inputs(
                TASK,
                format!("no field of {vis} was observed with intent {intent}"),
            ));
        }
        let spw = match &self.spw {
            Some(spw) => spw.clone(),
            None => dataset.spw_selection(&intent),
        };

        Ok(SplitInputs {
            outputvis: self
                .outputvis
                .clone()
                .unwrap_or_else(|| derived_name(&vis, "split")),
            vis_path: dataset.path.clone(),
            vis,
            intent,
            field,
            spw,
            datacolumn: self.datacolumn.clone().unwrap_or_else(|| "data".into()),
            replace: self.replace.unwrap_or(false),
            output_dir: self
                .output_dir
                .clone()
                .unwrap_or_else(|| ctx.output_dir().to_path_buf()),
        })
    }
}

impl SplitInputs {
    /// Where the new dataset will be written.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.outputvis)
    }
}

impl Inputs for SplitInputs {
    fn command(&self) -> &str {
        "mstransform"
    }

    fn fields(&self) -> EngineArgs {
        engine_args([
            ("vis", json!(self.vis_path.display().to_string())),
            ("outputvis", json!(self.output_path().display().to_string())),
            ("field", json!(self.field)),
            ("spw", json!(self.spw)),
            ("intent", json!(self.intent)),
            ("datacolumn", json!(self.datacolumn)),
            ("replace", json!(self.replace)),
            ("output_dir", json!(self.output_dir.display().to_string())),
        ])
    }

    fn pipeline_only_keys(&self) -> &'static [&'static str] {
        &["replace", "output_dir"]
    }

    fn output_dir(&self) -> &std::path::Path {
        &self.output_dir
    }
}

fn select_fields(fields: &[Field], selection: &str) -> Vec<Field> {
    let names = selection_items(selection);
    fields
        .iter()
        .filter(|f| names.is_empty() || names.contains(&f.name.as_str()))
        .cloned()
        .collect()
}

fn select_spws(spws: &[Spw], selection: &str) -> Vec<Spw> {
    let ids = selection_items(selection);
    spws.iter()
        .filter(|s| ids.is_empty() || ids.iter().any(|id| id.parse() == Ok(s.id)))
        .cloned()
        .collect()
}

/// Results of a [`SplitTask`].
#[derive(Debug, Clone)]
pub struct SplitResults {
    header: ResultsHeader,
    /// The dataset that was split.
    pub vis: String,
    /// Whether `dataset` replaces `vis`.
    pub replace: bool,
    /// The new dataset.
    pub dataset: Dataset,
}

impl Results for SplitResults {
    fn header(&self) -> &ResultsHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResultsHeader {
        &mut self.header
    }

    fn apply_to_context(&mut self, ctx: &mut Context) -> Result<(), PipelineError> {
        if self.replace {
            ctx.replace(&self.vis, self.dataset.clone())?;
        } else {
            ctx.register(self.dataset.clone())?;
        }
        Ok(())
    }
}

/// Splits out a selection of a dataset with the engine's `mstransform`.
#[derive(Debug)]
pub struct SplitTask {
    inputs: SplitInputs,
}

impl SplitTask {
    /// A task splitting according to `inputs`.
    pub fn new(inputs: SplitInputs) -> Self {
        Self { inputs }
    }
}

impl Task for SplitTask {
    type Inputs = SplitInputs;
    type Results = SplitResults;

    fn name(&self) -> &str {
        TASK
    }

    fn inputs(&self) -> &SplitInputs {
        &self.inputs
    }

    fn prepare(&self, ctx: &Context, executor: &mut Executor) -> Result<SplitResults, PipelineError> {
        let source = ctx
            .get_dataset(&self.inputs.vis)
            .map_err(|e| PipelineError::invalid_inputs(TASK, e))?;
        info!(
            "splitting fields '{}' spws '{}' of {} into {}",
            self.inputs.field, self.inputs.spw, self.inputs.vis, self.inputs.outputvis
        );
        executor.execute(&self.inputs.to_job())?;

        let dataset = Dataset::new(&self.inputs.outputvis, self.inputs.output_path())
            .with_fields(select_fields(&source.fields, &self.inputs.field))
            .with_spws(select_spws(&source.spws, &self.inputs.spw));
        Ok(SplitResults {
            header: ResultsHeader::new(TASK, ctx.stage_number()),
            vis: self.inputs.vis.clone(),
            replace: self.inputs.replace,
            dataset,
        })
    }

    fn analyse(&self, mut results: SplitResults) -> Result<SplitResults, PipelineError> {
        results.header.missing_output = check_output(&results.dataset.path);
        Ok(results)
    }
}
