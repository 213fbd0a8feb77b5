//! Solve for complex gains on calibrator fields and register the table for later application.

use std::path::{Path, PathBuf};

use derive_builder::Builder;
use log::info;
use serde_json::json;

use super::check_output;
use crate::{
    context::{CalApplication, Context},
    error::PipelineError,
    inputs::{engine_args, resolve_vis, EngineArgs, Inputs},
    job::Executor,
    task::{Results, ResultsHeader, Task},
};

const TASK: &str = "gaincal";

/// Inputs of a [`GaincalTask`], built with [`GaincalInputsBuilder::build`].
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(skip))]
pub struct GaincalInputs {
    /// Registered name of the dataset to solve on. Defaults to the only registered dataset.
    #[builder(setter(into))]
    pub vis: String,

    /// Where `vis` lives.
    #[builder(setter(skip))]
    pub vis_path: PathBuf,

    /// Name of the table, written inside `output_dir`. Defaults to `<vis>.s<stage>.gcal`.
    #[builder(setter(into))]
    pub caltable: String,

    /// Intent of the calibrator. Defaults to `PHASE`.
    #[builder(setter(into))]
    pub intent: String,

    /// Field selection. Defaults to the fields observed with `intent`.
    #[builder(setter(into))]
    pub field: String,

    /// Spectral window selection. Defaults to the windows carrying `intent`.
    #[builder(setter(into))]
    pub spw: String,

    /// Solution interval.
    #[builder(setter(into))]
    pub solint: String,

    /// Kind of gain solved for.
    #[builder(setter(into))]
    pub gaintype: String,

    /// `p`, `a` or `ap`.
    #[builder(setter(into))]
    pub calmode: String,

    /// Reference antenna, empty to let the engine choose.
    #[builder(setter(into))]
    pub refant: String,

    /// Reject solutions below this signal to noise.
    pub minsnr: f64,

    /// Where the table is written. Defaults to the context's output directory.
    #[builder(setter(into))]
    pub output_dir: PathBuf,
}

impl GaincalInputsBuilder {
    /// Resolve every parameter not given explicitly against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidInputs`] if `vis` can't be resolved or no field was
    /// observed as a calibrator with the intent.
    pub fn build(&self, ctx: &Context) -> Result<GaincalInputs, PipelineError> {
        let vis = resolve_vis(TASK, ctx, self.vis.as_ref())?;
        let dataset = ctx
            .get_dataset(&vis)
            .map_err(|e| PipelineError::invalid_inputs(TASK, e))?;
        let intent = self.intent.clone().unwrap_or_else(|| "PHASE".into());
        let field = match &self.field {
            Some(field) => field.clone(),
            None => dataset.field_selection(&intent),
        };
        if field.is_empty() {
            return Err(PipelineError::invalid_inputs(
                TASK,
                format!("no calibrator field of {vis} was observed with intent {intent}"),
            ));
        }
        let spw = match &self.spw {
            Some(spw) => spw.clone(),
            None => dataset.spw_selection(&intent),
        };
        let minsnr = self.minsnr.unwrap_or(3.0);
        if minsnr.is_nan() || minsnr < 0.0 {
            return Err(PipelineError::invalid_inputs(
                TASK,
                format!("minsnr must be non-negative, got {minsnr}"),
            ));
        }

        Ok(GaincalInputs {
            caltable: self
                .caltable
                .clone()
                .unwrap_or_else(|| format!("{vis}.s{}.gcal", ctx.stage_number())),
            vis_path: dataset.path.clone(),
            vis,
            intent,
            field,
            spw,
            solint: self.solint.clone().unwrap_or_else(|| "int".into()),
            gaintype: self.gaintype.clone().unwrap_or_else(|| "G".into()),
            calmode: self.calmode.clone().unwrap_or_else(|| "ap".into()),
            refant: self.refant.clone().unwrap_or_default(),
            minsnr,
            output_dir: self
                .output_dir
                .clone()
                .unwrap_or_else(|| ctx.output_dir().to_path_buf()),
        })
    }
}

impl GaincalInputs {
    /// Where the table will be written.
    pub fn caltable_path(&self) -> PathBuf {
        self.output_dir.join(&self.caltable)
    }
}

impl Inputs for GaincalInputs {
    fn command(&self) -> &str {
        "gaincal"
    }

    fn fields(&self) -> EngineArgs {
        engine_args([
            ("vis", json!(self.vis_path.display().to_string())),
            ("caltable", json!(self.caltable_path().display().to_string())),
            ("field", json!(self.field)),
            ("spw", json!(self.spw)),
            ("intent", json!(self.intent)),
            ("solint", json!(self.solint)),
            ("gaintype", json!(self.gaintype)),
            ("calmode", json!(self.calmode)),
            ("refant", json!(self.refant)),
            ("minsnr", json!(self.minsnr)),
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

/// Results of a [`GaincalTask`].
#[derive(Debug, Clone)]
pub struct GaincalResults {
    header: ResultsHeader,
    /// The solved table and how to apply it.
    pub application: CalApplication,
}

impl Results for GaincalResults {
    fn header(&self) -> &ResultsHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResultsHeader {
        &mut self.header
    }

    fn apply_to_context(&mut self, ctx: &mut Context) -> Result<(), PipelineError> {
        info!(
            "registering {} for {}",
            self.application.gaintable.display(),
            self.application.vis
        );
        ctx.add_calibration(self.application.clone())?;
        Ok(())
    }
}

/// Solves for gains with the engine's `gaincal`.
#[derive(Debug)]
pub struct GaincalTask {
    inputs: GaincalInputs,
}

impl GaincalTask {
    /// A task solving according to `inputs`.
    pub fn new(inputs: GaincalInputs) -> Self {
        Self { inputs }
    }
}

impl Task for GaincalTask {
    type Inputs = GaincalInputs;
    type Results = GaincalResults;

    fn name(&self) -> &str {
        TASK
    }

    fn inputs(&self) -> &GaincalInputs {
        &self.inputs
    }

    fn prepare(
        &self,
        ctx: &Context,
        executor: &mut Executor,
    ) -> Result<GaincalResults, PipelineError> {
        executor.execute(&self.inputs.to_job())?;
        Ok(GaincalResults {
            header: ResultsHeader::new(TASK, ctx.stage_number()),
            application: CalApplication {
                vis: self.inputs.vis.clone(),
                gaintable: self.inputs.caltable_path(),
                // solutions from the calibrators apply to every field
                field: String::new(),
                spw: self.inputs.spw.clone(),
                interp: "linear".into(),
                calwt: false,
                stage: ctx.stage_number(),
            },
        })
    }

    fn analyse(&self, mut results: GaincalResults) -> Result<GaincalResults, PipelineError> {
        results.header.missing_output = check_output(&results.application.gaintable);
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::ExecutorConfig,
        task::StageOutcome,
        test_common::{ngc253, FakeEngine},
    };
    use serde_json::Value;
    use std::{fs::create_dir_all, sync::Arc};
    use tempfile::tempdir;

    fn gaincal() -> FakeEngine {
        FakeEngine::new().on("gaincal", |job| {
            create_dir_all(job.args["caltable"].as_str().unwrap()).unwrap();
            Ok(Value::Null)
        })
    }

    #[test]
    fn test_defaults_from_context() {
        let mut ctx = Context::new("/out");
        ctx.register(ngc253("ds1", "/data/ds1.ms")).unwrap();
        ctx.next_stage();
        ctx.next_stage();
        let inputs = GaincalInputsBuilder::default().build(&ctx).unwrap();
        assert_eq!(inputs.caltable, "ds1.s2.gcal");
        assert_eq!(inputs.field, "J0132-1654");
        assert_eq!(inputs.spw, "0");
        assert_eq!(inputs.solint, "int");
        assert_eq!(inputs.calmode, "ap");
        assert_eq!(inputs.minsnr, 3.0);

        let args = inputs.to_engine_args();
        assert_eq!(args["caltable"], json!("/out/ds1.s2.gcal"));
        assert!(!args.contains_key("output_dir"));
    }

    #[test]
    fn test_invalid_inputs() {
        let mut ctx = Context::new("/out");
        ctx.register(ngc253("ds1", "/data/ds1.ms")).unwrap();
        assert!(matches!(
            GaincalInputsBuilder::default().minsnr(-1.0).build(&ctx),
            Err(PipelineError::InvalidInputs { .. })
        ));
        assert!(matches!(
            GaincalInputsBuilder::default().intent("CHECK").build(&ctx),
            Err(PipelineError::InvalidInputs { .. })
        ));
    }

    #[test]
    fn test_table_is_registered() {
        let tmp_dir = tempdir().unwrap();
        let mut ctx = Context::new(tmp_dir.path());
        ctx.register(ngc253("ds1", tmp_dir.path().join("ds1.ms")))
            .unwrap();
        ctx.next_stage();
        let mut exec = Executor::new(Arc::new(gaincal()), ExecutorConfig::default());

        let task = GaincalTask::new(GaincalInputsBuilder::default().build(&ctx).unwrap());
        let mut results = task.execute(&ctx, &mut exec).unwrap();
        assert_eq!(results.outcome(), StageOutcome::Succeeded);
        results.merge_with_context(&mut ctx).unwrap();

        let tables = ctx.callibrary().applications_for("ds1");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].gaintable, tmp_dir.path().join("ds1.s1.gcal"));
        assert_eq!(tables[0].stage, 1);
        assert_eq!(
            ctx.callibrary().gaintable_arg("ds1"),
            tmp_dir.path().join("ds1.s1.gcal").display().to_string()
        );
    }

    #[test]
    fn test_same_table_twice_is_refused() {
        let tmp_dir = tempdir().unwrap();
        let mut ctx = Context::new(tmp_dir.path());
        ctx.register(ngc253("ds1", tmp_dir.path().join("ds1.ms")))
            .unwrap();
        let mut exec = Executor::new(Arc::new(gaincal()), ExecutorConfig::default());
        let task = GaincalTask::new(GaincalInputsBuilder::default().build(&ctx).unwrap());

        let mut first = task.execute(&ctx, &mut exec).unwrap();
        first.merge_with_context(&mut ctx).unwrap();
        let mut second = task.execute(&ctx, &mut exec).unwrap();
        let err = second.merge_with_context(&mut ctx).unwrap_err();
        assert!(err.is_fatal());
    }
}
