//! Recipe files: the datasets and imaging targets a run starts from, and the stages it runs.
//!
//! ```toml
//! output_dir = "/scratch/ngc253"
//! engine = "/opt/casa/bin/casa-engine"
//! workers = 8
//!
//! [[dataset]]
//! name = "uid___A002_X1"
//! path = "/data/uid___A002_X1.ms"
//! fields = [
//!     { name = "J0132-1654", intents = ["PHASE"] },
//!     { name = "NGC253", intents = ["TARGET"] },
//! ]
//! spws = [{ id = 0 }]
//!
//! [[target]]
//! imagename = "NGC253"
//! field = "NGC253"
//! imsize = [256, 256]
//! cell = "0.5arcsec"
//!
//! [[stage]]
//! task = "flagdata"
//! mode = "summary"
//!
//! [[stage]]
//! task = "gaincal"
//!
//! [[stage]]
//! task = "split"
//! replace = true
//!
//! [[stage]]
//! task = "tclean"
//! niter = 500
//! ```

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info};
use serde::Deserialize;

use crate::{
    clean::{BeamMaskHeuristic, CleanConfig, ImageStore, PeakOverRmsStop},
    context::{Context, ContextError, Dataset, Field, ImagingTarget, Spw},
    dispatch::ClusterDispatcher,
    error::PipelineError,
    pipeline::{Pipeline, Stage, StageFactory},
    tasks::{
        flagdata::{FlagdataInputsBuilder, FlagdataTask},
        gaincal::{GaincalInputsBuilder, GaincalTask},
        split::{SplitInputsBuilder, SplitTask},
        tclean::{TcleanInputsBuilder, TcleanTask},
    },
};

/// A parsed recipe file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    /// Where products are written.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Engine wrapper executable.
    #[serde(default)]
    pub engine: Option<PathBuf>,
    /// Extra arguments given to the engine before each command.
    #[serde(default)]
    pub engine_args: Vec<String>,
    /// Number of engine workers for sharded stages.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Datasets registered before the first stage.
    #[serde(default, rename = "dataset")]
    pub datasets: Vec<DatasetEntry>,
    /// Imaging work queued before the first stage.
    #[serde(default, rename = "target")]
    pub targets: Vec<ImagingTarget>,
    /// Stages, in the order they run.
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageEntry>,
}

/// A dataset in a recipe.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetEntry {
    /// Name to register it under.
    pub name: String,
    /// Where it lives.
    pub path: PathBuf,
    /// Fields and their intents.
    #[serde(default)]
    pub fields: Vec<Field>,
    /// Spectral windows and their intents.
    #[serde(default)]
    pub spws: Vec<Spw>,
    /// Sub-datasets. Looked for on disk if not given.
    #[serde(default)]
    pub shards: Option<Vec<String>>,
}

impl DatasetEntry {
    /// The dataset descriptor, discovering sub-datasets on disk unless they were listed.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Discovery`] if the sub-dataset directory can't be read.
    pub fn to_dataset(&self) -> Result<Dataset, ContextError> {
        let dataset = match &self.shards {
            Some(shards) => Dataset::new(&self.name, &self.path).with_shards(shards.clone()),
            None => Dataset::discover(&self.name, &self.path)?,
        };
        Ok(dataset
            .with_fields(self.fields.clone())
            .with_spws(self.spws.clone()))
    }
}

/// Parameters of a `split` stage. Anything left out is resolved against the context.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(missing_docs)]
pub struct SplitParams {
    pub vis: Option<String>,
    pub outputvis: Option<String>,
    pub intent: Option<String>,
    pub field: Option<String>,
    pub spw: Option<String>,
    pub datacolumn: Option<String>,
    pub replace: Option<bool>,
}

/// Parameters of a `gaincal` stage.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(missing_docs)]
pub struct GaincalParams {
    pub vis: Option<String>,
    pub caltable: Option<String>,
    pub intent: Option<String>,
    pub field: Option<String>,
    pub spw: Option<String>,
    pub solint: Option<String>,
    pub gaintype: Option<String>,
    pub calmode: Option<String>,
    pub refant: Option<String>,
    pub minsnr: Option<f64>,
}

/// Parameters of a `flagdata` stage.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(missing_docs)]
pub struct FlagdataParams {
    pub vis: Option<String>,
    pub mode: Option<String>,
    pub field: Option<String>,
    pub spw: Option<String>,
    pub autocorr: Option<bool>,
}

/// Parameters of a `tclean` stage, including the options of its clean sequence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[allow(missing_docs)]
pub struct TcleanParams {
    pub vis: Option<String>,
    pub imagename: Option<String>,
    pub intent: Option<String>,
    pub field: Option<String>,
    pub spw: Option<String>,
    pub imsize: Option<[usize; 2]>,
    pub cell: Option<String>,
    pub specmode: Option<String>,
    pub deconvolver: Option<String>,
    pub weighting: Option<String>,
    pub robust: Option<f64>,
    pub niter: Option<usize>,
    pub max_passes: Option<usize>,
    pub restore: Option<bool>,
    pub pblimit: Option<f32>,
    pub threshold_sigma: Option<f64>,
    pub min_peak_over_rms: Option<f64>,
    pub max_iterations: Option<usize>,
}

impl TcleanParams {
    fn clean_config(&self) -> CleanConfig {
        let default = CleanConfig::default();
        CleanConfig {
            niter: self.niter.unwrap_or(default.niter),
            max_passes: self.max_passes.unwrap_or(default.max_passes),
            restore: self.restore.unwrap_or(default.restore),
            ..default
        }
    }

    fn heuristic(&self) -> BeamMaskHeuristic {
        let default = BeamMaskHeuristic::default();
        BeamMaskHeuristic {
            pblimit: self.pblimit.unwrap_or(default.pblimit),
            threshold_sigma: self.threshold_sigma.unwrap_or(default.threshold_sigma),
        }
    }

    fn stop(&self) -> PeakOverRmsStop {
        let default = PeakOverRmsStop::default();
        PeakOverRmsStop {
            min_peak_over_rms: self.min_peak_over_rms.unwrap_or(default.min_peak_over_rms),
            max_iterations: self.max_iterations.unwrap_or(default.max_iterations),
        }
    }
}

/// One `[[stage]]` of a recipe, tagged by its `task`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "task", rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum StageEntry {
    Split(SplitParams),
    Gaincal(GaincalParams),
    Flagdata(FlagdataParams),
    Tclean(TcleanParams),
}

impl StageEntry {
    /// Name of the task.
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::Split(_) => "split",
            Self::Gaincal(_) => "gaincal",
            Self::Flagdata(_) => "flagdata",
            Self::Tclean(_) => "tclean",
        }
    }
}

/// Set each builder field whose parameter was given.
macro_rules! set_given {
    ($builder:ident, $params:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$params.$field {
                $builder.$field(value.clone());
            }
        )+
    };
}

/// What configured stages share within a run.
#[derive(Clone)]
pub struct StageServices {
    /// Runs sharded stages over sub-datasets. Without one they run on the driver.
    pub dispatcher: Option<ClusterDispatcher>,
    /// Where imaging stages read their products.
    pub image_store: Arc<dyn ImageStore>,
}

/// A [`StageFactory`] for a stage described in a recipe.
pub struct ConfiguredStage {
    entry: StageEntry,
    services: StageServices,
}

impl ConfiguredStage {
    /// A factory building `entry` with `services`.
    pub fn new(entry: StageEntry, services: StageServices) -> Self {
        Self { entry, services }
    }
}

impl StageFactory for ConfiguredStage {
    fn task_name(&self) -> &str {
        self.entry.task_name()
    }

    fn build(&self, ctx: &Context) -> Result<Box<dyn Stage>, PipelineError> {
        let stage: Box<dyn Stage> = match &self.entry {
            StageEntry::Split(params) => {
                let mut builder = SplitInputsBuilder::default();
                set_given!(
                    builder, params, vis, outputvis, intent, field, spw, datacolumn, replace
                );
                Box::new(SplitTask::new(builder.build(ctx)?))
            }
            StageEntry::Gaincal(params) => {
                let mut builder = GaincalInputsBuilder::default();
                set_given!(
                    builder, params, vis, caltable, intent, field, spw, solint, gaintype, calmode,
                    refant, minsnr
                );
                Box::new(GaincalTask::new(builder.build(ctx)?))
            }
            StageEntry::Flagdata(params) => {
                let mut builder = FlagdataInputsBuilder::default();
                set_given!(builder, params, vis, mode, field, spw, autocorr);
                let mut task = FlagdataTask::new(builder.build(ctx)?);
                if let Some(dispatcher) = &self.services.dispatcher {
                    task = task.with_dispatcher(dispatcher.clone());
                }
                Box::new(task)
            }
            StageEntry::Tclean(params) => {
                let mut builder = TcleanInputsBuilder::default();
                set_given!(
                    builder,
                    params,
                    vis,
                    imagename,
                    intent,
                    field,
                    spw,
                    imsize,
                    cell,
                    specmode,
                    deconvolver,
                    weighting,
                    robust
                );
                Box::new(
                    TcleanTask::new(builder.build(ctx)?, Arc::clone(&self.services.image_store))
                        .with_config(params.clean_config())
                        .with_heuristic(Box::new(params.heuristic()))
                        .with_stop(Box::new(params.stop())),
                )
            }
        };
        debug!("built {} for stage {}", stage.task_name(), ctx.stage_number());
        Ok(stage)
    }
}

impl Recipe {
    /// Parse a recipe.
    ///
    /// # Errors
    ///
    /// Returns the parser's error if `text` is not a valid recipe.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Read and parse the recipe at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the file can't be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let config_error = |message: String| PipelineError::Config {
            path: path.display().to_string(),
            message,
        };
        let text = read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        let recipe = Self::from_toml_str(&text).map_err(|e| config_error(e.to_string()))?;
        info!(
            "read recipe {} with {} datasets and {} stages",
            path.display(),
            recipe.datasets.len(),
            recipe.stages.len()
        );
        Ok(recipe)
    }

    /// A context writing into `output_dir`, holding the recipe's datasets and imaging targets.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Context`] if sub-datasets can't be discovered or a name is
    /// used twice.
    pub fn context(&self, output_dir: impl AsRef<Path>) -> Result<Context, PipelineError> {
        let mut ctx = Context::new(output_dir);
        for entry in &self.datasets {
            ctx.register(entry.to_dataset()?)?;
        }
        for target in &self.targets {
            ctx.add_target(target.clone())?;
        }
        Ok(ctx)
    }

    /// The recipe's stages, sharing `services`.
    pub fn pipeline(&self, services: &StageServices) -> Pipeline {
        let mut pipeline = Pipeline::new();
        for entry in &self.stages {
            pipeline.push(Box::new(ConfiguredStage::new(
                entry.clone(),
                services.clone(),
            )));
        }
        pipeline
    }
}
