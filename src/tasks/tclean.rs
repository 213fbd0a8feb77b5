//! Image a target, cleaning iteratively until the residuals converge.

use std::{
    fmt::{Debug, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};

use derive_builder::Builder;
use log::{debug, info};
use serde_json::json;

use crate::{
    clean::{
        BeamMaskHeuristic, CleanConfig, ImageStore, IterationSequence, IterationStats,
        MaskThresholdHeuristic, PeakOverRmsStop, SequenceState, StopPredicate, StopReason,
    },
    context::{Context, ContextError, ImageRecord},
    error::PipelineError,
    inputs::{engine_args, resolve_vis, EngineArgs, Inputs},
    job::Executor,
    task::{OutputNotProduced, Results, ResultsHeader, Task},
};

const TASK: &str = "tclean";

/// Inputs of a [`TcleanTask`], built with [`TcleanInputsBuilder::build`].
///
/// Anything not given explicitly comes from the pending imaging target named by `imagename`,
/// or the first pending target if no name is given.
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(build_fn(skip))]
pub struct TcleanInputs {
    /// Registered name of the dataset to image. Defaults to the only registered dataset.
    #[builder(setter(into))]
    pub vis: String,

    /// Where `vis` lives.
    #[builder(setter(skip))]
    pub vis_path: PathBuf,

    /// Base name of the image products, relative to `output_dir`.
    #[builder(setter(into))]
    pub imagename: String,

    /// Intent of the data to image.
    #[builder(setter(into))]
    pub intent: String,

    /// Field selection.
    #[builder(setter(into))]
    pub field: String,

    /// Spectral window selection.
    #[builder(setter(into))]
    pub spw: String,

    /// Image size in pixels, `[width, height]`.
    pub imsize: [usize; 2],

    /// Pixel size, e.g. `"0.5arcsec"`.
    #[builder(setter(into))]
    pub cell: String,

    /// Spectral mode.
    #[builder(setter(into))]
    pub specmode: String,

    /// Minor cycle algorithm.
    #[builder(setter(into))]
    pub deconvolver: String,

    /// Visibility weighting.
    #[builder(setter(into))]
    pub weighting: String,

    /// Briggs robustness.
    pub robust: f64,

    /// Where the image products are written. Defaults to the context's output directory.
    #[builder(setter(into))]
    pub output_dir: PathBuf,
}

impl TcleanInputsBuilder {
    /// Resolve every parameter not given explicitly against `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::InvalidInputs`] if `vis` can't be resolved, or if the image
    /// name, size or cell are neither given nor available from a pending target.
    pub fn build(&self, ctx: &Context) -> Result<TcleanInputs, PipelineError> {
        let vis = resolve_vis(TASK, ctx, self.vis.as_ref())?;
        let dataset = ctx
            .get_dataset(&vis)
            .map_err(|e| PipelineError::invalid_inputs(TASK, e))?;
        let pending = ctx.pending_work_list();
        let target = match &self.imagename {
            Some(name) => pending.iter().find(|t| &t.imagename == name),
            None => pending.first(),
        };
        let missing = |what: &str| {
            PipelineError::invalid_inputs(
                TASK,
                format!("no {what} given and no imaging target is pending"),
            )
        };

        let imagename = self
            .imagename
            .clone()
            .or_else(|| target.map(|t| t.imagename.clone()))
            .ok_or_else(|| missing("imagename"))?;
        let intent = self
            .intent
            .clone()
            .or_else(|| target.map(|t| t.intent.clone()))
            .unwrap_or_else(|| "TARGET".into());
        let field = self
            .field
            .clone()
            .or_else(|| target.map(|t| t.field.clone()))
            .unwrap_or_else(|| dataset.field_selection(&intent));
        let spw = self
            .spw
            .clone()
            .or_else(|| target.map(|t| t.spw.clone()))
            .unwrap_or_else(|| dataset.spw_selection(&intent));
        let imsize = self
            .imsize
            .or_else(|| target.map(|t| t.imsize))
            .ok_or_else(|| missing("imsize"))?;
        if imsize.contains(&0) {
            return Err(PipelineError::invalid_inputs(
                TASK,
                format!("imsize must be positive, got {imsize:?}"),
            ));
        }
        let cell = self
            .cell
            .clone()
            .or_else(|| target.map(|t| t.cell.clone()))
            .ok_or_else(|| missing("cell"))?;
        let specmode = self
            .specmode
            .clone()
            .or_else(|| target.map(|t| t.specmode.clone()))
            .unwrap_or_else(|| "mfs".into());

        Ok(TcleanInputs {
            vis_path: dataset.path.clone(),
            vis,
            imagename,
            intent,
            field,
            spw,
            imsize,
            cell,
            specmode,
            deconvolver: self.deconvolver.clone().unwrap_or_else(|| "hogbom".into()),
            weighting: self.weighting.clone().unwrap_or_else(|| "briggs".into()),
            robust: self.robust.unwrap_or(0.5),
            output_dir: self
                .output_dir
                .clone()
                .unwrap_or_else(|| ctx.output_dir().to_path_buf()),
        })
    }
}

impl TcleanInputs {
    /// Path prefix of every image product.
    pub fn image_base(&self) -> String {
        self.output_dir.join(&self.imagename).display().to_string()
    }

    /// `(height, width)` of the images.
    pub fn shape(&self) -> (usize, usize) {
        (self.imsize[1], self.imsize[0])
    }
}

impl Inputs for TcleanInputs {
    fn command(&self) -> &str {
        "tclean"
    }

    fn fields(&self) -> EngineArgs {
        engine_args([
            ("vis", json!(self.vis_path.display().to_string())),
            ("imagename", json!(self.image_base())),
            ("field", json!(self.field)),
            ("spw", json!(self.spw)),
            ("intent", json!(self.intent)),
            ("imsize", json!(self.imsize)),
            ("cell", json!(self.cell)),
            ("specmode", json!(self.specmode)),
            ("deconvolver", json!(self.deconvolver)),
            ("weighting", json!(self.weighting)),
            ("robust", json!(self.robust)),
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

/// Results of a [`TcleanTask`].
#[derive(Debug, Clone)]
pub struct TcleanResults {
    header: ResultsHeader,
    /// The final products, if the sequence ran.
    pub record: Option<ImageRecord>,
    /// Statistics of every pass.
    pub history: Vec<IterationStats>,
    /// Where the sequence got to.
    pub state: SequenceState,
    /// Which limit ended the passes.
    pub stop_reason: Option<StopReason>,
}

impl Results for TcleanResults {
    fn header(&self) -> &ResultsHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResultsHeader {
        &mut self.header
    }

    fn apply_to_context(&mut self, ctx: &mut Context) -> Result<(), PipelineError> {
        let record = match &self.record {
            Some(record) => record.clone(),
            None => return Ok(()),
        };
        let imagename = record.imagename.clone();
        ctx.register_image(record)?;
        match ctx.complete_target(&imagename) {
            Ok(_) => debug!("imaging target {} is done", imagename),
            Err(ContextError::NotFound { .. }) => {
                debug!("{} was not a pending imaging target", imagename);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Images with the engine's `tclean`, driving an [`IterationSequence`] to convergence.
pub struct TcleanTask {
    inputs: TcleanInputs,
    config: CleanConfig,
    heuristic: Box<dyn MaskThresholdHeuristic>,
    stop: Box<dyn StopPredicate>,
    store: Arc<dyn ImageStore>,
}

impl Debug for TcleanTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcleanTask")
            .field("inputs", &self.inputs)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TcleanTask {
    /// A task imaging according to `inputs`, reading products through `store`, with the default
    /// beam mask heuristic and stop rule.
    pub fn new(inputs: TcleanInputs, store: Arc<dyn ImageStore>) -> Self {
        Self {
            inputs,
            config: CleanConfig::default(),
            heuristic: Box::new(BeamMaskHeuristic::default()),
            stop: Box::new(PeakOverRmsStop::default()),
            store,
        }
    }

    /// Replace the sequence options.
    pub fn with_config(mut self, config: CleanConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the mask and threshold heuristic.
    pub fn with_heuristic(mut self, heuristic: Box<dyn MaskThresholdHeuristic>) -> Self {
        self.heuristic = heuristic;
        self
    }

    /// Replace the stop rule.
    pub fn with_stop(mut self, stop: Box<dyn StopPredicate>) -> Self {
        self.stop = stop;
        self
    }

    fn sequence(&self) -> IterationSequence<'_> {
        let mut base_args = self.inputs.to_engine_args();
        base_args.shift_remove("imagename");
        IterationSequence::new(
            self.inputs.image_base(),
            self.inputs.shape(),
            base_args,
            self.config.clone(),
            self.heuristic.as_ref(),
            self.stop.as_ref(),
            self.store.as_ref(),
        )
    }
}

impl Task for TcleanTask {
    type Inputs = TcleanInputs;
    type Results = TcleanResults;

    fn name(&self) -> &str {
        TASK
    }

    fn inputs(&self) -> &TcleanInputs {
        &self.inputs
    }

    fn prepare(
        &self,
        ctx: &Context,
        executor: &mut Executor,
    ) -> Result<TcleanResults, PipelineError> {
        let mut header = ResultsHeader::new(TASK, ctx.stage_number());
        let sequence = self.sequence();

        if executor.is_dry_run() {
            // nothing would be written for the heuristics to look at
            executor.execute(&sequence.dirty_job())?;
            header.missing_output = Some(OutputNotProduced {
                expected_path: PathBuf::from(sequence.products_for(0).residual),
            });
            return Ok(TcleanResults {
                header,
                record: None,
                history: vec![],
                state: SequenceState::Initial,
                stop_reason: None,
            });
        }

        let state = sequence.run(executor)?;
        let record = match (state.final_products(), state.latest()) {
            (Some(products), Some(latest)) => {
                info!(
                    "{}: {} clean passes, final threshold {:.3e}, residual rms {:.3e}",
                    self.inputs.imagename,
                    state.iteration,
                    state.threshold,
                    latest.residual_robust_rms
                );
                let image = if self.config.restore {
                    products.image.clone()
                } else {
                    products.residual.clone()
                };
                if !self.store.exists(&image) {
                    header.missing_output = Some(OutputNotProduced {
                        expected_path: PathBuf::from(&image),
                    });
                }
                Some(ImageRecord {
                    imagename: self.inputs.imagename.clone(),
                    vis: self.inputs.vis.clone(),
                    image,
                    residual: products.residual.clone(),
                    model: products.model.clone(),
                    psf: products.psf.clone(),
                    pb: Some(products.pb.clone()).filter(|pb| self.store.exists(pb)),
                    threshold: state.threshold,
                    iterations: state.iteration,
                    residual_rms: latest.residual_robust_rms,
                    stage: ctx.stage_number(),
                })
            }
            _ => None,
        };
        Ok(TcleanResults {
            header,
            record,
            history: state.history,
            state: state.state,
            stop_reason: state.stop_reason,
        })
    }
}
