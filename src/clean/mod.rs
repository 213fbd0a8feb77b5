//! Iterative imaging: make a dirty image, then keep deconvolving with a fresh mask and threshold
//! until a stop rule says the residuals have converged.

use std::fmt::{Display, Formatter};

use derive_builder::Builder;
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::{
    inputs::EngineArgs,
    job::{Executor, Job},
};

mod error;
mod heuristics;
mod mask;
mod stats;
mod store;

pub use error::{CleanError, IterationFatalError};
pub use heuristics::{
    BeamMaskHeuristic, BeamMaskHeuristicBuilder, MaskInputs, MaskThresholdHeuristic,
    PeakOverRmsStop, PeakOverRmsStopBuilder, StopPredicate,
};
pub use mask::{Mask, MaskKind};
pub use stats::{median, rms, robust_rms, std_dev, IterationStats, MAD_TO_SIGMA};
pub use store::{
    decode_pixels, encode_pixels, EngineImageStore, ImageStore, MemoryImageStore,
};

/// The image products of one imaging pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageProducts {
    /// Base name of the products.
    pub imagename: String,
    /// Restored image.
    pub image: String,
    /// Residual.
    pub residual: String,
    /// Clean components.
    pub model: String,
    /// Point spread function.
    pub psf: String,
    /// Primary beam.
    pub pb: String,
}

impl ImageProducts {
    /// The products the engine writes for `imagename`.
    pub fn new(imagename: &str) -> Self {
        Self {
            imagename: imagename.to_string(),
            image: format!("{imagename}.image"),
            residual: format!("{imagename}.residual"),
            model: format!("{imagename}.model"),
            psf: format!("{imagename}.psf"),
            pb: format!("{imagename}.pb"),
        }
    }
}

/// Options for an [`IterationSequence`]
#[derive(Builder, Debug, Clone)]
pub struct CleanConfig {
    /// Engine command that images.
    #[builder(default = "\"tclean\".into()", setter(into))]
    pub command: String,

    /// Minor cycle iteration limit for each clean pass.
    #[builder(default = "1000")]
    pub niter: usize,

    /// Hard limit on clean passes after the dirty image.
    #[builder(default = "10")]
    pub max_passes: usize,

    /// Whether to restore the final model once converged.
    #[builder(default = "true")]
    pub restore: bool,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            command: "tclean".into(),
            niter: 1000,
            max_passes: 10,
            restore: true,
        }
    }
}

impl Display for CleanConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Will image with {}, up to {} passes of {} iterations.",
            self.command, self.max_passes, self.niter
        )?;
        writeln!(
            f,
            "{} restore the final model.",
            if self.restore { "Will" } else { "Will not" }
        )?;
        Ok(())
    }
}

/// Where a sequence is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Nothing has run.
    Initial,
    /// Passes are running.
    Iterating,
    /// The stop rule has fired.
    Converged,
    /// The pass limit was reached before the stop rule fired.
    Exhausted,
    /// The final products have been restored.
    Done,
}

impl Display for SequenceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Iterating => "iterating",
            Self::Converged => "converged",
            Self::Exhausted => "exhausted",
            Self::Done => "done",
        };
        write!(f, "{name}")
    }
}

/// Which limit ended the passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The [`StopPredicate`] declined another pass.
    StopRule,
    /// [`CleanConfig::max_passes`] was reached.
    PassLimit,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopRule => write!(f, "stop rule"),
            Self::PassLimit => write!(f, "pass limit"),
        }
    }
}

/// Everything a sequence has done so far.
#[derive(Debug, Clone)]
pub struct IterationState {
    /// Life cycle state.
    pub state: SequenceState,
    /// Index of the latest pass.
    pub iteration: usize,
    /// Statistics of every pass, indexed by iteration.
    pub history: Vec<IterationStats>,
    /// Products of every pass, indexed by iteration.
    pub products: Vec<ImageProducts>,
    /// Mask of the latest pass.
    pub mask: Option<Mask>,
    /// Threshold of the latest pass.
    pub threshold: f64,
    /// Why the passes ended, once they have.
    pub stop_reason: Option<StopReason>,
}

impl IterationState {
    fn new() -> Self {
        Self {
            state: SequenceState::Initial,
            iteration: 0,
            history: vec![],
            products: vec![],
            mask: None,
            threshold: 0.0,
            stop_reason: None,
        }
    }

    /// Products of the latest pass.
    pub fn final_products(&self) -> Option<&ImageProducts> {
        self.products.last()
    }

    /// Statistics of the latest pass.
    pub fn latest(&self) -> Option<&IterationStats> {
        self.history.last()
    }
}

/// Drives the imaging engine through a dirty pass and successive clean passes.
///
/// Pass `n` writes its products under `<imagename>.iter<n>` and starts from the model of pass
/// `n - 1`, so every pass can be inspected afterwards.
pub struct IterationSequence<'a> {
    imagename: String,
    shape: (usize, usize),
    base_args: EngineArgs,
    config: CleanConfig,
    heuristic: &'a dyn MaskThresholdHeuristic,
    stop: &'a dyn StopPredicate,
    store: &'a dyn ImageStore,
    state: IterationState,
}

impl<'a> IterationSequence<'a> {
    /// A sequence imaging into `imagename` with `shape = (height, width)`. `base_args` are
    /// passed on every imaging call.
    pub fn new(
        imagename: impl Into<String>,
        shape: (usize, usize),
        base_args: EngineArgs,
        config: CleanConfig,
        heuristic: &'a dyn MaskThresholdHeuristic,
        stop: &'a dyn StopPredicate,
        store: &'a dyn ImageStore,
    ) -> Self {
        Self {
            imagename: imagename.into(),
            shape,
            base_args,
            config,
            heuristic,
            stop,
            store,
            state: IterationState::new(),
        }
    }

    /// Progress so far.
    pub fn state(&self) -> &IterationState {
        &self.state
    }

    /// The products pass `iteration` writes.
    pub fn products_for(&self, iteration: usize) -> ImageProducts {
        ImageProducts::new(&format!("{}.iter{}", self.imagename, iteration))
    }

    fn pass_job(&self, iteration: usize, mask: Value, threshold: f64) -> Job {
        let products = self.products_for(iteration);
        let mut args = self.base_args.clone();
        args.insert("imagename".into(), json!(products.imagename));
        args.insert(
            "niter".into(),
            json!(if iteration == 0 { 0 } else { self.config.niter }),
        );
        args.insert("threshold".into(), json!(format!("{threshold}Jy")));
        args.insert("mask".into(), mask);
        if iteration > 0 {
            args.insert(
                "startmodel".into(),
                json!(self.products_for(iteration - 1).model),
            );
        }
        args.insert("calcres".into(), json!(true));
        args.insert("calcpsf".into(), json!(true));
        args.insert("restoration".into(), json!(false));
        Job::new(&self.config.command, args)
    }

    /// The call that makes the dirty image.
    pub fn dirty_job(&self) -> Job {
        self.pass_job(0, json!(""), 0.0)
    }

    /// The call that restores the model of pass `iteration` without further cleaning.
    pub fn restore_job(&self, iteration: usize) -> Job {
        let mut args = self.base_args.clone();
        args.insert(
            "imagename".into(),
            json!(self.products_for(iteration).imagename),
        );
        args.insert("niter".into(), json!(0));
        args.insert("calcres".into(), json!(false));
        args.insert("calcpsf".into(), json!(false));
        args.insert("restoration".into(), json!(true));
        Job::new(&self.config.command, args)
    }

    fn run_pass(
        &mut self,
        executor: &mut Executor,
        iteration: usize,
        mask: Option<Mask>,
        threshold: f64,
    ) -> Result<(), CleanError> {
        let products = self.products_for(iteration);
        let mask_arg = match &mask {
            None => json!(""),
            Some(mask) => match mask.to_region() {
                Some(region) => json!(region),
                None => {
                    let name = format!("{}.mask", products.imagename);
                    self.store
                        .write_image(&name, mask.to_image().view(), executor)?;
                    json!(name)
                }
            },
        };
        let job = self.pass_job(iteration, mask_arg, threshold);
        info!(
            "{}: pass {} to threshold {:.3e}",
            self.imagename, iteration, threshold
        );
        executor
            .call(&job)
            .map_err(|source| CleanError::Engine {
                job: job.to_string(),
                source,
            })?;

        let model = self.store.read_image(&products.model, executor)?;
        let residual = self.store.read_image(&products.residual, executor)?;
        if residual.dim() != self.shape {
            return Err(CleanError::ShapeMismatch {
                name: products.residual,
                found: residual.dim(),
                expected: self.shape,
            });
        }
        let stats = IterationStats::compute(
            iteration,
            threshold,
            &products.residual,
            model.view(),
            residual.view(),
            mask.as_ref(),
        )?;
        debug!(
            "{}: pass {} peak {:.3e}, robust rms {:.3e}, model flux {:.3e}",
            self.imagename, iteration, stats.residual_max, stats.residual_robust_rms, stats.model_sum
        );

        self.state.iteration = iteration;
        self.state.history.push(stats);
        self.state.products.push(products);
        self.state.mask = mask;
        self.state.threshold = threshold;
        Ok(())
    }

    fn next_mask_and_threshold(
        &self,
        executor: &mut Executor,
    ) -> Result<(Mask, f64), CleanError> {
        let products = self.products_for(self.state.iteration);
        let residual = self.store.read_image(&products.residual, executor)?;
        let flux = if self.store.exists(&products.pb) {
            Some(self.store.read_image(&products.pb, executor)?)
        } else {
            None
        };
        let inputs = MaskInputs {
            shape: self.shape,
            residual: residual.view(),
            flux: flux.as_ref().map(|pb| pb.view()),
        };
        Ok(self
            .heuristic
            .derive_mask_and_threshold(&self.state.history, &inputs))
    }

    /// Run the sequence to completion.
    ///
    /// # Errors
    ///
    /// Returns an [`IterationFatalError`] naming the pass that failed. Nothing is retried.
    pub fn run(mut self, executor: &mut Executor) -> Result<IterationState, IterationFatalError> {
        let imagename = self.imagename.clone();
        let fatal = |iteration: usize, cause: CleanError| IterationFatalError {
            imagename: imagename.clone(),
            iteration,
            cause,
        };

        self.state.state = SequenceState::Iterating;
        self.run_pass(executor, 0, None, 0.0)
            .map_err(|cause| fatal(0, cause))?;

        let reason = loop {
            let iteration = self.state.iteration;
            if !self.stop.should_continue(&self.state.history) {
                break StopReason::StopRule;
            }
            if iteration >= self.config.max_passes {
                break StopReason::PassLimit;
            }
            let next = iteration + 1;
            let (mask, threshold) = self
                .next_mask_and_threshold(executor)
                .map_err(|cause| fatal(next, cause))?;
            self.run_pass(executor, next, Some(mask), threshold)
                .map_err(|cause| fatal(next, cause))?;
        };
        self.state.stop_reason = Some(reason);
        match reason {
            StopReason::StopRule => {
                self.state.state = SequenceState::Converged;
                info!(
                    "{}: converged after {} clean passes",
                    self.imagename, self.state.iteration
                );
            }
            StopReason::PassLimit => {
                self.state.state = SequenceState::Exhausted;
                warn!(
                    "{}: stopping at the limit of {} clean passes before converging",
                    self.imagename, self.config.max_passes
                );
            }
        }

        if self.config.restore {
            let iteration = self.state.iteration;
            let job = self.restore_job(iteration);
            executor.call(&job).map_err(|source| {
                fatal(
                    iteration,
                    CleanError::Engine {
                        job: job.to_string(),
                        source,
                    },
                )
            })?;
        }
        self.state.state = SequenceState::Done;
        Ok(self.state)
    }
}
