//! Pluggable decisions of a clean sequence: where to clean, how deep, and when to stop.

use std::fmt::{Display, Formatter};

use derive_builder::Builder;
use log::{debug, info};
use ndarray::ArrayView2;

use super::{IterationStats, Mask};

/// The images a mask heuristic may look at.
#[derive(Debug, Clone, Copy)]
pub struct MaskInputs<'a> {
    /// `(height, width)` of the images.
    pub shape: (usize, usize),
    /// Residual of the latest pass.
    pub residual: ArrayView2<'a, f32>,
    /// Primary beam, if the engine made one.
    pub flux: Option<ArrayView2<'a, f32>>,
}

/// Chooses the mask and threshold for the next clean pass.
pub trait MaskThresholdHeuristic {
    /// The mask and threshold for the pass after `history.last()`.
    fn derive_mask_and_threshold(&self, history: &[IterationStats], inputs: &MaskInputs)
        -> (Mask, f64);
}

/// Decides whether another clean pass is worthwhile.
pub trait StopPredicate {
    /// Whether to run another pass given every pass so far.
    fn should_continue(&self, history: &[IterationStats]) -> bool;
}

/// Masks where the primary beam is above `pblimit`, falling back to the central quarter of the
/// image, and cleans down to `threshold_sigma` times the robust residual rms.
#[derive(Builder, Debug, Clone)]
pub struct BeamMaskHeuristic {
    /// Primary beam level bounding the mask.
    #[builder(default = "0.2")]
    pub pblimit: f32,
    /// Threshold in units of the residual robust rms.
    #[builder(default = "4.0")]
    pub threshold_sigma: f64,
}

impl Default for BeamMaskHeuristic {
    fn default() -> Self {
        Self {
            pblimit: 0.2,
            threshold_sigma: 4.0,
        }
    }
}

impl Display for BeamMaskHeuristic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "mask above pb {}, threshold {} sigma",
            self.pblimit, self.threshold_sigma
        )
    }
}

impl MaskThresholdHeuristic for BeamMaskHeuristic {
    fn derive_mask_and_threshold(
        &self,
        history: &[IterationStats],
        inputs: &MaskInputs,
    ) -> (Mask, f64) {
        let mask = match inputs.flux {
            Some(flux) if flux.dim() == inputs.shape => {
                let mask = Mask::from_threshold(flux, self.pblimit);
                if mask.is_empty() {
                    debug!("primary beam never exceeds {}, using central quarter", self.pblimit);
                    Mask::central_quarter(inputs.shape)
                } else {
                    mask
                }
            }
            _ => Mask::central_quarter(inputs.shape),
        };
        let rms = history.last().map_or(0.0, |s| s.residual_robust_rms);
        let mut threshold = self.threshold_sigma * rms;
        // never clean shallower than the previous pass
        if let Some(previous) = history.iter().rev().map(|s| s.threshold).find(|&t| t > 0.0) {
            threshold = threshold.min(previous);
        }
        (mask, threshold)
    }
}

/// Stops when the residual peak sinks into the noise, the peak stops improving, or the pass
/// count is reached.
#[derive(Builder, Debug, Clone)]
pub struct PeakOverRmsStop {
    /// Continue while the residual peak is at least this many robust rms.
    #[builder(default = "5.0")]
    pub min_peak_over_rms: f64,
    /// Most clean passes after the dirty image. Reaching it counts as the stop rule firing,
    /// unlike [`CleanConfig::max_passes`](crate::clean::CleanConfig::max_passes).
    #[builder(default = "5")]
    pub max_iterations: usize,
}

impl Default for PeakOverRmsStop {
    fn default() -> Self {
        Self {
            min_peak_over_rms: 5.0,
            max_iterations: 5,
        }
    }
}

impl StopPredicate for PeakOverRmsStop {
    fn should_continue(&self, history: &[IterationStats]) -> bool {
        let latest = match history.last() {
            Some(latest) => latest,
            None => return true,
        };
        if latest.iteration >= self.max_iterations {
            info!("stop rule budget of {} clean passes spent", self.max_iterations);
            return false;
        }
        if latest.peak_over_rms < self.min_peak_over_rms {
            debug!(
                "residual peak is {:.2} rms, below {:.2}",
                latest.peak_over_rms, self.min_peak_over_rms
            );
            return false;
        }
        if latest.threshold > 0.0 && latest.residual_max <= latest.threshold {
            debug!("nothing left above threshold {}", latest.threshold);
            return false;
        }
        if let [.., previous, _] = history {
            if previous.iteration > 0 && latest.residual_max >= previous.residual_max {
                debug!("residual peak did not improve on iteration {}", previous.iteration);
                return false;
            }
        }
        true
    }
}
