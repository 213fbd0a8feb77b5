//! Image statistics which drive the clean heuristics.

use ndarray::{ArrayView2, Zip};
use serde::Serialize;

use super::{CleanError, Mask};

/// Scale from median absolute deviation to standard deviation for gaussian noise.
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of `values`, reordering them. The mean of the middle two for even lengths.
pub fn median(values: &mut [f64]) -> Option<f64> {
    let n = values.len();
    if n == 0 {
        return None;
    }
    let mid = n / 2;
    let (lower, upper, _) = values.select_nth_unstable_by(mid, f64::total_cmp);
    let upper = *upper;
    if n % 2 == 1 {
        Some(upper)
    } else {
        // the largest of the lower half is the other middle value
        let below = lower.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some((below + upper) / 2.0)
    }
}

/// Noise estimate that ignores bright outliers: `1.4826 * median(|x - median(x)|)`.
pub fn robust_rms(values: &[f64]) -> Option<f64> {
    let mut work = values.to_vec();
    let centre = median(&mut work)?;
    for v in work.iter_mut() {
        *v = (*v - centre).abs();
    }
    median(&mut work).map(|mad| MAD_TO_SIGMA * mad)
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    Some((values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt())
}

/// Root mean square.
pub fn rms(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some((values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt())
}

/// Statistics of one clean pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationStats {
    /// Pass number, 0 for the dirty image.
    pub iteration: usize,
    /// Threshold the pass cleaned to, 0 for the dirty image.
    pub threshold: f64,
    /// Total flux in the model.
    pub model_sum: f64,
    /// Brightest residual pixel.
    pub residual_max: f64,
    /// Faintest residual pixel.
    pub residual_min: f64,
    /// Robust noise estimate of the residual.
    pub residual_robust_rms: f64,
    /// `residual_max / residual_robust_rms`.
    pub peak_over_rms: f64,
    /// RMS of the residual inside the clean mask, if there was one.
    pub rms_inside_mask: Option<f64>,
    /// RMS of the residual outside the clean mask, or of the whole residual.
    pub rms_outside_mask: f64,
    /// Pixels in the clean mask.
    pub mask_pixels: usize,
}

impl IterationStats {
    /// Take statistics from the model and residual of pass `iteration`. Non-finite residual
    /// pixels, e.g. outside the primary beam, are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CleanError::ShapeMismatch`] if the images or mask differ in shape, or
    /// [`CleanError::NoFinitePixels`] if the residual is blank.
    pub fn compute(
        iteration: usize,
        threshold: f64,
        residual_name: &str,
        model: ArrayView2<f32>,
        residual: ArrayView2<f32>,
        mask: Option<&Mask>,
    ) -> Result<Self, CleanError> {
        if model.dim() != residual.dim() {
            return Err(CleanError::ShapeMismatch {
                name: residual_name.to_string(),
                found: residual.dim(),
                expected: model.dim(),
            });
        }
        if let Some(mask) = mask {
            if mask.shape() != residual.dim() {
                return Err(CleanError::ShapeMismatch {
                    name: residual_name.to_string(),
                    found: residual.dim(),
                    expected: mask.shape(),
                });
            }
        }

        let mut all = Vec::with_capacity(residual.len());
        let mut inside = vec![];
        let mut outside = vec![];
        match mask {
            Some(mask) => Zip::from(residual)
                .and(mask.pixels())
                .for_each(|&value, &masked| {
                    if value.is_finite() {
                        all.push(value as f64);
                        if masked {
                            inside.push(value as f64);
                        } else {
                            outside.push(value as f64);
                        }
                    }
                }),
            None => residual
                .iter()
                .filter(|v| v.is_finite())
                .for_each(|&v| all.push(v as f64)),
        }

        let no_pixels = || CleanError::NoFinitePixels {
            name: residual_name.to_string(),
        };
        let residual_max = all.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let residual_min = all.iter().copied().fold(f64::INFINITY, f64::min);
        let residual_robust_rms = robust_rms(&all).ok_or_else(no_pixels)?;
        let peak_over_rms = if residual_robust_rms > 0.0 {
            residual_max / residual_robust_rms
        } else if residual_max > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };
        let rms_outside_mask = match mask {
            Some(_) => rms(&outside).unwrap_or(0.0),
            None => rms(&all).ok_or_else(no_pixels)?,
        };

        Ok(Self {
            iteration,
            threshold,
            model_sum: model.iter().filter(|v| v.is_finite()).map(|&v| v as f64).sum(),
            residual_max,
            residual_min,
            residual_robust_rms,
            peak_over_rms,
            rms_inside_mask: mask.map(|_| rms(&inside).unwrap_or(0.0)),
            rms_outside_mask,
            mask_pixels: mask.map_or(0, Mask::count),
        })
    }
}
