//! Masking engine
//!
//! Builds a (tight, filled) mask pair per echo. The tight mask is the
//! thresholded weight volume; the filled mask has holes closed and is
//! optionally unioned with a BET mask. Both are eroded by the same number
//! of iterations, so `tight ⊆ filled` holds throughout.

use tracing::debug;

use crate::config::{FillingAlgorithm, ThresholdMode};
use crate::error::{QsmError, Result};
use crate::utils::morphology::{count, erode_binary, fill_holes_morphological, is_subset, union};
use crate::utils::threshold::{histogram_threshold, percentile, ThresholdAlgorithm};
use crate::volume::Volume;

/// Percentile that fractional thresholds are relative to
pub const REFERENCE_PERCENTILE: f64 = 98.0;

/// Binary masks for one echo
#[derive(Clone, Debug, PartialEq)]
pub struct MaskPair {
    pub tight: Vec<u8>,
    pub filled: Vec<u8>,
}

/// How the threshold for a weight volume is chosen
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ThresholdChoice {
    /// Fraction of the 98th percentile of the weights
    Fraction(f64),
    /// Absolute weight value
    Absolute(f64),
    /// Histogram-based selection
    Histogram { algorithm: ThresholdAlgorithm, factor: f64 },
}

impl ThresholdChoice {
    /// Interpret a configured `threshold_value` under `mode`
    pub fn from_options(
        value: Option<f64>,
        mode: ThresholdMode,
        algorithm: ThresholdAlgorithm,
        factor: f64,
    ) -> Self {
        match (value, mode) {
            (None, _) => ThresholdChoice::Histogram { algorithm, factor },
            (Some(v), ThresholdMode::Absolute) => ThresholdChoice::Absolute(v),
            (Some(v), ThresholdMode::Fraction) if v > 1.0 => ThresholdChoice::Fraction(v / 100.0),
            (Some(v), ThresholdMode::Fraction) => ThresholdChoice::Fraction(v),
            (Some(v), ThresholdMode::Auto) if v > 1.0 => ThresholdChoice::Absolute(v),
            (Some(v), ThresholdMode::Auto) => ThresholdChoice::Fraction(v),
        }
    }

    /// Threshold in the units of `values`
    pub fn select(&self, values: &[f64]) -> f64 {
        match *self {
            ThresholdChoice::Fraction(f) => f * percentile(values, REFERENCE_PERCENTILE),
            ThresholdChoice::Absolute(v) => v,
            ThresholdChoice::Histogram { algorithm, factor } => histogram_threshold(values, algorithm, factor),
        }
    }
}

/// Parameters of threshold-based mask construction
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaskingParams {
    pub threshold: ThresholdChoice,
    pub filling: FillingAlgorithm,
    pub fill_strength: usize,
    pub erosions: usize,
}

/// Where masks come from for a Run
#[derive(Clone, Copy, Debug)]
pub enum MaskSource<'a> {
    /// User-supplied masks, one per echo
    Existing(&'a [Volume]),
    /// Threshold per-echo weights; `bet` is unioned into the filled mask
    Threshold {
        weights: &'a [Volume],
        bet: Option<&'a Volume>,
    },
    /// BET masks, one per echo or a single first-echo mask to broadcast
    Bet { masks: &'a [Volume], n_echoes: usize },
}

/// Mask pair from a weight volume
pub fn threshold_pair(weight: &Volume, bet: Option<&Volume>, params: &MaskingParams) -> Result<MaskPair> {
    let (nx, ny, nz) = weight.dims;
    let threshold = params.threshold.select(&weight.data);
    debug!(threshold, "masking threshold");

    let tight: Vec<u8> = weight
        .data
        .iter()
        .map(|&w| (w.is_finite() && w >= threshold) as u8)
        .collect();

    let mut filled = if params.filling.morphological() {
        fill_holes_morphological(&tight, nx, ny, nz, params.fill_strength)
    } else {
        tight.clone()
    };
    if let Some(bet) = bet {
        weight.check_same_grid(bet, "BET mask")?;
        filled = union(&filled, &bet.to_mask());
    }

    // eroding both keeps tight a subset of filled
    Ok(MaskPair {
        tight: erode_binary(&tight, nx, ny, nz, params.erosions),
        filled: erode_binary(&filled, nx, ny, nz, params.erosions),
    })
}

/// Mask pair from a single supplied mask: both members are the eroded mask
pub fn fixed_pair(mask: &Volume, erosions: usize) -> MaskPair {
    let (nx, ny, nz) = mask.dims;
    let eroded = erode_binary(&mask.to_mask(), nx, ny, nz, erosions);
    MaskPair { tight: eroded.clone(), filled: eroded }
}

/// Compute one mask pair per echo
///
/// Fails with `MaskingFailed` when any filled mask is empty.
pub fn compute_masks(source: MaskSource<'_>, params: &MaskingParams) -> Result<Vec<MaskPair>> {
    let pairs = match source {
        MaskSource::Existing(masks) => masks.iter().map(|m| fixed_pair(m, params.erosions)).collect(),
        MaskSource::Threshold { weights, bet } => weights
            .iter()
            .map(|w| threshold_pair(w, bet, params))
            .collect::<Result<Vec<_>>>()?,
        MaskSource::Bet { masks, n_echoes } => {
            let first = masks
                .first()
                .ok_or_else(|| QsmError::MaskingFailed("BET produced no mask".to_string()))?;
            if masks.len() == n_echoes {
                masks.iter().map(|m| fixed_pair(m, params.erosions)).collect()
            } else {
                vec![fixed_pair(first, params.erosions); n_echoes]
            }
        }
    };

    for (e, pair) in pairs.iter().enumerate() {
        if count(&pair.filled) == 0 {
            return Err(QsmError::MaskingFailed(format!("mask for echo {} is empty", e + 1)));
        }
        debug_assert!(is_subset(&pair.tight, &pair.filled));
    }
    Ok(pairs)
}
