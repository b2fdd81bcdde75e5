//! Automatic thresholding algorithms
//!
//! Otsu's method for bimodal histograms, a Gaussian fit to the lower
//! (background) mode, and percentile helpers used by fractional thresholds.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Number of histogram bins used by every histogram-based threshold
pub const HISTOGRAM_BINS: usize = 256;

/// Histogram threshold selection method
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdAlgorithm {
    Otsu,
    Gaussian,
}

impl ThresholdAlgorithm {
    /// Factor used when none is configured
    pub fn default_factor(self) -> f64 {
        match self {
            ThresholdAlgorithm::Otsu => 1.0,
            ThresholdAlgorithm::Gaussian => 3.0,
        }
    }
}

/// Threshold `values` with the given algorithm
///
/// `otsu` returns the Otsu threshold multiplied by `factor`. `gaussian`
/// fits a normal distribution to the lower mode and returns
/// `mean + factor * sigma`. The result is clamped to the data range.
pub fn histogram_threshold(values: &[f64], algorithm: ThresholdAlgorithm, factor: f64) -> f64 {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return 0.0;
    }
    let (min_val, max_val) = min_max(&finite);

    let threshold = match algorithm {
        ThresholdAlgorithm::Otsu => otsu_threshold(&finite, HISTOGRAM_BINS) * factor,
        ThresholdAlgorithm::Gaussian => {
            let (mean, sigma) = fit_lower_mode(&finite, HISTOGRAM_BINS);
            mean + factor * sigma
        }
    };
    threshold.clamp(min_val, max_val)
}

fn min_max(data: &[f64]) -> (f64, f64) {
    let min_val = data.iter().fold(f64::MAX, |a, &b| a.min(b));
    let max_val = data.iter().fold(f64::MIN, |a, &b| a.max(b));
    (min_val, max_val)
}

/// Otsu's method for automatic threshold selection
///
/// Finds the threshold that maximizes inter-class variance. Operates on
/// all values including zeros and returns the threshold at a bin edge.
pub fn otsu_threshold(data: &[f64], num_bins: usize) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let (min_val, max_val) = min_max(data);
    if (max_val - min_val).abs() < 1e-10 {
        return min_val;
    }

    let bin_width = (max_val - min_val) / num_bins as f64;
    let histogram = build_histogram(data, min_val, bin_width, num_bins);
    let total = data.len() as f64;

    let sum_total: f64 = histogram.iter().enumerate().map(|(i, &c)| i as f64 * c as f64).sum();

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut max_variance = 0.0;
    let mut optimal_bin = 0;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }

        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_total - sum_background) / weight_foreground;

        let variance = weight_background * weight_foreground * (mean_background - mean_foreground).powi(2);
        if variance > max_variance {
            max_variance = variance;
            optimal_bin = t;
        }
    }

    // Upper edge of the background class
    min_val + (optimal_bin + 1) as f64 * bin_width
}

fn build_histogram(data: &[f64], min_val: f64, bin_width: f64, num_bins: usize) -> Vec<usize> {
    let mut histogram = vec![0usize; num_bins];
    for &v in data {
        let bin = ((v - min_val) / bin_width).floor() as usize;
        histogram[bin.min(num_bins - 1)] += 1;
    }
    histogram
}

/// Fit a normal distribution to the lower mode of the histogram
///
/// The mode is the most populated bin below the Otsu split. Sigma comes
/// from the samples at or below the mode, mirrored about it, so the upper
/// (tissue) mode does not inflate the estimate.
///
/// # Returns
/// (mean, sigma)
pub fn fit_lower_mode(data: &[f64], num_bins: usize) -> (f64, f64) {
    if data.is_empty() {
        return (0.0, 0.0);
    }
    let (min_val, max_val) = min_max(data);
    if (max_val - min_val).abs() < 1e-10 {
        return (min_val, 0.0);
    }

    let bin_width = (max_val - min_val) / num_bins as f64;
    let histogram = build_histogram(data, min_val, bin_width, num_bins);

    let split = otsu_threshold(data, num_bins);
    let split_bin = (((split - min_val) / bin_width).floor() as usize).clamp(1, num_bins);

    let mode_bin = histogram[..split_bin]
        .iter()
        .enumerate()
        .max_by_key(|(_, &c)| c)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mean = min_val + (mode_bin as f64 + 0.5) * bin_width;

    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for &v in data.iter().filter(|&&v| v <= mean) {
        sum_sq += (v - mean) * (v - mean);
        count += 1;
    }
    let sigma = if count > 0 { (sum_sq / count as f64).sqrt() } else { 0.0 };
    // A mode sitting on the data minimum has no lower tail; fall back to bin width
    (mean, sigma.max(bin_width))
}

/// Percentile (0-100) of finite values using nearest-rank on sorted data
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = (p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}
