//! Phase-domain numerics
//!
//! Scaling raw phase to radians, oblique-to-axial resampling through the
//! complex signal, conversions between phase, frequency and normalized
//! field, and magnitude-weighted multi-echo B0 fitting.

use std::f64::consts::PI;

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{QsmError, Result};
use crate::utils::resample::{resample_affine, Interpolation};
use crate::volume::{apply_affine, closest_axes, obliquity_norm, Affine, DataType, Volume};

pub(crate) const TWO_PI: f64 = 2.0 * PI;

/// Proton gyromagnetic ratio, Hz/T
pub const GYROMAGNETIC_RATIO: f64 = 42.58e6;

/// How close min/max must be to ∓π for phase to count as already scaled
pub const SCALE_TOLERANCE: f64 = 0.01;

/// Obliquity (degrees) above which volumes are resampled to axial
pub const DEFAULT_OBLIQUITY_THRESHOLD: f64 = 10.0;

/// Echo time used to synthesize a pseudo-phase from a combined field map
pub const PSEUDO_PHASE_TE: f64 = 0.005;

/// Wrap angle to (-π, π]
#[inline]
pub fn wrap_to_pi(angle: f64) -> f64 {
    let a = (angle + PI).rem_euclid(TWO_PI) - PI;
    if a <= -PI {
        a + TWO_PI
    } else {
        a
    }
}

/// Units the dipole inversion expects its field input in
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NormalizationScale {
    /// Field in ppm
    Ppm,
    /// Field in ppm·2π
    PpmTwoPi,
}

impl NormalizationScale {
    /// Factor applied to unwrapped phase (radians)
    pub fn phase_factor(self) -> f64 {
        match self {
            NormalizationScale::Ppm => 1e6 / TWO_PI,
            NormalizationScale::PpmTwoPi => 1e6,
        }
    }

    /// Factor applied to a frequency map (Hz)
    pub fn frequency_factor(self) -> f64 {
        match self {
            NormalizationScale::Ppm => 1e6,
            NormalizationScale::PpmTwoPi => TWO_PI * 1e6,
        }
    }
}

fn float_dtype(dtype: DataType) -> DataType {
    if dtype.is_integral() {
        DataType::Float32
    } else {
        dtype
    }
}

/// Map phase linearly onto [-π, π]
///
/// Phase already spanning [-π, π] (within 0.01 rad at both ends) is
/// returned unchanged, as is constant phase. Float dtypes are kept;
/// integer-coded phase (e.g. vendor int16 ranges) becomes float32.
pub fn scale_to_pi(phase: &Volume) -> Volume {
    let (lo, hi) = phase.min_max();
    let already_scaled = (lo + PI).abs() <= SCALE_TOLERANCE && (hi - PI).abs() <= SCALE_TOLERANCE;
    if already_scaled || (hi - lo).abs() < 1e-12 {
        return phase.clone().with_dtype(float_dtype(phase.dtype));
    }
    let span = hi - lo;
    let data = phase
        .data
        .iter()
        .map(|&v| (v - lo) / span * TWO_PI - PI)
        .collect();
    phase.with_data(data).with_dtype(float_dtype(phase.dtype))
}

/// Resample magnitude and phase through their complex signal
///
/// Real and imaginary parts are interpolated separately so that phase
/// wraps do not smear; phase is recovered with `atan2` and magnitude as the
/// modulus. Integral magnitudes are rounded.
pub fn complex_resample(
    mag: &Volume,
    phase: &Volume,
    target_affine: &Affine,
    target_dims: (usize, usize, usize),
) -> Result<(Volume, Volume)> {
    mag.check_same_grid(phase, "complex_resample")?;

    let signal: Vec<Complex64> = mag
        .data
        .iter()
        .zip(&phase.data)
        .map(|(&m, &p)| Complex64::from_polar(m, p))
        .collect();
    let real = mag.with_data(signal.iter().map(|c| c.re).collect());
    let imag = mag.with_data(signal.iter().map(|c| c.im).collect());

    let real = resample_affine(&real, target_affine, target_dims, Interpolation::Continuous)?;
    let imag = resample_affine(&imag, target_affine, target_dims, Interpolation::Continuous)?;

    let resampled: Vec<Complex64> = real
        .data
        .iter()
        .zip(&imag.data)
        .map(|(&re, &im)| Complex64::new(re, im))
        .collect();

    let round = mag.dtype.is_integral();
    let mag_data = resampled
        .iter()
        .map(|c| if round { c.norm().round() } else { c.norm() })
        .collect();
    let phase_data = resampled.iter().map(|c| c.im.atan2(c.re)).collect();

    let mag_out = real.with_data(mag_data).with_dtype(mag.dtype);
    let phase_out = real.with_data(phase_data).with_dtype(float_dtype(phase.dtype));
    Ok((mag_out, phase_out))
}

/// Result of an axial resample
#[derive(Clone, Debug)]
pub struct AxialResampled {
    pub magnitude: Option<Volume>,
    pub phase: Volume,
    /// false when the inputs were below the obliquity threshold
    pub resampled: bool,
}

/// Axis-aligned affine covering the same field of view as `affine`
///
/// Each world axis takes the voxel size and dimension of its closest image
/// axis, keeps that axis's direction sign, and the grid is centred on the
/// source field of view.
pub fn canonical_axial_affine(affine: &Affine, dims: (usize, usize, usize)) -> (Affine, (usize, usize, usize)) {
    let axes = closest_axes(affine);
    let src_dims = [dims.0, dims.1, dims.2];
    let col_norm = |c: usize| {
        (affine[c] * affine[c] + affine[4 + c] * affine[4 + c] + affine[8 + c] * affine[8 + c]).sqrt()
    };

    let centre = apply_affine(
        affine,
        [
            (dims.0 as f64 - 1.0) / 2.0,
            (dims.1 as f64 - 1.0) / 2.0,
            (dims.2 as f64 - 1.0) / 2.0,
        ],
    );

    let mut out = [0.0; 16];
    let mut new_dims = [0usize; 3];
    for r in 0..3 {
        let c = axes[r];
        let sign = if affine[r * 4 + c] < 0.0 { -1.0 } else { 1.0 };
        let step = sign * col_norm(c);
        new_dims[r] = src_dims[c];
        out[r * 4 + r] = step;
        out[r * 4 + 3] = centre[r] - step * (new_dims[r] as f64 - 1.0) / 2.0;
    }
    out[15] = 1.0;
    (out, (new_dims[0], new_dims[1], new_dims[2]))
}

/// Resample oblique acquisitions onto an axial grid
///
/// Inputs whose obliquity norm is below `obliquity_threshold_deg` are
/// returned unchanged. Without a magnitude, unit magnitude is used for the
/// complex interpolation.
pub fn axial_resample(
    mag: Option<&Volume>,
    phase: &Volume,
    obliquity_threshold_deg: f64,
) -> Result<AxialResampled> {
    if obliquity_norm(&phase.affine) < obliquity_threshold_deg {
        return Ok(AxialResampled {
            magnitude: mag.cloned(),
            phase: phase.clone(),
            resampled: false,
        });
    }

    let (target, dims) = canonical_axial_affine(&phase.affine, phase.dims);
    let unit;
    let mag_in = match mag {
        Some(m) => m,
        None => {
            unit = phase.with_data(vec![1.0; phase.n_voxels()]);
            &unit
        }
    };
    let (mag_out, phase_out) = complex_resample(mag_in, phase, &target, dims)?;
    Ok(AxialResampled {
        magnitude: mag.map(|_| mag_out),
        phase: phase_out,
        resampled: true,
    })
}

/// Unwrapped phase (rad) to normalized field
///
/// `normalized = phase * scale_factor / (γ * B0 * TE)`
pub fn phase_to_normalized(phase_unwrapped: &Volume, te: f64, b0: f64, scale_factor: f64) -> Result<Volume> {
    check_positive("echo time", te)?;
    check_positive("field strength", b0)?;
    let k = scale_factor / (GYROMAGNETIC_RATIO * b0 * te);
    Ok(phase_unwrapped
        .with_data(phase_unwrapped.data.iter().map(|&p| p * k).collect())
        .with_dtype(DataType::Float32))
}

/// Frequency (Hz) to normalized field
///
/// `normalized = frequency * scale_factor / (γ * B0)`
pub fn freq_to_normalized(frequency: &Volume, b0: f64, scale_factor: f64) -> Result<Volume> {
    check_positive("field strength", b0)?;
    let k = scale_factor / (GYROMAGNETIC_RATIO * b0);
    Ok(frequency
        .with_data(frequency.data.iter().map(|&f| f * k).collect())
        .with_dtype(DataType::Float32))
}

/// Frequency (Hz) to phase (rad) at echo time `te`, optionally wrapped
pub fn freq_to_phase(frequency: &Volume, te: f64, wraps: bool) -> Volume {
    let data = frequency
        .data
        .iter()
        .map(|&f| {
            let p = TWO_PI * f * te;
            if wraps {
                wrap_to_pi(p)
            } else {
                p
            }
        })
        .collect();
    frequency.with_data(data).with_dtype(DataType::Float32)
}

/// Phase (rad) at echo time `te` to frequency (Hz)
pub fn phase_to_freq(phase: &Volume, te: f64) -> Result<Volume> {
    check_positive("echo time", te)?;
    let k = 1.0 / (TWO_PI * te);
    Ok(phase
        .with_data(phase.data.iter().map(|&p| p * k).collect())
        .with_dtype(DataType::Float32))
}

fn check_positive(what: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(QsmError::Input(format!("{} must be positive, got {}", what, value)))
    }
}

/// Output of multi-echo B0 combination
#[derive(Clone, Debug)]
pub struct CombinedB0 {
    /// Field map in rad/s
    pub b0: Volume,
    /// Fitted unwrapped phase at the shortest echo time
    pub phase: Volume,
}

/// Combine unwrapped multi-echo phase into a single field map
///
/// Fits `phase = offset + slope * TE` per voxel by weighted least squares
/// with the echo magnitudes as weights (unit weights without magnitude).
/// A single echo has no offset degree of freedom and is fitted through
/// the origin.
pub fn combine_echoes_b0(
    phases: &[Volume],
    magnitudes: Option<&[Volume]>,
    tes: &[f64],
) -> Result<CombinedB0> {
    let first = phases
        .first()
        .ok_or_else(|| QsmError::Input("no echoes to combine".to_string()))?;
    if tes.len() != phases.len() {
        return Err(QsmError::Input(format!(
            "{} echo times for {} phase volumes",
            tes.len(),
            phases.len()
        )));
    }
    for &te in tes {
        check_positive("echo time", te)?;
    }
    for (e, p) in phases.iter().enumerate().skip(1) {
        first.check_same_grid(p, &format!("phase echo {}", e + 1))?;
    }
    if let Some(mags) = magnitudes {
        if mags.len() != phases.len() {
            return Err(QsmError::Input(format!(
                "{} magnitude volumes for {} phase volumes",
                mags.len(),
                phases.len()
            )));
        }
        for (e, m) in mags.iter().enumerate() {
            first.check_same_grid(m, &format!("magnitude echo {}", e + 1))?;
        }
    }

    let n_echoes = phases.len();
    let n_total = first.n_voxels();
    let te_min = tes.iter().copied().fold(f64::INFINITY, f64::min);
    let weight = |e: usize, v: usize| magnitudes.map_or(1.0, |m| m[e].data[v].abs());

    let mut field = vec![0.0; n_total];
    let mut combined = vec![0.0; n_total];

    for v in 0..n_total {
        if n_echoes == 1 {
            field[v] = phases[0].data[v] / tes[0];
            combined[v] = phases[0].data[v];
            continue;
        }

        // Weighted fit with intercept on centred data
        let mut sum_w = 0.0;
        let mut sum_w_te = 0.0;
        let mut sum_w_phase = 0.0;
        for e in 0..n_echoes {
            let w = weight(e, v);
            sum_w += w;
            sum_w_te += w * tes[e];
            sum_w_phase += w * phases[e].data[v];
        }
        if sum_w < 1e-10 {
            continue;
        }
        let te_mean = sum_w_te / sum_w;
        let phase_mean = sum_w_phase / sum_w;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for e in 0..n_echoes {
            let w = weight(e, v);
            let dte = tes[e] - te_mean;
            sxx += w * dte * dte;
            sxy += w * dte * (phases[e].data[v] - phase_mean);
        }
        if sxx > 1e-20 {
            let slope = sxy / sxx;
            let intercept = phase_mean - slope * te_mean;
            field[v] = slope;
            combined[v] = intercept + slope * te_min;
        }
    }

    Ok(CombinedB0 {
        b0: first.with_data(field).with_dtype(DataType::Float32),
        phase: first.with_data(combined).with_dtype(DataType::Float32),
    })
}
