//! In-process reconstruction stages
//!
//! Each stage reads its inputs from disk, computes, and writes its outputs;
//! nothing is shared in memory between stages.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{QsmError, Result};
use crate::masking::{compute_masks, MaskSource, MaskingParams};
use crate::nifti_io::{load, save, save_as};
use crate::phase::{
    axial_resample, canonical_axial_affine, combine_echoes_b0, freq_to_normalized, freq_to_phase,
    phase_to_normalized, scale_to_pi, TWO_PI,
};
use crate::sidecar::{read_sidecar, write_sidecar, Sidecar};
use crate::utils::average::{fuse_two_pass, nonzero_average};
use crate::utils::resample::{resample_affine, resample_like, Interpolation};
use crate::volume::{obliquity_norm, DataType, Volume};

/// Where the masking stage gets its masks from
#[derive(Clone, Debug, PartialEq)]
pub enum MaskInputs {
    /// Supplied masks, one per echo
    Existing(Vec<PathBuf>),
    /// Weight volumes to threshold; an optional BET mask to union in
    Threshold { weights: Vec<PathBuf>, bet: Option<PathBuf> },
    /// BET masks, per echo or first echo only
    Bet(Vec<PathBuf>),
}

/// A stage executed inside the pipeline process
#[derive(Clone, Debug, PartialEq)]
pub enum InternalStage {
    ScalePhase {
        input: PathBuf,
        output: PathBuf,
    },
    AxialResample {
        phase: PathBuf,
        magnitude: Option<PathBuf>,
        mask: Option<PathBuf>,
        obliquity_threshold: f64,
        phase_out: PathBuf,
        magnitude_out: Option<PathBuf>,
        mask_out: Option<PathBuf>,
    },
    ComputeMasks {
        inputs: MaskInputs,
        n_echoes: usize,
        params: MaskingParams,
        tight_out: Vec<PathBuf>,
        filled_out: Vec<PathBuf>,
    },
    CombineEchoes {
        phases: Vec<PathBuf>,
        magnitudes: Option<Vec<PathBuf>>,
        echo_times: Vec<f64>,
        /// Field map in Hz
        frequency_out: PathBuf,
        phase_out: PathBuf,
    },
    PhaseToNormalized {
        phase: PathBuf,
        echo_time: f64,
        field_strength: f64,
        scale_factor: f64,
        output: PathBuf,
    },
    FreqToNormalized {
        frequency: PathBuf,
        field_strength: f64,
        scale_factor: f64,
        output: PathBuf,
    },
    FreqToPhase {
        frequency: PathBuf,
        echo_time: f64,
        wraps: bool,
        output: PathBuf,
    },
    FuseTwoPass {
        tight: PathBuf,
        filled: PathBuf,
        output: PathBuf,
    },
    NonzeroAverage {
        inputs: Vec<PathBuf>,
        output: PathBuf,
    },
    ResampleLike {
        source: PathBuf,
        reference: PathBuf,
        output: PathBuf,
    },
    Publish {
        chi: PathBuf,
        sidecar: PathBuf,
        nifti_out: PathBuf,
        json_out: PathBuf,
    },
}

fn load_all(paths: &[PathBuf]) -> Result<Vec<Volume>> {
    paths.iter().map(|p| load(p)).collect()
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QsmError::io(parent, e))?;
    }
    std::fs::copy(from, to).map_err(|e| QsmError::io(from, e))?;
    Ok(())
}

impl InternalStage {
    pub fn run(&self) -> Result<()> {
        match self {
            InternalStage::ScalePhase { input, output } => {
                let phase = load(input)?;
                save(&scale_to_pi(&phase), output)
            }

            InternalStage::AxialResample {
                phase,
                magnitude,
                mask,
                obliquity_threshold,
                phase_out,
                magnitude_out,
                mask_out,
            } => run_axial_resample(
                phase,
                magnitude.as_deref(),
                mask.as_deref(),
                *obliquity_threshold,
                phase_out,
                magnitude_out.as_deref(),
                mask_out.as_deref(),
            ),

            InternalStage::ComputeMasks { inputs, n_echoes, params, tight_out, filled_out } => {
                run_compute_masks(inputs, *n_echoes, params, tight_out, filled_out)
            }

            InternalStage::CombineEchoes { phases, magnitudes, echo_times, frequency_out, phase_out } => {
                let phases = load_all(phases)?;
                let magnitudes = magnitudes.as_deref().map(load_all).transpose()?;
                let combined = combine_echoes_b0(&phases, magnitudes.as_deref(), echo_times)?;
                let hz = combined
                    .b0
                    .with_data(combined.b0.data.iter().map(|w| w / TWO_PI).collect());
                save(&hz, frequency_out)?;
                save(&combined.phase, phase_out)
            }

            InternalStage::PhaseToNormalized { phase, echo_time, field_strength, scale_factor, output } => {
                let unwrapped = load(phase)?;
                save(&phase_to_normalized(&unwrapped, *echo_time, *field_strength, *scale_factor)?, output)
            }

            InternalStage::FreqToNormalized { frequency, field_strength, scale_factor, output } => {
                let freq = load(frequency)?;
                save(&freq_to_normalized(&freq, *field_strength, *scale_factor)?, output)
            }

            InternalStage::FreqToPhase { frequency, echo_time, wraps, output } => {
                let freq = load(frequency)?;
                save(&freq_to_phase(&freq, *echo_time, *wraps), output)
            }

            InternalStage::FuseTwoPass { tight, filled, output } => {
                let fused = fuse_two_pass(&load(tight)?, &load(filled)?)?;
                save_as(&fused, output, DataType::Float32)
            }

            InternalStage::NonzeroAverage { inputs, output } => {
                let averaged = nonzero_average(&load_all(inputs)?)?;
                save_as(&averaged, output, DataType::Float32)
            }

            InternalStage::ResampleLike { source, reference, output } => {
                let resampled = resample_like(&load(source)?, &load(reference)?, Interpolation::Continuous)?;
                save_as(&resampled, output, DataType::Float32)
            }

            InternalStage::Publish { chi, sidecar, nifti_out, json_out } => {
                let chi = load(chi)?;
                save_as(&chi, nifti_out, DataType::Float32)?;
                let source = if sidecar.is_file() { read_sidecar(sidecar)? } else { Sidecar::default() };
                write_sidecar(&source.for_qsm_output(), json_out)
            }
        }
    }
}

fn run_axial_resample(
    phase_path: &Path,
    magnitude_path: Option<&Path>,
    mask_path: Option<&Path>,
    threshold: f64,
    phase_out: &Path,
    magnitude_out: Option<&Path>,
    mask_out: Option<&Path>,
) -> Result<()> {
    let phase = load(phase_path)?;
    let oblique = obliquity_norm(&phase.affine) >= threshold;

    if !oblique {
        debug!(phase = %phase_path.display(), "below obliquity threshold, copying inputs");
        copy_file(phase_path, phase_out)?;
        if let (Some(from), Some(to)) = (magnitude_path, magnitude_out) {
            copy_file(from, to)?;
        }
        if let (Some(from), Some(to)) = (mask_path, mask_out) {
            copy_file(from, to)?;
        }
        return Ok(());
    }

    let magnitude = magnitude_path.map(load).transpose()?;
    let resampled = axial_resample(magnitude.as_ref(), &phase, threshold)?;
    save(&resampled.phase, phase_out)?;
    if let (Some(mag), Some(to)) = (&resampled.magnitude, magnitude_out) {
        save(mag, to)?;
    }
    if let (Some(from), Some(to)) = (mask_path, mask_out) {
        let mask = load(from)?;
        let (target, dims) = canonical_axial_affine(&phase.affine, phase.dims);
        let resampled_mask = resample_affine(&mask, &target, dims, Interpolation::Nearest)?;
        save_as(&resampled_mask, to, DataType::Uint8)?;
    }
    Ok(())
}

fn run_compute_masks(
    inputs: &MaskInputs,
    n_echoes: usize,
    params: &MaskingParams,
    tight_out: &[PathBuf],
    filled_out: &[PathBuf],
) -> Result<()> {
    let (pairs, geometry) = match inputs {
        MaskInputs::Existing(paths) => {
            let masks = load_all(paths)?;
            let pairs = compute_masks(MaskSource::Existing(&masks), params)?;
            (pairs, masks)
        }
        MaskInputs::Threshold { weights, bet } => {
            let weights = load_all(weights)?;
            let bet = match bet {
                Some(path) if path.is_file() => Some(load(path)?),
                Some(path) => {
                    warn!(path = %path.display(), "BET mask unavailable, filling without it");
                    None
                }
                None => None,
            };
            let pairs = compute_masks(MaskSource::Threshold { weights: &weights, bet: bet.as_ref() }, params)?;
            (pairs, weights)
        }
        MaskInputs::Bet(paths) => {
            let masks = load_all(paths)?;
            let pairs = compute_masks(MaskSource::Bet { masks: &masks, n_echoes }, params)?;
            (pairs, masks)
        }
    };

    let first = geometry
        .first()
        .ok_or_else(|| QsmError::MaskingFailed("no masking inputs".to_string()))?;
    for (e, pair) in pairs.iter().enumerate() {
        let reference = geometry.get(e).unwrap_or(first);
        if let Some(path) = tight_out.get(e) {
            save_as(&reference.mask_like(&pair.tight), path, DataType::Uint8)?;
        }
        if let Some(path) = filled_out.get(e) {
            save_as(&reference.mask_like(&pair.filled), path, DataType::Uint8)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FillingAlgorithm;
    use crate::masking::ThresholdChoice;
    use crate::volume::{diagonal_affine, idx3d};

    fn write(dir: &Path, name: &str, data: Vec<f64>, dims: (usize, usize, usize)) -> PathBuf {
        let path = dir.join(name);
        save(&Volume::new(data, dims, diagonal_affine((1.0, 1.0, 1.0), [0.0; 3])), &path).unwrap();
        path
    }

    #[test]
    fn test_axial_resample_copies_bytes_when_not_oblique() {
        let dir = tempfile::tempdir().unwrap();
        let phase = write(dir.path(), "phase.nii", vec![0.25; 27], (3, 3, 3));
        let mag = write(dir.path(), "mag.nii", vec![4.0; 27], (3, 3, 3));
        let stage = InternalStage::AxialResample {
            phase: phase.clone(),
            magnitude: Some(mag.clone()),
            mask: None,
            obliquity_threshold: 10.0,
            phase_out: dir.path().join("out/phase.nii"),
            magnitude_out: Some(dir.path().join("out/mag.nii")),
            mask_out: None,
        };
        stage.run().unwrap();
        assert_eq!(std::fs::read(&phase).unwrap(), std::fs::read(dir.path().join("out/phase.nii")).unwrap());
        assert_eq!(std::fs::read(&mag).unwrap(), std::fs::read(dir.path().join("out/mag.nii")).unwrap());
    }

    #[test]
    fn test_compute_masks_writes_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let n = 8;
        let mut data = vec![0.0; n * n * n];
        for k in 2..6 {
            for j in 2..6 {
                for i in 2..6 {
                    data[idx3d(i, j, k, n, n)] = 100.0;
                }
            }
        }
        let weight = write(dir.path(), "w.nii", data, (n, n, n));
        let stage = InternalStage::ComputeMasks {
            inputs: MaskInputs::Threshold { weights: vec![weight], bet: Some(dir.path().join("missing.nii")) },
            n_echoes: 1,
            params: MaskingParams {
                threshold: ThresholdChoice::Absolute(50.0),
                filling: FillingAlgorithm::Morphological,
                fill_strength: 0,
                erosions: 0,
            },
            tight_out: vec![dir.path().join("tight.nii")],
            filled_out: vec![dir.path().join("filled.nii")],
        };
        stage.run().unwrap();
        let tight = load(&dir.path().join("tight.nii")).unwrap();
        assert_eq!(tight.dtype, DataType::Uint8);
        assert_eq!(tight.data.iter().filter(|&&v| v > 0.0).count(), 64);
    }

    #[test]
    fn test_combine_echoes_writes_hz() {
        let dir = tempfile::tempdir().unwrap();
        let dims = (4, 4, 4);
        let tes = [0.004, 0.008, 0.012];
        let phases: Vec<PathBuf> = tes
            .iter()
            .enumerate()
            .map(|(e, &te)| write(dir.path(), &format!("p{}.nii", e), vec![TWO_PI * 10.0 * te; 64], dims))
            .collect();
        let stage = InternalStage::CombineEchoes {
            phases,
            magnitudes: None,
            echo_times: tes.to_vec(),
            frequency_out: dir.path().join("frequency.nii"),
            phase_out: dir.path().join("phase.nii"),
        };
        stage.run().unwrap();
        let hz = load(&dir.path().join("frequency.nii")).unwrap();
        assert!(hz.data.iter().all(|f| (f - 10.0).abs() < 1e-3), "{:?}", &hz.data[..4]);
    }

    #[test]
    fn test_publish_adds_qsm_image_type() {
        let dir = tempfile::tempdir().unwrap();
        let chi = write(dir.path(), "chi.nii", vec![0.1; 8], (2, 2, 2));
        let sidecar = dir.path().join("src.json");
        std::fs::write(&sidecar, r#"{"EchoTime": 0.02, "MagneticFieldStrength": 3, "ImageType": ["P"]}"#).unwrap();
        let stage = InternalStage::Publish {
            chi,
            sidecar,
            nifti_out: dir.path().join("qsm/sub-1_Chimap.nii"),
            json_out: dir.path().join("qsm/sub-1_Chimap.json"),
        };
        stage.run().unwrap();
        let out = read_sidecar(&dir.path().join("qsm/sub-1_Chimap.json")).unwrap();
        assert!(out.image_type.contains(&"QSM".to_string()));
        assert_eq!(load(&dir.path().join("qsm/sub-1_Chimap.nii")).unwrap().dims, (2, 2, 2));
    }
}
