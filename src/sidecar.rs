//! BIDS JSON sidecars
//!
//! Only the acquisition fields the pipeline needs are typed; everything else
//! is carried through unchanged so it can be propagated to the output.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QsmError, Result};

/// ImageType entries added to every susceptibility map sidecar
pub const QSM_IMAGE_TYPE: [&str; 3] = ["DERIVED", "SECONDARY", "QSM"];

/// Default B0 direction when the sidecar carries none
pub const DEFAULT_B0_DIRECTION: [f64; 3] = [0.0, 0.0, 1.0];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sidecar {
    /// Seconds
    #[serde(rename = "EchoTime", skip_serializing_if = "Option::is_none")]
    pub echo_time: Option<f64>,
    /// Tesla
    #[serde(rename = "MagneticFieldStrength", skip_serializing_if = "Option::is_none")]
    pub field_strength: Option<f64>,
    #[serde(rename = "B0Direction", skip_serializing_if = "Option::is_none")]
    pub b0_direction: Option<[f64; 3]>,
    #[serde(rename = "ImageType", default, skip_serializing_if = "Vec::is_empty")]
    pub image_type: Vec<String>,
    #[serde(rename = "EchoNumber", skip_serializing_if = "Option::is_none")]
    pub echo_number: Option<u32>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// Sidecar path next to a NIfTI file: `x.nii` / `x.nii.gz` -> `x.json`
pub fn sidecar_path(nifti: &Path) -> PathBuf {
    let name = nifti.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let stem = name
        .strip_suffix(".nii.gz")
        .or_else(|| name.strip_suffix(".nii"))
        .unwrap_or(&name);
    nifti.with_file_name(format!("{}.json", stem))
}

pub fn read_sidecar(path: &Path) -> Result<Sidecar> {
    let text = std::fs::read_to_string(path).map_err(|e| QsmError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| QsmError::json(path, e))
}

pub fn write_sidecar(sidecar: &Sidecar, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QsmError::io(parent, e))?;
    }
    let text = serde_json::to_string_pretty(sidecar).map_err(|e| QsmError::json(path, e))?;
    std::fs::write(path, text).map_err(|e| QsmError::io(path, e))
}

/// Acquisition parameters of one echo
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EchoMetadata {
    pub echo_time: f64,
    pub field_strength: f64,
    pub b0_direction: [f64; 3],
}

impl Sidecar {
    /// Validate the fields every phase sidecar must carry
    pub fn echo_metadata(&self, origin: &Path) -> Result<EchoMetadata> {
        let echo_time = self
            .echo_time
            .ok_or_else(|| QsmError::Input(format!("'{}' has no EchoTime", origin.display())))?;
        let field_strength = self
            .field_strength
            .ok_or_else(|| QsmError::Input(format!("'{}' has no MagneticFieldStrength", origin.display())))?;
        if !(echo_time > 0.0) || !(field_strength > 0.0) {
            return Err(QsmError::Input(format!(
                "'{}': EchoTime and MagneticFieldStrength must be positive",
                origin.display()
            )));
        }
        let b0_direction = match self.b0_direction {
            None => DEFAULT_B0_DIRECTION,
            Some(d) => {
                let norm = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                if !(norm > 0.0) {
                    return Err(QsmError::Input(format!("'{}': B0Direction is zero", origin.display())));
                }
                [d[0] / norm, d[1] / norm, d[2] / norm]
            }
        };
        Ok(EchoMetadata { echo_time, field_strength, b0_direction })
    }

    /// Sidecar for a derived susceptibility map
    ///
    /// Keeps the source metadata, drops per-echo fields, and appends the
    /// QSM ImageType entries without duplicating them.
    pub fn for_qsm_output(&self) -> Sidecar {
        let mut out = self.clone();
        out.echo_time = None;
        out.echo_number = None;
        for tag in QSM_IMAGE_TYPE {
            if !out.image_type.iter().any(|t| t == tag) {
                out.image_type.push(tag.to_string());
            }
        }
        out
    }
}
