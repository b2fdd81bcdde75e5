//! Common test utilities for pipeline integration tests
//!
//! Synthetic phantoms, BIDS tree writers and shell-script stand-ins for the
//! external reconstruction tools.

#![allow(dead_code)]

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use qsm_pipeline::cli::{Cli, Command, RunArgs};
use qsm_pipeline::nifti_io::{save, save_as};
use qsm_pipeline::volume::{diagonal_affine, Affine, DataType, Volume};

/// Create a binary sphere mask on a 3D volume (Fortran order)
pub fn create_sphere_mask(
    nx: usize, ny: usize, nz: usize,
    center_x: f64, center_y: f64, center_z: f64,
    radius: f64,
) -> Vec<u8> {
    let mut mask = vec![0u8; nx * ny * nz];
    let r2 = radius * radius;
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let dx = i as f64 - center_x;
                let dy = j as f64 - center_y;
                let dz = k as f64 - center_z;
                if dx * dx + dy * dy + dz * dz <= r2 {
                    mask[i + j * nx + k * nx * ny] = 1;
                }
            }
        }
    }
    mask
}

pub fn wrap(x: f64) -> f64 {
    let w = (x + PI).rem_euclid(2.0 * PI) - PI;
    if w <= -PI { w + 2.0 * PI } else { w }
}

/// Spherical "brain" with a dark central cavity and a linear field along x
pub struct Phantom {
    pub dims: (usize, usize, usize),
    pub affine: Affine,
    /// 100 in tissue, 5 in the cavity, 0 outside
    pub magnitude: Vec<f64>,
    /// Field offset in Hz, zero outside the brain
    pub field_hz: Vec<f64>,
    pub brain: Vec<u8>,
}

impl Phantom {
    pub fn new(dims: (usize, usize, usize)) -> Self {
        let (nx, ny, nz) = dims;
        let (cx, cy, cz) = ((nx as f64 - 1.0) / 2.0, (ny as f64 - 1.0) / 2.0, (nz as f64 - 1.0) / 2.0);
        let smallest = nx.min(ny).min(nz) as f64;
        let radius = 0.35 * smallest;
        let brain = create_sphere_mask(nx, ny, nz, cx, cy, cz, radius);
        let cavity = create_sphere_mask(nx, ny, nz, cx, cy, cz, 0.12 * smallest);

        let mut magnitude = vec![0.0; nx * ny * nz];
        let mut field_hz = vec![0.0; nx * ny * nz];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = i + j * nx + k * nx * ny;
                    if brain[idx] > 0 {
                        magnitude[idx] = if cavity[idx] > 0 { 5.0 } else { 100.0 };
                        field_hz[idx] = 40.0 * (i as f64 - cx) / radius;
                    }
                }
            }
        }
        Phantom {
            dims,
            affine: diagonal_affine((1.0, 1.0, 1.0), [-(nx as f64) / 2.0, -(ny as f64) / 2.0, -(nz as f64) / 2.0]),
            magnitude,
            field_hz,
            brain,
        }
    }

    /// Wrapped phase at echo time `te` (s)
    pub fn phase(&self, te: f64) -> Vec<f64> {
        self.field_hz.iter().map(|f| wrap(2.0 * PI * f * te)).collect()
    }

    pub fn volume(&self, data: Vec<f64>) -> Volume {
        Volume::new(data, self.dims, self.affine)
    }
}

fn write_json(path: &Path, value: serde_json::Value) {
    fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

/// Write one MEGRE Run under `<root>/sub-<subject>/anat`; returns the anat dir
pub fn write_bids_run(
    root: &Path,
    subject: &str,
    phantom: &Phantom,
    echo_times: &[f64],
    field_strength: f64,
    with_magnitude: bool,
) -> PathBuf {
    let anat = root.join(format!("sub-{}", subject)).join("anat");
    fs::create_dir_all(&anat).unwrap();
    for (e, &te) in echo_times.iter().enumerate() {
        let stem = format!("sub-{}_echo-{}", subject, e + 1);
        save(&phantom.volume(phantom.phase(te)), &anat.join(format!("{}_part-phase_MEGRE.nii", stem))).unwrap();
        write_json(
            &anat.join(format!("{}_part-phase_MEGRE.json", stem)),
            serde_json::json!({
                "EchoTime": te,
                "MagneticFieldStrength": field_strength,
                "EchoNumber": e + 1,
                "ImageType": ["ORIGINAL", "PRIMARY", "P"],
                "Manufacturer": "Synthetic",
            }),
        );
        if with_magnitude {
            save(&phantom.volume(phantom.magnitude.clone()), &anat.join(format!("{}_part-mag_MEGRE.nii", stem)))
                .unwrap();
            write_json(
                &anat.join(format!("{}_part-mag_MEGRE.json", stem)),
                serde_json::json!({
                    "EchoTime": te,
                    "MagneticFieldStrength": field_strength,
                    "EchoNumber": e + 1,
                    "ImageType": ["ORIGINAL", "PRIMARY", "M"],
                }),
            );
        }
    }
    anat
}

/// Write a supplied mask under `<root>/derivatives/qsm-masks`
pub fn write_mask(root: &Path, subject: &str, echo: Option<usize>, phantom: &Phantom, mask: &[u8]) -> PathBuf {
    let dir = root.join("derivatives/qsm-masks").join(format!("sub-{}", subject)).join("anat");
    fs::create_dir_all(&dir).unwrap();
    let name = match echo {
        Some(e) => format!("sub-{}_echo-{}_mask.nii", subject, e),
        None => format!("sub-{}_mask.nii", subject),
    };
    let path = dir.join(name);
    let volume = phantom.volume(mask.iter().map(|&m| m as f64).collect());
    save_as(&volume, &path, DataType::Uint8).unwrap();
    path
}

const FILE_TOOL: &str = r#"
input=""; mask=""; out=""; mask_out=""
while [ $# -gt 0 ]; do
  case "$1" in
    --phase|--field|--input) input="$2"; shift 2 ;;
    --mask) mask="$2"; shift 2 ;;
    --output) out="$2"; shift 2 ;;
    --mask-output) mask_out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if [ "$mode" = mask ]; then cp "$mask" "$out"; else cp "$input" "$out"; fi
if [ -n "$mask_out" ]; then cp "$mask" "$mask_out"; fi
"#;

const ROMEO_TOOL: &str = r#"
phase=""; mag=""; out=""; quality=0; b0=0
while [ $# -gt 0 ]; do
  case "$1" in
    -p) phase="$2"; shift 2 ;;
    -m) mag="$2"; shift 2 ;;
    -o) out="$2"; shift 2 ;;
    -t|-k) shift 2 ;;
    -q) quality=1; shift ;;
    -B) b0=1; shift ;;
    *) shift ;;
  esac
done
first=$(echo "$phase" | cut -d, -f1)
mkdir -p "$out"
if [ $quality = 1 ]; then
  if [ -n "$mag" ]; then cp "$(echo "$mag" | cut -d, -f1)" "$out/quality.nii"; else cp "$first" "$out/quality.nii"; fi
elif [ $b0 = 1 ]; then
  cp "$first" "$out/B0.nii"
else
  cp "$first" "$out/unwrapped.nii"
fi
"#;

const TGV_TOOL: &str = r#"
phase=""; mask=""
while [ $# -gt 0 ]; do
  case "$1" in
    -p) phase="$2"; shift 2 ;;
    -m) mask="$2"; shift 2 ;;
    *) shift ;;
  esac
done
cp "$mask" "$(dirname "$phase")/phase_qsm_000.nii"
"#;

const BET_TOOL: &str = r#"
cp "$1" "$2_mask.nii.gz"
"#;

/// Install stand-ins for every external tool and return the tools file
///
/// Unwrapping, background removal and bias correction copy their input;
/// dipole inversions write their mask, so a susceptibility map shows
/// exactly which mask produced it.
#[cfg(unix)]
pub fn install_fake_tools(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let scripts: Vec<(&str, String)> = vec![
        ("bet", BET_TOOL.to_string()),
        ("romeo", ROMEO_TOOL.to_string()),
        ("tgv", TGV_TOOL.to_string()),
        ("laplacian", format!("mode=input\n{}", FILE_TOOL)),
        ("makehomogeneous", format!("mode=input\n{}", FILE_TOOL)),
        ("vsharp", format!("mode=input\n{}", FILE_TOOL)),
        ("pdf", format!("mode=input\n{}", FILE_TOOL)),
        ("rts", format!("mode=mask\n{}", FILE_TOOL)),
        ("tv", format!("mode=mask\n{}", FILE_TOOL)),
        ("nextqsm", format!("mode=mask\n{}", FILE_TOOL)),
    ];

    let mut map = serde_json::Map::new();
    for (tool, body) in scripts {
        let path = bin.join(format!("fake-{}", tool));
        fs::write(&path, format!("#!/bin/sh\nset -e\n{}", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        map.insert(tool.to_string(), serde_json::Value::String(path.to_string_lossy().into_owned()));
    }
    let tools_file = dir.join("tools.json");
    write_json(&tools_file, serde_json::Value::Object(map));
    tools_file
}

/// Parse `run` arguments the way the binary does
pub fn run_args(bids: &Path, output: &Path, tools_file: &Path, extra: &[&str]) -> RunArgs {
    let mut argv: Vec<String> = vec![
        "qsm-pipeline".to_string(),
        "run".to_string(),
        bids.to_string_lossy().into_owned(),
        output.to_string_lossy().into_owned(),
        "--tools-file".to_string(),
        tools_file.to_string_lossy().into_owned(),
        "--n-procs".to_string(),
        "2".to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    match Cli::try_parse_from(argv).unwrap().command {
        Command::Run(args) => args,
        other => panic!("expected run command, got {:?}", other),
    }
}

/// Directory under `workdir` whose name starts with `prefix-`
pub fn node_dir(workdir: &Path, prefix: &str) -> PathBuf {
    let wanted = format!("{}-", prefix);
    fs::read_dir(workdir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .find(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().starts_with(&wanted))
                .unwrap_or(false)
        })
        .unwrap_or_else(|| panic!("no node directory '{}*' in {}", wanted, workdir.display()))
}

pub fn count_nonzero(data: &[f64]) -> usize {
    data.iter().filter(|v| **v != 0.0).count()
}
