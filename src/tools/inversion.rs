//! Dipole inversion tools: TGV-QSM, RTS, TV and NeXtQSM
//!
//! TGV consumes wrapped (or pseudo-) phase and does its own unwrapping and
//! background removal; the others consume a tissue field.

use std::path::Path;

use super::{fmt_float, fmt_triple, OutputRule, Resources, Tool, ToolInvocation, ToolPaths, INVERSION_TIMEOUT};

/// Expected peak memory of NeXtQSM, GB
pub const NEXTQSM_MEMORY_GB: f64 = 13.0;

const INVERSION_MEMORY_GB: f64 = 3.0;

/// Susceptibility output of every inversion, relative to its node directory
pub const CHI_FILE: &str = "chi.nii";

/// TGV-QSM
///
/// The program names its output after the phase input, so the phase is
/// staged into `out_dir` first and the result is discovered there.
#[allow(clippy::too_many_arguments)]
pub fn tgv(
    phase: &Path,
    mask: &Path,
    echo_time: f64,
    field_strength: f64,
    alphas: [f64; 2],
    iterations: u32,
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    let gz = phase.to_string_lossy().ends_with(".gz");
    let staged_phase = out_dir.join(if gz { "phase.nii.gz" } else { "phase.nii" });
    let staged_mask = out_dir.join("mask.nii");
    ToolInvocation::new(Tool::Tgv, paths, Resources::new(INVERSION_MEMORY_GB, INVERSION_TIMEOUT))
        .stage(phase, &staged_phase)
        .stage(mask, &staged_mask)
        .flag("-p", staged_phase.to_string_lossy())
        .flag("-m", staged_mask.to_string_lossy())
        .flag("-f", fmt_float(field_strength))
        .flag("-t", fmt_float(echo_time))
        .arg("-s")
        .flag("-o", "_qsm")
        .arg("--alpha")
        .arg(fmt_float(alphas[0]))
        .arg(fmt_float(alphas[1]))
        .flag("-i", iterations.to_string())
        .arg("--ignore-orientation")
        .arg("--no-resampling")
        .output(OutputRule::Discover {
            dir: out_dir.to_path_buf(),
            pattern: r"^phase_qsm.*\.nii(\.gz)?$".to_string(),
            rename_to: out_dir.join(CHI_FILE),
        })
}

fn field_solver(
    tool: Tool,
    mem_gb: f64,
    tissue_field: &Path,
    mask: &Path,
    voxel_size: [f64; 3],
    b0_direction: [f64; 3],
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    let chi = out_dir.join(CHI_FILE);
    let mut inv = ToolInvocation::new(tool, paths, Resources::new(mem_gb, INVERSION_TIMEOUT))
        .flag("--field", tissue_field.to_string_lossy())
        .flag("--mask", mask.to_string_lossy())
        .arg("--voxel-size");
    for v in fmt_triple(voxel_size) {
        inv = inv.arg(v);
    }
    inv = inv.arg("--b0-direction");
    for v in fmt_triple(b0_direction) {
        inv = inv.arg(v);
    }
    inv.flag("--output", chi.to_string_lossy())
        .output(OutputRule::Exact(chi))
}

/// Rapid two-step dipole inversion
pub fn rts(
    tissue_field: &Path,
    mask: &Path,
    voxel_size: [f64; 3],
    b0_direction: [f64; 3],
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    field_solver(Tool::Rts, INVERSION_MEMORY_GB, tissue_field, mask, voxel_size, b0_direction, out_dir, paths)
}

/// Total-variation regularized dipole inversion
pub fn tv(
    tissue_field: &Path,
    mask: &Path,
    voxel_size: [f64; 3],
    b0_direction: [f64; 3],
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    field_solver(Tool::Tv, INVERSION_MEMORY_GB, tissue_field, mask, voxel_size, b0_direction, out_dir, paths)
}

/// NeXtQSM deep-learning inversion
pub fn nextqsm(
    tissue_field: &Path,
    mask: &Path,
    voxel_size: [f64; 3],
    b0_direction: [f64; 3],
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    field_solver(Tool::Nextqsm, NEXTQSM_MEMORY_GB, tissue_field, mask, voxel_size, b0_direction, out_dir, paths)
}
