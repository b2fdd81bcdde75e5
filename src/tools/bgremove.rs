//! Background field removal tools: V-SHARP and PDF

use std::path::Path;

use super::{fmt_triple, OutputRule, Resources, Tool, ToolInvocation, ToolPaths, DEFAULT_TIMEOUT};

/// Expected peak memory of PDF, GB
pub const PDF_MEMORY_GB: f64 = 5.0;

/// V-SHARP, writing `<out>/tissue_field.nii` and the eroded `<out>/vsharp_mask.nii`
pub fn vsharp(
    field: &Path,
    mask: &Path,
    voxel_size: [f64; 3],
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    let tissue = out_dir.join("tissue_field.nii");
    let eroded = out_dir.join("vsharp_mask.nii");
    let mut inv = ToolInvocation::new(Tool::Vsharp, paths, Resources::new(2.0, DEFAULT_TIMEOUT))
        .flag("--field", field.to_string_lossy())
        .flag("--mask", mask.to_string_lossy())
        .arg("--voxel-size");
    for v in fmt_triple(voxel_size) {
        inv = inv.arg(v);
    }
    inv.flag("--output", tissue.to_string_lossy())
        .flag("--mask-output", eroded.to_string_lossy())
        .output(OutputRule::Exact(tissue))
        .output(OutputRule::Exact(eroded))
}

/// Projection onto dipole fields, writing `<out>/tissue_field.nii`
pub fn pdf(
    field: &Path,
    mask: &Path,
    voxel_size: [f64; 3],
    b0_direction: [f64; 3],
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    let tissue = out_dir.join("tissue_field.nii");
    let mut inv = ToolInvocation::new(Tool::Pdf, paths, Resources::new(PDF_MEMORY_GB, DEFAULT_TIMEOUT))
        .flag("--field", field.to_string_lossy())
        .flag("--mask", mask.to_string_lossy())
        .arg("--voxel-size");
    for v in fmt_triple(voxel_size) {
        inv = inv.arg(v);
    }
    inv = inv.arg("--b0-direction");
    for v in fmt_triple(b0_direction) {
        inv = inv.arg(v);
    }
    inv.flag("--output", tissue.to_string_lossy())
        .output(OutputRule::Exact(tissue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdf_asks_for_memory() {
        let inv = pdf(
            Path::new("/f.nii"),
            Path::new("/m.nii"),
            [1.0, 1.0, 2.0],
            [0.0, 0.0, 1.0],
            Path::new("/w"),
            &ToolPaths::default(),
        );
        assert!(inv.resources.mem_gb >= 5.0);
        assert!(inv.command_line().contains("--voxel-size 1 1 2"));
    }

    #[test]
    fn test_vsharp_writes_eroded_mask() {
        let inv = vsharp(Path::new("/f.nii"), Path::new("/m.nii"), [1.0; 3], Path::new("/w"), &ToolPaths::default());
        assert_eq!(inv.outputs.len(), 2);
        assert_eq!(inv.outputs[1].path(), Path::new("/w/vsharp_mask.nii"));
    }
}
