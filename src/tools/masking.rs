//! Masking-related tools: FSL BET, ROMEO phase quality, MakeHomogeneous

use std::path::Path;

use super::{fmt_float, OutputRule, Resources, Tool, ToolInvocation, ToolPaths, DEFAULT_TIMEOUT};

/// `bet <input> <out>/bet -m -n -R -f <fi>`, writing `<out>/bet_mask.nii.gz`
pub fn bet(magnitude: &Path, out_dir: &Path, fractional_intensity: f64, paths: &ToolPaths) -> ToolInvocation {
    let mut inv = ToolInvocation::new(Tool::Bet, paths, Resources::new(1.0, DEFAULT_TIMEOUT))
        .path_arg(magnitude)
        .path_arg(&out_dir.join("bet"))
        .arg("-m")
        .arg("-n")
        .arg("-R")
        .flag("-f", fmt_float(fractional_intensity))
        .output(OutputRule::Exact(out_dir.join("bet_mask.nii.gz")));
    inv.env.push(("FSLOUTPUTTYPE".to_string(), "NIFTI_GZ".to_string()));
    inv
}

/// ROMEO voxel quality map of one echo, `<out>/quality.nii`
pub fn romeo_quality(
    phase: &Path,
    magnitude: Option<&Path>,
    echo_time: f64,
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    let mut inv = ToolInvocation::new(Tool::Romeo, paths, Resources::new(2.0, DEFAULT_TIMEOUT))
        .flag("-p", phase.to_string_lossy());
    if let Some(mag) = magnitude {
        inv = inv.flag("-m", mag.to_string_lossy());
    }
    inv.flag("-t", format!("[{}]", fmt_float(echo_time * 1e3)))
        .flag("-k", "nomask")
        .arg("-q")
        .arg("--no-unwrapping")
        .flag("-o", out_dir.to_string_lossy())
        .output(OutputRule::Exact(out_dir.join("quality.nii")))
}

/// Bias-field (inhomogeneity) correction of a magnitude image
pub fn makehomogeneous(magnitude: &Path, out_dir: &Path, paths: &ToolPaths) -> ToolInvocation {
    let output = out_dir.join("magnitude_corrected.nii");
    ToolInvocation::new(Tool::MakeHomogeneous, paths, Resources::new(2.0, DEFAULT_TIMEOUT))
        .flag("--input", magnitude.to_string_lossy())
        .flag("--output", output.to_string_lossy())
        .output(OutputRule::Exact(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bet_command() {
        let inv = bet(Path::new("/in/mag.nii"), Path::new("/w/bet-1"), 0.5, &ToolPaths::default());
        assert_eq!(inv.command_line(), "bet /in/mag.nii /w/bet-1/bet -m -n -R -f 0.5");
        assert_eq!(inv.outputs[0].path(), Path::new("/w/bet-1/bet_mask.nii.gz"));
    }

    #[test]
    fn test_romeo_quality_without_magnitude() {
        let inv = romeo_quality(Path::new("/in/p.nii"), None, 0.02, Path::new("/w/q"), &ToolPaths::default());
        assert!(!inv.args.contains(&"-m".to_string()));
        assert!(inv.args.contains(&"[20]".to_string()));
    }
}
