//! Phase unwrapping tools: ROMEO (per echo or B0 over all echoes) and
//! Laplacian unwrapping

use std::path::{Path, PathBuf};

use super::{fmt_float, OutputRule, Resources, Tool, ToolInvocation, ToolPaths, DEFAULT_TIMEOUT};

fn echo_times_ms(tes: &[f64]) -> String {
    let list: Vec<String> = tes.iter().map(|te| fmt_float(te * 1e3)).collect();
    format!("[{}]", list.join(","))
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(",")
}

/// Unwrap one echo with ROMEO, `<out>/unwrapped.nii`
pub fn romeo(
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
    inv.flag("-t", echo_times_ms(&[echo_time]))
        .flag("-k", "nomask")
        .arg("--no-rescale")
        .flag("-o", out_dir.to_string_lossy())
        .output(OutputRule::Exact(out_dir.join("unwrapped.nii")))
}

/// Combined B0 field map (Hz) over all echoes, `<out>/B0.nii`
pub fn romeo_b0(
    phases: &[PathBuf],
    magnitudes: Option<&[PathBuf]>,
    echo_times: &[f64],
    out_dir: &Path,
    paths: &ToolPaths,
) -> ToolInvocation {
    let mut inv = ToolInvocation::new(Tool::Romeo, paths, Resources::new(3.0, DEFAULT_TIMEOUT))
        .flag("-p", join_paths(phases));
    if let Some(mags) = magnitudes {
        inv = inv.flag("-m", join_paths(mags));
    }
    inv.flag("-t", echo_times_ms(echo_times))
        .arg("-B")
        .flag("-k", "nomask")
        .arg("--no-rescale")
        .flag("-o", out_dir.to_string_lossy())
        .output(OutputRule::Exact(out_dir.join("B0.nii")))
}

/// Laplacian unwrapping of one echo, `<out>/unwrapped.nii`
pub fn laplacian(phase: &Path, out_dir: &Path, paths: &ToolPaths) -> ToolInvocation {
    let output = out_dir.join("unwrapped.nii");
    ToolInvocation::new(Tool::Laplacian, paths, Resources::new(2.0, DEFAULT_TIMEOUT))
        .flag("--phase", phase.to_string_lossy())
        .flag("--output", output.to_string_lossy())
        .output(OutputRule::Exact(output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_romeo_b0_lists_every_echo() {
        let phases = vec![PathBuf::from("/a/p1.nii"), PathBuf::from("/a/p2.nii")];
        let inv = romeo_b0(&phases, None, &[0.004, 0.012], Path::new("/w/b0"), &ToolPaths::default());
        assert!(inv.args.contains(&"/a/p1.nii,/a/p2.nii".to_string()));
        assert!(inv.args.contains(&"[4,12]".to_string()));
        assert!(inv.args.contains(&"-B".to_string()));
        assert_eq!(inv.outputs[0].path(), Path::new("/w/b0/B0.nii"));
    }

    #[test]
    fn test_laplacian_output() {
        let inv = laplacian(Path::new("/a/p.nii"), Path::new("/w/u"), &ToolPaths::default());
        assert_eq!(inv.program, "laplacian_unwrapping");
        assert_eq!(inv.outputs[0].path(), Path::new("/w/u/unwrapped.nii"));
    }
}
