//! Combining per-echo and per-pass susceptibility maps

use crate::error::{QsmError, Result};
use crate::volume::Volume;

/// Magnitude below which a voxel is treated as empty
pub const NONZERO_EPSILON: f64 = 1e-4;

/// Voxelwise mean over the inputs that are nonzero at each voxel
///
/// A value takes part in the mean when `|v| >= 1e-4`; a voxel where no
/// input qualifies is exactly 0. The output carries the first input's
/// geometry and dtype.
pub fn nonzero_average(volumes: &[Volume]) -> Result<Volume> {
    let first = volumes
        .first()
        .ok_or_else(|| QsmError::Input("nonzero_average needs at least one volume".to_string()))?;
    for (i, v) in volumes.iter().enumerate().skip(1) {
        first.check_same_grid(v, &format!("nonzero_average input {}", i))?;
    }

    let n = first.n_voxels();
    let mut data = vec![0.0; n];
    for (idx, out) in data.iter_mut().enumerate() {
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in volumes {
            let x = v.data[idx];
            if x.is_finite() && x.abs() >= NONZERO_EPSILON {
                sum += x;
                count += 1;
            }
        }
        if count > 0 {
            *out = sum / count as f64;
        }
    }
    Ok(first.with_data(data))
}

/// Two-pass fusion: `tight` wherever it is nonzero, `filled` elsewhere
pub fn fuse_two_pass(tight: &Volume, filled: &Volume) -> Result<Volume> {
    tight.check_same_grid(filled, "two-pass fusion")?;
    let data = tight
        .data
        .iter()
        .zip(&filled.data)
        .map(|(&t, &f)| if t != 0.0 { t } else { f })
        .collect();
    Ok(tight.with_data(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::identity_affine;

    fn vol(data: Vec<f64>) -> Volume {
        let n = data.len();
        Volume::new(data, (n, 1, 1), identity_affine())
    }

    #[test]
    fn test_nonzero_average_skips_small_values() {
        let a = vol(vec![1.0, 0.0, 5e-5, 2.0]);
        let b = vol(vec![3.0, 0.0, 1e-5, 0.0]);
        let out = nonzero_average(&[a, b]).unwrap();
        assert_eq!(out.data, vec![2.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_nonzero_average_keeps_first_affine() {
        let mut a = vol(vec![1.0, 1.0]);
        a.affine[3] = 7.0;
        let b = vol(vec![1.0, 1.0]);
        let out = nonzero_average(&[a.clone(), b]).unwrap();
        assert_eq!(out.affine, a.affine);
    }

    #[test]
    fn test_nonzero_average_negative_values_count() {
        let out = nonzero_average(&[vol(vec![-0.2]), vol(vec![0.4])]).unwrap();
        assert!((out.data[0] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_nonzero_average_shape_mismatch() {
        let err = nonzero_average(&[vol(vec![1.0, 2.0]), vol(vec![1.0])]).unwrap_err();
        assert!(matches!(err, QsmError::ShapeMismatch(_)));
    }

    #[test]
    fn test_nonzero_average_empty_input() {
        assert!(nonzero_average(&[]).is_err());
    }

    #[test]
    fn test_fuse_tight_wins() {
        let tight = vol(vec![0.5, 0.0, -0.3, 0.0]);
        let filled = vol(vec![-0.1, 0.2, 0.4, 0.0]);
        let fused = fuse_two_pass(&tight, &filled).unwrap();
        assert_eq!(fused.data, vec![0.5, 0.2, -0.3, 0.0]);
    }
}
