//! Resampling volumes onto a new voxel grid

use serde::{Deserialize, Serialize};

use crate::error::{QsmError, Result};
use crate::volume::{apply_affine, idx3d, invert_affine, multiply_affine, voxel_size_from_affine, Affine, Volume};

/// Interpolation mode
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    /// Trilinear
    Continuous,
    /// Nearest neighbour, for label and mask volumes
    Nearest,
}

/// Trilinear interpolation at a fractional voxel coordinate.
/// Samples outside the volume read as zero.
fn sample_trilinear(data: &[f64], nx: usize, ny: usize, nz: usize, x: f64, y: f64, z: f64) -> f64 {
    let eps = 1e-6;
    if x < -eps || y < -eps || z < -eps
        || x > (nx - 1) as f64 + eps || y > (ny - 1) as f64 + eps || z > (nz - 1) as f64 + eps
    {
        return 0.0;
    }
    let x = x.clamp(0.0, (nx - 1) as f64);
    let y = y.clamp(0.0, (ny - 1) as f64);
    let z = z.clamp(0.0, (nz - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let z0 = z.floor() as usize;
    let x1 = (x0 + 1).min(nx - 1);
    let y1 = (y0 + 1).min(ny - 1);
    let z1 = (z0 + 1).min(nz - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let fz = z - z0 as f64;

    let v = |i: usize, j: usize, k: usize| data[idx3d(i, j, k, nx, ny)];

    let c00 = v(x0, y0, z0) * (1.0 - fx) + v(x1, y0, z0) * fx;
    let c10 = v(x0, y1, z0) * (1.0 - fx) + v(x1, y1, z0) * fx;
    let c01 = v(x0, y0, z1) * (1.0 - fx) + v(x1, y0, z1) * fx;
    let c11 = v(x0, y1, z1) * (1.0 - fx) + v(x1, y1, z1) * fx;

    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;
    c0 * (1.0 - fz) + c1 * fz
}

fn sample_nearest(data: &[f64], nx: usize, ny: usize, nz: usize, x: f64, y: f64, z: f64) -> f64 {
    let (i, j, k) = (x.round(), y.round(), z.round());
    if i < 0.0 || j < 0.0 || k < 0.0 || i >= nx as f64 || j >= ny as f64 || k >= nz as f64 {
        return 0.0;
    }
    data[idx3d(i as usize, j as usize, k as usize, nx, ny)]
}

/// Resample `volume` onto the grid described by `target_affine` and
/// `target_dims`. The output keeps the source dtype.
pub fn resample_affine(
    volume: &Volume,
    target_affine: &Affine,
    target_dims: (usize, usize, usize),
    mode: Interpolation,
) -> Result<Volume> {
    let source_inv = invert_affine(&volume.affine)
        .ok_or_else(|| QsmError::Input("source affine is not invertible".to_string()))?;
    // target voxel -> world -> source voxel
    let target_to_source = multiply_affine(&source_inv, target_affine);

    let (nx, ny, nz) = volume.dims;
    let (tx, ty, tz) = target_dims;
    let mut data = vec![0.0; tx * ty * tz];

    for k in 0..tz {
        for j in 0..ty {
            for i in 0..tx {
                let p = apply_affine(&target_to_source, [i as f64, j as f64, k as f64]);
                data[idx3d(i, j, k, tx, ty)] = match mode {
                    Interpolation::Continuous => sample_trilinear(&volume.data, nx, ny, nz, p[0], p[1], p[2]),
                    Interpolation::Nearest => sample_nearest(&volume.data, nx, ny, nz, p[0], p[1], p[2]),
                };
            }
        }
    }

    Ok(Volume {
        data,
        dims: target_dims,
        voxel_size: voxel_size_from_affine(target_affine),
        affine: *target_affine,
        dtype: volume.dtype,
    })
}

/// Bring `source` onto the grid of `reference`
///
/// Returns `source` unchanged when both affines are elementwise equal and
/// the shapes agree; otherwise resamples trilinearly, keeping the
/// reference shape and affine.
pub fn resample_like(source: &Volume, reference: &Volume, mode: Interpolation) -> Result<Volume> {
    if source.affine == reference.affine && source.dims == reference.dims {
        return Ok(source.clone());
    }
    resample_affine(source, &reference.affine, reference.dims, mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::diagonal_affine;

    fn ramp(dims: (usize, usize, usize), affine: Affine) -> Volume {
        let (nx, ny, nz) = dims;
        let mut data = vec![0.0; nx * ny * nz];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data[idx3d(i, j, k, nx, ny)] = i as f64 + 10.0 * j as f64 + 100.0 * k as f64;
                }
            }
        }
        Volume::new(data, dims, affine)
    }

    #[test]
    fn test_resample_like_identity_is_bitwise() {
        let affine = diagonal_affine((1.0, 1.0, 2.0), [3.0, -4.0, 5.0]);
        let src = ramp((4, 5, 6), affine);
        let out = resample_like(&src, &src.clone(), Interpolation::Continuous).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_resample_translation_half_voxel() {
        let src = ramp((4, 4, 4), diagonal_affine((1.0, 1.0, 1.0), [0.0; 3]));
        let target = diagonal_affine((1.0, 1.0, 1.0), [0.5, 0.0, 0.0]);
        let out = resample_affine(&src, &target, (3, 4, 4), Interpolation::Continuous).unwrap();
        // linear ramp along x: value at x=0.5 is 0.5
        assert!((out.data[idx3d(0, 1, 1, 3, 4)] - 110.5).abs() < 1e-9);
        assert_eq!(out.affine, target);
    }

    #[test]
    fn test_resample_outside_is_zero() {
        let src = ramp((4, 4, 4), diagonal_affine((1.0, 1.0, 1.0), [0.0; 3]));
        let target = diagonal_affine((1.0, 1.0, 1.0), [10.0, 0.0, 0.0]);
        let out = resample_affine(&src, &target, (2, 2, 2), Interpolation::Continuous).unwrap();
        assert!(out.data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_nearest_keeps_labels() {
        let src = ramp((4, 4, 4), diagonal_affine((1.0, 1.0, 1.0), [0.0; 3]));
        let target = diagonal_affine((1.0, 1.0, 1.0), [0.4, 0.0, 0.0]);
        let out = resample_affine(&src, &target, (3, 4, 4), Interpolation::Nearest).unwrap();
        assert!(out.data.iter().all(|v| v.fract() == 0.0));
    }

    #[test]
    fn test_resample_like_downsample_keeps_reference_shape() {
        let src = ramp((8, 8, 8), diagonal_affine((1.0, 1.0, 1.0), [0.0; 3]));
        let reference = Volume::new(vec![0.0; 64], (4, 4, 4), diagonal_affine((2.0, 2.0, 2.0), [0.0; 3]));
        let out = resample_like(&src, &reference, Interpolation::Continuous).unwrap();
        assert_eq!(out.dims, (4, 4, 4));
        // reference voxel (1,0,0) sits at world x=2
        assert!((out.data[idx3d(1, 0, 0, 4, 4)] - 2.0).abs() < 1e-9);
    }
}
