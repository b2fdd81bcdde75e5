//! In-memory 3D volumes and affine geometry
//!
//! Voxel data are stored flat in Fortran order (x varies fastest) to match
//! the NIfTI convention: index = x + y*nx + z*nx*ny. Affines are 4x4
//! row-major matrices mapping voxel indices to world (mm) coordinates.

use serde::{Deserialize, Serialize};

use crate::error::{QsmError, Result};

/// 4x4 row-major voxel-to-world matrix
pub type Affine = [f64; 16];

/// Per-axis tolerance (mm) when comparing voxel sizes
pub const VOXEL_SIZE_TOLERANCE: f64 = 1e-3;

/// Storage type of a volume on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    /// NIfTI-1 datatype code
    pub fn nifti_code(self) -> i16 {
        match self {
            DataType::Uint8 => 2,
            DataType::Int16 => 4,
            DataType::Int32 => 8,
            DataType::Float32 => 16,
            DataType::Float64 => 64,
        }
    }

    pub fn from_nifti_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(DataType::Uint8),
            4 | 512 => Some(DataType::Int16),
            8 | 768 => Some(DataType::Int32),
            16 => Some(DataType::Float32),
            64 => Some(DataType::Float64),
            _ => None,
        }
    }

    pub fn bitpix(self) -> i16 {
        match self {
            DataType::Uint8 => 8,
            DataType::Int16 => 16,
            DataType::Int32 | DataType::Float32 => 32,
            DataType::Float64 => 64,
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(self, DataType::Uint8 | DataType::Int16 | DataType::Int32)
    }
}

/// A 3D image with its geometry
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    /// Voxel values, Fortran order
    pub data: Vec<f64>,
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Voxel-to-world transform
    pub affine: Affine,
    /// Storage type the volume was read with (or will be written as)
    pub dtype: DataType,
}

impl Volume {
    /// Create a float32 volume. Voxel size is taken from the affine.
    pub fn new(data: Vec<f64>, dims: (usize, usize, usize), affine: Affine) -> Self {
        Volume {
            data,
            dims,
            voxel_size: voxel_size_from_affine(&affine),
            affine,
            dtype: DataType::Float32,
        }
    }

    /// Same geometry, new data
    pub fn with_data(&self, data: Vec<f64>) -> Self {
        Volume {
            data,
            dims: self.dims,
            voxel_size: self.voxel_size,
            affine: self.affine,
            dtype: self.dtype,
        }
    }

    pub fn zeros_like(&self) -> Self {
        self.with_data(vec![0.0; self.n_voxels()])
    }

    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn n_voxels(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    /// (min, max) over finite values; (0, 0) for an empty or all-NaN volume
    pub fn min_max(&self) -> (f64, f64) {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in self.data.iter().filter(|v| v.is_finite()) {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        if lo > hi {
            (0.0, 0.0)
        } else {
            (lo, hi)
        }
    }

    /// Binarize: any nonzero finite value is inside
    pub fn to_mask(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|&v| if v.is_finite() && v != 0.0 { 1 } else { 0 })
            .collect()
    }

    /// Build a uint8 volume from a binary mask on this volume's grid
    pub fn mask_like(&self, mask: &[u8]) -> Self {
        self.with_data(mask.iter().map(|&m| m as f64).collect())
            .with_dtype(DataType::Uint8)
    }

    /// Fail with `ShapeMismatch` unless `other` lives on the same grid
    pub fn check_same_grid(&self, other: &Volume, what: &str) -> Result<()> {
        check_grid(self.dims, self.voxel_size, other.dims, other.voxel_size, what)
    }
}

/// Compare two grids: dims must match exactly, voxel sizes within tolerance
pub fn check_grid(
    dims_a: (usize, usize, usize),
    vs_a: (f64, f64, f64),
    dims_b: (usize, usize, usize),
    vs_b: (f64, f64, f64),
    what: &str,
) -> Result<()> {
    if dims_a != dims_b {
        return Err(QsmError::ShapeMismatch(format!(
            "{}: dims {:?} vs {:?}",
            what, dims_a, dims_b
        )));
    }
    let diffs = [
        (vs_a.0 - vs_b.0).abs(),
        (vs_a.1 - vs_b.1).abs(),
        (vs_a.2 - vs_b.2).abs(),
    ];
    if diffs.iter().any(|&d| d > VOXEL_SIZE_TOLERANCE) {
        return Err(QsmError::ShapeMismatch(format!(
            "{}: voxel size {:?} vs {:?}",
            what, vs_a, vs_b
        )));
    }
    Ok(())
}

/// Index into 3D array (Fortran/column-major order)
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

pub fn identity_affine() -> Affine {
    diagonal_affine((1.0, 1.0, 1.0), [0.0, 0.0, 0.0])
}

/// Axis-aligned affine with the given voxel size (signed) and origin
pub fn diagonal_affine(scale: (f64, f64, f64), origin: [f64; 3]) -> Affine {
    [
        scale.0, 0.0, 0.0, origin[0],
        0.0, scale.1, 0.0, origin[1],
        0.0, 0.0, scale.2, origin[2],
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Voxel sizes are the norms of the first three columns
pub fn voxel_size_from_affine(affine: &Affine) -> (f64, f64, f64) {
    let col = |c: usize| {
        (affine[c] * affine[c] + affine[4 + c] * affine[4 + c] + affine[8 + c] * affine[8 + c]).sqrt()
    };
    (col(0), col(1), col(2))
}

/// Map a voxel coordinate to world space
#[inline]
pub fn apply_affine(affine: &Affine, p: [f64; 3]) -> [f64; 3] {
    [
        affine[0] * p[0] + affine[1] * p[1] + affine[2] * p[2] + affine[3],
        affine[4] * p[0] + affine[5] * p[1] + affine[6] * p[2] + affine[7],
        affine[8] * p[0] + affine[9] * p[1] + affine[10] * p[2] + affine[11],
    ]
}

/// Product a*b of two affines
pub fn multiply_affine(a: &Affine, b: &Affine) -> Affine {
    let mut out = [0.0; 16];
    for r in 0..4 {
        for c in 0..4 {
            out[r * 4 + c] = (0..4).map(|k| a[r * 4 + k] * b[k * 4 + c]).sum();
        }
    }
    out
}

/// Invert an affine (3x3 linear part plus translation).
/// Returns None when the linear part is singular.
pub fn invert_affine(affine: &Affine) -> Option<Affine> {
    let m = |r: usize, c: usize| affine[r * 4 + c];
    let det = m(0, 0) * (m(1, 1) * m(2, 2) - m(1, 2) * m(2, 1))
        - m(0, 1) * (m(1, 0) * m(2, 2) - m(1, 2) * m(2, 0))
        + m(0, 2) * (m(1, 0) * m(2, 1) - m(1, 1) * m(2, 0));
    if det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let mut inv = [0.0; 16];
    inv[0] = (m(1, 1) * m(2, 2) - m(1, 2) * m(2, 1)) * inv_det;
    inv[1] = (m(0, 2) * m(2, 1) - m(0, 1) * m(2, 2)) * inv_det;
    inv[2] = (m(0, 1) * m(1, 2) - m(0, 2) * m(1, 1)) * inv_det;
    inv[4] = (m(1, 2) * m(2, 0) - m(1, 0) * m(2, 2)) * inv_det;
    inv[5] = (m(0, 0) * m(2, 2) - m(0, 2) * m(2, 0)) * inv_det;
    inv[6] = (m(0, 2) * m(1, 0) - m(0, 0) * m(1, 2)) * inv_det;
    inv[8] = (m(1, 0) * m(2, 1) - m(1, 1) * m(2, 0)) * inv_det;
    inv[9] = (m(0, 1) * m(2, 0) - m(0, 0) * m(2, 1)) * inv_det;
    inv[10] = (m(0, 0) * m(1, 1) - m(0, 1) * m(1, 0)) * inv_det;
    for r in 0..3 {
        inv[r * 4 + 3] = -(inv[r * 4] * m(0, 3) + inv[r * 4 + 1] * m(1, 3) + inv[r * 4 + 2] * m(2, 3));
    }
    inv[15] = 1.0;
    Some(inv)
}

/// Angle (degrees) between each world axis and its closest image axis
pub fn obliquity_degrees(affine: &Affine) -> [f64; 3] {
    let vs = voxel_size_from_affine(affine);
    let vs = [vs.0, vs.1, vs.2];
    let mut out = [0.0; 3];
    for (r, o) in out.iter_mut().enumerate() {
        let best = (0..3)
            .map(|c| if vs[c] > 0.0 { (affine[r * 4 + c] / vs[c]).abs() } else { 0.0 })
            .fold(0.0_f64, f64::max)
            .min(1.0);
        *o = best.acos().to_degrees();
    }
    out
}

/// Euclidean norm of the per-axis obliquity
pub fn obliquity_norm(affine: &Affine) -> f64 {
    let o = obliquity_degrees(affine);
    (o[0] * o[0] + o[1] * o[1] + o[2] * o[2]).sqrt()
}

/// Image axis paired with each world axis, choosing the permutation with
/// the largest total direction-cosine magnitude
pub fn closest_axes(affine: &Affine) -> [usize; 3] {
    const PERMS: [[usize; 3]; 6] = [
        [0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0],
    ];
    let vs = voxel_size_from_affine(affine);
    let vs = [vs.0, vs.1, vs.2];
    let cosine = |r: usize, c: usize| {
        if vs[c] > 0.0 { (affine[r * 4 + c] / vs[c]).abs() } else { 0.0 }
    };
    let mut best = PERMS[0];
    let mut best_score = f64::NEG_INFINITY;
    for perm in PERMS {
        let score: f64 = (0..3).map(|r| cosine(r, perm[r])).sum();
        if score > best_score {
            best_score = score;
            best = perm;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotation_z(deg: f64) -> Affine {
        let (s, c) = deg.to_radians().sin_cos();
        [
            c, -s, 0.0, 1.0,
            s, c, 0.0, 2.0,
            0.0, 0.0, 2.0, 3.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }

    #[test]
    fn test_voxel_size_from_affine() {
        let affine = diagonal_affine((-1.5, 2.0, 3.0), [0.0, 0.0, 0.0]);
        let vs = voxel_size_from_affine(&affine);
        assert!((vs.0 - 1.5).abs() < 1e-12);
        assert!((vs.1 - 2.0).abs() < 1e-12);
        assert!((vs.2 - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_invert_affine_roundtrip() {
        let affine = rotation_z(25.0);
        let inv = invert_affine(&affine).unwrap();
        let prod = multiply_affine(&affine, &inv);
        let eye = identity_affine();
        for i in 0..16 {
            assert!((prod[i] - eye[i]).abs() < 1e-10, "entry {} = {}", i, prod[i]);
        }
    }

    #[test]
    fn test_invert_singular() {
        let mut affine = identity_affine();
        affine[10] = 0.0;
        assert!(invert_affine(&affine).is_none());
    }

    #[test]
    fn test_obliquity() {
        assert!(obliquity_norm(&identity_affine()) < 1e-6);
        let o = obliquity_degrees(&rotation_z(20.0));
        assert!((o[0] - 20.0).abs() < 1e-6, "x obliquity {}", o[0]);
        assert!((o[1] - 20.0).abs() < 1e-6, "y obliquity {}", o[1]);
        assert!(o[2].abs() < 1e-6);
    }

    #[test]
    fn test_closest_axes_permuted() {
        // image x -> world y, image y -> world x
        let affine = [
            0.0, 1.0, 0.0, 0.0,
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ];
        assert_eq!(closest_axes(&affine), [1, 0, 2]);
    }

    #[test]
    fn test_check_grid_tolerance() {
        assert!(check_grid((2, 2, 2), (1.0, 1.0, 1.0), (2, 2, 2), (1.0005, 1.0, 1.0), "t").is_ok());
        assert!(check_grid((2, 2, 2), (1.0, 1.0, 1.0), (2, 2, 2), (1.01, 1.0, 1.0), "t").is_err());
        assert!(check_grid((2, 2, 2), (1.0, 1.0, 1.0), (2, 2, 3), (1.0, 1.0, 1.0), "t").is_err());
    }

    #[test]
    fn test_min_max_ignores_nan() {
        let v = Volume::new(vec![1.0, f64::NAN, -2.0, 4.0], (4, 1, 1), identity_affine());
        assert_eq!(v.min_max(), (-2.0, 4.0));
    }
}
