//! NIfTI-1 file I/O
//!
//! Reads .nii and .nii.gz volumes (gzip is detected from the magic bytes,
//! not the extension) into `Volume`s and writes them back with a chosen
//! storage type. Float32 data survive a load/save cycle bit-for-bit.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::error::{QsmError, Result};
use crate::volume::{Affine, DataType, Volume};

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;

/// Geometry of a NIfTI file, without its voxel data
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeHeader {
    pub dims: (usize, usize, usize),
    pub voxel_size: (f64, f64, f64),
    pub affine: Affine,
    pub dtype: Option<DataType>,
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Header summary for diagnostics when the nifti crate rejects a file
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < HEADER_SIZE {
        return format!("file too small ({} bytes, need at least {})", bytes.len(), HEADER_SIZE);
    }
    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);
    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Load a volume from disk
pub fn load(path: &Path) -> Result<Volume> {
    let bytes = std::fs::read(path).map_err(|e| QsmError::io(path, e))?;
    load_from_bytes(&bytes, path)
}

/// Decode a volume from in-memory bytes; `origin` is only used in errors
pub fn load_from_bytes(bytes: &[u8], origin: &Path) -> Result<Volume> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))
            .map_err(|e| QsmError::nifti(origin, format!("failed to read gzipped NIfTI: {}", e)))?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes)).map_err(|e| {
            QsmError::nifti(origin, format!("failed to read NIfTI: {} ({})", e, get_header_info(bytes)))
        })?
    };

    let header = obj.header().clone();
    let ndim = header.dim[0] as usize;
    if ndim < 3 {
        return Err(QsmError::nifti(origin, format!("expected at least 3D volume, got {}D", ndim)));
    }

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| QsmError::nifti(origin, format!("failed to convert to ndarray: {}", e)))?;

    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(QsmError::nifti(origin, format!("expected at least 3D array, got {}D", shape.len())));
    }
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);

    // Fortran order; 4D inputs keep their first volume
    let mut data = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let v = if shape.len() == 3 { array[[i, j, k]] } else { array[[i, j, k, 0]] };
                data.push(v);
            }
        }
    }

    Ok(Volume {
        data,
        dims: (nx, ny, nz),
        voxel_size: pixdim_voxel_size(&header),
        affine: get_affine(&header),
        dtype: DataType::from_nifti_code(header.datatype).unwrap_or(DataType::Float32),
    })
}

/// Read only the header of a NIfTI file
pub fn read_header(path: &Path) -> Result<VolumeHeader> {
    let mut file = File::open(path).map_err(|e| QsmError::io(path, e))?;
    let mut magic = [0u8; 2];
    file.read_exact(&mut magic).map_err(|e| QsmError::io(path, e))?;
    file.seek(SeekFrom::Start(0)).map_err(|e| QsmError::io(path, e))?;

    let reader = BufReader::new(file);
    let header = if is_gzip(&magic) {
        NiftiHeader::from_reader(GzDecoder::new(reader))
    } else {
        NiftiHeader::from_reader(reader)
    }
    .map_err(|e| QsmError::nifti(path, format!("failed to read header: {}", e)))?;

    if (header.dim[0] as usize) < 3 {
        return Err(QsmError::nifti(path, format!("expected at least 3D volume, got {}D", header.dim[0])));
    }

    Ok(VolumeHeader {
        dims: (header.dim[1] as usize, header.dim[2] as usize, header.dim[3] as usize),
        voxel_size: pixdim_voxel_size(&header),
        affine: get_affine(&header),
        dtype: DataType::from_nifti_code(header.datatype),
    })
}

fn pixdim_voxel_size(header: &NiftiHeader) -> (f64, f64, f64) {
    (
        header.pixdim[1].abs() as f64,
        header.pixdim[2].abs() as f64,
        header.pixdim[3].abs() as f64,
    )
}

/// Affine from the header: sform if set, else qform, else scaled identity
fn get_affine(header: &NiftiHeader) -> Affine {
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        return [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ];
    }

    let (vsx, vsy, vsz) = pixdim_voxel_size(header);
    if header.qform_code > 0 {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let r = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - b * b - c * c],
        ];
        let scale = [vsx, vsy, vsz * qfac];
        let offset = [header.quatern_x as f64, header.quatern_y as f64, header.quatern_z as f64];
        let mut affine = [0.0; 16];
        for row in 0..3 {
            for col in 0..3 {
                affine[row * 4 + col] = r[row][col] * scale[col];
            }
            affine[row * 4 + 3] = offset[row];
        }
        affine[15] = 1.0;
        return affine;
    }

    [
        vsx, 0.0, 0.0, 0.0,
        0.0, vsy, 0.0, 0.0,
        0.0, 0.0, vsz, 0.0,
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Encode a volume as uncompressed NIfTI-1 bytes using `dtype` for storage
pub fn encode(volume: &Volume, dtype: DataType) -> Vec<u8> {
    let (nx, ny, nz) = volume.dims;
    let (vsx, vsy, vsz) = volume.voxel_size;
    let affine = &volume.affine;

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());

    let dim: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    header[70..72].copy_from_slice(&dtype.nifti_code().to_le_bytes());
    header[72..74].copy_from_slice(&dtype.bitpix().to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    header[108..112].copy_from_slice(&(VOX_OFFSET as f32).to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());
    // xyzt_units: mm, seconds
    header[123] = 2 | 8;
    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + col] as f32).to_le_bytes());
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    let bytes_per_voxel = (dtype.bitpix() / 8) as usize;
    let mut buffer = Vec::with_capacity(VOX_OFFSET + volume.data.len() * bytes_per_voxel);
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]);

    for &val in &volume.data {
        match dtype {
            DataType::Uint8 => buffer.push(round_clamped(val, 0.0, u8::MAX as f64) as u8),
            DataType::Int16 => buffer.extend_from_slice(
                &(round_clamped(val, i16::MIN as f64, i16::MAX as f64) as i16).to_le_bytes(),
            ),
            DataType::Int32 => buffer.extend_from_slice(
                &(round_clamped(val, i32::MIN as f64, i32::MAX as f64) as i32).to_le_bytes(),
            ),
            DataType::Float32 => buffer.extend_from_slice(&(val as f32).to_le_bytes()),
            DataType::Float64 => buffer.extend_from_slice(&val.to_le_bytes()),
        }
    }

    buffer
}

fn round_clamped(v: f64, lo: f64, hi: f64) -> f64 {
    if v.is_finite() {
        v.round().clamp(lo, hi)
    } else {
        0.0
    }
}

/// Save a volume using its own dtype
///
/// If the path ends with .nii.gz, the file is gzip compressed.
pub fn save(volume: &Volume, path: &Path) -> Result<()> {
    save_as(volume, path, volume.dtype)
}

/// Save a volume with an explicit storage type
pub fn save_as(volume: &Volume, path: &Path, dtype: DataType) -> Result<()> {
    if volume.data.len() != volume.n_voxels() {
        return Err(QsmError::ShapeMismatch(format!(
            "cannot save '{}': {} values for dims {:?}",
            path.display(),
            volume.data.len(),
            volume.dims
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| QsmError::io(parent, e))?;
    }

    let raw = encode(volume, dtype);
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw).map_err(|e| QsmError::io(path, e))?;
        encoder.finish().map_err(|e| QsmError::io(path, e))?
    } else {
        raw
    };

    std::fs::write(path, &bytes).map_err(|e| QsmError::io(path, e))
}

/// Load and binarize a mask file
pub fn load_mask(path: &Path) -> Result<(Volume, Vec<u8>)> {
    let volume = load(path)?;
    let mask = volume.to_mask();
    Ok((volume, mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::diagonal_affine;

    fn sample_volume(dims: (usize, usize, usize)) -> Volume {
        let n = dims.0 * dims.1 * dims.2;
        let data = (0..n).map(|i| (i as f32 * 0.37 - 3.0) as f64).collect();
        Volume::new(data, dims, diagonal_affine((1.0, 2.0, 3.0), [10.0, 20.0, 30.0]))
    }

    #[test]
    fn test_gzip_detection() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x00]));
        assert!(!is_gzip(&[0x00, 0x00, 0x00]));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn test_float32_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii");
        let vol = sample_volume((4, 3, 2));
        save(&vol, &path).unwrap();
        let loaded = load(&path).unwrap();

        assert_eq!(loaded.dims, vol.dims);
        assert_eq!(loaded.dtype, DataType::Float32);
        for (a, b) in loaded.data.iter().zip(&vol.data) {
            assert_eq!((*a as f32).to_bits(), (*b as f32).to_bits());
        }
        assert!((loaded.voxel_size.1 - 2.0).abs() < 1e-6);
        assert!((loaded.affine[3] - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_gzip_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii.gz");
        let vol = sample_volume((3, 3, 3));
        save(&vol, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(is_gzip(&bytes), "file should be gzip compressed");

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.data.len(), 27);
        assert!((loaded.data[5] - vol.data[5]).abs() < 1e-6);
    }

    #[test]
    fn test_uint8_storage_rounds_and_clamps() {
        let vol = Volume::new(vec![-1.0, 0.4, 0.6, 300.0], (4, 1, 1), diagonal_affine((1.0, 1.0, 1.0), [0.0; 3]));
        let bytes = encode(&vol, DataType::Uint8);
        assert_eq!(bytes.len(), VOX_OFFSET + 4);
        assert_eq!(&bytes[VOX_OFFSET..], &[0u8, 0, 1, 255]);
        assert_eq!(i16::from_le_bytes([bytes[70], bytes[71]]), 2);
    }

    #[test]
    fn test_header_only_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hdr.nii.gz");
        save(&sample_volume((5, 4, 3)), &path).unwrap();
        let header = read_header(&path).unwrap();
        assert_eq!(header.dims, (5, 4, 3));
        assert_eq!(header.dtype, Some(DataType::Float32));
        assert!((header.voxel_size.2 - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_affine_qform_fallback() {
        let mut header = NiftiHeader::default();
        header.pixdim = [1.0, 2.0, 2.0, 2.0, 1.0, 1.0, 1.0, 1.0];
        header.sform_code = 0;
        header.qform_code = 1;
        // identity rotation
        header.quatern_b = 0.0;
        header.quatern_c = 0.0;
        header.quatern_d = 0.0;
        header.quatern_x = 5.0;

        let affine = get_affine(&header);
        assert!((affine[0] - 2.0).abs() < 1e-9);
        assert!((affine[5] - 2.0).abs() < 1e-9);
        assert!((affine[10] - 2.0).abs() < 1e-9);
        assert!((affine[3] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_affine_identity_fallback() {
        let mut header = NiftiHeader::default();
        header.pixdim[1] = 1.0;
        header.pixdim[2] = 2.0;
        header.pixdim[3] = 3.0;
        header.sform_code = 0;
        header.qform_code = 0;

        let affine = get_affine(&header);
        assert_eq!(affine[0], 1.0);
        assert_eq!(affine[5], 2.0);
        assert_eq!(affine[10], 3.0);
    }

    #[test]
    fn test_load_invalid_bytes() {
        let err = load_from_bytes(&[0u8; 10], Path::new("bogus.nii")).unwrap_err();
        assert!(err.to_string().contains("bogus.nii"), "{}", err);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = load(Path::new("/tmp/nonexistent_qsm_file_12345.nii")).unwrap_err();
        assert!(matches!(err, QsmError::Io { .. }), "got {:?}", err);
    }

    #[test]
    fn test_save_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut vol = sample_volume((2, 2, 2));
        vol.data.pop();
        let err = save(&vol, &dir.path().join("x.nii")).unwrap_err();
        assert!(matches!(err, QsmError::ShapeMismatch(_)));
    }
}
