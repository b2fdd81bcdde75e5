//! Binary morphology on 3D masks
//!
//! All operations use the 6-connected (face-neighbour) structuring element.
//! Voxels outside the volume count as background.

use crate::volume::idx3d;

/// Face neighbours of (i, j, k) that lie inside the volume
#[inline]
fn for_each_neighbor<F: FnMut(usize)>(i: usize, j: usize, k: usize, nx: usize, ny: usize, nz: usize, mut f: F) {
    if i > 0 { f(idx3d(i - 1, j, k, nx, ny)); }
    if i + 1 < nx { f(idx3d(i + 1, j, k, nx, ny)); }
    if j > 0 { f(idx3d(i, j - 1, k, nx, ny)); }
    if j + 1 < ny { f(idx3d(i, j + 1, k, nx, ny)); }
    if k > 0 { f(idx3d(i, j, k - 1, nx, ny)); }
    if k + 1 < nz { f(idx3d(i, j, k + 1, nx, ny)); }
}

#[inline]
fn on_boundary(i: usize, j: usize, k: usize, nx: usize, ny: usize, nz: usize) -> bool {
    i == 0 || i + 1 == nx || j == 0 || j + 1 == ny || k == 0 || k + 1 == nz
}

/// Erode a binary mask `iterations` times; `iterations == 0` is identity
pub fn erode_binary(mask: &[u8], nx: usize, ny: usize, nz: usize, iterations: usize) -> Vec<u8> {
    let mut current: Vec<u8> = mask.iter().map(|&m| (m != 0) as u8).collect();
    for _ in 0..iterations {
        let mut next = vec![0u8; current.len()];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = idx3d(i, j, k, nx, ny);
                    if current[idx] == 0 || on_boundary(i, j, k, nx, ny, nz) {
                        continue;
                    }
                    let mut keep = true;
                    for_each_neighbor(i, j, k, nx, ny, nz, |n| keep &= current[n] != 0);
                    if keep {
                        next[idx] = 1;
                    }
                }
            }
        }
        current = next;
    }
    current
}

/// Dilate a binary mask `iterations` times
pub fn dilate_binary(mask: &[u8], nx: usize, ny: usize, nz: usize, iterations: usize) -> Vec<u8> {
    let mut current: Vec<u8> = mask.iter().map(|&m| (m != 0) as u8).collect();
    for _ in 0..iterations {
        let mut next = current.clone();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    if current[idx3d(i, j, k, nx, ny)] != 0 {
                        for_each_neighbor(i, j, k, nx, ny, nz, |n| next[n] = 1);
                    }
                }
            }
        }
        current = next;
    }
    current
}

/// Find connected background component using flood fill (6-connectivity)
///
/// # Returns
/// (component voxel indices, whether the component touches the volume edge)
fn flood_fill_background(
    mask: &[u8],
    visited: &mut [bool],
    start: usize,
    nx: usize, ny: usize, nz: usize,
) -> (Vec<usize>, bool) {
    let mut component = Vec::new();
    let mut touches_boundary = false;
    let mut stack = vec![start];
    visited[start] = true;

    while let Some(idx) = stack.pop() {
        component.push(idx);

        let k = idx / (nx * ny);
        let rem = idx % (nx * ny);
        let j = rem / nx;
        let i = rem % nx;
        touches_boundary |= on_boundary(i, j, k, nx, ny, nz);

        for_each_neighbor(i, j, k, nx, ny, nz, |n| {
            if !visited[n] && mask[n] == 0 {
                visited[n] = true;
                stack.push(n);
            }
        });
    }

    (component, touches_boundary)
}

/// Fill enclosed background (holes) in a binary mask
///
/// Any connected background component that does not reach the volume edge
/// becomes foreground.
pub fn fill_holes(mask: &[u8], nx: usize, ny: usize, nz: usize) -> Vec<u8> {
    let n_total = nx * ny * nz;
    let mut result: Vec<u8> = mask.iter().map(|&m| (m != 0) as u8).collect();
    let mut visited = vec![false; n_total];

    for idx in 0..n_total {
        if mask[idx] == 0 && !visited[idx] {
            let (component, touches_boundary) = flood_fill_background(mask, &mut visited, idx, nx, ny, nz);
            if !touches_boundary {
                for cidx in component {
                    result[cidx] = 1;
                }
            }
        }
    }

    result
}

/// Morphological hole filling with optional closing
///
/// `strength` dilations are applied first so that holes open to the
/// outside through thin gaps become enclosed; the same number of erosions
/// follows the fill. The result always contains the input mask.
pub fn fill_holes_morphological(mask: &[u8], nx: usize, ny: usize, nz: usize, strength: usize) -> Vec<u8> {
    if strength == 0 {
        return fill_holes(mask, nx, ny, nz);
    }
    let dilated = dilate_binary(mask, nx, ny, nz, strength);
    let filled = fill_holes(&dilated, nx, ny, nz);
    let closed = erode_binary(&filled, nx, ny, nz, strength);
    union(&closed, mask)
}

/// Voxelwise OR of two masks
pub fn union(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(&x, &y)| (x != 0 || y != 0) as u8).collect()
}

/// true when every voxel set in `inner` is set in `outer`
pub fn is_subset(inner: &[u8], outer: &[u8]) -> bool {
    inner.iter().zip(outer).all(|(&a, &b)| a == 0 || b != 0)
}

pub fn count(mask: &[u8]) -> usize {
    mask.iter().filter(|&&m| m != 0).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube(n: usize, lo: usize, hi: usize) -> Vec<u8> {
        let mut mask = vec![0u8; n * n * n];
        for k in lo..hi {
            for j in lo..hi {
                for i in lo..hi {
                    mask[idx3d(i, j, k, n, n)] = 1;
                }
            }
        }
        mask
    }

    #[test]
    fn test_erode_zero_iterations_is_identity() {
        let mask = cube(6, 1, 5);
        assert_eq!(erode_binary(&mask, 6, 6, 6, 0), mask);
    }

    #[test]
    fn test_erode_peels_one_layer() {
        let mask = cube(7, 1, 6);
        let eroded = erode_binary(&mask, 7, 7, 7, 1);
        assert_eq!(eroded, cube(7, 2, 5));
        let twice = erode_binary(&mask, 7, 7, 7, 2);
        assert_eq!(count(&twice), 1);
    }

    #[test]
    fn test_erode_is_six_connected() {
        // plus-shaped neighbourhood keeps the centre; a missing diagonal does not matter
        let n = 3;
        let mut mask = vec![0u8; 27];
        let c = idx3d(1, 1, 1, n, n);
        mask[c] = 1;
        for_each_neighbor(1, 1, 1, n, n, n, |idx| mask[idx] = 1);
        // 3x3x3 volume: centre is not on the boundary
        let eroded = erode_binary(&mask, n, n, n, 1);
        assert_eq!(eroded[c], 1);
        assert_eq!(count(&eroded), 1);
    }

    #[test]
    fn test_fill_holes_enclosed_cavity() {
        let n = 7;
        let mut mask = cube(n, 1, 6);
        let centre = idx3d(3, 3, 3, n, n);
        mask[centre] = 0;
        let filled = fill_holes(&mask, n, n, n);
        assert_eq!(filled[centre], 1);
        assert_eq!(filled, cube(n, 1, 6));
    }

    #[test]
    fn test_fill_holes_keeps_outside() {
        let n = 7;
        let mask = cube(n, 2, 5);
        let filled = fill_holes(&mask, n, n, n);
        assert_eq!(filled, mask, "background touching the edge must stay background");
    }

    #[test]
    fn test_morphological_fill_contains_input() {
        let n = 9;
        let mut mask = cube(n, 1, 8);
        // tunnel from the centre to the outside along x
        for i in 0..5 {
            mask[idx3d(i, 4, 4, n, n)] = 0;
        }
        let plain = fill_holes(&mask, n, n, n);
        assert_eq!(plain[idx3d(4, 4, 4, n, n)], 0, "tunnel is open to the edge");
        let closed = fill_holes_morphological(&mask, n, n, n, 1);
        assert!(is_subset(&mask, &closed));
        assert_eq!(closed[idx3d(4, 4, 4, n, n)], 1, "closing should seal the tunnel");
    }

    #[test]
    fn test_union_and_subset() {
        let a = vec![1, 0, 0, 1];
        let b = vec![0, 0, 1, 1];
        let u = union(&a, &b);
        assert_eq!(u, vec![1, 0, 1, 1]);
        assert!(is_subset(&a, &u));
        assert!(!is_subset(&u, &a));
    }
}
