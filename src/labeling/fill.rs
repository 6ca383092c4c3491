//! Hole filling
//!
//! Background voxels that cannot reach the outer boundary through other
//! background voxels are holes. With 4/8 connectivity each slice of the
//! chosen orientation is processed independently and in parallel; with 6/26
//! connectivity the whole volume is flooded at once.

use super::{check_mask, Connectivity, HoleFillingResult};
use crate::error::{Result, VolumeError};
use crate::types::Orientation;
use log::debug;
use ndarray::{Array3, ArrayViewMut3, Axis};
use rayon::prelude::*;
use std::collections::VecDeque;

/// Fill enclosed background regions of `mask`.
///
/// `orientation` selects the slicing axis for 2-D connectivity and is
/// ignored for 3-D connectivity.
pub fn fill_holes(
    mask: &[u8],
    dims: [usize; 3],
    connectivity: Connectivity,
    orientation: Orientation,
) -> Result<HoleFillingResult> {
    check_mask(mask, dims)?;
    let [nx, ny, nz] = dims;
    let binary: Vec<u8> = mask.iter().map(|&v| (v != 0) as u8).collect();
    let mut grid = Array3::from_shape_vec((nz, ny, nx), binary)
        .map_err(|e| VolumeError::InvalidDimensions(e.to_string()))?;

    // Offsets are reordered to the (z, y, x) axis order of the grid
    let offsets: Vec<[isize; 3]> = connectivity
        .neighbor_offsets()
        .into_iter()
        .map(|[dx, dy, dz]| [dz, dy, dx])
        .collect();

    let (hole_count, hole_volume) = if connectivity.is_3d() {
        flood_enclosed(grid.view_mut(), &offsets)
    } else {
        let axis = match orientation {
            Orientation::Axial => Axis(0),
            Orientation::Coronal => Axis(1),
            Orientation::Sagittal => Axis(2),
        };
        grid.axis_iter_mut(axis)
            .into_par_iter()
            .map(|plane| flood_enclosed(plane.insert_axis(Axis(0)), &offsets))
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
    };

    debug!(
        "Filled {} holes ({} voxels) in {}x{}x{} mask with {}",
        hole_count, hole_volume, nx, ny, nz, connectivity
    );
    Ok(HoleFillingResult {
        filled: grid.iter().copied().collect(),
        hole_count,
        hole_volume,
    })
}

fn neighbor(point: [usize; 3], offset: [isize; 3], shape: [usize; 3]) -> Option<[usize; 3]> {
    let mut moved = [0usize; 3];
    for axis in 0..3 {
        let value = point[axis].checked_add_signed(offset[axis])?;
        if value >= shape[axis] {
            return None;
        }
        moved[axis] = value;
    }
    Some(moved)
}

/// Flood the background from the boundary, then fill what stayed dry.
///
/// A voxel lies on the boundary when one of its `offsets` leaves the grid,
/// so planar offsets never treat the flat axis as a boundary. Returns the
/// number of holes and the voxels filled.
fn flood_enclosed(mut grid: ArrayViewMut3<'_, u8>, offsets: &[[isize; 3]]) -> (usize, usize) {
    let (d, h, w) = grid.dim();
    let shape = [d, h, w];
    let mut reached = Array3::<bool>::from_elem((d, h, w), false);
    let mut queue = VecDeque::new();

    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let point = [z, y, x];
                if grid[point] != 0 {
                    continue;
                }
                if offsets.iter().any(|&o| neighbor(point, o, shape).is_none()) {
                    reached[point] = true;
                    queue.push_back(point);
                }
            }
        }
    }
    spread(&grid, &mut reached, &mut queue, offsets);

    let mut hole_count = 0;
    let mut hole_volume = 0;
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let seed = [z, y, x];
                if grid[seed] != 0 || reached[seed] {
                    continue;
                }
                hole_count += 1;
                reached[seed] = true;
                queue.push_back(seed);
                while let Some(point) = queue.pop_front() {
                    grid[point] = 1;
                    hole_volume += 1;
                    for &offset in offsets {
                        if let Some(next) = neighbor(point, offset, shape) {
                            if grid[next] == 0 && !reached[next] {
                                reached[next] = true;
                                queue.push_back(next);
                            }
                        }
                    }
                }
            }
        }
    }
    (hole_count, hole_volume)
}

/// Breadth-first spread of `reached` through background voxels
fn spread(
    grid: &ArrayViewMut3<'_, u8>,
    reached: &mut Array3<bool>,
    queue: &mut VecDeque<[usize; 3]>,
    offsets: &[[isize; 3]],
) {
    let (d, h, w) = grid.dim();
    let shape = [d, h, w];
    while let Some(point) = queue.pop_front() {
        for &offset in offsets {
            if let Some(next) = neighbor(point, offset, shape) {
                if grid[next] == 0 && !reached[next] {
                    reached[next] = true;
                    queue.push_back(next);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::count_set;

    fn ring(size: usize) -> Vec<u8> {
        (0..size * size)
            .map(|i| {
                let (x, y) = (i % size, i / size);
                (x == 0 || y == 0 || x == size - 1 || y == size - 1) as u8
            })
            .collect()
    }

    fn hollow_cube(size: usize) -> Vec<u8> {
        (0..size * size * size)
            .map(|i| {
                let (x, y, z) = (i % size, (i / size) % size, i / (size * size));
                let edge = |v: usize| v == 0 || v == size - 1;
                (edge(x) || edge(y) || edge(z)) as u8
            })
            .collect()
    }

    #[test]
    fn test_ring_is_filled() {
        let mask = ring(5);
        let result = fill_holes(&mask, [5, 5, 1], Connectivity::Four, Orientation::Axial).unwrap();
        assert_eq!(result.hole_count, 1);
        assert_eq!(result.hole_volume, 9);
        assert!(result.filled.iter().all(|&v| v == 1));
    }

    #[test]
    fn test_diagonal_gap_depends_on_connectivity() {
        // Ring with its corner removed: the inside leaks diagonally
        let mut mask = ring(4);
        mask[0] = 0;
        let four = fill_holes(&mask, [4, 4, 1], Connectivity::Four, Orientation::Axial).unwrap();
        assert_eq!(four.hole_volume, 4);
        let eight = fill_holes(&mask, [4, 4, 1], Connectivity::Eight, Orientation::Axial).unwrap();
        assert_eq!(eight.hole_volume, 0);
        assert_eq!(eight.hole_count, 0);
    }

    #[test]
    fn test_hollow_shell_3d() {
        let mask = hollow_cube(5);
        for connectivity in [Connectivity::Six, Connectivity::TwentySix] {
            let result = fill_holes(&mask, [5, 5, 5], connectivity, Orientation::Axial).unwrap();
            assert_eq!(result.hole_count, 1);
            assert_eq!(result.hole_volume, 27);
            assert_eq!(count_set(&result.filled), count_set(&mask) + result.hole_volume);
        }
    }

    #[test]
    fn test_orientation_selects_planes() {
        // A closed tube along z: axial slices are rings, sagittal slices are open
        let size = 5;
        let depth = 3;
        let slice = ring(size);
        let mask: Vec<u8> = (0..depth).flat_map(|_| slice.iter().copied()).collect();
        let dims = [size, size, depth];

        let axial = fill_holes(&mask, dims, Connectivity::Four, Orientation::Axial).unwrap();
        assert_eq!(axial.hole_count, depth);
        assert_eq!(axial.hole_volume, 9 * depth);

        let sagittal = fill_holes(&mask, dims, Connectivity::Four, Orientation::Sagittal).unwrap();
        assert_eq!(sagittal.hole_volume, 0);
        let coronal = fill_holes(&mask, dims, Connectivity::Four, Orientation::Coronal).unwrap();
        assert_eq!(coronal.hole_volume, 0);

        // In 3-D the tube is open at both ends
        let open = fill_holes(&mask, dims, Connectivity::Six, Orientation::Axial).unwrap();
        assert_eq!(open.hole_volume, 0);
    }

    #[test]
    fn test_set_count_invariant() {
        let masks: Vec<(Vec<u8>, [usize; 3])> = vec![
            (vec![0; 16], [4, 4, 1]),
            (vec![1; 16], [4, 4, 1]),
            (ring(6), [6, 6, 1]),
            ((0..64).map(|i| (i % 3 == 0) as u8).collect(), [4, 4, 4]),
            (hollow_cube(4), [4, 4, 4]),
        ];
        for (mask, dims) in masks {
            for connectivity in [
                Connectivity::Four,
                Connectivity::Eight,
                Connectivity::Six,
                Connectivity::TwentySix,
            ] {
                let result = fill_holes(&mask, dims, connectivity, Orientation::Axial).unwrap();
                assert_eq!(count_set(&result.filled), count_set(&mask) + result.hole_volume);
            }
        }
    }

    #[test]
    fn test_rejects_bad_dims() {
        assert!(fill_holes(&[0; 3], [2, 2, 1], Connectivity::Four, Orientation::Axial).is_err());
    }
}
