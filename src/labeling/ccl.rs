//! Single-scan connected-component labeling
//!
//! Each set voxel takes the label of its already visited neighbors; when
//! neighbors disagree their labels are merged in a union-find table. A
//! second pass replaces provisional labels by consecutive final ids.
//! Provisional labels are 8-bit, so at most [`PROVISIONAL_LABEL_LIMIT`]
//! may be allocated in one scan.

use super::{check_mask, Connectivity, LabelInfo, LabelingResult};
use crate::error::{Result, VolumeError};
use log::debug;

/// Maximum number of provisional labels one scan may allocate
pub const PROVISIONAL_LABEL_LIMIT: usize = u8::MAX as usize;

/// Union-find over provisional labels `1..=255`
struct LabelTable {
    parent: [u8; 256],
    next: usize,
}

impl LabelTable {
    fn new() -> Self {
        Self {
            parent: [0; 256],
            next: 1,
        }
    }

    fn allocate(&mut self) -> Result<u8> {
        if self.next > PROVISIONAL_LABEL_LIMIT {
            return Err(VolumeError::Capacity {
                limit: PROVISIONAL_LABEL_LIMIT,
            });
        }
        let label = self.next as u8;
        self.parent[label as usize] = label;
        self.next += 1;
        Ok(label)
    }

    fn find(&mut self, mut label: u8) -> u8 {
        while self.parent[label as usize] != label {
            let grandparent = self.parent[self.parent[label as usize] as usize];
            self.parent[label as usize] = grandparent;
            label = grandparent;
        }
        label
    }

    /// Merge two sets; the smaller root survives
    fn union(&mut self, a: u8, b: u8) -> u8 {
        let ra = self.find(a);
        let rb = self.find(b);
        let (lo, hi) = if ra <= rb { (ra, rb) } else { (rb, ra) };
        self.parent[hi as usize] = lo;
        lo
    }

    fn allocated(&self) -> usize {
        self.next - 1
    }
}

fn step(position: usize, delta: isize, extent: usize) -> Option<usize> {
    let moved = position.checked_add_signed(delta)?;
    (moved < extent).then_some(moved)
}

/// Label the connected components of `mask`.
///
/// 4- and 8-connectivity require `dims[2] == 1`. Fails with
/// [`VolumeError::Capacity`] when more than 255 provisional labels are
/// needed.
pub fn label_components(
    mask: &[u8],
    dims: [usize; 3],
    connectivity: Connectivity,
) -> Result<LabelingResult> {
    check_mask(mask, dims)?;
    let [nx, ny, nz] = dims;
    if !connectivity.is_3d() && nz != 1 {
        return Err(VolumeError::Validation(format!(
            "{} needs a single slice, got depth {}",
            connectivity, nz
        )));
    }
    let index = |x: usize, y: usize, z: usize| x + nx * (y + ny * z);
    let offsets = connectivity.backward_offsets();

    let mut labels = vec![0u8; mask.len()];
    let mut table = LabelTable::new();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let idx = index(x, y, z);
                if mask[idx] == 0 {
                    continue;
                }
                let mut label = 0u8;
                for &[dx, dy, dz] in &offsets {
                    let (Some(px), Some(py), Some(pz)) =
                        (step(x, dx, nx), step(y, dy, ny), step(z, dz, nz))
                    else {
                        continue;
                    };
                    let neighbor = labels[index(px, py, pz)];
                    if neighbor == 0 {
                        continue;
                    }
                    label = if label == 0 {
                        table.find(neighbor)
                    } else {
                        table.union(label, neighbor)
                    };
                }
                if label == 0 {
                    label = table.allocate()?;
                }
                labels[idx] = label;
            }
        }
    }

    // Compression: consecutive ids in order of first appearance
    let mut final_ids = [0u8; 256];
    let mut infos: Vec<LabelInfo> = Vec::new();
    for z in 0..nz {
        for y in 0..ny {
            for x in 0..nx {
                let idx = index(x, y, z);
                if labels[idx] == 0 {
                    continue;
                }
                let root = table.find(labels[idx]) as usize;
                if final_ids[root] == 0 {
                    infos.push(LabelInfo::at([x, y, z]));
                    final_ids[root] = infos.len() as u8;
                } else {
                    infos[final_ids[root] as usize - 1].include([x, y, z]);
                }
                labels[idx] = final_ids[root];
            }
        }
    }

    debug!(
        "Labeled {}x{}x{} mask with {}: {} provisional, {} final labels",
        nx,
        ny,
        nz,
        connectivity,
        table.allocated(),
        infos.len()
    );
    Ok(LabelingResult {
        label_map: labels,
        label_count: infos.len(),
        labels: infos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(rows: &[&str]) -> (Vec<u8>, [usize; 3]) {
        let width = rows[0].len();
        let mask = rows
            .iter()
            .flat_map(|row| row.bytes().map(|b| (b == b'#') as u8))
            .collect();
        (mask, [width, rows.len(), 1])
    }

    #[test]
    fn test_empty_mask() {
        let result = label_components(&[0; 12], [4, 3, 1], Connectivity::Four).unwrap();
        assert_eq!(result.label_count, 0);
        assert!(result.labels.is_empty());
        assert!(result.label_map.iter().all(|&l| l == 0));
    }

    #[test]
    fn test_full_mask_is_one_component() {
        let (w, h) = (7, 5);
        let result = label_components(&vec![1; w * h], [w, h, 1], Connectivity::Four).unwrap();
        assert_eq!(result.label_count, 1);
        let info = result.label(1).unwrap();
        assert_eq!(info.bounding_box_min, [0, 0, 0]);
        assert_eq!(info.bounding_box_max, [w - 1, h - 1, 0]);
        assert_eq!(info.volume, w * h);
    }

    #[test]
    fn test_diagonal_depends_on_connectivity() {
        let (mask, dims) = parse(&["#..", ".#.", "..#"]);
        assert_eq!(label_components(&mask, dims, Connectivity::Four).unwrap().label_count, 3);
        assert_eq!(label_components(&mask, dims, Connectivity::Eight).unwrap().label_count, 1);
    }

    #[test]
    fn test_u_shape_merges() {
        // Two arms get different provisional labels and meet at the bottom
        let (mask, dims) = parse(&["#.#.#", "#.#.#", "###.#"]);
        let result = label_components(&mask, dims, Connectivity::Four).unwrap();
        assert_eq!(result.label_count, 2);
        assert_eq!(result.label_map[0], 1);
        assert_eq!(result.label_map[2], 1);
        assert_eq!(result.label_map[4], 2);
        assert_eq!(result.label(1).unwrap().volume, 7);
        assert_eq!(result.label(2).unwrap().volume, 3);
    }

    #[test]
    fn test_anti_diagonal_under_eight() {
        let (mask, dims) = parse(&["..#", ".#.", "#.."]);
        assert_eq!(label_components(&mask, dims, Connectivity::Eight).unwrap().label_count, 1);
    }

    #[test]
    fn test_3d_connectivity() {
        // Voxels (0,0,0) and (1,1,1) touch only at a corner
        let mut mask = vec![0u8; 8];
        mask[0] = 1;
        mask[7] = 1;
        let six = label_components(&mask, [2, 2, 2], Connectivity::Six).unwrap();
        assert_eq!(six.label_count, 2);
        assert_eq!(six.label(2).unwrap().bounding_box_min, [1, 1, 1]);
        let all = label_components(&mask, [2, 2, 2], Connectivity::TwentySix).unwrap();
        assert_eq!(all.label_count, 1);
    }

    #[test]
    fn test_2d_connectivity_rejects_depth() {
        let err = label_components(&[1; 8], [2, 2, 2], Connectivity::Four).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_capacity_limit() {
        // Isolated voxels on even columns of a single row
        let isolated = |count: usize| {
            let width = count * 2 - 1;
            let mask: Vec<u8> = (0..width).map(|x| (x % 2 == 0) as u8).collect();
            (mask, [width, 1, 1])
        };
        let (mask, dims) = isolated(255);
        assert_eq!(label_components(&mask, dims, Connectivity::Four).unwrap().label_count, 255);

        let (mask, dims) = isolated(256);
        let err = label_components(&mask, dims, Connectivity::Four).unwrap_err();
        assert!(matches!(err, VolumeError::Capacity { limit: 255 }));

        // A 40x40 checkerboard exceeds the limit under 4-connectivity only
        let mask: Vec<u8> = (0..1600).map(|i| ((i % 40 + i / 40) % 2 == 0) as u8).collect();
        assert!(label_components(&mask, [40, 40, 1], Connectivity::Four).is_err());
        let eight = label_components(&mask, [40, 40, 1], Connectivity::Eight).unwrap();
        assert_eq!(eight.label_count, 1);
    }
}
