//! Connectivity analysis on binary masks
//!
//! Masks hold one byte per voxel (non-zero means set), x fastest, then y,
//! then z. Dimensions are always given as `[x, y, z]`.

pub mod ccl;
pub mod fill;
pub mod policy;

pub use ccl::{label_components, PROVISIONAL_LABEL_LIMIT};
pub use fill::fill_holes;
pub use policy::{coalesce_top, sort_by_volume};

use crate::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which neighbors count as adjacent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Connectivity {
    /// 2-D edge neighbors
    Four,
    /// 2-D edge and corner neighbors
    Eight,
    /// 3-D face neighbors
    Six,
    /// 3-D face, edge and corner neighbors
    TwentySix,
}

impl Connectivity {
    pub fn neighbor_count(&self) -> u8 {
        match self {
            Connectivity::Four => 4,
            Connectivity::Eight => 8,
            Connectivity::Six => 6,
            Connectivity::TwentySix => 26,
        }
    }

    pub fn is_3d(&self) -> bool {
        matches!(self, Connectivity::Six | Connectivity::TwentySix)
    }

    /// All neighbor offsets as `[dx, dy, dz]`
    pub fn neighbor_offsets(&self) -> Vec<[isize; 3]> {
        let mut offsets = Vec::with_capacity(self.neighbor_count() as usize);
        for dz in -1isize..=1 {
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let moved = (dx != 0) as u8 + (dy != 0) as u8 + (dz != 0) as u8;
                    let keep = match self {
                        Connectivity::Four => dz == 0 && moved == 1,
                        Connectivity::Eight => dz == 0 && moved > 0,
                        Connectivity::Six => moved == 1,
                        Connectivity::TwentySix => moved > 0,
                    };
                    if keep {
                        offsets.push([dx, dy, dz]);
                    }
                }
            }
        }
        offsets
    }

    /// Offsets of neighbors visited before the current voxel in scan order
    pub fn backward_offsets(&self) -> Vec<[isize; 3]> {
        self.neighbor_offsets()
            .into_iter()
            .filter(|[dx, dy, dz]| (*dz, *dy, *dx) < (0, 0, 0))
            .collect()
    }
}

impl TryFrom<u8> for Connectivity {
    type Error = VolumeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            4 => Ok(Connectivity::Four),
            8 => Ok(Connectivity::Eight),
            6 => Ok(Connectivity::Six),
            26 => Ok(Connectivity::TwentySix),
            other => Err(VolumeError::Validation(format!(
                "Unsupported connectivity {}",
                other
            ))),
        }
    }
}

impl From<Connectivity> for u8 {
    fn from(connectivity: Connectivity) -> Self {
        connectivity.neighbor_count()
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-connectivity", self.neighbor_count())
    }
}

/// Extent and size of one labeled component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelInfo {
    /// Inclusive `[x, y, z]` minimum
    pub bounding_box_min: [usize; 3],
    /// Inclusive `[x, y, z]` maximum
    pub bounding_box_max: [usize; 3],
    /// Voxel count
    pub volume: usize,
}

impl LabelInfo {
    pub(crate) fn at(point: [usize; 3]) -> Self {
        Self {
            bounding_box_min: point,
            bounding_box_max: point,
            volume: 1,
        }
    }

    pub(crate) fn include(&mut self, point: [usize; 3]) {
        for axis in 0..3 {
            self.bounding_box_min[axis] = self.bounding_box_min[axis].min(point[axis]);
            self.bounding_box_max[axis] = self.bounding_box_max[axis].max(point[axis]);
        }
        self.volume += 1;
    }

    /// Union of two components' extents and sizes
    pub fn merged(&self, other: &LabelInfo) -> LabelInfo {
        let mut merged = *self;
        for axis in 0..3 {
            let (lo, hi) = (&mut merged.bounding_box_min[axis], &mut merged.bounding_box_max[axis]);
            *lo = (*lo).min(other.bounding_box_min[axis]);
            *hi = (*hi).max(other.bounding_box_max[axis]);
        }
        merged.volume += other.volume;
        merged
    }
}

/// Output of one labeling pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelingResult {
    /// Component id per voxel, `0` for background
    pub label_map: Vec<u8>,
    pub label_count: usize,
    /// `labels[i]` describes component `i + 1`
    pub labels: Vec<LabelInfo>,
}

impl LabelingResult {
    /// Description of component `id`
    pub fn label(&self, id: u8) -> Option<&LabelInfo> {
        (id as usize).checked_sub(1).and_then(|i| self.labels.get(i))
    }
}

/// Output of one hole filling pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoleFillingResult {
    /// Filled mask, `0` or `1` per voxel
    #[serde(rename = "resultBuffer")]
    pub filled: Vec<u8>,
    /// Enclosed background components
    pub hole_count: usize,
    /// Voxels switched from background to foreground
    pub hole_volume: usize,
}

/// Reject masks whose length does not match positive dimensions
pub(crate) fn check_mask(mask: &[u8], dims: [usize; 3]) -> Result<()> {
    let [x, y, z] = dims;
    if x == 0 || y == 0 || z == 0 {
        return Err(VolumeError::InvalidDimensions(format!(
            "Mask dimensions must be positive, got {}x{}x{}",
            x, y, z
        )));
    }
    if mask.len() != x * y * z {
        return Err(VolumeError::InvalidDimensions(format!(
            "Mask holds {} voxels, expected {}",
            mask.len(),
            x * y * z
        )));
    }
    Ok(())
}

/// Number of set voxels
pub fn count_set(mask: &[u8]) -> usize {
    mask.iter().filter(|&&v| v != 0).count()
}
