//! Core data types for the volume engine

use crate::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric representation of one voxel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PixelFormat {
    /// 1 bit per voxel, 8 voxels packed per byte (MSB first)
    Binary = 0,
    /// Signed 8-bit integer
    Int8 = 1,
    /// Unsigned 8-bit integer
    UInt8 = 2,
    /// Signed 16-bit integer
    Int16 = 3,
    /// Unsigned 16-bit integer
    UInt16 = 4,
}

impl PixelFormat {
    /// Smallest representable value
    pub fn min_level(&self) -> i32 {
        match self {
            PixelFormat::Binary | PixelFormat::UInt8 | PixelFormat::UInt16 => 0,
            PixelFormat::Int8 => i8::MIN as i32,
            PixelFormat::Int16 => i16::MIN as i32,
        }
    }

    /// Largest representable value
    pub fn max_level(&self) -> i32 {
        match self {
            PixelFormat::Binary => 1,
            PixelFormat::Int8 => i8::MAX as i32,
            PixelFormat::UInt8 => u8::MAX as i32,
            PixelFormat::Int16 => i16::MAX as i32,
            PixelFormat::UInt16 => u16::MAX as i32,
        }
    }

    /// Bytes used by one voxel, `None` for the bit-packed binary format
    pub fn bytes_per_voxel(&self) -> Option<usize> {
        match self {
            PixelFormat::Binary => None,
            PixelFormat::Int8 | PixelFormat::UInt8 => Some(1),
            PixelFormat::Int16 | PixelFormat::UInt16 => Some(2),
        }
    }

    /// Byte length of one slice holding `voxels` voxels
    pub fn slice_byte_len(&self, voxels: usize) -> usize {
        match self.bytes_per_voxel() {
            Some(bpv) => voxels * bpv,
            None => voxels.div_ceil(8),
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, PixelFormat::Int8 | PixelFormat::Int16)
    }

    /// Check whether `value` is representable in this format
    pub fn contains(&self, value: i32) -> bool {
        value >= self.min_level() && value <= self.max_level()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Orientation of a 2-D cut through a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// Fixed z
    #[default]
    Axial,
    /// Fixed y
    Coronal,
    /// Fixed x
    Sagittal,
}

/// Axis-aligned box in voxel coordinates; `min` inclusive, `max` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Box3 {
    pub min: [i64; 3],
    pub max: [i64; 3],
}

impl Box3 {
    /// Create a new box, rejecting inverted or empty extents
    pub fn new(min: [i64; 3], max: [i64; 3]) -> Result<Self> {
        let bounds = Self { min, max };
        bounds.validate()?;
        Ok(bounds)
    }

    /// Reject boxes built from literals or JSON with inverted or empty extents
    pub fn validate(&self) -> Result<()> {
        if (0..3).any(|i| self.max[i] <= self.min[i]) {
            return Err(VolumeError::InvalidDimensions(format!(
                "Box max {:?} must exceed min {:?} on every axis",
                self.max, self.min
            )));
        }
        Ok(())
    }

    /// Box covering `[0, size)` on every axis
    pub fn from_size(size: [usize; 3]) -> Self {
        Self {
            min: [0; 3],
            max: [size[0] as i64, size[1] as i64, size[2] as i64],
        }
    }

    /// Extent along each axis
    pub fn size(&self) -> [usize; 3] {
        [
            (self.max[0] - self.min[0]) as usize,
            (self.max[1] - self.min[1]) as usize,
            (self.max[2] - self.min[2]) as usize,
        ]
    }

    pub fn contains(&self, point: [i64; 3]) -> bool {
        (0..3).all(|i| point[i] >= self.min[i] && point[i] < self.max[i])
    }

    /// Check that this box lies within `[0, size)`
    pub fn is_within(&self, size: [usize; 3]) -> bool {
        (0..3).all(|i| self.min[i] >= 0 && self.max[i] <= size[i] as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_levels() {
        assert_eq!(PixelFormat::Binary.max_level(), 1);
        assert_eq!(PixelFormat::Int8.min_level(), -128);
        assert_eq!(PixelFormat::UInt16.max_level(), 65535);
        assert_eq!(PixelFormat::Int16.min_level(), -32768);
        assert!(PixelFormat::UInt8.contains(255));
        assert!(!PixelFormat::UInt8.contains(-1));
    }

    #[test]
    fn test_slice_byte_len() {
        assert_eq!(PixelFormat::Binary.slice_byte_len(16), 2);
        assert_eq!(PixelFormat::Binary.slice_byte_len(17), 3);
        assert_eq!(PixelFormat::Int16.slice_byte_len(17), 34);
        assert_eq!(PixelFormat::UInt8.slice_byte_len(17), 17);
    }

    #[test]
    fn test_pixel_format_serde() {
        let json = serde_json::to_string(&PixelFormat::UInt16).unwrap();
        assert_eq!(json, "\"uint16\"");
        let parsed: PixelFormat = serde_json::from_str("\"binary\"").unwrap();
        assert_eq!(parsed, PixelFormat::Binary);
    }

    #[test]
    fn test_box3() {
        assert!(Box3::new([0, 0, 0], [0, 1, 1]).is_err());
        let b = Box3::new([-1, 0, 2], [3, 4, 5]).unwrap();
        assert_eq!(b.size(), [4, 4, 3]);
        assert!(b.contains([-1, 0, 2]));
        assert!(!b.contains([3, 0, 2]));
        assert!(!b.is_within([10, 10, 10]));
        assert!(Box3::from_size([2, 3, 4]).is_within([2, 3, 4]));
    }
}
