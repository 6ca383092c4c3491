//! Volume metadata carried by global header and footer frames

use crate::error::{Result, VolumeError};
use crate::partial::PartialVolumeDescriptor;
use crate::types::PixelFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Display window as level (center) and width
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowLevel {
    pub level: f64,
    pub width: f64,
}

impl WindowLevel {
    pub fn new(level: f64, width: f64) -> Self {
        Self { level, width }
    }
}

/// Complete metadata for a (possibly partial) volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMetadata {
    /// Number of voxels along x, y and z
    pub voxel_count: [usize; 3],

    /// Physical voxel spacing
    #[serde(default = "unit_voxel_size")]
    pub voxel_size: [f32; 3],

    /// Voxel representation
    pub pixel_format: PixelFormat,

    /// Window recorded in the source images
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dicom_window: Option<WindowLevel>,

    /// Window derived from the observed value range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_window: Option<WindowLevel>,

    /// Any further key-value pairs sent by the source
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn unit_voxel_size() -> [f32; 3] {
    [1.0, 1.0, 1.0]
}

impl VolumeMetadata {
    /// Create new metadata
    pub fn new(voxel_count: [usize; 3], pixel_format: PixelFormat) -> Self {
        Self {
            voxel_count,
            voxel_size: unit_voxel_size(),
            pixel_format,
            dicom_window: None,
            estimated_window: None,
            extra: Map::new(),
        }
    }

    /// Set voxel spacing
    pub fn with_voxel_size(mut self, voxel_size: [f32; 3]) -> Self {
        self.voxel_size = voxel_size;
        self
    }

    /// Set the source window
    pub fn with_dicom_window(mut self, window: WindowLevel) -> Self {
        self.dicom_window = Some(window);
        self
    }

    /// Add custom metadata
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.extra.insert(key.into(), value.into());
    }

    /// Get custom metadata
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Number of slices
    pub fn depth(&self) -> usize {
        self.voxel_count[2]
    }

    /// Check that every dimension is positive
    pub fn validate(&self) -> Result<()> {
        if self.voxel_count.iter().any(|&n| n == 0) {
            return Err(VolumeError::Metadata(format!(
                "Voxel count must be positive, got {:?}",
                self.voxel_count
            )));
        }
        Ok(())
    }

    /// Metadata of the sub-volume selected by `partial`
    pub fn for_partial(&self, partial: &PartialVolumeDescriptor) -> Result<Self> {
        let count = partial.count()?;
        let (_, last) = partial.bounds();
        if last as usize > self.depth() {
            return Err(VolumeError::OutOfBounds(format!(
                "Partial volume {} exceeds {} images",
                partial,
                self.depth()
            )));
        }
        let mut meta = self.clone();
        meta.voxel_count[2] = count;
        meta.voxel_size[2] *= partial.delta.unsigned_abs() as f32;
        Ok(meta)
    }

    /// Merge footer fields into this metadata, key by key.
    ///
    /// Geometry keys may repeat the header but never change it.
    pub fn merge_footer(&mut self, footer: &Value) -> Result<()> {
        let Value::Object(fields) = footer else {
            return Err(VolumeError::Metadata(
                "Footer must be a JSON object".to_string(),
            ));
        };
        if fields.is_empty() {
            return Ok(());
        }
        let mut merged = serde_json::to_value(&*self)?;
        if let Value::Object(target) = &mut merged {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        let updated: VolumeMetadata = serde_json::from_value(merged)
            .map_err(|e| VolumeError::Metadata(e.to_string()))?;
        updated.validate()?;
        if updated.voxel_count != self.voxel_count || updated.pixel_format != self.pixel_format {
            return Err(VolumeError::Metadata(format!(
                "Footer cannot change the volume from {:?} {} to {:?} {}",
                self.voxel_count, self.pixel_format, updated.voxel_count, updated.pixel_format
            )));
        }
        *self = updated;
        Ok(())
    }

    /// Fill `estimated_window` from an observed value range unless present.
    ///
    /// The width never drops below 1.
    pub fn estimate_window(&mut self, min: i32, max: i32) -> Option<WindowLevel> {
        if self.estimated_window.is_none() && min <= max {
            self.estimated_window = Some(WindowLevel::new(
                (min as f64 + max as f64) / 2.0,
                (max as f64 - min as f64).max(1.0),
            ));
        }
        self.estimated_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let meta = VolumeMetadata::new([512, 512, 120], PixelFormat::Int16)
            .with_voxel_size([0.5, 0.5, 2.0])
            .with_dicom_window(WindowLevel::new(40.0, 400.0));
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["voxelCount"], json!([512, 512, 120]));
        assert_eq!(value["pixelFormat"], "int16");
        assert_eq!(value["dicomWindow"]["width"], 400.0);
        assert!(value.get("estimatedWindow").is_none());
    }

    #[test]
    fn test_extra_fields_are_kept() {
        let meta: VolumeMetadata = serde_json::from_value(json!({
            "voxelCount": [4, 4, 2],
            "pixelFormat": "uint8",
            "modality": "CT"
        }))
        .unwrap();
        assert_eq!(meta.voxel_size, [1.0, 1.0, 1.0]);
        assert_eq!(meta.get_metadata("modality"), Some(&json!("CT")));
    }

    #[test]
    fn test_for_partial() {
        let meta =
            VolumeMetadata::new([8, 8, 20], PixelFormat::UInt16).with_voxel_size([1.0, 1.0, 1.5]);
        let partial = meta.for_partial(&PartialVolumeDescriptor::new(19, 1, -3)).unwrap();
        assert_eq!(partial.voxel_count, [8, 8, 7]);
        assert_eq!(partial.voxel_size[2], 4.5);
        assert!(meta.for_partial(&PartialVolumeDescriptor::new(1, 21, 1)).is_err());
        assert!(meta.for_partial(&PartialVolumeDescriptor::new(1, 2, 0)).is_err());
    }

    #[test]
    fn test_merge_footer() {
        let mut meta = VolumeMetadata::new([4, 4, 2], PixelFormat::Int16);
        meta.merge_footer(&json!({
            "estimatedWindow": {"level": 10.0, "width": 50.0},
            "seriesDescription": "chest"
        }))
        .unwrap();
        assert_eq!(meta.estimated_window, Some(WindowLevel::new(10.0, 50.0)));
        assert_eq!(meta.get_metadata("seriesDescription"), Some(&json!("chest")));
        assert_eq!(meta.estimate_window(-100, 100), Some(WindowLevel::new(10.0, 50.0)));

        assert!(meta.merge_footer(&json!([1, 2])).is_err());
        assert!(meta.merge_footer(&json!({"voxelCount": [0, 4, 2]})).is_err());
    }

    #[test]
    fn test_footer_cannot_change_geometry() {
        let mut meta = VolumeMetadata::new([2, 2, 2], PixelFormat::UInt8);
        let err = meta
            .merge_footer(&json!({"voxelCount": [9, 9, 9], "pixelFormat": "int16"}))
            .unwrap_err();
        assert!(matches!(err, VolumeError::Metadata(_)));
        assert!(meta.merge_footer(&json!({"pixelFormat": "int16"})).is_err());
        assert_eq!(meta.voxel_count, [2, 2, 2]);
        assert_eq!(meta.pixel_format, PixelFormat::UInt8);

        // Repeating the header values is fine
        meta.merge_footer(&json!({"voxelCount": [2, 2, 2], "modality": "MR"}))
            .unwrap();
        assert_eq!(meta.get_metadata("modality"), Some(&json!("MR")));
    }

    #[test]
    fn test_estimate_window() {
        let mut meta = VolumeMetadata::new([4, 4, 2], PixelFormat::Int16);
        assert_eq!(meta.estimate_window(-100, 300), Some(WindowLevel::new(100.0, 400.0)));

        let mut flat = VolumeMetadata::new([4, 4, 2], PixelFormat::UInt8);
        assert_eq!(flat.estimate_window(7, 7), Some(WindowLevel::new(7.0, 1.0)));
    }
}
