//! Per-request slice sources
//!
//! A [`SliceFetcher`] answers one request per frame: the global header, each
//! slice by image number and an optional footer. It is the seam behind
//! [`PerSliceTransport`](crate::transport::PerSliceTransport) and behind the
//! channel server.

use crate::error::{Result, VolumeError};
use crate::frame::{Frame, SliceHeader};
use crate::metadata::VolumeMetadata;
use crate::partial::PartialVolumeDescriptor;
use crate::utils::{slice_path, VOLUME_METADATA_FILE};
use crate::volume::{raw_value_range, VoxelVolume};
use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Footer document stored next to the metadata
pub const FOOTER_FILE: &str = "footer.json";

/// Slice source backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceBackend {
    /// Local file system
    FileSystem,
    /// In-process series store
    Memory,
    /// Remote image server
    Remote,
}

impl SourceBackend {
    /// Parse source backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(SourceBackend::FileSystem),
                "mem" => Ok(SourceBackend::Memory),
                "http" | "https" | "ws" | "wss" => Ok(SourceBackend::Remote),
                _ => Err(VolumeError::Configuration(format!(
                    "Unknown scheme: {}",
                    scheme
                ))),
            }
        } else {
            // Assume file system if no scheme
            Ok(SourceBackend::FileSystem)
        }
    }
}

/// Trait for fetching volume frames one request at a time
#[async_trait]
pub trait SliceFetcher: Send + Sync {
    /// Fetch the global header, sized for `partial` when given
    async fn fetch_header(
        &self,
        series: &str,
        partial: Option<&PartialVolumeDescriptor>,
    ) -> Result<Frame>;

    /// Fetch one slice by 1-based image number
    async fn fetch_slice(&self, series: &str, image_number: u32) -> Result<Frame>;

    /// Fetch the global footer, if the source has one
    async fn fetch_footer(
        &self,
        series: &str,
        partial: Option<&PartialVolumeDescriptor>,
    ) -> Result<Option<Frame>>;

    /// Get the backend type
    fn backend(&self) -> SourceBackend;
}

/// Build the slice frame for image `image_number` out of raw slice bytes
pub(crate) fn slice_frame(
    meta: &VolumeMetadata,
    image_number: u32,
    payload: Bytes,
) -> Result<Frame> {
    let voxels = meta.voxel_count[0] * meta.voxel_count[1];
    let expected = meta.pixel_format.slice_byte_len(voxels);
    if payload.len() != expected {
        return Frame::failure(
            format!(
                "Image {} holds {} bytes, expected {}",
                image_number,
                payload.len(),
                expected
            ),
            Some(image_number),
        );
    }
    let (min, max) = raw_value_range(meta.pixel_format, &payload, voxels).unwrap_or((0, 0));
    let info = SliceHeader {
        instance_number: image_number,
        min,
        max,
        success: true,
    };
    Frame::slice(&info, payload)
}

pub(crate) fn check_series_name(series: &str) -> Result<()> {
    if series.is_empty()
        || series == "."
        || series == ".."
        || series.contains(['/', '\\'])
    {
        return Err(VolumeError::Validation(format!(
            "Invalid series identifier: {:?}",
            series
        )));
    }
    Ok(())
}

/// Series stored on the local file system.
///
/// Layout per series: `<root>/<series>/volume.json`, one
/// `<root>/<series>/slices/<image:08>.raw` file per image and an optional
/// `<root>/<series>/footer.json`.
pub struct FileSystemSliceFetcher {
    base_path: PathBuf,
    metadata: RwLock<HashMap<String, VolumeMetadata>>,
}

impl FileSystemSliceFetcher {
    /// Create a new file system slice fetcher
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    /// Get the full path for a path relative to a series directory
    fn full_path(&self, series: &str, path: &str) -> PathBuf {
        self.base_path.join(series).join(path)
    }

    async fn series_metadata(&self, series: &str) -> Result<VolumeMetadata> {
        check_series_name(series)?;
        let cached = self.metadata.read().get(series).cloned();
        if let Some(meta) = cached {
            return Ok(meta);
        }
        let path = self.full_path(series, VOLUME_METADATA_FILE);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VolumeError::NotFound(format!("Series {}", series)))
            }
            Err(e) => return Err(VolumeError::Io(e)),
        };
        let meta: VolumeMetadata =
            serde_json::from_slice(&data).map_err(|e| VolumeError::Metadata(e.to_string()))?;
        meta.validate()?;
        self.metadata.write().insert(series.to_string(), meta.clone());
        Ok(meta)
    }

    /// Store every populated slice of `volume` as series `series`
    pub async fn write_series(
        &self,
        series: &str,
        metadata: &VolumeMetadata,
        volume: &VoxelVolume,
    ) -> Result<()> {
        check_series_name(series)?;
        if metadata.voxel_count != volume.size() || metadata.pixel_format != volume.pixel_format() {
            return Err(VolumeError::Validation(format!(
                "Metadata {:?} {} does not describe a {:?} {} volume",
                metadata.voxel_count,
                metadata.pixel_format,
                volume.size(),
                volume.pixel_format()
            )));
        }
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| VolumeError::Metadata(e.to_string()))?;
        self.write(series, VOLUME_METADATA_FILE, &json).await?;
        for z in 0..volume.size()[2] {
            if let Ok(slice) = volume.read_slice(z) {
                self.write(series, &slice_path(z as u32 + 1), slice).await?;
            }
        }
        self.metadata.write().remove(series);
        debug!("Stored series {}: {}", series, volume.summary());
        Ok(())
    }

    async fn write(&self, series: &str, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(series, path);

        // Create parent directories if they don't exist
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(VolumeError::Io)?;
        }

        let mut file = fs::File::create(&full_path).await.map_err(VolumeError::Io)?;
        file.write_all(data).await.map_err(VolumeError::Io)?;
        Ok(())
    }
}

#[async_trait]
impl SliceFetcher for FileSystemSliceFetcher {
    async fn fetch_header(
        &self,
        series: &str,
        partial: Option<&PartialVolumeDescriptor>,
    ) -> Result<Frame> {
        let meta = self.series_metadata(series).await?;
        let meta = match partial {
            Some(p) => meta.for_partial(p)?,
            None => meta,
        };
        Frame::header(&meta)
    }

    async fn fetch_slice(&self, series: &str, image_number: u32) -> Result<Frame> {
        let meta = self.series_metadata(series).await?;
        if image_number == 0 || image_number as usize > meta.depth() {
            return Frame::failure(
                format!("Image {} is not part of series {}", image_number, series),
                Some(image_number),
            );
        }
        let path = self.full_path(series, &slice_path(image_number));
        match fs::read(&path).await {
            Ok(data) => slice_frame(&meta, image_number, Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Frame::failure(
                format!("Image {} of series {} is missing", image_number, series),
                Some(image_number),
            ),
            Err(e) => Err(VolumeError::Io(e)),
        }
    }

    async fn fetch_footer(
        &self,
        series: &str,
        _partial: Option<&PartialVolumeDescriptor>,
    ) -> Result<Option<Frame>> {
        check_series_name(series)?;
        let path = self.full_path(series, FOOTER_FILE);
        match fs::read(&path).await {
            Ok(data) => {
                let fields: serde_json::Value = serde_json::from_slice(&data)
                    .map_err(|e| VolumeError::Metadata(e.to_string()))?;
                Frame::footer(&fields).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VolumeError::Io(e)),
        }
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::FileSystem
    }
}

/// Parse URL and create the matching slice fetcher.
///
/// Only filesystem URLs are handled here; remote image servers plug in by
/// implementing [`SliceFetcher`] or by speaking the channel protocol.
pub fn create_slice_fetcher(url: &str) -> Result<Box<dyn SliceFetcher>> {
    let backend = SourceBackend::from_url(url)?;

    match backend {
        SourceBackend::FileSystem => {
            // Extract path from file:// URL or use as-is
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemSliceFetcher::new(path)))
        }
        SourceBackend::Memory | SourceBackend::Remote => Err(VolumeError::Configuration(format!(
            "Backend {:?} cannot be created from a URL; construct it directly",
            backend
        ))),
    }
}
