//! Voxel Stream - progressive volumetric data engine
//!
//! In-memory DICOM-derived scalar volumes that fill up slice by slice while
//! they are being displayed, plus the analysis that runs on them once they
//! are complete.
//!
//! # Features
//!
//! - `VoxelVolume` with bit-packed binary, 8-bit and 16-bit pixel formats
//!   and per-slice population tracking
//! - Strided partial volumes selected by a `PartialVolumeDescriptor`
//! - Progressive loading over a per-slice request transport or a
//!   multiplexed channel transport
//! - Async result cache that deduplicates in-flight fetches
//! - Connected-component labeling and hole filling on a dedicated compute pool
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use voxel_stream::{
//!     create_slice_fetcher, LoaderConfig, PartialVolumeDescriptor, PerSliceTransport,
//!     ProgressiveVolumeLoader, VolumeRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = Arc::from(create_slice_fetcher("file:///data/studies")?);
//! let transport = Arc::new(PerSliceTransport::new(fetcher, &LoaderConfig::default())?);
//!
//! // Every second image between 1 and 99
//! let request = VolumeRequest::new("ct-chest")
//!     .with_partial(PartialVolumeDescriptor::new(1, 99, 2));
//! let loader = ProgressiveVolumeLoader::spawn(transport, request)?;
//!
//! let metadata = loader.ready().await?;
//! println!("{:?} voxels", metadata.voxel_count);
//! loader.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod frame;
pub mod io;
pub mod labeling;
pub mod loader;
pub mod metadata;
pub mod partial;
pub mod server;
pub mod transport;
pub mod types;
pub mod utils;
pub mod volume;
pub mod worker;

// Re-exports
pub use cache::{AsyncResultCache, CacheStats};
pub use config::{CacheConfig, EngineConfig, LoaderConfig, WorkerConfig};
pub use error::{Result, VolumeError};
pub use frame::{Frame, FrameKind, SliceHeader};
pub use io::{create_slice_fetcher, FileSystemSliceFetcher, SliceFetcher, SourceBackend};
pub use labeling::{
    Connectivity, HoleFillingResult, LabelInfo, LabelingResult, PROVISIONAL_LABEL_LIMIT,
};
pub use loader::{load_volume, LoadEvent, LoadState, Progress, ProgressiveVolumeLoader};
pub use metadata::{VolumeMetadata, WindowLevel};
pub use partial::{range_contains, ImageRanges, PartialVolumeDescriptor};
pub use server::{connect_in_process, serve_channel, MemorySliceFetcher};
pub use transport::{
    ChannelTransport, PerSliceTransport, TransportKind, VolumeRequest, VolumeTransport,
};
pub use types::{Box3, Orientation, PixelFormat};
pub use volume::{copy_shared, SharedVolume, VoxelVolume};
pub use worker::{ComputePool, HoleFillingRequest, LabelingRequest, WorkerRequest, WorkerResponse};

/// Version of the crate
pub const VOXEL_STREAM_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VOXEL_STREAM_VERSION.is_empty());
    }
}
