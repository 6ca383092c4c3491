//! Source side of the frame protocol
//!
//! [`MemorySliceFetcher`] keeps series in memory and answers per-slice
//! requests; [`serve_channel`] speaks the multiplexed channel protocol on
//! top of any [`SliceFetcher`].

use crate::config::LoaderConfig;
use crate::error::{Result, VolumeError};
use crate::frame::{Frame, FrameKind};
use crate::io::{check_series_name, slice_frame, SliceFetcher, SourceBackend};
use crate::metadata::VolumeMetadata;
use crate::partial::PartialVolumeDescriptor;
use crate::transport::{encode_envelope, requested_images, ChannelRequest, ChannelTransport};
use crate::volume::VoxelVolume;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct StoredSeries {
    metadata: VolumeMetadata,
    volume: Arc<VoxelVolume>,
    footer: Option<Value>,
}

/// In-memory series store
#[derive(Default)]
pub struct MemorySliceFetcher {
    series: RwLock<HashMap<String, StoredSeries>>,
}

impl MemorySliceFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `volume` as series `series`, replacing any previous entry
    pub fn insert(&self, series: impl Into<String>, volume: VoxelVolume) -> Result<()> {
        let series = series.into();
        check_series_name(&series)?;
        let [x, y, z] = volume.size();
        if x * y * z == 0 {
            return Err(VolumeError::InvalidDimensions(format!(
                "Series {} has an empty volume",
                series
            )));
        }
        let metadata = VolumeMetadata::new(volume.size(), volume.pixel_format());
        self.insert_with_metadata(series, metadata, volume)
    }

    /// Register `volume` with explicit metadata
    pub fn insert_with_metadata(
        &self,
        series: impl Into<String>,
        metadata: VolumeMetadata,
        volume: VoxelVolume,
    ) -> Result<()> {
        let series = series.into();
        check_series_name(&series)?;
        if metadata.voxel_count != volume.size() || metadata.pixel_format != volume.pixel_format() {
            return Err(VolumeError::Validation(format!(
                "Metadata for series {} does not match its volume",
                series
            )));
        }
        self.series.write().insert(
            series,
            StoredSeries {
                metadata,
                volume: Arc::new(volume),
                footer: None,
            },
        );
        Ok(())
    }

    /// Attach footer fields sent after the last slice
    pub fn set_footer(&self, series: &str, footer: Value) -> Result<()> {
        match self.series.write().get_mut(series) {
            Some(stored) => {
                stored.footer = Some(footer);
                Ok(())
            }
            None => Err(VolumeError::NotFound(format!("Series {}", series))),
        }
    }

    pub fn remove(&self, series: &str) -> bool {
        self.series.write().remove(series).is_some()
    }

    fn lookup(&self, series: &str) -> Result<(VolumeMetadata, Arc<VoxelVolume>)> {
        self.series
            .read()
            .get(series)
            .map(|s| (s.metadata.clone(), Arc::clone(&s.volume)))
            .ok_or_else(|| VolumeError::NotFound(format!("Series {}", series)))
    }
}

#[async_trait]
impl SliceFetcher for MemorySliceFetcher {
    async fn fetch_header(
        &self,
        series: &str,
        partial: Option<&PartialVolumeDescriptor>,
    ) -> Result<Frame> {
        let (meta, _) = self.lookup(series)?;
        let meta = match partial {
            Some(p) => meta.for_partial(p)?,
            None => meta,
        };
        Frame::header(&meta)
    }

    async fn fetch_slice(&self, series: &str, image_number: u32) -> Result<Frame> {
        let (meta, volume) = self.lookup(series)?;
        let z = (image_number as usize).wrapping_sub(1);
        match volume.read_slice(z) {
            Ok(slice) => slice_frame(&meta, image_number, Bytes::copy_from_slice(slice)),
            Err(e) => Frame::failure(
                format!("Image {} of series {}: {}", image_number, series, e),
                Some(image_number),
            ),
        }
    }

    async fn fetch_footer(
        &self,
        series: &str,
        _partial: Option<&PartialVolumeDescriptor>,
    ) -> Result<Option<Frame>> {
        let footer = self
            .series
            .read()
            .get(series)
            .and_then(|s| s.footer.clone());
        footer.map(|fields| Frame::footer(&fields)).transpose()
    }

    fn backend(&self) -> SourceBackend {
        SourceBackend::Memory
    }
}

/// Serve channel requests from `incoming` with frames taken from `fetcher`.
///
/// Each open request streams header, slices in request order, then a
/// footer; a failed read ends the transfer with a failure frame. Returns
/// when `incoming` closes, cancelling every unfinished transfer.
pub async fn serve_channel(
    fetcher: Arc<dyn SliceFetcher>,
    mut incoming: mpsc::Receiver<Bytes>,
    outgoing: mpsc::Sender<Bytes>,
) {
    let mut transfers: HashMap<u32, JoinHandle<()>> = HashMap::new();
    info!("Channel server started ({:?} source)", fetcher.backend());

    while let Some(message) = incoming.recv().await {
        transfers.retain(|_, task| !task.is_finished());
        match ChannelRequest::decode(&message) {
            Ok(ChannelRequest::Open {
                transfer_id,
                series,
                partial_volume_descriptor,
            }) => {
                debug!("Transfer {} requested series {}", transfer_id, series);
                let task = tokio::spawn(stream_transfer(
                    Arc::clone(&fetcher),
                    outgoing.clone(),
                    transfer_id,
                    series,
                    partial_volume_descriptor,
                ));
                if let Some(previous) = transfers.insert(transfer_id, task) {
                    previous.abort();
                }
            }
            Ok(ChannelRequest::Abort { transfer_id }) => {
                if let Some(task) = transfers.remove(&transfer_id) {
                    task.abort();
                    debug!("Transfer {} aborted by client", transfer_id);
                }
            }
            Err(e) => warn!("Ignoring channel request: {}", e),
        }
    }

    for (_, task) in transfers {
        task.abort();
    }
    info!("Channel server stopped");
}

async fn stream_transfer(
    fetcher: Arc<dyn SliceFetcher>,
    outgoing: mpsc::Sender<Bytes>,
    transfer_id: u32,
    series: String,
    partial: Option<PartialVolumeDescriptor>,
) {
    let result = send_transfer(&*fetcher, &outgoing, transfer_id, &series, partial.as_ref()).await;
    if let Err(e) = result {
        warn!("Transfer {} of series {} failed: {}", transfer_id, series, e);
        if let Ok(frame) = Frame::failure(e.to_string(), None) {
            let _ = send_frame(&outgoing, transfer_id, &frame).await;
        }
    }
}

async fn send_transfer(
    fetcher: &dyn SliceFetcher,
    outgoing: &mpsc::Sender<Bytes>,
    transfer_id: u32,
    series: &str,
    partial: Option<&PartialVolumeDescriptor>,
) -> Result<()> {
    if let Some(p) = partial {
        p.validate()?;
    }
    let header = fetcher.fetch_header(series, partial).await?;
    let meta = header.metadata()?;
    send_frame(outgoing, transfer_id, &header).await?;

    for image_number in requested_images(partial, meta.depth())? {
        let frame = fetcher.fetch_slice(series, image_number).await?;
        let failed = frame.kind() == FrameKind::Failure;
        send_frame(outgoing, transfer_id, &frame).await?;
        if failed {
            return Ok(());
        }
    }

    let footer = match fetcher.fetch_footer(series, partial).await? {
        Some(footer) => footer,
        None => Frame::footer(&json!({}))?,
    };
    send_frame(outgoing, transfer_id, &footer).await
}

async fn send_frame(outgoing: &mpsc::Sender<Bytes>, transfer_id: u32, frame: &Frame) -> Result<()> {
    outgoing
        .send(encode_envelope(transfer_id, frame))
        .await
        .map_err(|_| VolumeError::Transport("channel closed".to_string()))
}

/// Run a channel server for `fetcher` on this runtime and connect a client to it
pub fn connect_in_process(
    fetcher: Arc<dyn SliceFetcher>,
    config: &LoaderConfig,
) -> Result<ChannelTransport> {
    config.validate()?;
    let (client_tx, server_rx) = mpsc::channel(config.channel_buffer);
    let (server_tx, client_rx) = mpsc::channel(config.channel_buffer);
    tokio::spawn(serve_channel(fetcher, server_rx, server_tx));
    Ok(ChannelTransport::connect(client_tx, client_rx))
}
