//! Transports delivering volume frames to the loader
//!
//! Two strategies sit behind [`VolumeTransport`]: [`PerSliceTransport`]
//! issues one request per frame against a [`SliceFetcher`], and
//! [`ChannelTransport`] multiplexes many volume requests over one persistent
//! bidirectional channel, routing frames by transfer id.

use crate::config::LoaderConfig;
use crate::error::{Result, VolumeError};
use crate::frame::{Frame, FrameKind};
use crate::io::SliceFetcher;
use crate::partial::PartialVolumeDescriptor;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Stream of frames answering one volume request
pub type FrameStream = BoxStream<'static, Result<Frame>>;

/// A request for a whole series or a partial volume of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    pub series: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialVolumeDescriptor>,
}

impl VolumeRequest {
    pub fn new(series: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: PartialVolumeDescriptor) -> Self {
        self.partial = Some(partial);
        self
    }

    /// Reject invalid partial descriptors before any I/O
    pub fn validate(&self) -> Result<()> {
        if self.series.is_empty() {
            return Err(VolumeError::Validation("Empty series identifier".to_string()));
        }
        match &self.partial {
            Some(partial) => partial.validate(),
            None => Ok(()),
        }
    }
}

/// Image numbers a request selects, in transfer order
pub(crate) fn requested_images(
    partial: Option<&PartialVolumeDescriptor>,
    depth: usize,
) -> Result<Vec<u32>> {
    match partial {
        Some(p) => Ok(p.to_sequence()?.into_iter().map(|n| n as u32).collect()),
        None => Ok((1..=depth as u32).collect()),
    }
}

/// Transport strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// One request per frame
    PerSlice,
    /// One persistent multiplexed channel
    Channel,
}

/// Trait for opening a frame stream for a volume request.
///
/// The stream starts with the global header frame, then carries slice
/// frames in any order and may end with a footer. Dropping the stream
/// closes the request.
#[async_trait]
pub trait VolumeTransport: Send + Sync {
    async fn open(&self, request: &VolumeRequest) -> Result<FrameStream>;

    fn kind(&self) -> TransportKind;
}

/// Request/response transport: one fetch per frame, several in flight
pub struct PerSliceTransport {
    fetcher: Arc<dyn SliceFetcher>,
    concurrency: usize,
}

impl PerSliceTransport {
    pub fn new(fetcher: Arc<dyn SliceFetcher>, config: &LoaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fetcher,
            concurrency: config.slice_concurrency,
        })
    }
}

#[async_trait]
impl VolumeTransport for PerSliceTransport {
    async fn open(&self, request: &VolumeRequest) -> Result<FrameStream> {
        let header = self
            .fetcher
            .fetch_header(&request.series, request.partial.as_ref())
            .await?;
        if header.kind() == FrameKind::Failure {
            return Ok(stream::once(future::ready(Ok(header))).boxed());
        }
        let meta = header.metadata()?;
        let images = requested_images(request.partial.as_ref(), meta.depth())?;

        let fetcher = Arc::clone(&self.fetcher);
        let series = request.series.clone();
        let slices = stream::iter(images)
            .map(move |image_number| {
                let fetcher = Arc::clone(&fetcher);
                let series = series.clone();
                async move { fetcher.fetch_slice(&series, image_number).await }
            })
            .buffer_unordered(self.concurrency);

        let fetcher = Arc::clone(&self.fetcher);
        let series = request.series.clone();
        let partial = request.partial;
        let footer =
            stream::once(async move { fetcher.fetch_footer(&series, partial.as_ref()).await })
                .filter_map(|footer| future::ready(footer.transpose()));

        Ok(stream::once(future::ready(Ok(header)))
            .chain(slices)
            .chain(footer)
            .boxed())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::PerSlice
    }
}

/// Client-to-server message of the channel protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelRequest {
    #[serde(rename_all = "camelCase")]
    Open {
        transfer_id: u32,
        series: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial_volume_descriptor: Option<PartialVolumeDescriptor>,
    },
    #[serde(rename_all = "camelCase")]
    Abort { transfer_id: u32 },
}

impl ChannelRequest {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(message: &[u8]) -> Result<Self> {
        serde_json::from_slice(message)
            .map_err(|e| VolumeError::InvalidFormat(format!("Malformed channel request: {}", e)))
    }
}

/// Prefix a frame with its transfer id
pub fn encode_envelope(transfer_id: u32, frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + frame.encoded_len());
    buf.put_u32_le(transfer_id);
    frame.encode_into(&mut buf);
    buf.freeze()
}

/// Split a channel message into its transfer id and frame
pub fn decode_envelope(mut message: Bytes) -> Result<(u32, Result<Frame>)> {
    if message.len() < 4 {
        return Err(VolumeError::InvalidFormat(format!(
            "Channel message of {} bytes has no transfer id",
            message.len()
        )));
    }
    let transfer_id = message.get_u32_le();
    Ok((transfer_id, Frame::decode(message)))
}

type Route = mpsc::UnboundedSender<Result<Frame>>;

struct ChannelLink {
    outgoing: mpsc::Sender<Bytes>,
    routes: Mutex<Routes>,
}

#[derive(Default)]
struct Routes {
    open: HashMap<u32, Route>,
    closed: bool,
}

impl ChannelLink {
    fn close(&self, reason: &str) {
        let mut routes = self.routes.lock();
        routes.closed = true;
        for (transfer_id, route) in routes.open.drain() {
            debug!("Failing transfer {}: {}", transfer_id, reason);
            let _ = route.send(Err(VolumeError::Transport(reason.to_string())));
        }
    }
}

/// Multiplexing client over one persistent bidirectional channel.
///
/// `outgoing` carries JSON [`ChannelRequest`]s to the server, `incoming`
/// carries enveloped frames back.
pub struct ChannelTransport {
    link: Arc<ChannelLink>,
    next_id: AtomicU32,
    demux: JoinHandle<()>,
}

impl ChannelTransport {
    /// Start routing frames from `incoming`; must be called inside a runtime
    pub fn connect(outgoing: mpsc::Sender<Bytes>, incoming: mpsc::Receiver<Bytes>) -> Self {
        let link = Arc::new(ChannelLink {
            outgoing,
            routes: Mutex::new(Routes::default()),
        });
        let demux = tokio::spawn(demultiplex(Arc::clone(&link), incoming));
        Self {
            link,
            next_id: AtomicU32::new(1),
            demux,
        }
    }

    /// Number of transfers still awaiting frames
    pub fn active_transfers(&self) -> usize {
        self.link.routes.lock().open.len()
    }

    pub fn is_closed(&self) -> bool {
        self.link.routes.lock().closed
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.demux.abort();
        self.link.close("channel transport dropped");
    }
}

async fn demultiplex(link: Arc<ChannelLink>, mut incoming: mpsc::Receiver<Bytes>) {
    while let Some(message) = incoming.recv().await {
        let (transfer_id, frame) = match decode_envelope(message) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping unroutable channel message: {}", e);
                continue;
            }
        };
        let terminal = match &frame {
            Ok(frame) => matches!(frame.kind(), FrameKind::Footer | FrameKind::Failure),
            Err(_) => true,
        };
        let mut routes = link.routes.lock();
        match routes.open.get(&transfer_id) {
            Some(route) => {
                let _ = route.send(frame);
                if terminal {
                    routes.open.remove(&transfer_id);
                }
            }
            None => debug!("Dropping frame for unknown transfer {}", transfer_id),
        }
    }
    link.close("channel closed");
}

#[async_trait]
impl VolumeTransport for ChannelTransport {
    async fn open(&self, request: &VolumeRequest) -> Result<FrameStream> {
        let transfer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = ChannelRequest::Open {
            transfer_id,
            series: request.series.clone(),
            partial_volume_descriptor: request.partial,
        }
        .encode()?;

        let (route, receiver) = mpsc::unbounded_channel();
        {
            let mut routes = self.link.routes.lock();
            if routes.closed {
                return Err(VolumeError::Transport("channel closed".to_string()));
            }
            routes.open.insert(transfer_id, route);
        }

        if self.link.outgoing.send(message).await.is_err() {
            self.link.routes.lock().open.remove(&transfer_id);
            return Err(VolumeError::Transport("channel closed".to_string()));
        }
        debug!("Opened transfer {} for series {}", transfer_id, request.series);

        Ok(Box::pin(ChannelFrameStream {
            transfer_id,
            receiver,
            link: Arc::clone(&self.link),
        }))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Channel
    }
}

/// Frames of one transfer; dropping it early aborts the transfer
struct ChannelFrameStream {
    transfer_id: u32,
    receiver: mpsc::UnboundedReceiver<Result<Frame>>,
    link: Arc<ChannelLink>,
}

impl Stream for ChannelFrameStream {
    type Item = Result<Frame>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for ChannelFrameStream {
    fn drop(&mut self) {
        let still_open = self.link.routes.lock().open.remove(&self.transfer_id).is_some();
        if !still_open {
            return;
        }
        let abort = ChannelRequest::Abort {
            transfer_id: self.transfer_id,
        };
        match abort.encode() {
            Ok(message) => {
                if self.link.outgoing.try_send(message).is_err() {
                    debug!("Could not send abort for transfer {}", self.transfer_id);
                }
            }
            Err(e) => warn!("Failed to encode abort request: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SliceHeader;
    use serde_json::json;

    #[test]
    fn test_channel_request_wire_shape() {
        let open = ChannelRequest::Open {
            transfer_id: 7,
            series: "1.2.840.1".to_string(),
            partial_volume_descriptor: Some(PartialVolumeDescriptor::new(1, 9, 2)),
        };
        let value: serde_json::Value = serde_json::from_slice(&open.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "open",
                "transferId": 7,
                "series": "1.2.840.1",
                "partialVolumeDescriptor": {"start": 1, "end": 9, "delta": 2}
            })
        );
        let abort = ChannelRequest::decode(br#"{"type":"abort","transferId":7}"#).unwrap();
        assert_eq!(abort, ChannelRequest::Abort { transfer_id: 7 });
        assert!(ChannelRequest::decode(b"{}").is_err());
    }

    #[test]
    fn test_envelope() {
        let info = SliceHeader {
            instance_number: 4,
            min: 0,
            max: 1,
            success: true,
        };
        let frame = Frame::slice(&info, Bytes::from_static(&[0, 1])).unwrap();
        let message = encode_envelope(42, &frame);
        assert_eq!(&message[..4], &42u32.to_le_bytes());
        let (id, decoded) = decode_envelope(message).unwrap();
        assert_eq!(id, 42);
        assert_eq!(decoded.unwrap(), frame);
        assert!(decode_envelope(Bytes::from_static(&[1, 2])).is_err());
    }

    #[test]
    fn test_requested_images() {
        assert_eq!(requested_images(None, 3).unwrap(), vec![1, 2, 3]);
        let partial = PartialVolumeDescriptor::new(7, 1, -3);
        assert_eq!(requested_images(Some(&partial), 10).unwrap(), vec![7, 4, 1]);
        assert!(VolumeRequest::new("s")
            .with_partial(PartialVolumeDescriptor::new(1, 2, 0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_per_slice_config_validated() {
        let fetcher: Arc<dyn SliceFetcher> = Arc::new(crate::server::MemorySliceFetcher::new());
        let zero = LoaderConfig::default().with_slice_concurrency(0);
        let err = PerSliceTransport::new(Arc::clone(&fetcher), &zero).err().unwrap();
        assert!(matches!(err, VolumeError::Configuration(_)));
        let transport = PerSliceTransport::new(fetcher, &LoaderConfig::default()).unwrap();
        assert_eq!(transport.kind(), TransportKind::PerSlice);
    }

    #[tokio::test]
    async fn test_channel_routes_and_aborts() {
        let (to_server, mut server_rx) = mpsc::channel(8);
        let (server_tx, from_server) = mpsc::channel(8);
        let transport = ChannelTransport::connect(to_server, from_server);

        let mut stream = transport.open(&VolumeRequest::new("a")).await.unwrap();
        let request = ChannelRequest::decode(&server_rx.recv().await.unwrap()).unwrap();
        let ChannelRequest::Open { transfer_id, .. } = request else {
            panic!("expected open request");
        };

        // Frames for unknown transfers are dropped, known ones are routed
        let footer = Frame::footer(&json!({})).unwrap();
        server_tx.send(encode_envelope(transfer_id + 100, &footer)).await.unwrap();
        server_tx.send(encode_envelope(transfer_id, &footer)).await.unwrap();
        let routed = stream.next().await.unwrap().unwrap();
        assert_eq!(routed.kind(), FrameKind::Footer);
        assert!(stream.next().await.is_none());
        assert_eq!(transport.active_transfers(), 0);

        // Dropping an unfinished stream sends an abort
        let pending = transport.open(&VolumeRequest::new("b")).await.unwrap();
        let _open = server_rx.recv().await.unwrap();
        drop(pending);
        let abort = ChannelRequest::decode(&server_rx.recv().await.unwrap()).unwrap();
        assert!(matches!(abort, ChannelRequest::Abort { .. }));

        // Closing the server side fails open transfers
        let mut orphan = transport.open(&VolumeRequest::new("c")).await.unwrap();
        drop(server_tx);
        assert!(matches!(orphan.next().await, Some(Err(VolumeError::Transport(_)))));
        assert!(transport.open(&VolumeRequest::new("d")).await.is_err());
    }
}
