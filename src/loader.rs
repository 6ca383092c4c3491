//! Progressive volume loading
//!
//! A [`ProgressiveVolumeLoader`] opens a frame stream on a
//! [`VolumeTransport`], allocates the target volume when the global header
//! arrives and writes slices as they come in, in whatever order the
//! transport delivers them. Consumers watch the state, the progress counter
//! or the per-slice population flags of the shared volume.

use crate::error::{Result, VolumeError};
use crate::frame::{Frame, FrameKind};
use crate::metadata::VolumeMetadata;
use crate::transport::{VolumeRequest, VolumeTransport};
use crate::volume::{SharedVolume, SliceSet, VoxelVolume};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Lifecycle of a loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    /// Waiting for volume metadata
    Initializing,
    /// Metadata known, slices arriving
    Loading,
    /// Every requested slice has been written
    Ready,
    Aborted,
    /// Loading failed with the given message
    Errored(String),
}

impl LoadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadState::Ready | LoadState::Aborted | LoadState::Errored(_))
    }

    fn to_error(&self) -> VolumeError {
        match self {
            LoadState::Aborted => VolumeError::Aborted,
            LoadState::Errored(message) => VolumeError::Transport(message.clone()),
            other => VolumeError::Transport(format!("Loader stopped while {:?}", other)),
        }
    }
}

/// Slices written so far out of the slices requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub loaded: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.loaded == self.total
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.loaded as f64 / self.total as f64
        }
    }
}

/// Notification delivered to registered listeners
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Progress(Progress),
    Ready,
    Failed(String),
}

/// Callback receiving [`LoadEvent`]s
pub type LoadListener = Arc<dyn Fn(&LoadEvent) + Send + Sync>;

struct Tracker {
    received: SliceSet,
    loaded: usize,
}

struct LoaderShared {
    request: VolumeRequest,
    volume: SharedVolume,
    metadata: RwLock<Option<VolumeMetadata>>,
    state: watch::Sender<LoadState>,
    tracker: Mutex<Tracker>,
    listeners: Mutex<Vec<LoadListener>>,
    aborted: AtomicBool,
}

impl LoaderShared {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn progress(&self) -> Progress {
        let tracker = self.tracker.lock();
        Progress {
            loaded: tracker.loaded,
            total: tracker.received.len(),
        }
    }

    fn emit(&self, event: LoadEvent) {
        if self.is_aborted() {
            return;
        }
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            listener(&event);
        }
    }

    /// Move to `next` unless a terminal state was reached already
    fn transition(&self, next: LoadState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                false
            } else {
                *state = next;
                true
            }
        })
    }

    /// Write under the volume lock, refusing once aborted
    fn write_volume<T>(&self, f: impl FnOnce(&mut VoxelVolume) -> Result<T>) -> Result<T> {
        let mut volume = self.volume.write();
        if self.is_aborted() {
            return Err(VolumeError::Aborted);
        }
        f(&mut volume)
    }

    fn on_header(&self, frame: &Frame) -> Result<()> {
        if self.metadata.read().is_some() {
            return Err(VolumeError::InvalidFormat(
                "Received a second global header".to_string(),
            ));
        }
        let meta = frame.metadata()?;
        if let Some(partial) = &self.request.partial {
            let expected = partial.count()?;
            if meta.depth() != expected {
                return Err(VolumeError::InvalidFormat(format!(
                    "Header announces {} slices but {} selects {}",
                    meta.depth(),
                    partial,
                    expected
                )));
            }
        }
        let [x, y, z] = meta.voxel_count;
        self.write_volume(|volume| volume.set_dimension(x, y, z, meta.pixel_format))?;
        *self.tracker.lock() = Tracker {
            received: SliceSet::new(z),
            loaded: 0,
        };
        info!(
            "Series {}: {}x{}x{} {} volume announced",
            self.request.series, x, y, z, meta.pixel_format
        );
        *self.metadata.write() = Some(meta);
        self.transition(LoadState::Loading);
        self.emit(LoadEvent::Progress(self.progress()));
        Ok(())
    }

    fn slice_index(&self, image_number: u32, depth: usize) -> Option<usize> {
        match &self.request.partial {
            Some(partial) => partial.index_of(image_number as i32),
            None => (image_number as usize)
                .checked_sub(1)
                .filter(|&z| z < depth),
        }
    }

    fn on_slice(&self, frame: &Frame) -> Result<()> {
        let depth = match self.metadata.read().as_ref() {
            Some(meta) => meta.depth(),
            None => {
                return Err(VolumeError::InvalidFormat(
                    "Slice frame received before the global header".to_string(),
                ))
            }
        };
        let info = frame.slice_header()?;
        if !info.success {
            return Err(VolumeError::Transport(format!(
                "Image {} was not read successfully",
                info.instance_number
            )));
        }
        let z = self.slice_index(info.instance_number, depth).ok_or_else(|| {
            VolumeError::InvalidFormat(format!(
                "Image {} is not part of the requested volume",
                info.instance_number
            ))
        })?;
        self.write_volume(|volume| volume.insert_single_image(z, frame.payload()))?;

        let progress = {
            let mut tracker = self.tracker.lock();
            if !tracker.received.insert(z) {
                debug!("Image {} received again", info.instance_number);
                return Ok(());
            }
            tracker.loaded += 1;
            Progress {
                loaded: tracker.loaded,
                total: tracker.received.len(),
            }
        };
        self.emit(LoadEvent::Progress(progress));
        if progress.is_complete() && self.transition(LoadState::Ready) {
            info!("Series {}: all {} slices loaded", self.request.series, progress.total);
            self.emit(LoadEvent::Ready);
        }
        Ok(())
    }

    fn on_footer(&self, frame: &Frame) -> Result<()> {
        let fields: serde_json::Value = frame.header_json()?;
        let range = self.volume.read().value_range();
        let mut metadata = self.metadata.write();
        let meta = metadata.as_mut().ok_or_else(|| {
            VolumeError::InvalidFormat("Footer received before the global header".to_string())
        })?;
        meta.merge_footer(&fields)?;
        if let Some((min, max)) = range {
            meta.estimate_window(min, max);
        }
        debug!("Series {}: footer merged", self.request.series);
        Ok(())
    }

    fn fail(&self, err: VolumeError) {
        if self.is_aborted() {
            return;
        }
        let message = err.to_string();
        if self.transition(LoadState::Errored(message.clone())) {
            warn!("Series {}: loading failed: {}", self.request.series, message);
            self.emit(LoadEvent::Failed(message));
        } else {
            warn!(
                "Series {}: ignoring error after completion: {}",
                self.request.series, message
            );
        }
    }
}

async fn run(shared: Arc<LoaderShared>, transport: Arc<dyn VolumeTransport>) {
    match drive(&shared, transport.as_ref()).await {
        Ok(()) | Err(VolumeError::Aborted) => {}
        Err(e) => shared.fail(e),
    }
}

async fn drive(shared: &LoaderShared, transport: &dyn VolumeTransport) -> Result<()> {
    let mut frames = transport.open(&shared.request).await?;
    while let Some(frame) = frames.next().await {
        if shared.is_aborted() {
            return Err(VolumeError::Aborted);
        }
        let frame = frame?;
        match frame.kind() {
            FrameKind::Header => shared.on_header(&frame)?,
            FrameKind::Slice => shared.on_slice(&frame)?,
            FrameKind::Footer => shared.on_footer(&frame)?,
            FrameKind::Failure => return Err(VolumeError::Transport(frame.failure_message()?)),
        }
    }
    let progress = shared.progress();
    if progress.is_complete() {
        Ok(())
    } else if shared.metadata.read().is_none() {
        Err(VolumeError::Transport(
            "Frame stream ended before the global header".to_string(),
        ))
    } else {
        Err(VolumeError::Transport(format!(
            "Frame stream ended after {} of {} slices",
            progress.loaded, progress.total
        )))
    }
}

/// Streams one requested volume into a [`VoxelVolume`]
pub struct ProgressiveVolumeLoader {
    shared: Arc<LoaderShared>,
    transport: Mutex<Option<Arc<dyn VolumeTransport>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressiveVolumeLoader {
    /// Create a loader without starting it, so listeners can subscribe first
    pub fn new(transport: Arc<dyn VolumeTransport>, request: VolumeRequest) -> Result<Self> {
        request.validate()?;
        let (state, _) = watch::channel(LoadState::Initializing);
        Ok(Self {
            shared: Arc::new(LoaderShared {
                request,
                volume: Arc::new(RwLock::new(VoxelVolume::default())),
                metadata: RwLock::new(None),
                state,
                tracker: Mutex::new(Tracker {
                    received: SliceSet::default(),
                    loaded: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                aborted: AtomicBool::new(false),
            }),
            transport: Mutex::new(Some(transport)),
            task: Mutex::new(None),
        })
    }

    /// Create and immediately start a loader
    pub fn spawn(transport: Arc<dyn VolumeTransport>, request: VolumeRequest) -> Result<Self> {
        let loader = Self::new(transport, request)?;
        loader.start();
        Ok(loader)
    }

    /// Begin loading; later calls do nothing. Must run inside a runtime.
    pub fn start(&self) {
        let Some(transport) = self.transport.lock().take() else {
            return;
        };
        if self.shared.is_aborted() {
            return;
        }
        debug!(
            "Loading series {} over {:?} transport",
            self.shared.request.series,
            transport.kind()
        );
        let task = tokio::spawn(run(Arc::clone(&self.shared), transport));
        *self.task.lock() = Some(task);
    }

    pub fn request(&self) -> &VolumeRequest {
        &self.shared.request
    }

    pub fn state(&self) -> LoadState {
        self.shared.state.borrow().clone()
    }

    pub fn progress(&self) -> Progress {
        self.shared.progress()
    }

    /// Metadata, once the global header has arrived
    pub fn metadata(&self) -> Option<VolumeMetadata> {
        self.shared.metadata.read().clone()
    }

    /// Shared handle to the target volume
    pub fn volume(&self) -> SharedVolume {
        Arc::clone(&self.shared.volume)
    }

    /// Check whether every slice index in `range` has been written
    pub fn contains_images(&self, range: Range<usize>) -> bool {
        self.shared.volume.read().contain_image(range)
    }

    /// Register a listener.
    ///
    /// A listener added after the loader finished or failed is told so
    /// immediately.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&LoadEvent) + Send + Sync + 'static,
    {
        let listener: LoadListener = Arc::new(listener);
        self.shared.listeners.lock().push(Arc::clone(&listener));
        if self.shared.is_aborted() {
            return;
        }
        match self.state() {
            LoadState::Ready => listener(&LoadEvent::Ready),
            LoadState::Errored(message) => listener(&LoadEvent::Failed(message)),
            _ => {}
        }
    }

    /// Resolve once metadata is known; slices may still be arriving
    pub async fn ready(&self) -> Result<VolumeMetadata> {
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(|state| *state != LoadState::Initializing)
            .await
            .map_err(|_| VolumeError::Transport("Loader dropped".to_string()))?
            .clone();
        self.metadata().ok_or_else(|| state.to_error())
    }

    /// Resolve once every requested slice has been written
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = rx
            .wait_for(LoadState::is_terminal)
            .await
            .map_err(|_| VolumeError::Transport("Loader dropped".to_string()))?
            .clone();
        match state {
            LoadState::Ready => Ok(()),
            other => Err(other.to_error()),
        }
    }

    /// Stop loading; no write reaches the volume after this returns.
    ///
    /// Calling it again, or after loading finished or failed, does nothing.
    pub fn abort(&self) {
        {
            let _volume = self.shared.volume.write();
            if self.state().is_terminal() || self.shared.aborted.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.transport.lock().take();
        if self.shared.transition(LoadState::Aborted) {
            info!("Series {}: loading aborted", self.shared.request.series);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }
}

impl Drop for ProgressiveVolumeLoader {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            self.abort();
        }
    }
}

/// Load a whole request and return a snapshot of the finished volume
pub async fn load_volume(
    transport: Arc<dyn VolumeTransport>,
    request: VolumeRequest,
) -> Result<Arc<VoxelVolume>> {
    let loader = ProgressiveVolumeLoader::spawn(transport, request)?;
    loader.wait().await?;
    let volume = loader.volume().read().clone();
    Ok(Arc::new(volume))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SliceHeader;
    use crate::partial::PartialVolumeDescriptor;
    use crate::transport::{FrameStream, TransportKind};
    use crate::types::PixelFormat;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;

    /// Replays a fixed list of frames
    struct ScriptedTransport {
        frames: Vec<Result<Frame>>,
    }

    impl ScriptedTransport {
        fn new(frames: Vec<Result<Frame>>) -> Arc<dyn VolumeTransport> {
            Arc::new(Self { frames })
        }
    }

    #[async_trait]
    impl VolumeTransport for ScriptedTransport {
        async fn open(&self, _request: &VolumeRequest) -> Result<FrameStream> {
            let frames: Vec<Result<Frame>> = self
                .frames
                .iter()
                .map(|f| match f {
                    Ok(frame) => Ok(frame.clone()),
                    Err(e) => Err(VolumeError::Transport(e.to_string())),
                })
                .collect();
            Ok(stream::iter(frames).boxed())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::PerSlice
        }
    }

    fn header(depth: usize) -> Frame {
        Frame::header(&VolumeMetadata::new([2, 1, depth], PixelFormat::UInt8)).unwrap()
    }

    fn slice(image_number: u32, values: [u8; 2]) -> Frame {
        let info = SliceHeader {
            instance_number: image_number,
            min: values[0].min(values[1]) as i32,
            max: values[0].max(values[1]) as i32,
            success: true,
        };
        Frame::slice(&info, Bytes::copy_from_slice(&values)).unwrap()
    }

    #[tokio::test]
    async fn test_out_of_order_slices() {
        let transport = ScriptedTransport::new(vec![
            Ok(header(3)),
            Ok(slice(3, [5, 6])),
            Ok(slice(1, [1, 2])),
            Ok(slice(3, [5, 6])),
            Ok(slice(2, [3, 4])),
            Ok(Frame::footer(&json!({"modality": "CT"})).unwrap()),
        ]);
        let loader = ProgressiveVolumeLoader::new(transport, VolumeRequest::new("s")).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        loader.subscribe(move |event| sink.lock().push(event.clone()));
        loader.start();
        loader.wait().await.unwrap();

        let volume = loader.volume();
        let volume = volume.read();
        assert!(volume.is_complete());
        assert_eq!(volume.get_pixel_at(1, 0, 2).unwrap(), 6);
        assert_eq!(volume.get_pixel_at(0, 0, 0).unwrap(), 1);
        drop(volume);

        let events = events.lock().clone();
        let loaded: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::Progress(p) => Some(p.loaded),
                _ => None,
            })
            .collect();
        assert_eq!(loaded, vec![0, 1, 2, 3]);
        assert_eq!(events.last(), Some(&LoadEvent::Ready));
    }

    #[tokio::test]
    async fn test_footer_estimates_window() {
        let transport = ScriptedTransport::new(vec![
            Ok(header(1)),
            Ok(slice(1, [10, 30])),
            Ok(Frame::footer(&json!({"modality": "CT"})).unwrap()),
        ]);
        let loader = ProgressiveVolumeLoader::spawn(transport, VolumeRequest::new("s")).unwrap();
        loader.wait().await.unwrap();
        // The footer is processed after the last slice made the loader ready
        for _ in 0..100 {
            if loader.metadata().and_then(|m| m.estimated_window).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        let meta = loader.metadata().unwrap();
        assert_eq!(meta.get_metadata("modality"), Some(&json!("CT")));
        let window = meta.estimated_window.unwrap();
        assert_eq!((window.level, window.width), (20.0, 20.0));
    }

    #[tokio::test]
    async fn test_abort_after_ready_is_ignored() {
        let transport = ScriptedTransport::new(vec![
            Ok(header(1)),
            Ok(slice(1, [0, 100])),
            Ok(Frame::footer(&json!({"modality": "CT"})).unwrap()),
        ]);
        let loader = ProgressiveVolumeLoader::spawn(transport, VolumeRequest::new("s")).unwrap();
        loader.wait().await.unwrap();
        loader.abort();
        assert_eq!(loader.state(), LoadState::Ready);
        assert!(!loader.is_aborted());

        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        loader.subscribe(move |event| *sink.lock() = Some(event.clone()));
        assert_eq!(seen.lock().clone(), Some(LoadEvent::Ready));

        // The footer still lands after the ignored abort
        for _ in 0..100 {
            if loader.metadata().and_then(|m| m.estimated_window).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        let meta = loader.metadata().unwrap();
        assert_eq!(meta.get_metadata("modality"), Some(&json!("CT")));
        assert!(meta.estimated_window.is_some());
    }

    #[tokio::test]
    async fn test_footer_changing_geometry_fails() {
        let transport = ScriptedTransport::new(vec![
            Ok(header(2)),
            Ok(slice(1, [1, 1])),
            Ok(Frame::footer(&json!({"voxelCount": [9, 9, 9], "pixelFormat": "int16"})).unwrap()),
            Ok(slice(2, [2, 2])),
        ]);
        let loader = ProgressiveVolumeLoader::spawn(transport, VolumeRequest::new("s")).unwrap();
        assert!(loader.wait().await.is_err());
        assert!(matches!(loader.state(), LoadState::Errored(_)));
        let meta = loader.metadata().unwrap();
        assert_eq!(meta.voxel_count, [2, 1, 2]);
        assert_eq!(meta.pixel_format, PixelFormat::UInt8);
        assert_eq!(loader.volume().read().size(), [2, 1, 2]);
    }

    #[tokio::test]
    async fn test_partial_request_maps_image_numbers() {
        let partial = PartialVolumeDescriptor::new(9, 1, -4);
        let transport = ScriptedTransport::new(vec![
            Ok(header(3)),
            Ok(slice(1, [1, 1])),
            Ok(slice(9, [9, 9])),
            Ok(slice(5, [5, 5])),
        ]);
        let request = VolumeRequest::new("s").with_partial(partial);
        let volume = load_volume(transport, request).await.unwrap();
        assert_eq!(volume.get_pixel_at(0, 0, 0).unwrap(), 9);
        assert_eq!(volume.get_pixel_at(0, 0, 1).unwrap(), 5);
        assert_eq!(volume.get_pixel_at(0, 0, 2).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failure_frame_errors() {
        let transport = ScriptedTransport::new(vec![
            Ok(header(2)),
            Ok(slice(1, [1, 1])),
            Ok(Frame::failure("disk on fire", Some(2)).unwrap()),
        ]);
        let loader = ProgressiveVolumeLoader::spawn(transport, VolumeRequest::new("s")).unwrap();
        let err = loader.wait().await.unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
        assert!(matches!(loader.state(), LoadState::Errored(_)));
        assert!(loader.contains_images(0..1));
        assert!(!loader.contains_images(0..2));

        // Late listeners still learn about the failure
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        loader.subscribe(move |event| *sink.lock() = Some(event.clone()));
        assert!(matches!(seen.lock().clone(), Some(LoadEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_protocol_violations() {
        let cases = vec![
            vec![Ok(slice(1, [1, 1]))],
            vec![Ok(header(2)), Ok(slice(3, [1, 1]))],
            vec![Ok(header(2)), Ok(header(2))],
            vec![Ok(header(2)), Ok(slice(1, [1, 1]))],
            vec![Ok(header(1)), Err(VolumeError::Transport("reset".into()))],
            vec![],
        ];
        for frames in cases {
            let request = VolumeRequest::new("s");
            let loader = ProgressiveVolumeLoader::spawn(ScriptedTransport::new(frames), request);
            let loader = loader.unwrap();
            assert!(loader.wait().await.is_err());
            assert!(matches!(loader.state(), LoadState::Errored(_)));
        }
    }

    #[tokio::test]
    async fn test_partial_header_mismatch() {
        let transport = ScriptedTransport::new(vec![Ok(header(4))]);
        let request = VolumeRequest::new("s").with_partial(PartialVolumeDescriptor::new(1, 5, 2));
        let loader = ProgressiveVolumeLoader::spawn(transport, request).unwrap();
        assert!(loader.ready().await.is_err());
    }

    #[test]
    fn test_invalid_request_rejected_synchronously() {
        let transport = ScriptedTransport::new(vec![]);
        let request = VolumeRequest::new("s").with_partial(PartialVolumeDescriptor::new(7, 7, -1));
        let err = ProgressiveVolumeLoader::new(transport, request).err().unwrap();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_abort_before_start() {
        let transport = ScriptedTransport::new(vec![Ok(header(1)), Ok(slice(1, [1, 1]))]);
        let loader = ProgressiveVolumeLoader::new(transport, VolumeRequest::new("s")).unwrap();
        loader.abort();
        loader.abort();
        loader.start();
        assert_eq!(loader.state(), LoadState::Aborted);
        assert!(matches!(loader.wait().await, Err(VolumeError::Aborted)));
        assert!(matches!(loader.ready().await, Err(VolumeError::Aborted)));
    }

    #[test]
    fn test_progress() {
        let p = Progress { loaded: 1, total: 4 };
        assert_eq!(p.fraction(), 0.25);
        assert!(!p.is_complete());
        assert!(!Progress::default().is_complete());
    }
}
