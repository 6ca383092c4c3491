//! Off-thread labeling and hole filling
//!
//! Jobs travel as owned messages: the request carries its own copy of the
//! mask and the response carries the result or an error message. Panics
//! inside a job become [`WorkerResponse::Error`].

use crate::config::WorkerConfig;
use crate::error::{Result, VolumeError};
use crate::labeling::{
    fill_holes, label_components, Connectivity, HoleFillingResult, LabelingResult,
};
use crate::types::Orientation;
use crate::volume::VoxelVolume;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

/// Connected-component labeling job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelingRequest {
    pub input_buffer: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub connectivity: Connectivity,
}

impl LabelingRequest {
    pub fn new(input_buffer: Vec<u8>, dims: [usize; 3], connectivity: Connectivity) -> Self {
        let [width, height, depth] = dims;
        Self {
            input_buffer,
            width,
            height,
            depth,
            connectivity,
        }
    }

    /// Copy a fully populated volume into a request
    pub fn from_volume(volume: &VoxelVolume, connectivity: Connectivity) -> Result<Self> {
        Ok(Self::new(volume.to_mask()?, volume.size(), connectivity))
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    pub fn run(&self) -> Result<LabelingResult> {
        label_components(&self.input_buffer, self.dims(), self.connectivity)
    }
}

/// Hole filling job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoleFillingRequest {
    pub input_buffer: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub connectivity: Connectivity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
}

impl HoleFillingRequest {
    pub fn new(input_buffer: Vec<u8>, dims: [usize; 3], connectivity: Connectivity) -> Self {
        let [width, height, depth] = dims;
        Self {
            input_buffer,
            width,
            height,
            depth,
            connectivity,
            orientation: None,
        }
    }

    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = Some(orientation);
        self
    }

    pub fn from_volume(volume: &VoxelVolume, connectivity: Connectivity) -> Result<Self> {
        Ok(Self::new(volume.to_mask()?, volume.size(), connectivity))
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.width, self.height, self.depth]
    }

    pub fn run(&self) -> Result<HoleFillingResult> {
        fill_holes(
            &self.input_buffer,
            self.dims(),
            self.connectivity,
            self.orientation.unwrap_or_default(),
        )
    }
}

/// Message sent to the compute threads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "request", rename_all = "camelCase")]
pub enum WorkerRequest {
    Label(LabelingRequest),
    FillHoles(HoleFillingRequest),
}

impl WorkerRequest {
    fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::Label(_) => "label",
            WorkerRequest::FillHoles(_) => "fillHoles",
        }
    }

    /// Run the job on the current thread
    pub fn execute(&self) -> WorkerResponse {
        let outcome = match self {
            WorkerRequest::Label(request) => request.run().map(WorkerResponse::Labeled),
            WorkerRequest::FillHoles(request) => request.run().map(WorkerResponse::Filled),
        };
        outcome.unwrap_or_else(|e| WorkerResponse::Error(e.to_string()))
    }
}

/// Message returned by the compute threads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "camelCase")]
pub enum WorkerResponse {
    Labeled(LabelingResult),
    Filled(HoleFillingResult),
    Error(String),
}

impl WorkerResponse {
    pub fn into_labeling(self) -> Result<LabelingResult> {
        match self {
            WorkerResponse::Labeled(result) => Ok(result),
            WorkerResponse::Error(message) => Err(VolumeError::Worker(message)),
            WorkerResponse::Filled(_) => Err(VolumeError::Worker(
                "Expected a labeling result, got a hole filling result".to_string(),
            )),
        }
    }

    pub fn into_hole_filling(self) -> Result<HoleFillingResult> {
        match self {
            WorkerResponse::Filled(result) => Ok(result),
            WorkerResponse::Error(message) => Err(VolumeError::Worker(message)),
            WorkerResponse::Labeled(_) => Err(VolumeError::Worker(
                "Expected a hole filling result, got a labeling result".to_string(),
            )),
        }
    }
}

type Job = (WorkerRequest, oneshot::Sender<WorkerResponse>);

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Worker panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Worker panicked: {}", message)
    } else {
        "Worker panicked".to_string()
    }
}

fn run_guarded<F>(job: F) -> WorkerResponse
where
    F: FnOnce() -> WorkerResponse,
{
    catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|panic| {
        let message = panic_message(panic);
        warn!("{}", message);
        WorkerResponse::Error(message)
    })
}

fn worker_loop(queue: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = queue.lock().blocking_recv();
        let Some((request, reply)) = job else {
            break;
        };
        debug!("Running {} job", request.kind());
        let response = run_guarded(|| request.execute());
        if reply.send(response).is_err() {
            debug!("Submitter went away before the job finished");
        }
    }
}

/// Dedicated threads fed by a bounded queue.
///
/// Dropping the pool joins its threads on the dropping thread and so waits
/// for queued jobs. Inside an async task use [`ComputePool::shutdown`].
pub struct ComputePool {
    sender: Option<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl ComputePool {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel::<Job>(config.queue_capacity);
        let queue = Arc::new(Mutex::new(receiver));
        let mut handles = Vec::with_capacity(config.threads);
        for idx in 0..config.threads {
            let queue = Arc::clone(&queue);
            let handle = thread::Builder::new()
                .name(format!("voxel-compute-{}", idx))
                .spawn(move || worker_loop(queue))
                .map_err(|e| {
                    VolumeError::Worker(format!("Failed to spawn compute thread: {}", e))
                })?;
            handles.push(handle);
        }
        info!(
            "Compute pool started with {} threads, queue capacity {}",
            config.threads, config.queue_capacity
        );
        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Queue a job and wait for its response.
    ///
    /// Waits for queue space when the queue is full.
    pub async fn submit(&self, request: WorkerRequest) -> Result<WorkerResponse> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| VolumeError::Worker("Compute pool is shut down".to_string()))?;
        let (reply, response) = oneshot::channel();
        sender
            .send((request, reply))
            .await
            .map_err(|_| VolumeError::Worker("Compute pool is shut down".to_string()))?;
        response
            .await
            .map_err(|_| VolumeError::Worker("Compute thread dropped the job".to_string()))
    }

    pub async fn label(&self, request: LabelingRequest) -> Result<LabelingResult> {
        self.submit(WorkerRequest::Label(request)).await?.into_labeling()
    }

    pub async fn fill_holes(&self, request: HoleFillingRequest) -> Result<HoleFillingResult> {
        self.submit(WorkerRequest::FillHoles(request))
            .await?
            .into_hole_filling()
    }

    /// Close the queue and wait for the threads without blocking the runtime
    pub async fn shutdown(mut self) -> Result<()> {
        self.sender.take();
        let handles = std::mem::take(&mut self.handles);
        tokio::task::spawn_blocking(move || join_all(handles))
            .await
            .map_err(|e| VolumeError::Worker(format!("Failed to join compute threads: {}", e)))
    }
}

fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if handle.join().is_err() {
            warn!("Compute thread exited with a panic");
        }
    }
    info!("Compute pool stopped");
}

impl Drop for ComputePool {
    /// Queued jobs still run; the threads exit once the queue is drained.
    fn drop(&mut self) {
        self.sender.take();
        if !self.handles.is_empty() {
            join_all(std::mem::take(&mut self.handles));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_label_through_pool() {
        let pool = ComputePool::new(&WorkerConfig::default()).unwrap();
        let request = LabelingRequest::new(vec![1, 0, 1, 1, 0, 1], [3, 2, 1], Connectivity::Four);
        let result = pool.label(request).await.unwrap();
        assert_eq!(result.label_count, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_errors_cross_as_messages() {
        let pool = ComputePool::new(&WorkerConfig::default().with_threads(1)).unwrap();
        let bad = LabelingRequest::new(vec![1; 5], [3, 2, 1], Connectivity::Four);
        let response = pool.submit(WorkerRequest::Label(bad)).await.unwrap();
        assert!(matches!(response, WorkerResponse::Error(ref m) if m.contains("expected 6")));

        let isolated: Vec<u8> = (0..600).map(|x| (x % 2 == 0) as u8).collect();
        let err = pool
            .label(LabelingRequest::new(isolated, [600, 1, 1], Connectivity::Four))
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::Worker(ref m) if m.contains("255")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_many_jobs_small_queue() {
        let config = WorkerConfig::default().with_threads(2).with_queue_capacity(1);
        let pool = Arc::new(ComputePool::new(&config).unwrap());
        let jobs = (1..=8).map(|n| {
            let pool = Arc::clone(&pool);
            async move {
                let mut mask = vec![1u8; n * n];
                if n > 2 {
                    mask[n + 1] = 0;
                }
                let request = HoleFillingRequest::new(mask, [n, n, 1], Connectivity::Four);
                pool.fill_holes(request).await.unwrap().hole_volume
            }
        });
        let volumes = futures::future::join_all(jobs).await;
        assert_eq!(volumes, vec![0, 0, 1, 1, 1, 1, 1, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_shutdown() {
        let pool = Arc::new(ComputePool::new(&WorkerConfig::default().with_threads(1)).unwrap());
        let side = 64;
        let job = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let mut mask = vec![1u8; side * side];
                mask[side + 1] = 0;
                let request = HoleFillingRequest::new(mask, [side, side, 1], Connectivity::Four);
                pool.fill_holes(request).await
            })
        };
        let result = job.await.unwrap().unwrap();
        assert_eq!(result.hole_volume, 1);

        let pool = Arc::try_unwrap(pool).ok().unwrap();
        assert_eq!(pool.threads(), 1);
        pool.shutdown().await.unwrap();
    }

    #[test]
    fn test_panic_becomes_error() {
        let response = run_guarded(|| panic!("boom"));
        assert_eq!(response, WorkerResponse::Error("Worker panicked: boom".to_string()));
    }

    #[test]
    fn test_message_shape() {
        let request = WorkerRequest::FillHoles(
            HoleFillingRequest::new(vec![0, 1], [2, 1, 1], Connectivity::Eight)
                .with_orientation(Orientation::Coronal),
        );
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "fillHoles");
        assert_eq!(json["request"]["inputBuffer"], serde_json::json!([0, 1]));
        assert_eq!(json["request"]["connectivity"], 8);
        assert_eq!(json["request"]["orientation"], "coronal");

        let response = WorkerResponse::Error("nope".into());
        let text = serde_json::to_string(&response).unwrap();
        let back: WorkerResponse = serde_json::from_str(&text).unwrap();
        assert!(back.into_labeling().is_err());
    }

    #[test]
    fn test_pool_config_validated() {
        assert!(ComputePool::new(&WorkerConfig::default().with_threads(0)).is_err());
    }
}
