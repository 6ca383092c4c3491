//! Engine configuration

use crate::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for progressive volume loading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Slice requests kept in flight by the per-slice transport
    pub slice_concurrency: usize,
    /// Capacity of channel message queues
    pub channel_buffer: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            slice_concurrency: 4,
            channel_buffer: 64,
        }
    }
}

impl LoaderConfig {
    pub fn with_slice_concurrency(mut self, slice_concurrency: usize) -> Self {
        self.slice_concurrency = slice_concurrency;
        self
    }

    pub fn with_channel_buffer(mut self, channel_buffer: usize) -> Self {
        self.channel_buffer = channel_buffer;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.slice_concurrency == 0 {
            return Err(VolumeError::Configuration(
                "sliceConcurrency must be at least 1".to_string(),
            ));
        }
        if self.channel_buffer == 0 {
            return Err(VolumeError::Configuration(
                "channelBuffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Limits of an [`AsyncResultCache`](crate::cache::AsyncResultCache)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum number of completed entries
    pub max_entries: usize,
    /// Entries older than this many milliseconds are refetched
    pub max_age_ms: Option<u64>,
    /// Maximum total size as reported by the cache's size function
    pub max_size_bytes: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 32,
            max_age_ms: None,
            max_size_bytes: None,
        }
    }
}

impl CacheConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age_ms = Some(u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_max_size_bytes(mut self, max_size_bytes: usize) -> Self {
        self.max_size_bytes = Some(max_size_bytes);
        self
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(VolumeError::Configuration(
                "maxEntries must be at least 1".to_string(),
            ));
        }
        if self.max_age_ms == Some(0) {
            return Err(VolumeError::Configuration(
                "maxAgeMs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings of the labeling / hole filling compute pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Dedicated compute threads
    pub threads: usize,
    /// Jobs that may wait in the queue before submitters block
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 2,
            queue_capacity: 8,
        }
    }
}

impl WorkerConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(VolumeError::Configuration(
                "threads must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(VolumeError::Configuration(
                "queueCapacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub loader: LoaderConfig,
    pub cache: CacheConfig,
    pub worker: WorkerConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| VolumeError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.loader.validate()?;
        self.cache.validate()?;
        self.worker.validate()
    }
}
