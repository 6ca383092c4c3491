//! Keyed cache of asynchronous results
//!
//! Concurrent requests for the same key share a single in-flight fetch.
//! Failed fetches are never stored, so the next request retries. Completed
//! entries are bounded by count, optionally by age and by total size.

use crate::config::CacheConfig;
use crate::error::{Result, VolumeError};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::time::Instant;

type SharedFetch<V> = Shared<BoxFuture<'static, std::result::Result<V, Arc<VolumeError>>>>;

enum Entry<V> {
    Pending {
        id: u64,
        fetch: SharedFetch<V>,
    },
    Ready {
        value: V,
        inserted: Instant,
        last_access: u64,
        size: usize,
    },
}

/// Counters describing cache behavior since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Requests answered from a completed entry
    pub hits: u64,
    /// Requests that joined a fetch already in flight
    pub joins: u64,
    /// Requests that started a fetch
    pub misses: u64,
    pub failures: u64,
    pub evictions: u64,
    pub expirations: u64,
}

enum Lookup<V> {
    Hit(V),
    Join(u64, SharedFetch<V>),
    Expired,
    Miss,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    tick: u64,
    next_id: u64,
    total_size: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn remove(&mut self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some(Entry::Ready { size, .. }) => {
                self.total_size -= size;
                true
            }
            Some(Entry::Pending { .. }) => true,
            None => false,
        }
    }

    fn ready_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, Entry::Ready { .. }))
            .count()
    }
}

/// Cache of values produced by asynchronous fetches
pub struct AsyncResultCache<K, V> {
    config: CacheConfig,
    size_of: Arc<dyn Fn(&V) -> usize + Send + Sync>,
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for AsyncResultCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            size_of: Arc::clone(&self.size_of),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> AsyncResultCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache whose entries all count as size 1
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_size_fn(config, |_| 1)
    }

    /// Create a cache measuring entries with `size_of`
    pub fn with_size_fn<F>(config: CacheConfig, size_of: F) -> Result<Self>
    where
        F: Fn(&V) -> usize + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            config,
            size_of: Arc::new(size_of),
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
                next_id: 0,
                total_size: 0,
                stats: CacheStats::default(),
            })),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn is_expired(&self, inserted: Instant) -> bool {
        self.config
            .max_age()
            .map(|max_age| inserted.elapsed() >= max_age)
            .unwrap_or(false)
    }

    /// Return the cached value for `key`, or run `fetch` to produce it.
    ///
    /// `fetch` is only invoked when no completed or in-flight entry exists.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (id, shared) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.tick += 1;
            let tick = inner.tick;
            let lookup = match inner.entries.get_mut(&key) {
                Some(Entry::Ready {
                    value,
                    inserted,
                    last_access,
                    ..
                }) => {
                    if self.is_expired(*inserted) {
                        Lookup::Expired
                    } else {
                        *last_access = tick;
                        Lookup::Hit(value.clone())
                    }
                }
                Some(Entry::Pending { id, fetch }) => Lookup::Join(*id, fetch.clone()),
                None => Lookup::Miss,
            };
            match lookup {
                Lookup::Hit(value) => {
                    inner.stats.hits += 1;
                    return Ok(value);
                }
                Lookup::Join(id, shared) => {
                    inner.stats.joins += 1;
                    (id, shared)
                }
                Lookup::Expired | Lookup::Miss => {
                    if inner.entries.contains_key(&key) {
                        debug!("Cache entry {:?} expired", key);
                        inner.remove(&key);
                        inner.stats.expirations += 1;
                    }
                    inner.stats.misses += 1;
                    inner.next_id += 1;
                    let id = inner.next_id;
                    let shared = fetch().map(|r| r.map_err(Arc::new)).boxed().shared();
                    inner.entries.insert(
                        key.clone(),
                        Entry::Pending {
                            id,
                            fetch: shared.clone(),
                        },
                    );
                    (id, shared)
                }
            }
        };

        let outcome = shared.await;
        self.complete(&key, id, &outcome);
        outcome.map_err(VolumeError::from)
    }

    /// Store the outcome of fetch `id` unless it was invalidated meanwhile
    fn complete(&self, key: &K, id: u64, outcome: &std::result::Result<V, Arc<VolumeError>>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.entries.get(key) {
            Some(Entry::Pending { id: pending, .. }) if *pending == id => {}
            _ => return,
        }
        match outcome {
            Ok(value) => {
                let size = (self.size_of)(value);
                inner.entries.insert(
                    key.clone(),
                    Entry::Ready {
                        value: value.clone(),
                        inserted: Instant::now(),
                        last_access: inner.tick,
                        size,
                    },
                );
                inner.total_size += size;
                self.evict(inner, key);
            }
            Err(e) => {
                warn!("Fetch for {:?} failed: {}", key, e);
                inner.entries.remove(key);
                inner.stats.failures += 1;
            }
        }
    }

    fn over_limit(&self, inner: &Inner<K, V>) -> bool {
        inner.ready_count() > self.config.max_entries
            || self
                .config
                .max_size_bytes
                .map(|limit| inner.total_size > limit)
                .unwrap_or(false)
    }

    /// Drop least recently used completed entries, never `keep`
    fn evict(&self, inner: &mut Inner<K, V>, keep: &K) {
        while self.over_limit(inner) {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| *k != keep)
                .filter_map(|(k, e)| match e {
                    Entry::Ready { last_access, .. } => Some((*last_access, k.clone())),
                    Entry::Pending { .. } => None,
                })
                .min_by_key(|(last_access, _)| *last_access)
                .map(|(_, k)| k);
            let Some(victim) = victim else {
                break;
            };
            debug!("Evicting cache entry {:?}", victim);
            inner.remove(&victim);
            inner.stats.evictions += 1;
        }
    }

    /// Completed value for `key`, without fetching
    pub fn peek(&self, key: &K) -> Option<V> {
        match self.inner.lock().entries.get(key) {
            Some(Entry::Ready { value, inserted, .. }) if !self.is_expired(*inserted) => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    /// Forget `key`. An in-flight fetch still answers its waiters but is not stored.
    pub fn invalidate(&self, key: &K) -> bool {
        self.inner.lock().remove(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.total_size = 0;
    }

    /// Number of entries, pending ones included
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sizes of completed entries
    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }
}
