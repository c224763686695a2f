//! Response cache keyed by request-key and API path.
//!
//! Every request-key owns a bucket; every API path under that key owns an
//! entry inside the bucket. Validity is never stored: an entry is valid while
//! its write mark equals the bucket's stale mark. Invalidating a key bumps the
//! stale mark, which makes every entry under it invalid at once without
//! touching the entries themselves.
//!
//! ## Locking
//!
//! The key → bucket map is a [`DashMap`]. Each bucket guards its stale mark
//! and its entry map with one [`Mutex`], so a mark comparison always sees the
//! stale mark and the write mark from the same critical section. Bucket
//! handles are `Arc`s that are only dereferenced under that mutex.
//!
//! ## Marks
//!
//! Marks are Unix seconds, kept strictly monotonic per bucket: an
//! invalidation always moves the stale mark forward even if the wall clock
//! has not ticked since the last write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

/// Errors reported by [`CacheStore`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("no cache found for key {key}")]
    NotFound { key: String },
}

/// Per request-key partition: one stale mark plus the entries written under it.
#[derive(Debug)]
struct Bucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    stale_mark: i64,
    entries: HashMap<String, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    write_mark: i64,
}

impl Bucket {
    fn new(now: i64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                stale_mark: now,
                entries: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        // A panic while holding the guard cannot leave the marks half-written:
        // every mutation assigns whole values.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BucketState {
    fn is_valid(&self, entry: &Entry) -> bool {
        entry.write_mark == self.stale_mark
    }
}

/// The process-wide cache.
///
/// # Examples
///
/// ```
/// use httpcache::cache::CacheStore;
///
/// let cache = CacheStore::new();
/// cache.add("cp-1", "/api/v1/devices", "[1,2]".into());
/// assert!(cache.is_valid("cp-1", "/api/v1/devices"));
///
/// cache.invalidate("cp-1").unwrap();
/// assert!(!cache.is_valid("cp-1", "/api/v1/devices"));
/// // The stale bytes are still there until the entry is rewritten.
/// assert!(cache.get("cp-1", "/api/v1/devices").is_some());
/// ```
#[derive(Debug, Default)]
pub struct CacheStore {
    buckets: DashMap<String, Arc<Bucket>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached payload for `(key, api)` whether or not it is
    /// still valid. Use [`is_valid`](Self::is_valid) or
    /// [`lookup`](Self::lookup) to decide whether it may be served.
    pub fn get(&self, key: &str, api: &str) -> Option<Bytes> {
        let bucket = self.bucket(key)?;
        let state = bucket.lock();
        state.entries.get(api).map(|entry| entry.data.clone())
    }

    /// `false` when the bucket or entry is missing or the marks disagree.
    pub fn is_valid(&self, key: &str, api: &str) -> bool {
        let Some(bucket) = self.bucket(key) else {
            return false;
        };
        let state = bucket.lock();
        state
            .entries
            .get(api)
            .is_some_and(|entry| state.is_valid(entry))
    }

    /// Returns the payload only if it is valid, checked and read under one lock.
    pub fn lookup(&self, key: &str, api: &str) -> Option<Bytes> {
        let bucket = self.bucket(key)?;
        let state = bucket.lock();
        state
            .entries
            .get(api)
            .filter(|entry| state.is_valid(entry))
            .map(|entry| entry.data.clone())
    }

    /// Stores `payload` for `(key, api)` and makes it valid.
    ///
    /// Both marks move together: the bucket's stale mark and the entry's
    /// write mark are set to the same value. Entries for other APIs under
    /// this key are left in place; any whose write mark is now behind the
    /// stale mark become invalid.
    pub fn add(&self, key: &str, api: &str, payload: Bytes) {
        self.add_at(key, api, payload, unix_now());
    }

    pub(crate) fn add_at(&self, key: &str, api: &str, payload: Bytes, now: i64) {
        let bucket = Arc::clone(
            self.buckets
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Bucket::new(now)))
                .value(),
        );

        let mut state = bucket.lock();
        let mark = now.max(state.stale_mark);
        state.stale_mark = mark;
        state.entries.insert(
            api.to_owned(),
            Entry {
                data: payload,
                write_mark: mark,
            },
        );
        debug!(key, api, mark, "cache entry written");
    }

    /// Marks every entry under `key` stale.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] when nothing was ever cached for `key`. No
    /// bucket is created in that case.
    pub fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.invalidate_at(key, unix_now())
    }

    pub(crate) fn invalidate_at(&self, key: &str, now: i64) -> Result<(), CacheError> {
        let bucket = self.bucket(key).ok_or_else(|| CacheError::NotFound {
            key: key.to_owned(),
        })?;

        let mut state = bucket.lock();
        state.stale_mark = now.max(state.stale_mark + 1);
        info!(key, stale_mark = state.stale_mark, "cache invalidated");
        Ok(())
    }

    /// Number of request-keys that have a bucket.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    // Clones the bucket handle out so the shard lock is released before the
    // bucket mutex is taken.
    fn bucket(&self, key: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(key).map(|b| Arc::clone(b.value()))
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
