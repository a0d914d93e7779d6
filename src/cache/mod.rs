// Copyright 2019-2025 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! LRU byte-range cache over a fixed-size backing source.
//!
//! Keys are half-open byte ranges of the CAR file. A request is served from
//! any cached range that contains it (superset hit); misses go through a
//! single-flight fetch so concurrent readers of the same range issue one
//! backing read. Overlapping and adjacent ranges merge on insert, and an
//! LRU sweep keeps occupancy within the configured memory budget.

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex, RwLock, RwLockUpgradableReadGuard};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Range cache error
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("range [{start}, {end}) is outside the {size}-byte source")]
    RangeOutOfBounds { start: u64, end: u64, size: u64 },
    #[error("entry of {len} bytes exceeds the {budget}-byte cache budget")]
    EntryTooLarge { len: u64, budget: u64 },
    #[error("range fetch failed: {0}")]
    FetchFailed(String),
}

/// Reads a byte range from the backing source. Retry and backoff live in
/// the fetcher, not in the cache.
pub trait RangeFetcher: Send + Sync {
    fn fetch(&self, offset: u64, len: u64) -> Result<Bytes, CacheError>;
}

impl<F> RangeFetcher for F
where
    F: Fn(u64, u64) -> Result<Bytes, CacheError> + Send + Sync,
{
    fn fetch(&self, offset: u64, len: u64) -> Result<Bytes, CacheError> {
        self(offset, len)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RangeCacheConfig {
    /// Upper bound on cached bytes.
    pub max_memory_size: u64,
    /// Size of the backing source; requests past it are rejected.
    pub source_size: u64,
}

#[derive(Debug)]
struct CachedRange {
    end: u64,
    data: Bytes,
    last_read: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    /// Non-overlapping ranges keyed by start offset.
    ranges: BTreeMap<u64, CachedRange>,
    occupied: u64,
}

#[derive(Default)]
struct FetchSlot {
    done: Mutex<bool>,
    cond: Condvar,
}

struct GcWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct RangeCache {
    inner: Arc<RwLock<CacheInner>>,
    fetching: Mutex<HashMap<(u64, u64), Arc<FetchSlot>>>,
    fetcher: Box<dyn RangeFetcher>,
    config: RangeCacheConfig,
    gc: Mutex<Option<GcWorker>>,
}

impl RangeCache {
    pub fn new(config: RangeCacheConfig, fetcher: impl RangeFetcher + 'static) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CacheInner::default())),
            fetching: Mutex::new(HashMap::new()),
            fetcher: Box::new(fetcher),
            config,
            gc: Mutex::new(None),
        }
    }

    /// Bytes currently cached.
    pub fn occupied(&self) -> u64 {
        self.inner.read().occupied
    }

    /// Read `len` bytes at `offset`, from cache or through the fetcher.
    pub fn get(&self, offset: u64, len: u64) -> Result<Bytes, CacheError> {
        let end = offset.checked_add(len).ok_or(CacheError::RangeOutOfBounds {
            start: offset,
            end: u64::MAX,
            size: self.config.source_size,
        })?;
        if end > self.config.source_size {
            return Err(CacheError::RangeOutOfBounds {
                start: offset,
                end,
                size: self.config.source_size,
            });
        }
        if len > self.config.max_memory_size {
            return Err(CacheError::EntryTooLarge {
                len,
                budget: self.config.max_memory_size,
            });
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        loop {
            if let Some(bytes) = self.lookup(offset, end) {
                return Ok(bytes);
            }
            match self.claim_fetch(offset, len) {
                Claim::Fetcher(slot) => {
                    // No cache lock is held across the backing read.
                    let fetched = self.fetcher.fetch(offset, len);
                    if let Ok(bytes) = &fetched {
                        self.store(offset, bytes.clone());
                    }
                    self.release_fetch(offset, len, &slot);
                    return fetched;
                }
                Claim::Waiter(slot) => {
                    let mut done = slot.done.lock();
                    if !*done {
                        slot.cond.wait(&mut done);
                    }
                    // Re-check the cache; if the fetch failed we race to
                    // become the next fetcher.
                }
            }
        }
    }

    /// Insert bytes read elsewhere, merging with overlapping and adjacent
    /// entries.
    pub fn set(&self, offset: u64, data: Bytes) -> Result<(), CacheError> {
        let len = data.len() as u64;
        let end = offset + len;
        if end > self.config.source_size {
            return Err(CacheError::RangeOutOfBounds {
                start: offset,
                end,
                size: self.config.source_size,
            });
        }
        if len > self.config.max_memory_size {
            return Err(CacheError::EntryTooLarge {
                len,
                budget: self.config.max_memory_size,
            });
        }
        if len == 0 {
            return Ok(());
        }
        self.store(offset, data);
        Ok(())
    }

    /// Start a background sweep evicting entries unread for `max_age`.
    pub fn start_gc(&self, max_age: Duration) {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let inner = self.inner.clone();
        let interval = max_age.min(Duration::from_secs(1)).max(Duration::from_millis(10));
        let handle = std::thread::Builder::new()
            .name("range-cache-gc".into())
            .spawn(move || {
                while !worker_stop.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    let mut inner = inner.write();
                    let before = inner.occupied;
                    let expired: Vec<u64> = inner
                        .ranges
                        .iter()
                        .filter(|(_, r)| r.last_read.elapsed() > max_age)
                        .map(|(start, _)| *start)
                        .collect();
                    for start in expired {
                        if let Some(range) = inner.ranges.remove(&start) {
                            inner.occupied -= range.data.len() as u64;
                        }
                    }
                    if inner.occupied != before {
                        debug!(
                            freed = before - inner.occupied,
                            occupied = inner.occupied,
                            "range cache gc sweep"
                        );
                    }
                }
            })
            .expect("spawn gc thread");
        let mut slot = self.gc.lock();
        if let Some(old) = slot.replace(GcWorker { stop, handle }) {
            old.stop.store(true, Ordering::Release);
            let _ = old.handle.join();
        }
    }

    /// Drop all cached data and stop the gc sweep.
    pub fn close(&self) {
        if let Some(worker) = self.gc.lock().take() {
            worker.stop.store(true, Ordering::Release);
            let _ = worker.handle.join();
        }
        let mut inner = self.inner.write();
        inner.ranges.clear();
        inner.occupied = 0;
    }

    fn lookup(&self, offset: u64, end: u64) -> Option<Bytes> {
        let inner = self.inner.upgradable_read();
        let (start, range) = inner.ranges.range(..=offset).next_back()?;
        if range.end < end {
            return None;
        }
        let slice = range
            .data
            .slice((offset - start) as usize..(end - start) as usize);
        let start = *start;
        let mut inner = RwLockUpgradableReadGuard::upgrade(inner);
        if let Some(range) = inner.ranges.get_mut(&start) {
            range.last_read = Instant::now();
        }
        Some(slice)
    }

    fn store(&self, offset: u64, data: Bytes) {
        let mut inner = self.inner.write();
        let end = offset + data.len() as u64;

        // Everything that overlaps or touches [offset, end) merges into one
        // contiguous entry; the incoming bytes win where they overlap.
        let mut merge_start = offset;
        let mut merge_end = end;
        let mut absorbed: Vec<u64> = Vec::new();
        for (start, range) in inner.ranges.range(..=end) {
            if range.end >= offset {
                merge_start = merge_start.min(*start);
                merge_end = merge_end.max(range.end);
                absorbed.push(*start);
            }
        }

        let merged = if absorbed.is_empty() {
            data
        } else if absorbed.len() == 1 && merge_start == offset && merge_end == end {
            // Exact replacement.
            data
        } else {
            let mut buf = BytesMut::zeroed((merge_end - merge_start) as usize);
            for start in &absorbed {
                if let Some(range) = inner.ranges.get(start) {
                    let at = (start - merge_start) as usize;
                    buf[at..at + range.data.len()].copy_from_slice(&range.data);
                }
            }
            let at = (offset - merge_start) as usize;
            buf[at..at + data.len()].copy_from_slice(&data);
            buf.freeze()
        };

        for start in absorbed {
            if let Some(range) = inner.ranges.remove(&start) {
                inner.occupied -= range.data.len() as u64;
            }
        }
        inner.occupied += merged.len() as u64;
        inner.ranges.insert(
            merge_start,
            CachedRange {
                end: merge_end,
                data: merged,
                last_read: Instant::now(),
            },
        );

        // LRU eviction back under budget; the entry just inserted is the
        // most recent and falls out last.
        while inner.occupied > self.config.max_memory_size {
            let victim = inner
                .ranges
                .iter()
                .min_by_key(|(_, r)| r.last_read)
                .map(|(start, _)| *start);
            let Some(start) = victim else { break };
            if let Some(range) = inner.ranges.remove(&start) {
                inner.occupied -= range.data.len() as u64;
                debug!(start, len = range.data.len(), "evicted range");
            }
        }
    }

    fn claim_fetch(&self, offset: u64, len: u64) -> Claim {
        let mut fetching = self.fetching.lock();
        match fetching.get(&(offset, len)) {
            Some(slot) => Claim::Waiter(slot.clone()),
            None => {
                let slot = Arc::new(FetchSlot::default());
                fetching.insert((offset, len), slot.clone());
                Claim::Fetcher(slot)
            }
        }
    }

    fn release_fetch(&self, offset: u64, len: u64, slot: &Arc<FetchSlot>) {
        self.fetching.lock().remove(&(offset, len));
        let mut done = slot.done.lock();
        *done = true;
        slot.cond.notify_all();
    }
}

impl Drop for RangeCache {
    fn drop(&mut self) {
        if let Some(worker) = self.gc.lock().take() {
            worker.stop.store(true, Ordering::Release);
            let _ = worker.handle.join();
        }
    }
}

enum Claim {
    Fetcher(Arc<FetchSlot>),
    Waiter(Arc<FetchSlot>),
}
