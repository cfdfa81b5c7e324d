use std::{
    collections::{HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use flowtop_common::{Direction, FlowKey};
use parking_lot::{Mutex, RwLock};

use crate::rate::{FlowRates, History, Sample};

pub const TABLE_SHARDS: usize = 64;

/// Mutable per-flow state. Counters are atomics so the ingestion path never
/// blocks on the history lock held by the sampler.
#[derive(Debug)]
pub struct FlowRecord {
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
    last_seen_ms: AtomicI64,
    history: Mutex<History>,
}

impl FlowRecord {
    fn new(created_ms: i64) -> Self {
        Self {
            upload_bytes: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
            last_seen_ms: AtomicI64::new(created_ms),
            history: Mutex::new(History::seeded()),
        }
    }

    fn add(&self, direction: Direction, bytes: u64, timestamp_ms: i64) {
        let counter = match direction {
            Direction::Upload => &self.upload_bytes,
            Direction::Download => &self.download_bytes,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
        self.last_seen_ms.fetch_max(timestamp_ms, Ordering::Relaxed);
    }

    pub fn upload_bytes(&self) -> u64 {
        self.upload_bytes.load(Ordering::Relaxed)
    }

    pub fn download_bytes(&self) -> u64 {
        self.download_bytes.load(Ordering::Relaxed)
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    /// Pushes the current counters into the history ring and returns the
    /// refreshed window rates.
    pub fn sample(&self) -> FlowRates {
        let current = Sample {
            upload_bytes: self.upload_bytes(),
            download_bytes: self.download_bytes(),
        };
        let mut history = self.history.lock();
        history.push(current);
        history.rates()
    }

    /// Rates as of the last sample, without pushing a new one.
    pub fn rates(&self) -> FlowRates {
        self.history.lock().rates()
    }
}

/// Concurrent key -> record map, sharded by key hash. Steady-state updates
/// take a shard read lock plus an atomic add; only first touch and reaping take
/// the write lock.
pub struct FlowTable<K> {
    shards: Vec<RwLock<HashMap<K, Arc<FlowRecord>>>>,
}

impl<K: FlowKey> FlowTable<K> {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(TABLE_SHARDS);
        for _ in 0..TABLE_SHARDS {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self { shards }
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len().max(1)
    }

    /// Returns the record for `key`, inserting a zeroed one on first touch.
    pub fn get_or_create(&self, key: &K, now_ms: i64) -> Arc<FlowRecord> {
        let shard = &self.shards[self.shard_index(key)];
        if let Some(record) = shard.read().get(key) {
            return record.clone();
        }
        insert_zeroed(&mut shard.write(), key, now_ms).clone()
    }

    /// Credits `bytes` to one direction of the flow. The shard lock is held for
    /// the increment so a concurrent reap cannot detach the record mid-update.
    pub fn add_bytes(&self, key: &K, direction: Direction, bytes: u64, timestamp_ms: i64) {
        let shard = &self.shards[self.shard_index(key)];
        {
            let guard = shard.read();
            if let Some(record) = guard.get(key) {
                record.add(direction, bytes, timestamp_ms);
                return;
            }
        }
        let mut guard = shard.write();
        insert_zeroed(&mut guard, key, timestamp_ms).add(direction, bytes, timestamp_ms);
    }

    pub fn get(&self, key: &K) -> Option<Arc<FlowRecord>> {
        self.shards[self.shard_index(key)].read().get(key).cloned()
    }

    /// Point-in-time listing of every record; no ordering across shards.
    pub fn snapshot(&self) -> Vec<(K, Arc<FlowRecord>)> {
        let mut entries = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let guard = shard.read();
            entries.extend(guard.iter().map(|(k, r)| (k.clone(), r.clone())));
        }
        entries
    }

    /// Drops records whose last contributing frame is older than `cutoff_ms`.
    pub fn reap(&self, cutoff_ms: i64) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|_, record| record.last_seen_ms() >= cutoff_ms);
            removed += before - guard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }
}

// Caller holds the shard write lock; a racing first touch finds the record
// another writer already inserted.
fn insert_zeroed<'a, K: FlowKey>(
    shard: &'a mut HashMap<K, Arc<FlowRecord>>,
    key: &K,
    now_ms: i64,
) -> &'a Arc<FlowRecord> {
    shard
        .entry(key.clone())
        .or_insert_with(|| Arc::new(FlowRecord::new(now_ms)))
}

impl<K: FlowKey> Default for FlowTable<K> {
    fn default() -> Self {
        Self::new()
    }
}
