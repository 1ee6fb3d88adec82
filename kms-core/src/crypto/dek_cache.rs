use crate::crypto::Dek;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::DEFAULT_CACHE_SIZE;

const CACHE_SIZE_ENV: &str = "KMS_DEK_CACHE_SIZE";
const MAX_SHARDS: usize = 16;
const NIL: usize = usize::MAX;

/// Identifies a wrapped DEK within one provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    provider: Arc<str>,
    digest: [u8; 32],
}

impl CacheKey {
    pub fn new(provider: Arc<str>, wrapped_dek: &[u8]) -> Self {
        Self {
            provider,
            digest: Sha256::digest(wrapped_dek).into(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    fn shard(&self, shards: usize) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.digest[..8]);
        (u64::from_le_bytes(prefix) % shards as u64) as usize
    }
}

/// Bounded LRU cache of unwrapped DEKs, keyed by their wrapped form.
///
/// Entries are spread over independently locked shards so lookups of
/// unrelated keys do not contend. Capacity and recency are cache-wide:
/// every use stamps the entry with a tick from one shared clock, and once
/// the total entry count exceeds capacity the oldest shard tail is evicted.
/// Each shard keeps its entries in a slot arena with an index-linked
/// recency list, so finding the victim costs one tail read per shard.
pub struct DekCache {
    provider: Arc<str>,
    capacity: usize,
    len: AtomicUsize,
    clock: AtomicU64,
    shards: Box<[Mutex<Shard>]>,
}

impl DekCache {
    /// Construct a cache for `provider` holding at most `capacity` DEKs.
    pub fn new(provider: impl Into<Arc<str>>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let shards = (0..capacity.min(MAX_SHARDS))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        Self {
            provider: provider.into(),
            capacity,
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            shards,
        }
    }

    /// Capacity from `KMS_DEK_CACHE_SIZE`, falling back to the default.
    pub fn from_env(provider: impl Into<Arc<str>>) -> Self {
        let capacity = env::var(CACHE_SIZE_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_CACHE_SIZE);
        Self::new(provider, capacity)
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn key(&self, wrapped_dek: &[u8]) -> CacheKey {
        CacheKey::new(self.provider.clone(), wrapped_dek)
    }

    /// Look up a DEK and mark it most recently used.
    pub fn get(&self, wrapped_dek: &[u8]) -> Option<Dek> {
        let key = self.key(wrapped_dek);
        let mut shard = self.shard_for(&key).lock();
        let idx = shard.find(&key)?;
        shard.touch(idx, self.tick());
        Some(shard.slots[idx].dek.clone())
    }

    /// Insert or refresh an entry, evicting the least recently used one once
    /// the cache holds more than `capacity` entries.
    pub fn insert(&self, wrapped_dek: &[u8], dek: Dek) {
        let key = self.key(wrapped_dek);
        {
            let mut shard = self.shard_for(&key).lock();
            if shard.insert(key, dek, self.tick()) {
                self.len.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.shrink_to_capacity();
    }

    /// Drop a single entry.
    pub fn remove(&self, wrapped_dek: &[u8]) -> bool {
        let key = self.key(wrapped_dek);
        let removed = self.shard_for(&key).lock().remove(&key);
        if removed {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            self.len.fetch_sub(shard.len(), Ordering::AcqRel);
            shard.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn shard_for(&self, key: &CacheKey) -> &Mutex<Shard> {
        &self.shards[key.shard(self.shards.len())]
    }

    /// Evict until the entry count is back at capacity. Each eviction is
    /// claimed by decrementing the count first, so concurrent inserters
    /// never evict below capacity.
    fn shrink_to_capacity(&self) {
        let claim = |n: usize| (n > self.capacity).then(|| n - 1);
        while self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, claim)
            .is_ok()
        {
            if !self.evict_oldest() {
                self.len.fetch_add(1, Ordering::AcqRel);
                break;
            }
        }
    }

    fn evict_oldest(&self) -> bool {
        for _ in 0..self.shards.len() {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(i, shard)| shard.lock().oldest_tick().map(|tick| (tick, i)))
                .min();
            let Some((_, i)) = oldest else {
                return false;
            };
            // Another caller may have drained that shard since the scan.
            if self.shards[i].lock().pop_oldest() {
                return true;
            }
        }
        false
    }
}

struct Slot {
    key: CacheKey,
    dek: Dek,
    tick: u64,
    prev: usize,
    next: usize,
}

/// Slot arena plus a doubly linked recency list threaded by index.
/// The head is the most recently used entry.
struct Shard {
    index: HashMap<CacheKey, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl Default for Shard {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }
}

impl Shard {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn find(&self, key: &CacheKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn oldest_tick(&self) -> Option<u64> {
        (self.tail != NIL).then(|| self.slots[self.tail].tick)
    }

    /// Returns true when the key was not present before.
    fn insert(&mut self, key: CacheKey, dek: Dek, tick: u64) -> bool {
        if let Some(idx) = self.find(&key) {
            self.slots[idx].dek = dek;
            self.touch(idx, tick);
            return false;
        }

        let idx = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.key = key.clone();
                slot.dek = dek;
                slot.tick = tick;
                idx
            }
            None => {
                self.slots.push(Slot {
                    key: key.clone(),
                    dek,
                    tick,
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }
        };

        self.index.insert(key, idx);
        self.push_front(idx);
        true
    }

    fn remove(&mut self, key: &CacheKey) -> bool {
        match self.index.remove(key) {
            Some(idx) => {
                self.release(idx);
                true
            }
            None => false,
        }
    }

    fn pop_oldest(&mut self) -> bool {
        if self.tail == NIL {
            return false;
        }
        let idx = self.tail;
        self.index.remove(&self.slots[idx].key);
        self.release(idx);
        true
    }

    fn release(&mut self, idx: usize) {
        self.unlink(idx);
        self.slots[idx].dek = Dek::zeroed();
        self.free.push(idx);
    }

    fn clear(&mut self) {
        *self = Self::default();
    }

    fn touch(&mut self, idx: usize, tick: u64) {
        self.slots[idx].tick = tick;
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.slots[next].prev = prev;
        }
        self.slots[idx].prev = NIL;
        self.slots[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.slots[idx].prev = NIL;
        self.slots[idx].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}
