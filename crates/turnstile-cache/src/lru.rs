use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Counters exposed by [`LruTier::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LruStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hit percentage over all reads, rounded to two decimals.
    pub hit_rate: f64,
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    seq: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct LruInner<V> {
    entries: HashMap<String, Entry<V>>,
    /// Access order: lowest sequence number is the least recently used.
    order: BTreeMap<u64, String>,
    next_seq: u64,
    hits: u64,
    misses: u64,
}

impl<V> LruInner<V> {
    fn touch(&mut self, key: &str) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.seq);
            entry.seq = seq;
            self.order.insert(seq, key.to_owned());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.seq);
                true
            }
            None => false,
        }
    }

    /// Frees one slot: reclaims an expired entry if any exists,
    /// otherwise evicts the least recently used one.
    fn evict_one(&mut self, now: Instant) {
        let victim = self
            .order
            .values()
            .find(|key| {
                self.entries
                    .get(key.as_str())
                    .is_some_and(|e| e.is_expired(now))
            })
            .or_else(|| self.order.values().next())
            .cloned();
        if let Some(key) = victim {
            self.remove(&key);
        }
    }
}

/// A bounded in-process cache with strict least-recently-used
/// eviction and per-entry TTLs.
///
/// Expired entries are dropped lazily when read and proactively by
/// [`gc`](LruTier::gc). Insertion never grows the cache beyond its
/// capacity: a full cache evicts synchronously before accepting the
/// new entry.
pub struct LruTier<V> {
    capacity: usize,
    inner: Mutex<LruInner<V>>,
}

impl<V: Clone> LruTier<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LruInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Returns the value for `key` and refreshes its recency.
    ///
    /// An entry past its TTL is removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.touch(key);
        inner.hits += 1;
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Returns the value for `key` even if it has expired, without
    /// touching recency or statistics. Backs stale-serving on store
    /// failure.
    pub fn get_stale(&self, key: &str) -> Option<V> {
        let inner = self.inner.lock();
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Inserts or replaces `key`, evicting if the cache is full.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let expires_at = ttl.map(|ttl| now + ttl);
        let mut inner = self.inner.lock();

        if inner.entries.contains_key(key) {
            inner.touch(key);
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.value = value;
                entry.expires_at = expires_at;
            }
            return;
        }

        while inner.entries.len() >= self.capacity {
            inner.evict_one(now);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.to_owned());
        inner.entries.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at,
                seq,
            },
        );
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    /// Returns `true` if `key` is present and not expired. Expired
    /// entries are dropped. Does not affect recency or statistics.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Batch [`get`](LruTier::get); results align with `keys`.
    pub fn mget(&self, keys: &[String]) -> Vec<Option<V>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Batch [`set`](LruTier::set) with a shared TTL.
    pub fn mset(&self, items: impl IntoIterator<Item = (String, V)>, ttl: Option<Duration>) {
        for (key, value) in items {
            self.set(&key, value, ttl);
        }
    }

    /// Sweeps all expired entries and returns how many were removed.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. Statistics are kept.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> LruStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        let hit_rate = if total > 0 {
            (inner.hits as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        LruStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
        }
    }
}
