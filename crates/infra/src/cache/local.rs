//! Process-local bounded TTL cache.
//!
//! Backed by `DashMap`, so reads and writes need no external lock. Every
//! entry carries its write time and TTL; a read past the TTL is treated as a
//! miss and removes the entry. When an insert pushes the size over capacity,
//! expired entries are purged first and then the least recently used entries
//! are evicted, with headroom of about 1/32 of capacity so a full cache scans
//! once per batch rather than on every insert. Recency is a global atomic
//! tick stamped on every hit, so the hit path never takes a write lock on the
//! map.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    written_at: Instant,
    ttl: Duration,
    last_access: AtomicU64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) >= self.ttl
    }
}

#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Entry<V>>,
    max_size: usize,
    ttl: Duration,
    tick: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            max_size: max_size.max(1),
            ttl,
            tick: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A cache bounded only by per-entry TTLs.
    pub fn unbounded(ttl: Duration) -> Self {
        Self::new(usize::MAX, ttl)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                entry.last_access.store(self.next_tick(), Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| !e.is_expired(Instant::now()))
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            written_at: Instant::now(),
            ttl,
            last_access: AtomicU64::new(self.next_tick()),
        };
        self.entries.insert(key, entry);
        if self.entries.len() > self.max_size {
            self.evict_overflow();
        }
    }

    fn evict_overflow(&self) {
        self.purge_expired();
        let len = self.entries.len();
        if len <= self.max_size {
            return;
        }

        let excess = len - self.max_size + self.max_size / 32;
        let mut by_age: Vec<(u64, K)> = self
            .entries
            .iter()
            .map(|e| (e.value().last_access.load(Ordering::Relaxed), e.key().clone()))
            .collect();
        if excess < by_age.len() {
            by_age.select_nth_unstable_by_key(excess, |(tick, _)| *tick);
            by_age.truncate(excess);
        }
        for (_, key) in by_age {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drops every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes every entry whose key satisfies `predicate`.
    pub fn invalidate_if(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !predicate(k));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}
