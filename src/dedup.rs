//! Bounded TTL set used to collapse duplicate bridge messages and client
//! sends. Canonical usage is check, then process, then mark — marking only
//! after successful processing preserves at-least-once semantics.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

struct Entry {
    inserted_at: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    capacity: usize,
    ttl: Duration,
}

pub struct DedupeCache {
    inner: Mutex<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl DedupeCache {
    pub fn new(capacity: usize, ttl: Duration) -> std::sync::Arc<Self> {
        let cache = std::sync::Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                capacity,
                ttl,
            }),
            sweeper: Mutex::new(None),
        });
        let weak = std::sync::Arc::downgrade(&cache);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.sweep(),
                    None => break,
                }
            }
        });
        *cache.sweeper.lock().unwrap() = Some(handle);
        cache
    }

    /// Returns true iff the key is present and not expired. Also evicts the
    /// key on access if it has expired.
    pub fn check(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let ttl = inner.ttl;
        if let Some(entry) = inner.entries.get(key) {
            if entry.inserted_at.elapsed() < ttl {
                return true;
            }
            inner.entries.remove(key);
        }
        false
    }

    pub fn mark(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.len() >= inner.capacity && !inner.entries.contains_key(key) {
            if let Some(oldest_key) = inner
                .entries
                .iter()
                .max_by_key(|(_, e)| e.inserted_at.elapsed())
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest_key);
            }
        }
        inner.entries.insert(
            key.to_string(),
            Entry {
                inserted_at: Instant::now(),
            },
        );
    }

    fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        let ttl = inner.ttl;
        inner.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
    }
}

impl Drop for DedupeCache {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}
