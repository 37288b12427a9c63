//! Expiring get-or-fetch cache.
//!
//! Each key owns a slot whose lock is held for the duration of a refresh, so
//! concurrent callers for the same key wait for the single in-flight fetch
//! and then share its result. Distinct keys never block each other beyond the
//! brief map lookup.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type Slot<V> = Arc<Mutex<Option<Entry<V>>>>;

pub struct ExpiringCache<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn slot(&self, key: &K) -> Slot<V> {
        lock(&self.slots).entry(key.clone()).or_default().clone()
    }

    /// Return the cached value for `key` if fresh, otherwise run `fetch`
    /// (at most once concurrently per key) and cache its success.
    pub fn get_or_fetch<E, F>(&self, key: &K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = self.slot(key);
        let mut entry = lock(&slot);
        if let Some(e) = entry.as_ref() {
            if Instant::now() < e.expires_at {
                return Ok(e.value.clone());
            }
        }
        let value = fetch()?;
        *entry = Some(Entry {
            value: value.clone(),
            expires_at: Instant::now() + self.ttl,
        });
        Ok(value)
    }

    /// Fresh cached value without fetching.
    pub fn peek(&self, key: &K) -> Option<V> {
        let slot = lock(&self.slots).get(key).cloned()?;
        let entry = lock(&slot);
        entry
            .as_ref()
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.value.clone())
    }

    /// Drop the cached value; waits for an in-flight refresh of `key`.
    pub fn invalidate(&self, key: &K) {
        let slot = lock(&self.slots).get(key).cloned();
        if let Some(slot) = slot {
            *lock(&slot) = None;
        }
    }

    pub fn clear(&self) {
        lock(&self.slots).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn fresh_values_are_reused() {
        let cache = ExpiringCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v: Result<u32, ()> = cache.get_or_fetch(&"k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            });
            assert_eq!(v, Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn expired_values_are_refetched() {
        let cache = ExpiringCache::new(Duration::ZERO);
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let _: Result<u32, ()> = cache.get_or_fetch(&"k", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.peek(&"k"), None);
    }

    #[test]
    fn errors_are_not_cached() {
        let cache: ExpiringCache<&str, u32> = ExpiringCache::new(Duration::from_secs(60));
        assert_eq!(cache.get_or_fetch(&"k", || Err("boom")), Err("boom"));
        assert_eq!(cache.get_or_fetch::<&str, _>(&"k", || Ok(2)), Ok(2));
    }

    #[test]
    fn invalidate_forces_refetch() {
        let cache = ExpiringCache::new(Duration::from_secs(60));
        let _: Result<u32, ()> = cache.get_or_fetch(&"k", || Ok(1));
        cache.invalidate(&"k");
        assert_eq!(cache.peek(&"k"), None);
        let v: Result<u32, ()> = cache.get_or_fetch(&"k", || Ok(2));
        assert_eq!(v, Ok(2));
    }

    #[test]
    fn concurrent_callers_share_one_fetch() {
        let cache = Arc::new(ExpiringCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_fetch::<(), _>(&"k", || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(42u32)
                    })
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
