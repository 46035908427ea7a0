//! Reference-counted cache of lazily built clients.
//!
//! An entry stays alive while any guard holds it and for `idle_ttl` after the
//! last guard is dropped. Expired entries are swept on access.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::EngineError;

type Lookup<K, V> = dyn Fn(&K) -> Result<V, EngineError> + Send + Sync;

struct CacheEntry<V> {
    value: V,
    holders: usize,
    idle_since: Option<Instant>,
}

type Entries<K, V> = Arc<Mutex<HashMap<K, CacheEntry<V>>>>;

fn lock<K, V>(entries: &Entries<K, V>) -> MutexGuard<'_, HashMap<K, CacheEntry<V>>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ClientCache<K, V> {
    lookup: Box<Lookup<K, V>>,
    idle_ttl: Duration,
    entries: Entries<K, V>,
}

impl<K, V> ClientCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new<F>(idle_ttl: Duration, lookup: F) -> Self
    where
        F: Fn(&K) -> Result<V, EngineError> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
            idle_ttl,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquire the value for `key`, building it on first use.
    pub fn get(&self, key: &K) -> Result<CacheGuard<K, V>, EngineError> {
        let mut entries = lock(&self.entries);
        Self::sweep_locked(&mut entries, self.idle_ttl);
        let value = match entries.get_mut(key) {
            Some(entry) => {
                entry.holders += 1;
                entry.idle_since = None;
                entry.value.clone()
            }
            None => {
                let value = (self.lookup)(key)?;
                entries.insert(
                    key.clone(),
                    CacheEntry {
                        value: value.clone(),
                        holders: 1,
                        idle_since: None,
                    },
                );
                value
            }
        };
        Ok(CacheGuard {
            key: key.clone(),
            value,
            entries: self.entries.clone(),
        })
    }

    /// Drop entries idle for longer than the TTL.
    pub fn sweep(&self) {
        Self::sweep_locked(&mut lock(&self.entries), self.idle_ttl);
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.entries).contains_key(key)
    }

    fn sweep_locked(entries: &mut HashMap<K, CacheEntry<V>>, idle_ttl: Duration) {
        entries.retain(|_, entry| {
            entry.holders > 0 || entry.idle_since.is_none_or(|since| since.elapsed() < idle_ttl)
        });
    }
}

/// Holds a cache entry alive until dropped.
pub struct CacheGuard<K: Eq + Hash, V> {
    key: K,
    value: V,
    entries: Entries<K, V>,
}

impl<K: Eq + Hash, V> Deref for CacheGuard<K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K: Eq + Hash, V> Drop for CacheGuard<K, V> {
    fn drop(&mut self) {
        if let Some(entry) = lock(&self.entries).get_mut(&self.key) {
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                entry.idle_since = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_cache(built: Arc<AtomicUsize>) -> ClientCache<String, String> {
        ClientCache::new(Duration::from_secs(300), move |key: &String| {
            if key == "missing" {
                return Err(EngineError::defect("workflow missing is not registered"));
            }
            built.fetch_add(1, Ordering::SeqCst);
            Ok(format!("client:{key}"))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_evicted_only_after_idle_ttl_without_holders() {
        let built = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(built.clone());

        let a = cache.get(&"Order".to_string()).unwrap();
        let b = cache.get(&"Order".to_string()).unwrap();
        assert_eq!(&*a, "client:Order");
        assert_eq!(built.load(Ordering::SeqCst), 1);

        drop(a);
        tokio::time::advance(Duration::from_secs(600)).await;
        cache.sweep();
        assert!(cache.contains(&"Order".to_string()), "still held by b");

        drop(b);
        tokio::time::advance(Duration::from_secs(299)).await;
        cache.sweep();
        assert!(cache.contains(&"Order".to_string()));

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.sweep();
        assert!(cache.is_empty());

        let _c = cache.get(&"Order".to_string()).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn lookup_failure_is_not_cached() {
        let cache = counting_cache(Arc::new(AtomicUsize::new(0)));
        assert!(cache.get(&"missing".to_string()).is_err());
        assert_eq!(cache.len(), 0);
    }
}
