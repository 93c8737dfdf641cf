//! Global cache scrubbing
//!
//! Almost any unit of work fills some process-wide cache the first time it
//! runs (compiled patterns, warn-once registries, host lookup tables). That
//! first fill would look like a leak on the first tracked repetition, and
//! steady-state churn in those caches adds noise to every later one.
//!
//! The [`CacheScrubber`] captures every registered cache once before a hunt
//! and resets each of them to exactly that capture after every repetition.
//!
//! # Example
//!
//! ```ignore
//! static REGISTRY: Lazy<Mutex<HashMap<String, u32>>> = Lazy::new(Default::default);
//!
//! let mut scrubber = CacheScrubber::detect();
//! scrubber.register(MapCache::new("registry", &*REGISTRY));
//! let state = scrubber.snapshot();
//! // ... run the probe ...
//! scrubber.restore(&state);
//! ```

use crate::patterns::PatternCache;
use crate::warnings::WarningRegistry;
use std::any::Any;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use tracing::{debug, trace};

/// Opaque captured contents of one cache
pub struct CacheSnapshot(Box<dyn Any>);

impl CacheSnapshot {
    pub fn new<T: Any>(contents: T) -> Self {
        Self(Box::new(contents))
    }

    /// Snapshot of a cache that carries no state (clear-only caches)
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for CacheSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CacheSnapshot(..)")
    }
}

/// A process-wide cache that can be captured and reset
pub trait GlobalCache {
    fn name(&self) -> &str;

    /// Force lazy initialisation so it happens before measurement
    fn prime(&self) {}

    fn capture(&self) -> CacheSnapshot;

    /// Reset the cache to exactly `snapshot`
    fn restore(&self, snapshot: &CacheSnapshot);
}

/// Adapter for registries kept in a `Mutex<HashMap>`
pub struct MapCache<K: 'static, V: 'static> {
    name: String,
    map: &'static Mutex<HashMap<K, V>>,
}

impl<K, V> MapCache<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    pub fn new(name: impl Into<String>, map: &'static Mutex<HashMap<K, V>>) -> Self {
        Self {
            name: name.into(),
            map,
        }
    }
}

impl<K, V> GlobalCache for MapCache<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&self) -> CacheSnapshot {
        let map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        CacheSnapshot::new(map.clone())
    }

    fn restore(&self, snapshot: &CacheSnapshot) {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.clear();
        if let Some(saved) = snapshot.downcast_ref::<HashMap<K, V>>() {
            map.extend(saved.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
}

/// Adapter for caches that can only be emptied
pub struct PurgeCache {
    name: String,
    purge: Box<dyn Fn()>,
}

impl PurgeCache {
    pub fn new(name: impl Into<String>, purge: impl Fn() + 'static) -> Self {
        Self {
            name: name.into(),
            purge: Box::new(purge),
        }
    }
}

impl GlobalCache for PurgeCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn capture(&self) -> CacheSnapshot {
        CacheSnapshot::empty()
    }

    fn restore(&self, _snapshot: &CacheSnapshot) {
        (self.purge)()
    }
}

/// Captured contents of every registered cache, in registration order
#[derive(Debug)]
pub struct CacheState {
    snapshots: Vec<CacheSnapshot>,
}

impl CacheState {
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Captures and resets the registered global caches
#[derive(Default)]
pub struct CacheScrubber {
    caches: Vec<Box<dyn GlobalCache>>,
    restores: usize,
}

impl CacheScrubber {
    /// Scrubber with no caches registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Scrubber over the caches this process is known to have.
    ///
    /// Selected once at startup; hosts add their own with [`register`](Self::register).
    pub fn detect() -> Self {
        let scrubber = Self::new()
            .with_cache(PatternCache)
            .with_cache(WarningRegistry);
        debug!(caches = ?scrubber.cache_names(), "Cache scrubber ready");
        scrubber
    }

    pub fn register(&mut self, cache: impl GlobalCache + 'static) {
        self.caches.push(Box::new(cache));
    }

    pub fn with_cache(mut self, cache: impl GlobalCache + 'static) -> Self {
        self.register(cache);
        self
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.caches.iter().map(|c| c.name().to_string()).collect()
    }

    /// Warm lazily initialised process state so it is allocated before measurement
    pub fn prime(&self) {
        let _ = std::io::stdout();
        let _ = std::io::stderr();
        let _ = std::thread::current();
        for cache in &self.caches {
            cache.prime();
        }
    }

    /// Capture every registered cache
    pub fn snapshot(&self) -> CacheState {
        let snapshots = self.caches.iter().map(|c| c.capture()).collect();
        CacheState { snapshots }
    }

    /// Reset every registered cache to `state`
    pub fn restore(&mut self, state: &CacheState) {
        for (cache, snapshot) in self.caches.iter().zip(state.snapshots.iter()) {
            cache.restore(snapshot);
        }
        self.restores += 1;
        trace!(restores = self.restores, "Caches restored");
    }

    /// Number of `restore` calls since construction
    pub fn restore_count(&self) -> usize {
        self.restores
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::cell::Cell;
    use std::rc::Rc;

    static REGISTRY: Lazy<Mutex<HashMap<String, u32>>> = Lazy::new(Default::default);

    #[test]
    fn test_map_cache_restores_exact_contents() {
        REGISTRY.lock().unwrap().insert("baseline".to_string(), 1);
        let mut scrubber = CacheScrubber::new().with_cache(MapCache::new("registry", &*REGISTRY));
        let state = scrubber.snapshot();

        {
            let mut map = REGISTRY.lock().unwrap();
            map.insert("first-fill".to_string(), 2);
            map.insert("baseline".to_string(), 99);
        }

        scrubber.restore(&state);
        let map = REGISTRY.lock().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("baseline"), Some(&1));
    }

    #[test]
    fn test_purge_cache_runs_on_every_restore() {
        let purged = Rc::new(Cell::new(0));
        let counter = purged.clone();
        let mut scrubber = CacheScrubber::new()
            .with_cache(PurgeCache::new("purge", move || counter.set(counter.get() + 1)));

        let state = scrubber.snapshot();
        scrubber.restore(&state);
        scrubber.restore(&state);

        assert_eq!(purged.get(), 2);
        assert_eq!(scrubber.restore_count(), 2);
    }

    #[test]
    fn test_detect_registers_builtin_caches() {
        let scrubber = CacheScrubber::detect();
        assert_eq!(scrubber.cache_names(), vec!["patterns", "warnings"]);
        assert_eq!(scrubber.snapshot().len(), 2);
    }

    #[test]
    fn test_snapshot_downcast() {
        let snapshot = CacheSnapshot::new(vec![1u8, 2, 3]);
        assert_eq!(snapshot.downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
        assert!(snapshot.downcast_ref::<String>().is_none());
    }
}
