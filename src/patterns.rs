//! Compiled-pattern cache
//!
//! Test selection (`-k`) and anything else in the process that matches test
//! ids goes through [`compile`], which memoises compiled regexes in a bounded
//! LRU cache. The cache fills lazily on first use and never shrinks on its
//! own, which is exactly the kind of growth the scrubber has to neutralise
//! between repetitions.

use crate::error::Result;
use crate::scrubber::{CacheSnapshot, GlobalCache};
use lru::LruCache;
use once_cell::sync::Lazy;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

/// Maximum number of compiled patterns kept
pub const PATTERN_CACHE_CAPACITY: usize = 128;

static PATTERNS: Lazy<Mutex<LruCache<String, Regex>>> = Lazy::new(|| {
    let capacity = NonZeroUsize::new(PATTERN_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
    Mutex::new(LruCache::new(capacity))
});

fn patterns() -> MutexGuard<'static, LruCache<String, Regex>> {
    PATTERNS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Compile `pattern`, reusing a cached regex when available
pub fn compile(pattern: &str) -> Result<Regex> {
    let mut cache = patterns();
    if let Some(regex) = cache.get(pattern) {
        return Ok(regex.clone());
    }
    trace!(pattern, "Compiling pattern");
    let regex = Regex::new(pattern)?;
    cache.put(pattern.to_string(), regex.clone());
    Ok(regex)
}

/// Drop every cached pattern
pub fn purge() {
    patterns().clear();
}

/// Number of cached patterns
pub fn cached() -> usize {
    patterns().len()
}

/// Scrubber adapter for the pattern cache
#[derive(Debug, Default)]
pub struct PatternCache;

impl GlobalCache for PatternCache {
    fn name(&self) -> &str {
        "patterns"
    }

    fn prime(&self) {
        Lazy::force(&PATTERNS);
    }

    fn capture(&self) -> CacheSnapshot {
        // Least recently used first, so replaying keeps the eviction order.
        let entries: Vec<(String, Regex)> = patterns()
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        CacheSnapshot::new(entries)
    }

    fn restore(&self, snapshot: &CacheSnapshot) {
        let mut cache = patterns();
        cache.clear();
        if let Some(entries) = snapshot.downcast_ref::<Vec<(String, Regex)>>() {
            for (pattern, regex) in entries {
                cache.put(pattern.clone(), regex.clone());
            }
        }
    }
}
