//! Warn-once registry
//!
//! Operational warnings that would otherwise repeat for every test (an
//! unwritable reflog, say) are logged once per key. The registry is a global
//! cache: the scrubber resets it between repetitions so a probe that warns
//! does not grow it permanently.

use crate::scrubber::{CacheSnapshot, GlobalCache};
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

static REGISTRY: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn registry() -> MutexGuard<'static, HashSet<String>> {
    REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Log `message` unless `key` already warned. Returns whether it was logged.
pub fn warn_once(key: &str, message: &str) -> bool {
    let mut seen = registry();
    if seen.contains(key) {
        return false;
    }
    seen.insert(key.to_string());
    warn!(key, "{}", message);
    true
}

/// Scrubber adapter for the warn-once registry
#[derive(Debug, Default)]
pub struct WarningRegistry;

impl GlobalCache for WarningRegistry {
    fn name(&self) -> &str {
        "warnings"
    }

    fn prime(&self) {
        Lazy::force(&REGISTRY);
    }

    fn capture(&self) -> CacheSnapshot {
        CacheSnapshot::new(registry().clone())
    }

    fn restore(&self, snapshot: &CacheSnapshot) {
        let mut seen = registry();
        seen.clear();
        if let Some(keys) = snapshot.downcast_ref::<HashSet<String>>() {
            seen.extend(keys.iter().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_warns_once_per_key() {
        assert!(warn_once("warnings-test-a", "first"));
        assert!(!warn_once("warnings-test-a", "again"));
        assert!(warn_once("warnings-test-b", "other key"));
    }

    #[test]
    #[serial]
    fn test_restore_allows_warning_again() {
        let cache = WarningRegistry;
        let snapshot = cache.capture();
        assert!(warn_once("warnings-test-scrubbed", "once"));
        cache.restore(&snapshot);
        assert!(warn_once("warnings-test-scrubbed", "displayed again"));
    }
}
