//! Per-test opt-out markers and repetition overrides

use crate::config::{validate_run, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `no_leak_check` marker: do not hunt this test.
///
/// With `fail` set the test still runs once, and a `(not checked)` verdict
/// carrying `reason` is attached so coverage audits can see it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakMarker {
    #[serde(default)]
    pub fail: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl LeakMarker {
    pub fn skip() -> Self {
        Self::default()
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            fail: true,
            reason: Some(reason.into()),
        }
    }

    /// Reason surfaced in the sentinel verdict
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or("")
    }
}

/// Markers and overrides keyed by node id, resolved once per test
#[derive(Debug, Clone, Default)]
pub struct MarkerRegistry {
    markers: HashMap<String, LeakMarker>,
    repetitions: HashMap<String, (usize, usize)>,
}

impl MarkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, node_id: impl Into<String>, marker: LeakMarker) {
        self.markers.insert(node_id.into(), marker);
    }

    pub fn resolve(&self, node_id: &str) -> Option<&LeakMarker> {
        self.markers.get(node_id)
    }

    /// Override `(stab, run)` for one test; `run == 0` is rejected here, not at hunt time
    pub fn set_repetitions(
        &mut self,
        node_id: impl Into<String>,
        stab: usize,
        run: usize,
    ) -> Result<(), ConfigError> {
        let node_id = node_id.into();
        validate_run(run).map_err(|err| {
            ConfigError::ValidationError(format!("override for {}: {}", node_id, err))
        })?;
        self.repetitions.insert(node_id, (stab, run));
        Ok(())
    }

    pub fn repetitions(&self, node_id: &str) -> Option<(usize, usize)> {
        self.repetitions.get(node_id).copied()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
