//! Per-metric leak classifiers
//!
//! Each classifier looks only at the tracked-phase delta sequence of one
//! metric and answers "leak" or "noise". They are pure functions so they can
//! be exercised directly against literal sequences.
//!
//! | Kind | Leak when |
//! |---|---|
//! | References | every delta >= 1 |
//! | Blocks | fewer than 1/3 zeros AND some \|delta\| > 1 |
//! | Descriptors | any delta != 0 |
//!
//! The 1/3 and unit-jitter thresholds of the block classifier were tuned
//! empirically against one allocator; they live in [`ClassifierPolicy`] so a
//! different allocator can be calibrated without code changes.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};

/// Which classifier a metric is judged by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic retained-object counts
    References,
    /// Instantaneous live counts subject to allocator jitter
    Blocks,
    /// Descriptors and handles, which should never fluctuate
    Descriptors,
}

impl MetricKind {
    /// Human-readable unit used in leak messages
    pub fn unit(&self) -> &'static str {
        match self {
            MetricKind::References => "references",
            MetricKind::Blocks => "memory blocks",
            MetricKind::Descriptors => "file descriptors",
        }
    }
}

/// Tunable thresholds for the block classifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierPolicy {
    /// A sequence with at least `zero_numerator / zero_denominator` zeros is noise
    #[serde(default = "default_zero_numerator")]
    pub zero_numerator: usize,

    #[serde(default = "default_zero_denominator")]
    pub zero_denominator: usize,

    /// Deltas with magnitude at most this are jitter
    #[serde(default = "default_jitter")]
    pub jitter: i64,
}

fn default_zero_numerator() -> usize {
    1
}

fn default_zero_denominator() -> usize {
    3
}

fn default_jitter() -> i64 {
    1
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            zero_numerator: default_zero_numerator(),
            zero_denominator: default_zero_denominator(),
            jitter: default_jitter(),
        }
    }
}

impl ClassifierPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.zero_denominator == 0 || self.zero_numerator > self.zero_denominator {
            return Err(ConfigError::ValidationError(format!(
                "policy: zero fraction {}/{} must be within 0..=1",
                self.zero_numerator, self.zero_denominator
            )));
        }
        if self.jitter < 0 {
            return Err(ConfigError::ValidationError(
                "policy: jitter must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    /// Classify `deltas` with the classifier for `kind`
    pub fn is_leak(&self, kind: MetricKind, deltas: &[i64]) -> bool {
        match kind {
            MetricKind::References => check_reference_deltas(deltas),
            MetricKind::Blocks => self.check_block_deltas(deltas),
            MetricKind::Descriptors => check_descriptor_deltas(deltas),
        }
    }

    /// Block classifier.
    ///
    /// False positives to ignore: `[0, 0, 1]`, `[1, -1, 1, 0]`, `[1, -1, 1, 1]`, `[5, 0, 0]`.
    /// Expected leaks: `[3, 3, 4]`, `[2, 1, 2, 5]`.
    pub fn check_block_deltas(&self, deltas: &[i64]) -> bool {
        if deltas.is_empty() {
            return false;
        }
        let zeros = deltas.iter().filter(|&&d| d == 0).count();
        let mostly_zero = self.zero_denominator * zeros >= self.zero_numerator * deltas.len();
        let only_jitter = deltas.iter().all(|d| d.abs() <= self.jitter);
        !mostly_zero && !only_jitter
    }
}

/// Reference classifier.
///
/// Ignores `[3, 0, 0]`, `[0, 1, 0]`, `[8, -8, 1]`; flags `[5, 5, 6]`, `[10, 1, 1]`.
pub fn check_reference_deltas(deltas: &[i64]) -> bool {
    !deltas.is_empty() && deltas.iter().all(|&d| d >= 1)
}

/// Descriptor classifier
pub fn check_descriptor_deltas(deltas: &[i64]) -> bool {
    deltas.iter().any(|&d| d != 0)
}
