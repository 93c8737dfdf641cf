//! Repeated-execution leak hunting
//!
//! [`LeakHunter::hunt`] runs a probe `stab + run` times on the current thread:
//!
//! 1. capture every global cache
//! 2. `stab` warm-up repetitions (probe, restore caches), nothing sampled
//! 3. sample the baseline
//! 4. `run` tracked repetitions (probe, restore caches, sample, record delta)
//! 5. classify each metric's delta sequence
//!
//! A probe error on any repetition aborts the hunt immediately and is handed
//! back untouched, tagged with the phase and repetition index.

use crate::classify::ClassifierPolicy;
use crate::config::ConfigError;
use crate::error::{LeakHuntError, Result};
use crate::sampler::{Metric, ResourceSampler};
use crate::scrubber::CacheScrubber;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use tracing::{debug, info, warn};

/// Verdict key recording a test that was deliberately not hunted
pub const UNCHECKED_KEY: &str = "(not checked)";

/// Which part of the hunt a repetition belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HuntPhase {
    Warmup,
    Tracked,
}

impl fmt::Display for HuntPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HuntPhase::Warmup => write!(f, "warm-up"),
            HuntPhase::Tracked => write!(f, "tracked"),
        }
    }
}

/// Why a hunt produced no verdict
#[derive(Debug)]
pub enum HuntError<E> {
    /// The probe itself failed; `source` is exactly what it returned
    Probe {
        phase: HuntPhase,
        repetition: usize,
        source: E,
    },
    /// The harness could not measure (bad repetition counts, unreadable counter)
    Harness(LeakHuntError),
}

impl<E: fmt::Display> fmt::Display for HuntError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HuntError::Probe {
                phase,
                repetition,
                source,
            } => write!(
                f,
                "probe failed on {} repetition {}: {}",
                phase, repetition, source
            ),
            HuntError::Harness(err) => write!(f, "leak hunt aborted: {}", err),
        }
    }
}

impl<E> std::error::Error for HuntError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HuntError::Probe { source, .. } => Some(source),
            HuntError::Harness(err) => Some(err),
        }
    }
}

impl<E> From<LeakHuntError> for HuntError<E> {
    fn from(err: LeakHuntError) -> Self {
        HuntError::Harness(err)
    }
}

/// Value recorded against one verdict key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerdictValue {
    /// Tracked-phase deltas of a leaking metric, unaltered
    Deltas(Vec<i64>),
    /// Reason a test was not checked
    Unchecked(String),
}

/// Leaking metrics and their tracked-phase deltas, in metric order.
///
/// Empty means no leak was detected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Verdict {
    entries: Vec<(String, VerdictValue)>,
}

impl Verdict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sentinel verdict for a test opted out with `fail = true`
    pub fn unchecked(reason: impl Into<String>) -> Self {
        Self {
            entries: vec![(
                UNCHECKED_KEY.to_string(),
                VerdictValue::Unchecked(reason.into()),
            )],
        }
    }

    pub fn insert(&mut self, metric: impl Into<String>, deltas: Vec<i64>) {
        let metric = metric.into();
        match self.entries.iter_mut().find(|(name, _)| *name == metric) {
            Some((_, value)) => *value = VerdictValue::Deltas(deltas),
            None => self.entries.push((metric, VerdictValue::Deltas(deltas))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_unchecked(&self) -> bool {
        self.get(UNCHECKED_KEY).is_some()
    }

    pub fn get(&self, metric: &str) -> Option<&VerdictValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == metric)
            .map(|(_, value)| value)
    }

    pub fn deltas(&self, metric: &str) -> Option<&[i64]> {
        match self.get(metric) {
            Some(VerdictValue::Deltas(deltas)) => Some(deltas),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &VerdictValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn metric_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match value {
                VerdictValue::Deltas(deltas) => write!(f, "{:?}: {:?}", name, deltas)?,
                VerdictValue::Unchecked(reason) => write!(f, "{:?}: {:?}", name, reason)?,
            }
        }
        write!(f, "}}")
    }
}

impl Serialize for Verdict {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Verdict {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct VerdictVisitor;

        impl<'de> Visitor<'de> for VerdictVisitor {
            type Value = Verdict;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of metric name to deltas")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Verdict, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) = access.next_entry::<String, VerdictValue>()? {
                    entries.push((name, value));
                }
                Ok(Verdict { entries })
            }
        }

        deserializer.deserialize_map(VerdictVisitor)
    }
}

/// Result of a completed hunt
#[derive(Debug)]
pub struct Hunt<T> {
    pub verdict: Verdict,
    /// What the probe returned on the final tracked repetition
    pub output: T,
}

/// Drives repetitions and classifies the resulting deltas
pub struct LeakHunter {
    sampler: ResourceSampler,
    scrubber: CacheScrubber,
    policy: ClassifierPolicy,
    metrics: Vec<Metric>,
}

impl LeakHunter {
    pub fn new(sampler: ResourceSampler, scrubber: CacheScrubber, policy: ClassifierPolicy) -> Self {
        let metrics = sampler.metrics();
        Self {
            sampler,
            scrubber,
            policy,
            metrics,
        }
    }

    /// Hunter over this host's default counters and caches
    pub fn detect(policy: ClassifierPolicy) -> Result<Self> {
        Ok(Self::new(
            ResourceSampler::detect()?,
            CacheScrubber::detect(),
            policy,
        ))
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn policy(&self) -> &ClassifierPolicy {
        &self.policy
    }

    pub fn scrubber(&self) -> &CacheScrubber {
        &self.scrubber
    }

    pub fn scrubber_mut(&mut self) -> &mut CacheScrubber {
        &mut self.scrubber
    }

    /// Run `probe` `stab` times to settle caches, then `run` tracked times.
    ///
    /// Every buffer the loop needs is allocated before the baseline sample.
    /// The probe's return value is held in one slot that each repetition
    /// overwrites before sampling, so a constant-size output nets to zero.
    pub fn hunt<T, E, F>(
        &mut self,
        mut probe: F,
        stab: usize,
        run: usize,
    ) -> std::result::Result<Hunt<T>, HuntError<E>>
    where
        F: FnMut() -> std::result::Result<T, E>,
    {
        if run == 0 {
            return Err(HuntError::Harness(LeakHuntError::Config(
                ConfigError::ValidationError("run must be at least 1 tracked repetition".to_string()),
            )));
        }

        let width = self.sampler.len();
        let mut deltas: Vec<Vec<i64>> = vec![vec![0; run]; width];
        let mut before = vec![0i64; width];
        let mut after = vec![0i64; width];
        let mut output: Option<T> = None;

        self.scrubber.prime();
        let state = self.scrubber.snapshot();

        info!(
            stab,
            run,
            caches = state.len(),
            "Beginning {} repetitions",
            stab + run
        );

        for repetition in 0..stab {
            let value = probe().map_err(|source| HuntError::Probe {
                phase: HuntPhase::Warmup,
                repetition,
                source,
            })?;
            output = Some(value);
            self.scrubber.restore(&state);
            debug!(repetition, "Warm-up repetition complete");
        }

        self.sampler.sample_into(&mut before)?;

        for repetition in 0..run {
            let value = probe().map_err(|source| HuntError::Probe {
                phase: HuntPhase::Tracked,
                repetition,
                source,
            })?;
            output = Some(value);
            self.scrubber.restore(&state);
            self.sampler.sample_into(&mut after)?;

            for (metric, series) in deltas.iter_mut().enumerate() {
                series[repetition] = after[metric] - before[metric];
            }
            std::mem::swap(&mut before, &mut after);
            debug!(repetition, "Tracked repetition complete");
        }

        let mut verdict = Verdict::new();
        for (metric, series) in self.metrics.iter().zip(deltas) {
            if self.policy.is_leak(metric.kind, &series) {
                warn!(
                    metric = %metric.name,
                    deltas = ?series,
                    sum = series.iter().sum::<i64>(),
                    "Leaked {}",
                    metric.kind.unit()
                );
                verdict.insert(metric.name.clone(), series);
            }
        }

        let output = output.ok_or_else(|| {
            HuntError::Harness(LeakHuntError::Other(
                "hunt finished without a tracked repetition".to_string(),
            ))
        })?;

        info!(leaking = verdict.len(), "Hunt complete");
        Ok(Hunt { verdict, output })
    }
}
