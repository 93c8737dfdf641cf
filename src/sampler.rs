//! Resource sampling
//!
//! A [`ResourceSampler`] reads an ordered set of process-wide counters into a
//! [`ResourceVector`]. The metric order is fixed when the sampler is built and
//! never changes for the lifetime of a hunt.
//!
//! Built-in counters:
//! - `refs`: allocations alive according to the counting allocator (required)
//! - `blocks`: heap those allocations occupy, in 16-byte blocks (same source)
//! - `fds`: open file descriptors, when the host exposes them
//!
//! Hosts can add their own counters (connection pools, handle tables) with
//! [`GaugeCounter`].

use crate::classify::MetricKind;
use crate::config::ConfigError;
use crate::diagnostics::memory::{self, AllocationTracker};
use crate::error::{LeakHuntError, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Name of the retained-reference metric
pub const REFS: &str = "refs";

/// Name of the allocated-block metric
pub const BLOCKS: &str = "blocks";

/// Name of the open-descriptor metric
pub const FDS: &str = "fds";

/// A named process-wide integer counter
pub trait Counter {
    /// Metric name used in vectors and verdicts
    fn name(&self) -> &str;

    /// Classifier applied to this metric's deltas
    fn kind(&self) -> MetricKind;

    /// Read the current value.
    ///
    /// Implementations must release any temporaries before returning so that
    /// reading one counter never shows up in another.
    fn read(&self) -> Result<i64>;
}

/// Live allocations from the counting allocator
#[derive(Debug, Default)]
pub struct LiveAllocations {
    tracker: AllocationTracker,
}

impl LiveAllocations {
    /// Returns a configuration error when the counting allocator is not installed
    pub fn detect() -> std::result::Result<Self, ConfigError> {
        if !memory::is_installed() {
            return Err(ConfigError::MissingCapability(
                "tracking retained references requires CountingAllocator as the #[global_allocator]"
                    .to_string(),
            ));
        }
        Ok(Self::default())
    }
}

impl Counter for LiveAllocations {
    fn name(&self) -> &str {
        REFS
    }

    fn kind(&self) -> MetricKind {
        MetricKind::References
    }

    fn read(&self) -> Result<i64> {
        Ok(self.tracker.live_allocations())
    }
}

/// Heap occupied by live allocations, in [`memory::BLOCK_SIZE`] blocks
#[derive(Debug, Default)]
pub struct LiveBlocks {
    tracker: AllocationTracker,
}

impl LiveBlocks {
    pub fn detect() -> Option<Self> {
        memory::is_installed().then(Self::default)
    }
}

impl Counter for LiveBlocks {
    fn name(&self) -> &str {
        BLOCKS
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Blocks
    }

    fn read(&self) -> Result<i64> {
        Ok(self.tracker.live_blocks())
    }
}

/// Open file descriptors, counted by listing the per-process fd directory
#[derive(Debug)]
pub struct OpenDescriptors {
    dir: PathBuf,
}

impl OpenDescriptors {
    const CANDIDATES: [&'static str; 2] = ["/proc/self/fd", "/dev/fd"];

    pub fn detect() -> Option<Self> {
        Self::CANDIDATES
            .iter()
            .map(Path::new)
            .find(|dir| std::fs::read_dir(dir).is_ok())
            .map(|dir| Self {
                dir: dir.to_path_buf(),
            })
    }
}

impl Counter for OpenDescriptors {
    fn name(&self) -> &str {
        FDS
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Descriptors
    }

    fn read(&self) -> Result<i64> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| LeakHuntError::CounterUnavailable {
                metric: FDS.to_string(),
                reason: format!("{}: {}", self.dir.display(), e),
            })?
            .count() as i64;
        // read_dir itself holds one descriptor open on the directory
        Ok(entries - 1)
    }
}

/// Host-defined counter backed by a closure
pub struct GaugeCounter {
    name: String,
    kind: MetricKind,
    gauge: Box<dyn Fn() -> i64>,
}

impl GaugeCounter {
    pub fn new(name: impl Into<String>, kind: MetricKind, gauge: impl Fn() -> i64 + 'static) -> Self {
        Self {
            name: name.into(),
            kind,
            gauge: Box::new(gauge),
        }
    }
}

impl Counter for GaugeCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MetricKind {
        self.kind
    }

    fn read(&self) -> Result<i64> {
        Ok((self.gauge)())
    }
}

/// Identity of one tracked metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
}

/// Ordered mapping from metric name to counter value
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceVector {
    entries: Vec<(String, i64)>,
}

impl ResourceVector {
    pub fn get(&self, name: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-metric `self - earlier`, in this vector's order
    pub fn delta(&self, earlier: &ResourceVector) -> Vec<(String, i64)> {
        self.entries
            .iter()
            .map(|(name, value)| {
                let before = earlier.get(name).unwrap_or(0);
                (name.clone(), value - before)
            })
            .collect()
    }
}

/// Reads every tracked counter after forcing deferred releases
pub struct ResourceSampler {
    counters: Vec<Box<dyn Counter>>,
    collectors: Vec<Box<dyn FnMut()>>,
}

impl ResourceSampler {
    /// Sampler over exactly `counters`, with no collectors
    pub fn new(counters: Vec<Box<dyn Counter>>) -> Self {
        Self {
            counters,
            collectors: Vec::new(),
        }
    }

    /// Build the default sampler for this host.
    ///
    /// `refs` is required and its absence is a configuration error; `blocks`
    /// and `fds` are included when the host exposes them.
    pub fn detect() -> Result<Self> {
        let mut counters: Vec<Box<dyn Counter>> = vec![Box::new(LiveAllocations::detect()?)];

        match LiveBlocks::detect() {
            Some(blocks) => counters.push(Box::new(blocks)),
            None => debug!("Block counter unavailable; skipping '{}'", BLOCKS),
        }
        match OpenDescriptors::detect() {
            Some(fds) => counters.push(Box::new(fds)),
            None => debug!("Descriptor directory not exposed by host; skipping '{}'", FDS),
        }

        let sampler = Self::new(counters).with_collector(flush_standard_streams);
        info!(metrics = ?sampler.metric_names(), "Resource sampler ready");
        Ok(sampler)
    }

    /// Append a host-defined counter after the built-in ones
    pub fn with_counter(mut self, counter: impl Counter + 'static) -> Self {
        self.counters.push(Box::new(counter));
        self
    }

    /// Add a hook run before every read to flush deferred releases
    pub fn with_collector(mut self, collector: impl FnMut() + 'static) -> Self {
        self.collectors.push(Box::new(collector));
        self
    }

    pub fn metrics(&self) -> Vec<Metric> {
        self.counters
            .iter()
            .map(|c| Metric {
                name: c.name().to_string(),
                kind: c.kind(),
            })
            .collect()
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.counters.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Run every collector once
    pub fn collect(&mut self) {
        for collector in self.collectors.iter_mut() {
            collector();
        }
    }

    /// Collect, then read every counter into `out` without allocating.
    ///
    /// `out` must hold exactly one slot per metric.
    pub fn sample_into(&mut self, out: &mut [i64]) -> Result<()> {
        if out.len() != self.counters.len() {
            return Err(LeakHuntError::Other(format!(
                "sample buffer holds {} slots for {} metrics",
                out.len(),
                self.counters.len()
            )));
        }
        self.collect();
        for (slot, counter) in out.iter_mut().zip(self.counters.iter()) {
            *slot = counter.read()?;
        }
        Ok(())
    }

    /// Collect, then read every counter into a fresh vector
    pub fn sample(&mut self) -> Result<ResourceVector> {
        let mut values = vec![0; self.counters.len()];
        self.sample_into(&mut values)?;
        let entries = self
            .counters
            .iter()
            .zip(values)
            .map(|(c, v)| (c.name().to_string(), v))
            .collect();
        Ok(ResourceVector { entries })
    }
}

/// Flush stdout and stderr so buffered output is handed to the OS
pub fn flush_standard_streams() {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn gauge(name: &str, kind: MetricKind, value: Rc<Cell<i64>>) -> GaugeCounter {
        GaugeCounter::new(name, kind, move || value.get())
    }

    #[test]
    fn test_detect_includes_refs_first() {
        // lib tests run with CountingAllocator installed
        let sampler = ResourceSampler::detect().unwrap();
        let names = sampler.metric_names();
        assert_eq!(names[0], REFS);
        assert_eq!(sampler.metrics()[0].kind, MetricKind::References);
    }

    #[test]
    fn test_metric_order_is_stable() {
        let a = Rc::new(Cell::new(1));
        let b = Rc::new(Cell::new(2));
        let mut sampler = ResourceSampler::new(vec![
            Box::new(gauge("b", MetricKind::Blocks, b.clone())),
            Box::new(gauge("a", MetricKind::References, a.clone())),
        ]);

        let first = sampler.sample().unwrap();
        a.set(10);
        let second = sampler.sample().unwrap();

        let order: Vec<&str> = second.iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(first.get("a"), Some(1));
        assert_eq!(second.delta(&first), vec![("b".to_string(), 0), ("a".to_string(), 9)]);
    }

    #[test]
    fn test_collectors_run_before_read() {
        let value = Rc::new(Cell::new(0));
        let collected = Rc::new(Cell::new(0));
        let observed = collected.clone();
        let setter = value.clone();
        let mut sampler =
            ResourceSampler::new(vec![Box::new(gauge("g", MetricKind::Descriptors, value))])
                .with_collector(move || {
                    observed.set(observed.get() + 1);
                    setter.set(42);
                });

        let vector = sampler.sample().unwrap();
        assert_eq!(collected.get(), 1);
        assert_eq!(vector.get("g"), Some(42));
    }

    #[test]
    fn test_sample_into_rejects_wrong_buffer() {
        let mut sampler = ResourceSampler::new(vec![Box::new(GaugeCounter::new(
            "g",
            MetricKind::Blocks,
            || 0,
        ))]);
        let mut buffer = [0i64; 2];
        assert!(sampler.sample_into(&mut buffer).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_exposes_all_builtin_counters() {
        let sampler = ResourceSampler::detect().unwrap();
        assert_eq!(sampler.metric_names(), vec![REFS, BLOCKS, FDS]);
    }

    #[test]
    fn test_blocks_follow_the_allocator() {
        let sampler = ResourceSampler::detect().unwrap();
        assert_eq!(sampler.metric_names()[1], BLOCKS);
        assert_eq!(sampler.metrics()[1].kind, MetricKind::Blocks);
        assert!(LiveBlocks::detect().unwrap().read().unwrap() > 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_descriptor_count_is_positive() {
        let fds = OpenDescriptors::detect().unwrap();
        // stdin/stdout/stderr at minimum
        assert!(fds.read().unwrap() >= 3);
    }
}
