//! Leakhunt - Repeated-Execution Resource Leak Hunter
//!
//! Finds slow leaks that only show up after many repetitions of the same
//! test: one retained allocation per call, one descriptor never closed.
//! A single run hides them; a small, consistent delta over repetitions
//! does not.
//!
//! # Architecture
//!
//! The system is organized into several layers:
//! - **Diagnostics**: counting global allocator (the host introspection facility)
//! - **Sampler**: reads every resource counter as an ordered vector
//! - **Scrubber**: captures and resets process-wide caches between repetitions
//! - **Hunter**: warm-up and tracked repetitions, per-metric classification
//! - **Interceptor**: runs one test under the hunter and reports it
//! - **Report / Runner**: phase reports, LEAKED status, terminal summary
//!
//! # Example
//!
//! ```ignore
//! use leakhunt_core::{CountingAllocator, LeakChecker, LeakConfig, Session, TestCase};
//!
//! #[global_allocator]
//! static GLOBAL: CountingAllocator = CountingAllocator;
//!
//! fn main() -> leakhunt_core::Result<()> {
//!     let mut config = LeakConfig::load(None)?;
//!     config.apply_token("5:4")?;
//!     let mut checker = LeakChecker::activate(config)?;
//!
//!     let mut session = Session::new().with_test(TestCase::new("test_noop", || Ok(())));
//!     let reports = session.run(Some(&mut checker));
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod config;
pub mod demo;
pub mod diagnostics;
pub mod error;
pub mod hunter;
pub mod interceptor;
pub mod patterns;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod scrubber;
pub mod warnings;

// Re-export commonly used types
pub use classify::{ClassifierPolicy, MetricKind};
pub use config::{ConfigError, LeakConfig, LeaksToken};
pub use diagnostics::{global_allocation_tracker, AllocationSnapshot, CountingAllocator};
pub use error::{LeakHuntError, Result};
pub use hunter::{Hunt, HuntError, HuntPhase, LeakHunter, Verdict, VerdictValue, UNCHECKED_KEY};
pub use interceptor::{LeakChecker, LeakMarker, MarkerRegistry, PhaseError, PhaseResult, TestItem};
pub use report::{Category, Outcome, Summary, TestReport, TestStatus, When};
pub use runner::{Session, TestCase};
pub use sampler::{Counter, GaugeCounter, ResourceSampler, ResourceVector};
pub use scrubber::{CacheScrubber, GlobalCache, MapCache, PurgeCache};

#[cfg(test)]
#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;
