//! Test interception
//!
//! [`LeakChecker`] replaces the one-shot execution of a test with a leak
//! hunt over its full setup, call, teardown sequence. Per test:
//!
//! * a `no_leak_check` marker bypasses the hunt; with `fail` set the test
//!   still runs once and gets a `(not checked)` verdict
//! * otherwise the hunt runs with the suite's `(stab, run)` or the test's
//!   override
//! * a failure on any repetition aborts the hunt, and that repetition's
//!   reports are returned as if the test had run once
//! * a completed hunt returns the last tracked repetition's reports, with a
//!   non-empty verdict attached to the call report

pub mod item;
pub mod marker;

pub use item::{execute, Execution, PhaseError, PhaseRecord, PhaseResult, TestItem};
pub use marker::{LeakMarker, MarkerRegistry};

use crate::config::LeakConfig;
use crate::error::Result;
use crate::hunter::{Hunt, HuntError, LeakHunter, Verdict};
use crate::report::{append_reflog, reflog_lines, Outcome, TestReport, TestStatus, When};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Process-wide leak checking state for one run
pub struct LeakChecker {
    config: LeakConfig,
    hunter: LeakHunter,
    markers: MarkerRegistry,
    /// Verdicts awaiting their test's call report
    pending: HashMap<String, Verdict>,
    session_id: Uuid,
}

impl LeakChecker {
    /// Enable leak checking for this run.
    ///
    /// Fails when the configuration is invalid or the counting allocator is
    /// not installed; leak checking never runs with a reduced metric set.
    pub fn activate(config: LeakConfig) -> Result<Self> {
        config.validate()?;
        let hunter = LeakHunter::detect(config.policy.clone())?;
        info!(
            stab = config.stab,
            run = config.run,
            metrics = ?hunter.metrics().iter().map(|m| m.name.as_str()).collect::<Vec<_>>(),
            "Leak checking enabled"
        );
        Ok(Self::with_hunter(config, hunter))
    }

    /// Checker over an explicitly built hunter
    pub fn with_hunter(config: LeakConfig, hunter: LeakHunter) -> Self {
        Self {
            config,
            hunter,
            markers: MarkerRegistry::new(),
            pending: HashMap::new(),
            session_id: Uuid::new_v4(),
        }
    }

    pub fn config(&self) -> &LeakConfig {
        &self.config
    }

    pub fn hunter(&self) -> &LeakHunter {
        &self.hunter
    }

    pub fn hunter_mut(&mut self) -> &mut LeakHunter {
        &mut self.hunter
    }

    pub fn markers(&self) -> &MarkerRegistry {
        &self.markers
    }

    pub fn markers_mut(&mut self) -> &mut MarkerRegistry {
        &mut self.markers
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Verdict recorded for `node_id` and not yet attached to a report
    pub fn pending(&self, node_id: &str) -> Option<&Verdict> {
        self.pending.get(node_id)
    }

    /// Run one test under leak checking and return its phase reports
    pub fn run_protocol<I: TestItem + ?Sized>(&mut self, item: &mut I) -> Vec<TestReport> {
        let node_id = item.node_id().to_string();

        if let Some(marker) = self.markers.resolve(&node_id).cloned() {
            debug!(test = %node_id, fail = marker.fail, "Leak check bypassed by marker");
            if marker.fail {
                self.pending
                    .insert(node_id.clone(), Verdict::unchecked(marker.reason()));
            }
            let execution = match execute(item) {
                Ok(execution) | Err(execution) => execution,
            };
            return self.finish(&node_id, execution);
        }

        let (stab, run) = self
            .markers
            .repetitions(&node_id)
            .unwrap_or((self.config.stab, self.config.run));
        debug!(test = %node_id, stab, run, "Hunting leaks");

        match self.hunter.hunt(|| execute(item), stab, run) {
            Ok(Hunt { verdict, output }) => {
                if !verdict.is_empty() {
                    if let Some(path) = &self.config.reflog {
                        let lines = reflog_lines(&node_id, &verdict, |metric| self.unit_of(metric));
                        append_reflog(path, &lines);
                    }
                    self.pending.insert(node_id.clone(), verdict);
                }
                self.finish(&node_id, output)
            }
            Err(HuntError::Probe {
                phase,
                repetition,
                source,
            }) => {
                info!(
                    test = %node_id,
                    %phase,
                    repetition,
                    failed = ?source.failing_phase(),
                    "Test did not pass during leak hunt"
                );
                self.finish(&node_id, source)
            }
            Err(HuntError::Harness(err)) => {
                error!(test = %node_id, error = %err, "Leak hunt aborted");
                self.pending.remove(&node_id);
                vec![TestReport::new(
                    node_id.as_str(),
                    When::Call,
                    Outcome::Failed,
                    Duration::ZERO,
                    self.session_id,
                )
                .with_longrepr(format!("leak hunt aborted: {}", err))]
            }
        }
    }

    /// Status category of a report, `LEAKED` for a passed call with leaks
    pub fn status(&self, report: &TestReport) -> TestStatus {
        TestStatus::of(report)
    }

    fn unit_of(&self, metric: &str) -> String {
        self.hunter
            .metrics()
            .iter()
            .find(|m| m.name == metric)
            .map(|m| m.kind.unit().to_string())
            .unwrap_or_else(|| metric.to_string())
    }

    /// Build the reports and consume this test's pending verdict
    fn finish(&mut self, node_id: &str, execution: Execution) -> Vec<TestReport> {
        let mut reports = execution.into_reports(node_id, self.session_id);
        let Some(verdict) = self.pending.remove(node_id) else {
            return reports;
        };
        match reports.iter_mut().find(|r| r.when == When::Call) {
            Some(call) => {
                if let Err(err) = call.attach_verdict(&verdict) {
                    warn!(test = %node_id, error = %err, "Could not attach leaks section");
                }
            }
            None => debug!(test = %node_id, "No call report, verdict dropped"),
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ClassifierPolicy, MetricKind};
    use crate::report::Category;
    use crate::sampler::{GaugeCounter, ResourceSampler};
    use crate::scrubber::CacheScrubber;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Test whose call grows `level` by `step` and optionally fails on a given call
    struct Faucet {
        id: &'static str,
        level: Rc<Cell<i64>>,
        step: i64,
        calls: usize,
        fail_on: Option<usize>,
    }

    impl Faucet {
        fn new(id: &'static str, level: Rc<Cell<i64>>, step: i64) -> Self {
            Self {
                id,
                level,
                step,
                calls: 0,
                fail_on: None,
            }
        }
    }

    impl TestItem for Faucet {
        fn node_id(&self) -> &str {
            self.id
        }

        fn call(&mut self) -> PhaseResult {
            self.calls += 1;
            if self.fail_on == Some(self.calls) {
                return Err(PhaseError::Failed("assert False".to_string()));
            }
            self.level.set(self.level.get() + self.step);
            Ok(())
        }
    }

    fn checker(level: Rc<Cell<i64>>, stab: usize, run: usize) -> LeakChecker {
        let sampler = ResourceSampler::new(vec![Box::new(GaugeCounter::new(
            "refs",
            MetricKind::References,
            move || level.get(),
        ))]);
        let hunter = LeakHunter::new(sampler, CacheScrubber::new(), ClassifierPolicy::default());
        let config = LeakConfig {
            stab,
            run,
            ..LeakConfig::default()
        };
        LeakChecker::with_hunter(config, hunter)
    }

    #[test]
    fn test_leaking_test_is_reported_leaked() {
        let level = Rc::new(Cell::new(0));
        let mut checker = checker(level.clone(), 1, 3);
        let mut item = Faucet::new("test_leaky", level, 1);

        let reports = checker.run_protocol(&mut item);
        assert_eq!(item.calls, 4);
        assert_eq!(reports.len(), 3);

        let call = reports.iter().find(|r| r.when == When::Call).unwrap();
        assert_eq!(checker.status(call).category, Category::Leaked);
        assert_eq!(call.leaks().unwrap().unwrap().to_string(), "{\"refs\": [1, 1, 1]}");
        assert!(checker.pending("test_leaky").is_none());
    }

    #[test]
    fn test_clean_test_passes() {
        let level = Rc::new(Cell::new(0));
        let mut checker = checker(level.clone(), 1, 3);
        let mut item = Faucet::new("test_mended", level, 0);

        let reports = checker.run_protocol(&mut item);
        assert!(reports.iter().all(|r| r.sections.is_empty()));
        let call = reports.iter().find(|r| r.when == When::Call).unwrap();
        assert_eq!(checker.status(call), TestStatus::PASSED);
    }

    #[test]
    fn test_failure_surfaces_with_phase() {
        let level = Rc::new(Cell::new(0));
        let mut checker = checker(level.clone(), 2, 2);
        let mut item = Faucet::new("test_broken", level, 1);
        item.fail_on = Some(3);

        let reports = checker.run_protocol(&mut item);
        assert_eq!(item.calls, 3);

        let call = reports.iter().find(|r| r.when == When::Call).unwrap();
        assert_eq!(call.outcome, Outcome::Failed);
        assert_eq!(call.longrepr.as_deref(), Some("assert False"));
        assert!(call.section(crate::report::LEAKS_SECTION).is_none());
        let teardown = reports.iter().find(|r| r.when == When::Teardown).unwrap();
        assert_eq!(teardown.outcome, Outcome::Passed);
    }

    #[test]
    fn test_fail_marker_records_sentinel_without_hunting() {
        let level = Rc::new(Cell::new(0));
        let mut checker = checker(level.clone(), 5, 4);
        checker
            .markers_mut()
            .mark("test_flaky", LeakMarker::fail("flaky"));
        let mut item = Faucet::new("test_flaky", level, 1);

        let reports = checker.run_protocol(&mut item);
        assert_eq!(item.calls, 1);
        assert_eq!(checker.hunter().scrubber().restore_count(), 0);

        let call = reports.iter().find(|r| r.when == When::Call).unwrap();
        assert_eq!(
            call.section(crate::report::LEAKS_SECTION),
            Some("{\"(not checked)\":\"flaky\"}")
        );
    }

    #[test]
    fn test_skip_marker_runs_once_silently() {
        let level = Rc::new(Cell::new(0));
        let mut checker = checker(level.clone(), 5, 4);
        checker.markers_mut().mark("test_quiet", LeakMarker::skip());
        let mut item = Faucet::new("test_quiet", level, 1);

        let reports = checker.run_protocol(&mut item);
        assert_eq!(item.calls, 1);
        assert!(reports.iter().all(|r| r.sections.is_empty()));
    }

    #[test]
    fn test_repetition_override() {
        let level = Rc::new(Cell::new(0));
        let mut checker = checker(level.clone(), 5, 4);
        checker
            .markers_mut()
            .set_repetitions("test_slow", 0, 1)
            .unwrap();
        let mut item = Faucet::new("test_slow", level, 0);

        checker.run_protocol(&mut item);
        assert_eq!(item.calls, 1);
    }

    #[test]
    fn test_zero_run_override_never_reaches_the_hunt() {
        let level = Rc::new(Cell::new(0));
        let mut checker = checker(level.clone(), 1, 1);
        assert!(checker
            .markers_mut()
            .set_repetitions("test_zero", 1, 0)
            .is_err());
        let mut item = Faucet::new("test_zero", level, 0);

        let reports = checker.run_protocol(&mut item);
        assert!(reports.iter().all(|r| r.outcome == Outcome::Passed));
        assert_eq!(item.calls, 2);
    }
}
