//! Common test utilities and helpers

#![allow(dead_code)]

use leakhunt_core::{
    CacheScrubber, ClassifierPolicy, GaugeCounter, LeakChecker, LeakConfig, LeakHunter,
    MetricKind, PhaseError, PhaseResult, ResourceSampler, TestItem,
};
use std::cell::Cell;
use std::rc::Rc;

/// Hunter whose only metric is a `refs` gauge over `level`
pub fn gauge_hunter(level: Rc<Cell<i64>>) -> LeakHunter {
    let sampler = ResourceSampler::new(vec![Box::new(GaugeCounter::new(
        "refs",
        MetricKind::References,
        move || level.get(),
    ))]);
    LeakHunter::new(sampler, CacheScrubber::new(), ClassifierPolicy::default())
}

/// Checker over [`gauge_hunter`] with the given repetition counts
pub fn gauge_checker(level: Rc<Cell<i64>>, stab: usize, run: usize) -> LeakChecker {
    let config = LeakConfig {
        stab,
        run,
        ..LeakConfig::default()
    };
    LeakChecker::with_hunter(config, gauge_hunter(level))
}

/// Which phase a [`ScriptedTest`] should fail in, and on which execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailIn {
    Setup(usize),
    Call(usize),
    Teardown(usize),
}

/// Test double that counts phase invocations and grows a shared gauge
pub struct ScriptedTest {
    pub node_id: String,
    pub level: Rc<Cell<i64>>,
    pub growth: i64,
    pub fail: Option<FailIn>,
    pub executions: usize,
    pub calls: usize,
    pub teardowns: usize,
}

impl ScriptedTest {
    pub fn new(node_id: &str, level: Rc<Cell<i64>>, growth: i64) -> Self {
        Self {
            node_id: node_id.to_string(),
            level,
            growth,
            fail: None,
            executions: 0,
            calls: 0,
            teardowns: 0,
        }
    }

    pub fn failing(mut self, fail: FailIn) -> Self {
        self.fail = Some(fail);
        self
    }

    fn check(&self, phase: FailIn) -> PhaseResult {
        if self.fail == Some(phase) {
            Err(PhaseError::Failed(format!("scripted failure in {:?}", phase)))
        } else {
            Ok(())
        }
    }
}

impl TestItem for ScriptedTest {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn setup(&mut self) -> PhaseResult {
        self.check(FailIn::Setup(self.executions))
    }

    fn call(&mut self) -> PhaseResult {
        self.calls += 1;
        self.check(FailIn::Call(self.executions))?;
        self.level.set(self.level.get() + self.growth);
        Ok(())
    }

    fn teardown(&mut self) -> PhaseResult {
        self.teardowns += 1;
        self.check(FailIn::Teardown(self.executions))
    }

    fn reset(&mut self) {
        self.executions += 1;
    }
}
