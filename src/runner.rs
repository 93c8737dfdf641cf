//! Minimal test session: collect, select, run, report

use crate::config::{validate_run, ConfigError};
use crate::error::Result;
use crate::interceptor::{execute, LeakChecker, LeakMarker, PhaseResult, TestItem};
use crate::patterns;
use crate::report::TestReport;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Phase = Box<dyn FnMut() -> PhaseResult>;

/// A test assembled from closures
pub struct TestCase {
    node_id: String,
    setup: Option<Phase>,
    call: Phase,
    teardown: Option<Phase>,
    reset: Option<Box<dyn FnMut()>>,
    marker: Option<LeakMarker>,
    repetitions: Option<(usize, usize)>,
}

impl TestCase {
    pub fn new(node_id: impl Into<String>, call: impl FnMut() -> PhaseResult + 'static) -> Self {
        Self {
            node_id: node_id.into(),
            setup: None,
            call: Box::new(call),
            teardown: None,
            reset: None,
            marker: None,
            repetitions: None,
        }
    }

    pub fn with_setup(mut self, setup: impl FnMut() -> PhaseResult + 'static) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn with_teardown(mut self, teardown: impl FnMut() -> PhaseResult + 'static) -> Self {
        self.teardown = Some(Box::new(teardown));
        self
    }

    /// Hook run before every execution to restore consumed fixtures
    pub fn with_reset(mut self, reset: impl FnMut() + 'static) -> Self {
        self.reset = Some(Box::new(reset));
        self
    }

    pub fn with_marker(mut self, marker: LeakMarker) -> Self {
        self.marker = Some(marker);
        self
    }

    /// Hunt this test with its own `(stab, run)`; `run` must be at least 1
    pub fn with_repetitions(
        mut self,
        stab: usize,
        run: usize,
    ) -> std::result::Result<Self, ConfigError> {
        validate_run(run)?;
        self.repetitions = Some((stab, run));
        Ok(self)
    }

    pub fn marker(&self) -> Option<&LeakMarker> {
        self.marker.as_ref()
    }
}

impl TestItem for TestCase {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn setup(&mut self) -> PhaseResult {
        match self.setup.as_mut() {
            Some(setup) => setup(),
            None => Ok(()),
        }
    }

    fn call(&mut self) -> PhaseResult {
        (self.call)()
    }

    fn teardown(&mut self) -> PhaseResult {
        match self.teardown.as_mut() {
            Some(teardown) => teardown(),
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        if let Some(reset) = self.reset.as_mut() {
            reset();
        }
    }
}

/// An ordered collection of tests run in one process
pub struct Session {
    tests: Vec<TestCase>,
    session_id: Uuid,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            tests: Vec::new(),
            session_id: Uuid::new_v4(),
        }
    }

    pub fn add(&mut self, test: TestCase) {
        self.tests.push(test);
    }

    pub fn with_test(mut self, test: TestCase) -> Self {
        self.add(test);
        self
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn node_ids(&self) -> Vec<&str> {
        self.tests.iter().map(|t| t.node_id.as_str()).collect()
    }

    /// Keep only tests whose node id matches `pattern`; returns how many were deselected
    pub fn select(&mut self, pattern: &str) -> Result<usize> {
        let regex = patterns::compile(pattern)?;
        let before = self.tests.len();
        self.tests.retain(|t| regex.is_match(&t.node_id));
        let deselected = before - self.tests.len();
        debug!(pattern, deselected, "Selected tests");
        Ok(deselected)
    }

    /// Run every test once, or under `checker` when leak checking is enabled
    pub fn run(&mut self, mut checker: Option<&mut LeakChecker>) -> Vec<TestReport> {
        info!(
            tests = self.tests.len(),
            leak_checking = checker.is_some(),
            "Session starts"
        );
        let mut reports = Vec::new();
        for test in self.tests.iter_mut() {
            match checker.as_deref_mut() {
                Some(checker) => {
                    if let Some(marker) = test.marker.clone() {
                        checker.markers_mut().mark(test.node_id.clone(), marker);
                    }
                    if let Some((stab, run)) = test.repetitions {
                        if let Err(err) = checker.markers_mut().set_repetitions(
                            test.node_id.clone(),
                            stab,
                            run,
                        ) {
                            warn!(test = %test.node_id, error = %err, "Ignoring repetition override");
                        }
                    }
                    reports.extend(checker.run_protocol(test));
                }
                None => {
                    let execution = match execute(test) {
                        Ok(execution) | Err(execution) => execution,
                    };
                    reports.extend(execution.into_reports(&test.node_id, self.session_id));
                }
            }
        }
        reports
    }
}
