//! One logical test and a single end-to-end execution of it

use crate::report::{Outcome, TestReport, When};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Why a phase did not pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseError {
    Failed(String),
    Skipped(String),
}

pub type PhaseResult = std::result::Result<(), PhaseError>;

/// A test the host knows how to set up, call and tear down
pub trait TestItem {
    fn node_id(&self) -> &str;

    fn setup(&mut self) -> PhaseResult {
        Ok(())
    }

    fn call(&mut self) -> PhaseResult;

    fn teardown(&mut self) -> PhaseResult {
        Ok(())
    }

    /// Restore one-shot state consumed by a previous execution, so the next
    /// execution starts exactly like the first one did.
    fn reset(&mut self) {}
}

/// Outcome of one phase of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseRecord {
    pub when: When,
    pub outcome: Outcome,
    pub longrepr: Option<String>,
    pub duration: Duration,
}

/// Per-phase records of a single setup, call, teardown sequence.
///
/// Fixed-size so a passing execution allocates nothing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Execution {
    phases: [Option<PhaseRecord>; 3],
}

impl Execution {
    pub fn phase(&self, when: When) -> Option<&PhaseRecord> {
        self.phases[when.index()].as_ref()
    }

    fn record(&mut self, record: PhaseRecord) {
        let slot = record.when.index();
        self.phases[slot] = Some(record);
    }

    /// True when every executed phase passed
    pub fn passed(&self) -> bool {
        self.phases
            .iter()
            .flatten()
            .all(|p| p.outcome == Outcome::Passed)
    }

    /// First phase that did not pass
    pub fn failing_phase(&self) -> Option<When> {
        self.phases
            .iter()
            .flatten()
            .find(|p| p.outcome != Outcome::Passed)
            .map(|p| p.when)
    }

    /// Reports in phase order, as the host would have produced them
    pub fn into_reports(self, node_id: &str, session_id: Uuid) -> Vec<TestReport> {
        self.phases
            .into_iter()
            .flatten()
            .map(|p| {
                let report = TestReport::new(node_id, p.when, p.outcome, p.duration, session_id);
                match p.longrepr {
                    Some(longrepr) => report.with_longrepr(longrepr),
                    None => report,
                }
            })
            .collect()
    }
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phases.iter().flatten().find(|p| p.outcome != Outcome::Passed) {
            Some(p) => write!(
                f,
                "{} {:?}: {}",
                p.when,
                p.outcome,
                p.longrepr.as_deref().unwrap_or("")
            ),
            None => write!(f, "passed"),
        }
    }
}

impl std::error::Error for Execution {}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked".to_string()
    }
}

fn run_phase(when: When, phase: impl FnOnce() -> PhaseResult) -> PhaseRecord {
    let start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(phase));
    let duration = start.elapsed();
    let (outcome, longrepr) = match result {
        Ok(Ok(())) => (Outcome::Passed, None),
        Ok(Err(PhaseError::Failed(message))) => (Outcome::Failed, Some(message)),
        Ok(Err(PhaseError::Skipped(reason))) => (Outcome::Skipped, Some(reason)),
        Err(payload) => (Outcome::Failed, Some(panic_message(payload))),
    };
    PhaseRecord {
        when,
        outcome,
        longrepr,
        duration,
    }
}

/// Run setup, call and teardown once, the way the host normally would.
///
/// Call only runs after a passing setup; teardown always runs. Panics are
/// caught per phase. `Err` carries the full execution when any phase did
/// not pass.
pub fn execute<I: TestItem + ?Sized>(item: &mut I) -> std::result::Result<Execution, Execution> {
    item.reset();
    let mut execution = Execution::default();

    let setup = run_phase(When::Setup, || item.setup());
    let setup_passed = setup.outcome == Outcome::Passed;
    execution.record(setup);

    if setup_passed {
        execution.record(run_phase(When::Call, || item.call()));
    }
    execution.record(run_phase(When::Teardown, || item.teardown()));

    if execution.passed() {
        Ok(execution)
    } else {
        Err(execution)
    }
}
