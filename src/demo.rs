//! Built-in faucet suite
//!
//! A handful of tests with known behaviour under leak checking, used by the
//! `demo` subcommand and by the integration tests.

use crate::interceptor::{LeakMarker, PhaseError};
use crate::patterns;
use crate::runner::{Session, TestCase};
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::fs::File;
use std::rc::Rc;
use std::sync::Mutex;

const DRIP_CAPACITY: usize = 4096;

/// Retained by the leaky faucet, one per call
static DRIPS: Lazy<Mutex<Vec<Box<u64>>>> =
    Lazy::new(|| Mutex::new(Vec::with_capacity(DRIP_CAPACITY)));

/// Handles kept open by the dripping tap
static OPEN_TAPS: Lazy<Mutex<Vec<File>>> =
    Lazy::new(|| Mutex::new(Vec::with_capacity(DRIP_CAPACITY)));

#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";
#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";

pub const LEAKY: &str = "faucet::test_leaky";
pub const DRIPPING_TAP: &str = "faucet::test_dripping_tap";
pub const BROKEN: &str = "faucet::test_broken";
pub const MENDED: &str = "faucet::test_mended";
pub const FILTERED: &str = "faucet::test_filtered";
pub const UNCHECKED: &str = "faucet::test_unchecked";

/// Number of boxes the leaky faucet has retained so far
pub fn drips() -> usize {
    DRIPS.lock().map(|d| d.len()).unwrap_or(0)
}

fn leaky() -> TestCase {
    TestCase::new(LEAKY, || {
        let mut drips = DRIPS.lock().unwrap_or_else(|p| p.into_inner());
        let next = drips.len() as u64;
        drips.push(Box::new(next));
        Ok(())
    })
}

fn dripping_tap() -> TestCase {
    TestCase::new(DRIPPING_TAP, || {
        let tap = File::open(NULL_DEVICE)
            .map_err(|e| PhaseError::Skipped(format!("no {}: {}", NULL_DEVICE, e)))?;
        OPEN_TAPS
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tap);
        Ok(())
    })
}

fn broken() -> TestCase {
    TestCase::new(BROKEN, || {
        Err(PhaseError::Failed(
            "faucet is broken: expected no drips".to_string(),
        ))
    })
}

/// Consumes a washer fixture each call; `reset` fits a new one
fn mended() -> TestCase {
    let washer: Rc<RefCell<Option<Vec<u8>>>> = Rc::new(RefCell::new(None));
    let fitted = washer.clone();
    let setup_check = washer.clone();

    TestCase::new(MENDED, move || {
        let washer = washer
            .borrow_mut()
            .take()
            .ok_or_else(|| PhaseError::Failed("washer already consumed".to_string()))?;
        if washer.iter().all(|b| *b == 0) {
            Ok(())
        } else {
            Err(PhaseError::Failed("washer is worn".to_string()))
        }
    })
    .with_setup(move || match setup_check.borrow().as_ref() {
        Some(_) => Ok(()),
        None => Err(PhaseError::Failed("no washer fitted".to_string())),
    })
    .with_reset(move || {
        *fitted.borrow_mut() = Some(vec![0u8; 64 * 1024]);
    })
}

/// Fills the pattern cache on first use; scrubbing keeps it from counting
fn filtered() -> TestCase {
    TestCase::new(FILTERED, || {
        let regex = patterns::compile(r"^faucet::test_\w+$")
            .map_err(|e| PhaseError::Failed(e.to_string()))?;
        if regex.is_match(FILTERED) {
            Ok(())
        } else {
            Err(PhaseError::Failed("filter rejected its own name".to_string()))
        }
    })
}

fn unchecked() -> TestCase {
    TestCase::new(UNCHECKED, || Ok(())).with_marker(LeakMarker::fail("not testing"))
}

/// The whole faucet suite, in collection order
pub fn faucet_suite() -> Session {
    Session::new()
        .with_test(leaky())
        .with_test(dripping_tap())
        .with_test(broken())
        .with_test(mended())
        .with_test(filtered())
        .with_test(unchecked())
}
