//! Test reports, outcome categories and the leaks summary
//!
//! A leak verdict travels with the call-phase [`TestReport`] as a named
//! section holding the verdict's ordered JSON mapping. Because the section is
//! plain data it survives JSON transport between processes, and the
//! [`TestStatus`] of a report can be derived from the report alone.
//!
//! A leaked test is reported in its own `leaked` category but never changes
//! the exit code: a leak is a warning, not a failure.

use crate::error::Result;
use crate::hunter::{Verdict, VerdictValue};
use crate::warnings::warn_once;
use chrono::{DateTime, Utc};
use crossterm::style::Stylize;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

/// Name of the report section carrying a verdict
pub const LEAKS_SECTION: &str = "leaks";

/// Phase of a single test execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum When {
    Setup,
    Call,
    Teardown,
}

impl When {
    pub const ALL: [When; 3] = [When::Setup, When::Call, When::Teardown];

    pub fn index(self) -> usize {
        match self {
            When::Setup => 0,
            When::Call => 1,
            When::Teardown => 2,
        }
    }
}

impl std::fmt::Display for When {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            When::Setup => write!(f, "setup"),
            When::Call => write!(f, "call"),
            When::Teardown => write!(f, "teardown"),
        }
    }
}

/// Raw outcome of one phase, before status categorisation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

/// Report for one phase of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub node_id: String,
    pub when: When,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub longrepr: Option<String>,
    #[serde(default)]
    pub sections: Vec<(String, String)>,
    pub duration_ms: f64,
    /// Process that produced the report
    pub session_id: Uuid,
    pub stop: DateTime<Utc>,
}

impl TestReport {
    pub fn new(
        node_id: impl Into<String>,
        when: When,
        outcome: Outcome,
        duration: Duration,
        session_id: Uuid,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            when,
            outcome,
            longrepr: None,
            sections: Vec::new(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            session_id,
            stop: Utc::now(),
        }
    }

    pub fn with_longrepr(mut self, longrepr: impl Into<String>) -> Self {
        self.longrepr = Some(longrepr.into());
        self
    }

    pub fn add_section(&mut self, name: impl Into<String>, content: impl Into<String>) {
        self.sections.push((name.into(), content.into()));
    }

    pub fn section(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, content)| content.as_str())
    }

    /// Attach a non-empty verdict; an empty one leaves no trace
    pub fn attach_verdict(&mut self, verdict: &Verdict) -> Result<()> {
        if !verdict.is_empty() {
            self.add_section(LEAKS_SECTION, verdict.to_json()?);
        }
        Ok(())
    }

    /// Recover the attached verdict; `None` means no leak was detected
    pub fn leaks(&self) -> Result<Option<Verdict>> {
        self.section(LEAKS_SECTION)
            .map(Verdict::from_json)
            .transpose()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Displayed outcome category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Passed,
    Failed,
    Skipped,
    Leaked,
}

impl Category {
    pub fn is_failure(self) -> bool {
        self == Category::Failed
    }
}

/// Category plus its short and long display forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestStatus {
    pub category: Category,
    pub letter: char,
    pub word: &'static str,
}

impl TestStatus {
    pub const PASSED: TestStatus = TestStatus {
        category: Category::Passed,
        letter: '.',
        word: "PASSED",
    };
    pub const FAILED: TestStatus = TestStatus {
        category: Category::Failed,
        letter: 'F',
        word: "FAILED",
    };
    pub const SKIPPED: TestStatus = TestStatus {
        category: Category::Skipped,
        letter: 's',
        word: "SKIPPED",
    };
    pub const LEAKED: TestStatus = TestStatus {
        category: Category::Leaked,
        letter: 'L',
        word: "LEAKED",
    };

    /// Status of a report; a passed call report with a leaks section is LEAKED
    pub fn of(report: &TestReport) -> Self {
        match report.outcome {
            Outcome::Failed => Self::FAILED,
            Outcome::Skipped => Self::SKIPPED,
            Outcome::Passed
                if report.when == When::Call && report.section(LEAKS_SECTION).is_some() =>
            {
                Self::LEAKED
            }
            Outcome::Passed => Self::PASSED,
        }
    }

    /// Whether this report contributes a line to the per-test listing
    pub fn is_reported(report: &TestReport) -> bool {
        report.when == When::Call || report.outcome != Outcome::Passed
    }
}

/// Counts per category plus the leaked tests' verdicts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub leaked: usize,
    pub leaks: Vec<(String, Verdict)>,
}

impl Summary {
    pub fn from_reports(reports: &[TestReport]) -> Result<Self> {
        let mut summary = Summary::default();
        for report in reports.iter().filter(|r| TestStatus::is_reported(r)) {
            match TestStatus::of(report).category {
                Category::Passed => summary.passed += 1,
                Category::Failed => summary.failed += 1,
                Category::Skipped => summary.skipped += 1,
                Category::Leaked => {
                    summary.leaked += 1;
                    if let Some(verdict) = report.leaks()? {
                        summary.leaks.push((report.node_id.clone(), verdict));
                    }
                }
            }
        }
        Ok(summary)
    }

    /// 1 when anything failed; leaks alone never fail the run
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }

    pub fn counts_line(&self) -> String {
        let mut parts = Vec::new();
        for (count, label) in [
            (self.failed, "failed"),
            (self.passed, "passed"),
            (self.skipped, "skipped"),
            (self.leaked, "leaked"),
        ] {
            if count > 0 {
                parts.push(format!("{} {}", count, label));
            }
        }
        if parts.is_empty() {
            "no tests ran".to_string()
        } else {
            parts.join(", ")
        }
    }
}

fn separator(title: &str) -> String {
    let width: usize = 72;
    let fill = width.saturating_sub(title.len() + 2) / 2;
    format!("{} {} {}", "=".repeat(fill), title, "=".repeat(fill))
}

/// One per-test line: `node_id WORD`
pub fn write_status_line<W: Write>(out: &mut W, report: &TestReport, color: bool) -> io::Result<()> {
    let status = TestStatus::of(report);
    let word = if color {
        match status.category {
            Category::Passed => status.word.green().to_string(),
            Category::Failed => status.word.red().to_string(),
            Category::Skipped => status.word.yellow().to_string(),
            Category::Leaked => status.word.cyan().bold().to_string(),
        }
    } else {
        status.word.to_string()
    };
    writeln!(out, "{} {}", report.node_id, word)
}

/// Print the leaks section and the final counts line
pub fn write_terminal_summary<W: Write>(out: &mut W, summary: &Summary, color: bool) -> io::Result<()> {
    if !summary.leaks.is_empty() {
        let title = separator("leaks summary");
        if color {
            writeln!(out, "{}", title.cyan())?;
        } else {
            writeln!(out, "{}", title)?;
        }
        for (node_id, verdict) in &summary.leaks {
            writeln!(out, "{}: {}", node_id, verdict)?;
        }
    }
    writeln!(out, "{}", separator(&summary.counts_line()))
}

/// Whether stdout should get ANSI colours
pub fn stdout_is_terminal() -> bool {
    atty::is(atty::Stream::Stdout)
}

/// One reflog line per leaking metric: `<node> leaked [..] <unit>, sum=<n>`
pub fn reflog_lines(node_id: &str, verdict: &Verdict, unit_of: impl Fn(&str) -> String) -> Vec<String> {
    verdict
        .iter()
        .map(|(metric, value)| match value {
            VerdictValue::Deltas(deltas) => format!(
                "{} leaked {:?} {}, sum={}",
                node_id,
                deltas,
                unit_of(metric),
                deltas.iter().sum::<i64>()
            ),
            VerdictValue::Unchecked(reason) => format!("{} not checked: {}", node_id, reason),
        })
        .collect()
}

/// Append reflog lines to `path`. Failures are warned about once per path.
pub fn append_reflog(path: &Path, lines: &[String]) {
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            for line in lines {
                writeln!(file, "{}", line)?;
            }
            file.flush()
        });
    if let Err(err) = written {
        warn_once(
            &format!("reflog:{}", path.display()),
            &format!("Could not append to reflog {}: {}", path.display(), err),
        );
    }
}
