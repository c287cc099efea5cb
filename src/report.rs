//! Run report and the reporter boundary.

use std::fmt::Write as _;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::case::{Outcome, TestStatus};
use crate::engine::EngineState;
use crate::transport::ConnectTarget;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub timed_out: usize,
}

impl Summary {
    fn count(&mut self, status: TestStatus) {
        self.total += 1;
        match status {
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Skipped => self.skipped += 1,
            TestStatus::Errored => self.errored += 1,
            TestStatus::TimedOut => self.timed_out += 1,
        }
    }
}

/// Ordered outcomes of one run plus aggregate counts.
///
/// Append-only while the engine runs; finalized before it is handed out.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    run_id: String,
    device: String,
    state: EngineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    summary: Summary,
    outcomes: Vec<Outcome>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl Report {
    pub(crate) fn begin(target: &ConnectTarget) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            device: target.to_string(),
            state: EngineState::Idle,
            error: None,
            summary: Summary::default(),
            outcomes: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn record(&mut self, outcome: Outcome) {
        self.summary.count(outcome.status);
        self.outcomes.push(outcome);
    }

    pub(crate) fn finish(&mut self, state: EngineState, error: Option<String>) {
        self.state = state;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Final engine state: `Done`, or `Failed` when the device was never
    /// reached.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Run-level error, if the run could not connect or lost its link.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// True when the run completed and no test failed, errored or timed out.
    /// Skipped tests do not count against the run.
    pub fn is_success(&self) -> bool {
        self.state == EngineState::Done
            && self.error.is_none()
            && self.summary.failed == 0
            && self.summary.errored == 0
            && self.summary.timed_out == 0
    }
}

// ---------------------------------------------------------------------------
// Reporters
// ---------------------------------------------------------------------------

/// Turns a finalized report into output.
pub trait Reporter {
    fn render(&self, report: &Report) -> Result<String>;

    fn report(&self, report: &Report) -> Result<()> {
        println!("{}", self.render(report)?);
        Ok(())
    }
}

/// Plain aligned table followed by a summary line.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    /// Also print captured characteristic values for failed tests.
    pub verbose: bool,
}

impl Reporter for ConsoleReporter {
    fn render(&self, report: &Report) -> Result<String> {
        let mut out = String::new();
        writeln!(out, "\nTest results for {}", report.device())?;
        writeln!(out, "{:<40} | {:<7} | {:>9} | Details", "Test", "Status", "Time")?;
        writeln!(out, "{:-<40}-|-{:-<7}-|-{:->9}-|-{:-<40}", "", "", "", "")?;

        for outcome in report.outcomes() {
            let label = outcome.description.as_deref().unwrap_or(&outcome.name);
            writeln!(
                out,
                "{:<40} | {:<7} | {:>8.2}s | {}",
                label,
                outcome.status,
                outcome.elapsed.as_secs_f64(),
                outcome.message().unwrap_or("")
            )?;
            if self.verbose {
                if let Some(detail) = &outcome.detail {
                    for (characteristic, value) in &detail.captured {
                        writeln!(out, "{:<40} |   -> {} = {}", "", characteristic, value)?;
                    }
                }
            }
        }

        let s = report.summary();
        writeln!(
            out,
            "\n{} tests: {} passed, {} failed, {} skipped, {} errored, {} timed out",
            s.total, s.passed, s.failed, s.skipped, s.errored, s.timed_out
        )?;
        if let Some(error) = report.error() {
            writeln!(out, "Run error: {}", error)?;
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn render(&self, report: &Report) -> Result<String> {
        Ok(serde_json::to_string_pretty(report)?)
    }
}
