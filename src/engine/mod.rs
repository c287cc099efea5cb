//! Execution engine: connect, run every case in isolation, disconnect.
//!
//! ```text
//! Idle -> Connecting -> Running(0) -> .. -> Running(n-1) -> Disconnecting -> Done
//!              \
//!               -> Failed          (connect budget exhausted, no test runs)
//! ```
//!
//! The engine owns the device handle for the whole run. Test bodies only see
//! a [`TestContext`] built for them, and run strictly one after another.
//! Whatever a body does (return an error, panic, hang past its deadline) is
//! turned into exactly one [`Outcome`]; only a lost connection stops the run
//! early, and even then every remaining case gets an `Errored` outcome.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::case::{FailureDetail, Outcome, TestCase, TestResult, TestStatus};
use crate::config::{ConnectionLossPolicy, InteractionSettings, RunConfig};
use crate::context::TestContext;
use crate::discovery::TestRegistry;
use crate::report::Report;
use crate::transport::{
    ConnectTarget, ConnectionState, DeviceHandle, ServiceMap, Transport, TransportError,
};

/// Reason recorded for cases that never ran because the link went away.
pub const CONNECTION_LOST: &str = "connection lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Idle,
    Connecting,
    Running(usize),
    Disconnecting,
    Done,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Connecting => write!(f, "connecting"),
            EngineState::Running(i) => write!(f, "running({})", i),
            EngineState::Disconnecting => write!(f, "disconnecting"),
            EngineState::Done => write!(f, "done"),
            EngineState::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// Default per-test deadline; a case's expected duration can extend it.
    pub test_timeout: Duration,
    pub teardown_timeout: Duration,
    /// Time a cancelled body gets to unwind before it is dropped.
    pub cancel_grace: Duration,
    pub interaction: InteractionSettings,
    pub on_connection_loss: ConnectionLossPolicy,
    pub reconnect_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

impl From<&RunConfig> for EngineSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            connect_attempts: config.device.connect_attempts,
            connect_retry_delay: config.device.connect_retry_delay(),
            test_timeout: config.tests.timeout(),
            teardown_timeout: config.tests.teardown_timeout(),
            cancel_grace: config.tests.cancel_grace(),
            interaction: config.interaction.clone(),
            on_connection_loss: config.run.on_connection_loss,
            reconnect_attempts: config.run.reconnect_attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// How a body ended, before it is mapped to a status.
enum Verdict {
    Returned(TestResult),
    Panicked(String),
    DeadlineExceeded,
}

pub struct Engine {
    transport: Arc<dyn Transport>,
    settings: EngineSettings,
    state: EngineState,
    history: Vec<EngineState>,
}

impl Engine {
    pub fn new(transport: Arc<dyn Transport>, settings: EngineSettings) -> Self {
        Self {
            transport,
            settings,
            state: EngineState::Idle,
            history: vec![EngineState::Idle],
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Every state the engine has been in, in order.
    pub fn history(&self) -> &[EngineState] {
        &self.history
    }

    fn transition(&mut self, to: EngineState) {
        debug!(from = %self.state, to = %to, "engine state");
        self.state = to;
        self.history.push(to);
    }

    /// Run every case in `registry` against `target`.
    ///
    /// Never fails: connection problems end up in the report as a run-level
    /// error and per-test outcomes.
    pub async fn run(&mut self, target: &ConnectTarget, registry: &TestRegistry) -> Report {
        let mut report = Report::begin(target);
        let cases = registry.cases();
        info!(%target, tests = cases.len(), "starting run");

        self.transition(EngineState::Connecting);
        let (mut handle, mut services) = match self
            .connect_with_retry(target, self.settings.connect_attempts)
            .await
        {
            Ok(link) => link,
            Err(e) => {
                error!(%target, error = %e, "could not connect, no tests will run");
                self.transition(EngineState::Failed);
                let detached = DeviceHandle::detached(target.clone());
                if let Err(de) = self.transport.disconnect(&detached).await {
                    warn!(error = %de, "cleanup disconnect failed");
                }
                report.finish(self.state, Some(format!("could not connect to {}: {}", target, e)));
                return report;
            }
        };

        let mut run_error = None;
        let mut next = 0;
        while next < cases.len() {
            let case = &cases[next];
            self.transition(EngineState::Running(next));
            let (outcome, link_lost) = self.run_case(case, &handle, &services).await;
            report.record(outcome);
            next += 1;

            if !link_lost {
                continue;
            }
            handle.set_state(ConnectionState::Disconnected);
            warn!(device = handle.id(), during = case.name(), "connection lost");

            let remaining = &cases[next..];
            if !remaining.is_empty()
                && self.settings.on_connection_loss == ConnectionLossPolicy::Reconnect
                && self.settings.reconnect_attempts > 0
            {
                self.transition(EngineState::Connecting);
                if let Err(e) = self.transport.disconnect(&handle).await {
                    debug!(error = %e, "disconnect of lost link failed");
                }
                match self
                    .connect_with_retry(target, self.settings.reconnect_attempts)
                    .await
                {
                    Ok((h, s)) => {
                        info!(device = h.id(), "reconnected, resuming run");
                        handle = h;
                        services = s;
                        continue;
                    }
                    Err(e) => warn!(error = %e, "reconnect failed"),
                }
            }

            for unrun in remaining {
                report.record(Outcome::not_run(unrun, CONNECTION_LOST));
            }
            run_error = Some(format!("{} during {}", CONNECTION_LOST, case.name()));
            break;
        }

        self.transition(EngineState::Disconnecting);
        handle.set_state(ConnectionState::Disconnecting);
        if let Err(e) = self.transport.disconnect(&handle).await {
            warn!(device = handle.id(), error = %e, "disconnect failed");
        }
        handle.set_state(ConnectionState::Disconnected);
        self.transition(EngineState::Done);

        report.finish(self.state, run_error);
        let summary = report.summary();
        info!(
            passed = summary.passed,
            failed = summary.failed,
            skipped = summary.skipped,
            errored = summary.errored,
            timed_out = summary.timed_out,
            "run finished"
        );
        report
    }

    /// Connect and enumerate services, retrying the pair up to `attempts`
    /// times (at least once). A link whose discovery fails is torn down
    /// before the retry.
    async fn connect_with_retry(
        &self,
        target: &ConnectTarget,
        attempts: u32,
    ) -> Result<(DeviceHandle, Arc<ServiceMap>), TransportError> {
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.connect_retry_delay).await;
            }
            info!(%target, attempt, attempts, "connecting");

            let handle = match self.transport.connect(target).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(%target, attempt, error = %e, "connect failed");
                    last_error = Some(e);
                    continue;
                }
            };
            match self.transport.discover(&handle).await {
                Ok(services) => {
                    info!(
                        device = handle.id(),
                        services = services.service_count(),
                        characteristics = services.characteristic_count(),
                        "connected"
                    );
                    return Ok((handle, Arc::new(services)));
                }
                Err(e) => {
                    warn!(device = handle.id(), attempt, error = %e, "service discovery failed");
                    if let Err(de) = self.transport.disconnect(&handle).await {
                        debug!(error = %de, "disconnect after failed discovery");
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TransportError::Connection("no connection attempt was made".into())))
    }

    /// Run one case and report whether the link was lost while it ran.
    async fn run_case(
        &self,
        case: &TestCase,
        handle: &DeviceHandle,
        services: &Arc<ServiceMap>,
    ) -> (Outcome, bool) {
        let span = info_span!("test", name = case.name(), index = case.index());

        let missing: Vec<String> = case
            .requires()
            .iter()
            .filter(|c| !services.contains(c))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            let message = format!("device does not expose {}", missing.join(", "));
            span.in_scope(|| info!(status = %TestStatus::Skipped, reason = %message, "test skipped"));
            let detail = FailureDetail {
                message,
                captured: Default::default(),
            };
            return (
                Outcome::new(case, TestStatus::Skipped, Duration::ZERO, Some(detail)),
                false,
            );
        }

        let mut ctx = TestContext::new(
            case.name(),
            Arc::clone(&self.transport),
            handle.clone(),
            Arc::clone(services),
            self.settings.interaction.clone(),
        );
        let deadline = case.deadline(self.settings.test_timeout);

        let (verdict, elapsed) = self
            .execute(case, &ctx, deadline)
            .instrument(span.clone())
            .await;

        let returned_loss = matches!(&verdict, Verdict::Returned(Err(e)) if e.is_connection_loss());
        let link_lost =
            returned_loss || ctx.saw_connection_loss() || !self.transport.is_connected(handle).await;

        let (status, message) = match verdict {
            Verdict::Returned(Ok(())) => (TestStatus::Passed, None),
            Verdict::Returned(Err(e)) => (e.status(), Some(e.to_string())),
            Verdict::Panicked(msg) if msg.starts_with("assertion") => (TestStatus::Failed, Some(msg)),
            Verdict::Panicked(msg) => (TestStatus::Errored, Some(format!("panicked: {}", msg))),
            Verdict::DeadlineExceeded => (
                TestStatus::TimedOut,
                Some(format!("did not finish within {:?}", deadline)),
            ),
        };

        if let Some(teardown) = case.teardown() {
            if link_lost {
                warn!(test = case.name(), "skipping teardown, connection lost");
            } else {
                ctx.rearm();
                let teardown_run = AssertUnwindSafe(teardown.run(&ctx)).catch_unwind();
                match tokio::time::timeout(self.settings.teardown_timeout, teardown_run)
                    .instrument(span.clone())
                    .await
                {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => warn!(test = case.name(), error = %e, "teardown failed"),
                    Ok(Err(panic)) => {
                        warn!(test = case.name(), panic = %panic_message(panic.as_ref()), "teardown panicked")
                    }
                    Err(_) => warn!(test = case.name(), "teardown timed out"),
                }
            }
        }

        let detail = message.map(|message| FailureDetail {
            message,
            captured: match status {
                TestStatus::Failed | TestStatus::Errored | TestStatus::TimedOut => ctx.captured_state(),
                _ => Default::default(),
            },
        });
        ctx.release_all().instrument(span.clone()).await;

        span.in_scope(|| {
            info!(
                status = %status,
                elapsed_ms = elapsed.as_millis() as u64,
                message = detail.as_ref().map_or("", |d| d.message.as_str()),
                "test finished"
            )
        });
        (Outcome::new(case, status, elapsed, detail), link_lost)
    }

    /// Run setup and body under the deadline. On expiry the context is
    /// cancelled and the body gets `cancel_grace` to unwind; it is dropped
    /// after that whether or not it finished.
    async fn execute(&self, case: &TestCase, ctx: &TestContext, deadline: Duration) -> (Verdict, Duration) {
        let started = Instant::now();
        let body = AssertUnwindSafe(run_body(case, ctx)).catch_unwind();
        tokio::pin!(body);

        tokio::select! {
            res = &mut body => {
                let verdict = match res {
                    Ok(result) => Verdict::Returned(result),
                    Err(panic) => Verdict::Panicked(panic_message(panic.as_ref())),
                };
                return (verdict, started.elapsed());
            }
            _ = tokio::time::sleep(deadline) => {}
        }

        let elapsed = started.elapsed();
        warn!(test = case.name(), ?deadline, "deadline exceeded, cancelling");
        ctx.cancel();
        if tokio::time::timeout(self.settings.cancel_grace, &mut body).await.is_err() {
            warn!(test = case.name(), "body ignored cancellation, abandoning it");
        }
        (Verdict::DeadlineExceeded, elapsed)
    }
}

async fn run_body(case: &TestCase, ctx: &TestContext) -> TestResult {
    if let Some(setup) = case.setup() {
        setup.run(ctx).await?;
    }
    case.body().run(ctx).await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        let literal: Box<dyn Any + Send> = Box::new("assertion failed: led_on");
        assert_eq!(panic_message(literal.as_ref()), "assertion failed: led_on");

        let formatted: Box<dyn Any + Send> = Box::new(format!("index {} out of range", 4));
        assert_eq!(panic_message(formatted.as_ref()), "index 4 out of range");

        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = RunConfig::default();
        config.tests.timeout_ms = 1_500;
        config.run.on_connection_loss = ConnectionLossPolicy::Reconnect;
        let settings = EngineSettings::from(&config);
        assert_eq!(settings.test_timeout, Duration::from_millis(1_500));
        assert_eq!(settings.connect_attempts, 3);
        assert_eq!(settings.on_connection_loss, ConnectionLossPolicy::Reconnect);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(EngineState::Running(2).to_string(), "running(2)");
        assert_eq!(EngineState::Failed.to_string(), "failed");
    }
}
