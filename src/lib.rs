//! gattbench -- test automation for Bluetooth Low Energy peripherals.
//!
//! This crate connects to a BLE device through a pluggable [`transport`],
//! discovers test cases (compiled [`discovery::Suite`] modules and
//! `test_*.toml` script modules), runs them one at a time with per-test
//! deadlines and isolation, and hands the resulting [`report::Report`] to a
//! reporter.

pub mod case;
pub mod config;
pub mod context;
pub mod discovery;
pub mod engine;
pub mod interact;
pub mod report;
pub mod transport;

use std::sync::Arc;

use thiserror::Error;

pub use case::{Outcome, TestBody, TestDef, TestError, TestResult, TestStatus};
pub use context::TestContext;
pub use discovery::{Suite, TestModule, TestSelector};
pub use engine::{Engine, EngineSettings, EngineState};
pub use report::Report;
pub use transport::{CharacteristicId, ConnectTarget, Transport, TransportError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Discovery(#[from] discovery::DiscoveryError),

    #[error("no device selected: set an address or a name")]
    NoTarget,
}

/// Discover the configured tests, then run them against the configured
/// device.
///
/// Discovery problems and a missing target are returned as errors before
/// any connection is attempted. Everything that happens after that is
/// recorded in the report.
pub async fn run(
    config: &config::RunConfig,
    transport: Arc<dyn Transport>,
    suite: &Suite,
) -> Result<Report, RunError> {
    let registry = discovery::discover(suite, Some(config.tests.dir.as_path()), &config.selector())?;
    let target = config.target().ok_or(RunError::NoTarget)?;

    tracing::info!(%target, tests = registry.len(), "running tests");
    let mut engine = Engine::new(transport, EngineSettings::from(config));
    Ok(engine.run(&target, &registry).await)
}
