//! TOML run configuration.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) is a valid configuration. Command-line flags are applied on top by
//! the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discovery::TestSelector;
use crate::transport::ConnectTarget;

/// Environment variable naming a config file to load.
pub const CONFIG_ENV: &str = "GATTBENCH_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "gattbench.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub interaction: InteractionSettings,
    #[serde(default)]
    pub run: RunPolicy,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded run configuration");
        Ok(config)
    }

    /// Try, in order: the file named by `GATTBENCH_CONFIG`, `./gattbench.toml`,
    /// compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "{} set but file could not be loaded, trying fallback", CONFIG_ENV
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Device to connect to. Address wins over name when both are set.
    pub fn target(&self) -> Option<ConnectTarget> {
        match (&self.device.address, &self.device.name) {
            (Some(address), _) => Some(ConnectTarget::Address(address.clone())),
            (None, Some(name)) => Some(ConnectTarget::Name(name.clone())),
            (None, None) => None,
        }
    }

    pub fn selector(&self) -> TestSelector {
        TestSelector::parse(&self.tests.select)
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Platform identifier of the device (MAC address, or UUID on macOS).
    pub address: Option<String>,
    /// Advertised name of the device.
    pub name: Option<String>,
    /// Connect attempts before the run fails.
    pub connect_attempts: u32,
    /// Pause between connect attempts.
    pub connect_retry_delay_ms: u64,
    /// How long a backend may scan for the target.
    pub scan_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            name: None,
            connect_attempts: 3,
            connect_retry_delay_ms: 1000,
            scan_timeout_ms: 10_000,
        }
    }
}

impl DeviceConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestsConfig {
    /// Directory scanned for `test_*.toml` modules.
    pub dir: PathBuf,
    /// `all`, or a name / wildcard pattern.
    pub select: String,
    /// Default per-test deadline.
    pub timeout_ms: u64,
    /// Upper bound for a module teardown hook.
    pub teardown_timeout_ms: u64,
    /// How long a cancelled body gets to unwind before it is abandoned.
    pub cancel_grace_ms: u64,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            select: "all".to_string(),
            timeout_ms: 30_000,
            teardown_timeout_ms: 5_000,
            cancel_grace_ms: 500,
        }
    }
}

impl TestsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Interaction
// ---------------------------------------------------------------------------

/// Defaults for the interaction primitives when a test does not pass its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionSettings {
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_retries: u32,
    /// Writes are not assumed idempotent; keep at zero unless the device
    /// tolerates duplicates.
    pub write_retries: u32,
    pub notification_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for InteractionSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: 5_000,
            write_timeout_ms: 5_000,
            read_retries: 2,
            write_retries: 0,
            notification_timeout_ms: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl InteractionSettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Run policy
// ---------------------------------------------------------------------------

/// What the engine does when the link drops between tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionLossPolicy {
    /// Record every remaining test as errored without running it.
    #[default]
    Abort,
    /// Try to re-establish the link first; abort if that fails.
    Reconnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunPolicy {
    pub on_connection_loss: ConnectionLossPolicy,
    /// Connect attempts made under `reconnect`; zero behaves like `abort`.
    pub reconnect_attempts: u32,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            on_connection_loss: ConnectionLossPolicy::Abort,
            reconnect_attempts: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let cfg: RunConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.device.connect_attempts, 3);
        assert_eq!(cfg.tests.select, "all");
        assert_eq!(cfg.tests.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.interaction.write_retries, 0);
        assert!(cfg.interaction.read_retries > 0);
        assert_eq!(cfg.run.on_connection_loss, ConnectionLossPolicy::Abort);
        assert!(cfg.target().is_none());
    }

    #[test]
    fn test_partial_sections_override_defaults() {
        let cfg: RunConfig = toml::from_str(
            r#"
            [device]
            name = "Nordic_Blinky"

            [tests]
            dir = "demos/blinky"
            timeout_ms = 2000

            [interaction]
            read_retries = 5

            [run]
            on_connection_loss = "reconnect"
            reconnect_attempts = 2
            "#,
        )
        .unwrap();

        assert_eq!(cfg.target(), Some(ConnectTarget::Name("Nordic_Blinky".into())));
        assert_eq!(cfg.tests.dir, PathBuf::from("demos/blinky"));
        assert_eq!(cfg.tests.timeout(), Duration::from_secs(2));
        assert_eq!(cfg.tests.cancel_grace(), Duration::from_millis(500));
        assert_eq!(cfg.interaction.read_retries, 5);
        assert_eq!(cfg.interaction.read_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.run.on_connection_loss, ConnectionLossPolicy::Reconnect);
        assert_eq!(cfg.run.reconnect_attempts, 2);
    }

    #[test]
    fn test_address_wins_over_name() {
        let mut cfg = RunConfig::default();
        cfg.device.name = Some("Blinky".into());
        cfg.device.address = Some("C0:FF:EE:00:00:01".into());
        assert_eq!(
            cfg.target(),
            Some(ConnectTarget::Address("C0:FF:EE:00:00:01".into()))
        );
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[tests\ntimeout_ms = ").unwrap();
        let err = RunConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }
}
