//! Script test modules: `test_*.toml` files whose `[[test]]` tables list
//! device interaction steps.
//!
//! ```toml
//! description = "Nordic blinky"
//!
//! [[test]]
//! name = "test_led_on"
//! description = "Turn the LED on"
//! requires = ["00001525-1212-efde-1523-785feabcd123"]
//!
//! [[test.step]]
//! action = "write"
//! characteristic = "00001525-1212-efde-1523-785feabcd123"
//! value = "01"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{DiscoveryError, TestModule};
use crate::case::{TestBody, TestDef, TestError, TestResult};
use crate::context::TestContext;
use crate::interact::InteractionError;
use crate::transport::CharacteristicId;

/// File and test name prefix that marks a test.
pub const TEST_PREFIX: &str = "test_";

const SCRIPT_EXTENSION: &str = "toml";

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

/// Byte string written in hex. Spaces and `:`, `-`, `_` separators are
/// ignored, as is a leading `0x`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct HexBytes(Vec<u8>);

impl HexBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<String> for HexBytes {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        let digits: String = trimmed
            .strip_prefix("0x")
            .unwrap_or(trimmed)
            .chars()
            .filter(|c| !matches!(c, ' ' | ':' | '-' | '_'))
            .collect();
        hex::decode(&digits)
            .map(HexBytes)
            .map_err(|e| format!("invalid hex value '{}': {}", value, e))
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Read {
        characteristic: CharacteristicId,
        #[serde(default)]
        expect: Option<HexBytes>,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        retries: Option<u32>,
    },
    Write {
        characteristic: CharacteristicId,
        value: HexBytes,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        retries: Option<u32>,
    },
    WaitNotification {
        characteristic: CharacteristicId,
        /// Any payload satisfies the wait when absent.
        #[serde(default)]
        expect: Option<HexBytes>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Poll reads until the characteristic holds `expect`.
    WaitValue {
        characteristic: CharacteristicId,
        expect: HexBytes,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        interval_ms: Option<u64>,
    },
    Sleep {
        ms: u64,
    },
    Skip {
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct ScriptDocument {
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "test")]
    tests: Vec<ScriptTestEntry>,
}

#[derive(Debug, Deserialize)]
struct ScriptTestEntry {
    name: toml::Spanned<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    requires: Vec<CharacteristicId>,
    #[serde(default)]
    expected_duration_ms: Option<u64>,
    #[serde(default, rename = "step")]
    steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Body of one script test: its steps, run in order.
#[derive(Debug, Clone)]
pub struct ScriptTest {
    steps: Vec<Step>,
}

impl ScriptTest {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    async fn run_step(&self, ctx: &TestContext, number: usize, step: &Step) -> TestResult {
        let settings = ctx.settings();
        let or = |ms: Option<u64>, default: Duration| ms.map_or(default, Duration::from_millis);

        match step {
            Step::Read {
                characteristic,
                expect,
                timeout_ms,
                retries,
            } => {
                let value = ctx
                    .read_characteristic(
                        characteristic,
                        or(*timeout_ms, settings.read_timeout()),
                        retries.unwrap_or(settings.read_retries),
                    )
                    .await?;
                if let Some(expected) = expect {
                    if value != expected.as_bytes() {
                        return Err(TestError::Failed(format!(
                            "step {}: read {}: expected {}, got {}",
                            number,
                            characteristic,
                            expected,
                            hex::encode(&value)
                        )));
                    }
                }
            }
            Step::Write {
                characteristic,
                value,
                timeout_ms,
                retries,
            } => {
                ctx.write_characteristic(
                    characteristic,
                    value.as_bytes(),
                    or(*timeout_ms, settings.write_timeout()),
                    retries.unwrap_or(settings.write_retries),
                )
                .await?;
            }
            Step::WaitNotification {
                characteristic,
                expect,
                timeout_ms,
            } => {
                let timeout = or(*timeout_ms, settings.notification_timeout());
                match expect {
                    Some(expected) => {
                        ctx.wait_for_value(characteristic, expected.as_bytes(), timeout)
                            .await?;
                    }
                    None => {
                        ctx.wait_for_notification(characteristic, |_| true, timeout)
                            .await?;
                    }
                }
            }
            Step::WaitValue {
                characteristic,
                expect,
                timeout_ms,
                interval_ms,
            } => {
                let expected = expect.as_bytes();
                let read_timeout = settings.read_timeout();
                ctx.wait_for_condition_every(
                    move || async move {
                        let value = ctx
                            .read_characteristic(characteristic, read_timeout, 0)
                            .await?;
                        Ok::<_, InteractionError>(value == expected)
                    },
                    or(*timeout_ms, settings.notification_timeout()),
                    or(*interval_ms, settings.poll_interval()),
                )
                .await?;
            }
            Step::Sleep { ms } => {
                ctx.sleep(Duration::from_millis(*ms)).await?;
            }
            Step::Skip { reason } => {
                return Err(TestError::Skipped(reason.clone()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TestBody for ScriptTest {
    async fn run(&self, ctx: &TestContext) -> TestResult {
        for (i, step) in self.steps.iter().enumerate() {
            debug!(test = ctx.test_name(), step = i + 1, ?step, "script step");
            self.run_step(ctx, i + 1, step).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn is_script_module(path: &Path) -> bool {
    let is_script = path.extension().and_then(|e| e.to_str()) == Some(SCRIPT_EXTENSION);
    let named_as_test = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TEST_PREFIX));
    is_script && named_as_test && path.is_file()
}

fn script_files(dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    let entries = std::fs::read_dir(dir).map_err(|source| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| DiscoveryError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if is_script_module(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load every script module in `dir`, or in `dir/tests` when `dir` itself
/// holds none.
pub fn load_dir(dir: &Path) -> Result<Vec<TestModule>, DiscoveryError> {
    let mut files = script_files(dir)?;
    if files.is_empty() {
        let nested = dir.join("tests");
        if nested.is_dir() {
            debug!(dir = %nested.display(), "no script modules at top level, trying tests/");
            files = script_files(&nested)?;
        }
    }

    let modules = files
        .iter()
        .map(|path| load_module(path))
        .collect::<Result<Vec<_>, _>>()?;
    info!(dir = %dir.display(), modules = modules.len(), "script modules loaded");
    Ok(modules)
}

/// Parse one script module. The module is named after the file stem.
pub fn load_module(path: &Path) -> Result<TestModule, DiscoveryError> {
    let load_error = |reason: String| DiscoveryError::ModuleLoad {
        path: path.to_path_buf(),
        reason,
    };

    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| load_error("file name is not valid UTF-8".to_string()))?;
    let content = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    let doc: ScriptDocument = toml::from_str(&content).map_err(|e| load_error(e.to_string()))?;

    let mut module = TestModule::new(name).at(path);
    if let Some(description) = doc.description {
        module = module.describe(description);
    }

    for entry in doc.tests {
        let line = line_of(&content, entry.name.span().start);
        let test_name = entry.name.into_inner();
        if !test_name.starts_with(TEST_PREFIX) {
            warn!(
                module = name,
                test = %test_name,
                line,
                "skipping [[test]] whose name does not start with '{}'", TEST_PREFIX
            );
            continue;
        }

        let mut def = TestDef::new(test_name, ScriptTest::new(entry.steps)).line(line);
        if let Some(description) = entry.description {
            def = def.describe(description);
        }
        for characteristic in entry.requires {
            def = def.requires(characteristic);
        }
        if let Some(ms) = entry.expected_duration_ms {
            def = def.expected_duration(Duration::from_millis(ms));
        }
        module = module.test(def);
    }

    debug!(module = name, tests = module.tests().len(), "script module parsed");
    Ok(module)
}

fn line_of(content: &str, offset: usize) -> u32 {
    let offset = offset.min(content.len());
    content.as_bytes()[..offset]
        .iter()
        .filter(|&&b| b == b'\n')
        .count() as u32
        + 1
}
