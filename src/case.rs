//! Test case model: bodies, definitions, discovered cases and outcomes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::context::TestContext;
use crate::interact::InteractionError;
use crate::transport::{CharacteristicId, TransportError};

pub type TestResult = Result<(), TestError>;

/// How a test body (or one of its hooks) can end other than by passing.
#[derive(Debug, Error)]
pub enum TestError {
    /// An explicit check by the test author did not hold.
    #[error("{0}")]
    Failed(String),

    /// The test decided it cannot run in this environment.
    #[error("{0}")]
    Skipped(String),

    /// A device interaction failed and the body propagated it.
    #[error(transparent)]
    Interaction(#[from] InteractionError),

    /// Anything else the body raised.
    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl TestError {
    /// Outcome status this error converts to at the per-test boundary.
    pub fn status(&self) -> TestStatus {
        match self {
            TestError::Failed(_) => TestStatus::Failed,
            TestError::Skipped(_) => TestStatus::Skipped,
            // Cancellation is only ever issued by the test deadline.
            TestError::Interaction(InteractionError::Cancelled) => TestStatus::TimedOut,
            TestError::Interaction(e) if e.is_timeout() => TestStatus::TimedOut,
            TestError::Interaction(_) | TestError::Unhandled(_) => TestStatus::Errored,
        }
    }

    pub fn is_connection_loss(&self) -> bool {
        matches!(self, TestError::Interaction(e) if e.is_connection_loss())
    }
}

impl From<TransportError> for TestError {
    fn from(e: TransportError) -> Self {
        TestError::Interaction(e.into())
    }
}

/// A unit of work run against a connected device.
///
/// Implemented directly by structs, and for free by functions shaped like
/// `fn(&TestContext) -> BoxFuture<'_, TestResult>`.
#[async_trait]
pub trait TestBody: Send + Sync {
    async fn run(&self, ctx: &TestContext) -> TestResult;
}

#[async_trait]
impl<F> TestBody for F
where
    F: for<'a> Fn(&'a TestContext) -> BoxFuture<'a, TestResult> + Send + Sync,
{
    async fn run(&self, ctx: &TestContext) -> TestResult {
        (self)(ctx).await
    }
}

// ---------------------------------------------------------------------------
// Definitions (pre-discovery) and cases (post-discovery)
// ---------------------------------------------------------------------------

/// A test as registered in a module, before discovery qualifies and orders it.
#[derive(Clone)]
pub struct TestDef {
    pub(crate) name: String,
    pub(crate) description: Option<String>,
    pub(crate) requires: Vec<CharacteristicId>,
    pub(crate) expected_duration: Option<Duration>,
    pub(crate) line: Option<u32>,
    pub(crate) body: Arc<dyn TestBody>,
}

impl TestDef {
    pub fn new(name: impl Into<String>, body: impl TestBody + 'static) -> Self {
        Self {
            name: name.into(),
            description: None,
            requires: Vec::new(),
            expected_duration: None,
            line: None,
            body: Arc::new(body),
        }
    }

    /// Human-readable title shown in reports instead of the bare name.
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare a characteristic the device must expose for this test to run.
    pub fn requires(mut self, characteristic: CharacteristicId) -> Self {
        self.requires.push(characteristic);
        self
    }

    pub fn expected_duration(mut self, duration: Duration) -> Self {
        self.expected_duration = Some(duration);
        self
    }

    pub fn line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for TestDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDef")
            .field("name", &self.name)
            .field("requires", &self.requires)
            .finish_non_exhaustive()
    }
}

/// Where a test was defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub path: PathBuf,
    pub line: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}", self.path.display(), line),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// A discovered, immutable test case. Identity is the qualified name.
#[derive(Clone)]
pub struct TestCase {
    index: usize,
    name: String,
    module: String,
    description: Option<String>,
    location: SourceLocation,
    requires: Vec<CharacteristicId>,
    expected_duration: Option<Duration>,
    body: Arc<dyn TestBody>,
    setup: Option<Arc<dyn TestBody>>,
    teardown: Option<Arc<dyn TestBody>>,
}

impl TestCase {
    pub(crate) fn new(
        index: usize,
        module: &str,
        path: &Path,
        def: TestDef,
        setup: Option<Arc<dyn TestBody>>,
        teardown: Option<Arc<dyn TestBody>>,
    ) -> Self {
        Self {
            index,
            name: format!("{}.{}", module, def.name),
            module: module.to_string(),
            description: def.description,
            location: SourceLocation {
                path: path.to_path_buf(),
                line: def.line,
            },
            requires: def.requires,
            expected_duration: def.expected_duration,
            body: def.body,
            setup,
            teardown,
        }
    }

    pub(crate) fn with_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Position in the run order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Qualified name, `module.test`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Name without the module prefix.
    pub fn short_name(&self) -> &str {
        &self.name[self.module.len() + 1..]
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn location(&self) -> &SourceLocation {
        &self.location
    }

    pub fn requires(&self) -> &[CharacteristicId] {
        &self.requires
    }

    pub fn expected_duration(&self) -> Option<Duration> {
        self.expected_duration
    }

    /// The deadline for this case: the run default, stretched to the
    /// expected duration when the case declares a longer one.
    pub fn deadline(&self, default: Duration) -> Duration {
        self.expected_duration.map_or(default, |hint| hint.max(default))
    }

    pub(crate) fn body(&self) -> &dyn TestBody {
        self.body.as_ref()
    }

    pub(crate) fn setup(&self) -> Option<&dyn TestBody> {
        self.setup.as_deref()
    }

    pub(crate) fn teardown(&self) -> Option<&dyn TestBody> {
        self.teardown.as_deref()
    }
}

impl fmt::Debug for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestCase")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Errored,
    TimedOut,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pad() so table columns line up
        match self {
            TestStatus::Passed => f.pad("PASS"),
            TestStatus::Failed => f.pad("FAIL"),
            TestStatus::Skipped => f.pad("SKIP"),
            TestStatus::Errored => f.pad("ERROR"),
            TestStatus::TimedOut => f.pad("TIMEOUT"),
        }
    }
}

/// Why a test did not pass, plus the characteristic values the context had
/// last observed (hex encoded) when it ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub captured: BTreeMap<String, String>,
}

/// Terminal record of one test.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub index: usize,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TestStatus,
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<FailureDetail>,
}

impl Outcome {
    pub(crate) fn new(case: &TestCase, status: TestStatus, elapsed: Duration, detail: Option<FailureDetail>) -> Self {
        Self {
            index: case.index(),
            name: case.name().to_string(),
            description: case.description().map(str::to_string),
            status,
            elapsed,
            detail,
        }
    }

    /// Outcome for a case whose body was never invoked.
    pub(crate) fn not_run(case: &TestCase, reason: &str) -> Self {
        Self::new(
            case,
            TestStatus::Errored,
            Duration::ZERO,
            Some(FailureDetail {
                message: reason.to_string(),
                captured: BTreeMap::new(),
            }),
        )
    }

    pub fn message(&self) -> Option<&str> {
        self.detail.as_ref().map(|d| d.message.as_str())
    }
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
