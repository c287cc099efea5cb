//! Test discovery: turns registered modules and `test_*.toml` script files
//! into an ordered, validated [`TestRegistry`].
//!
//! Discovery is read-only. It never talks to a transport, so every problem
//! it finds (unloadable module, duplicate name, empty selection) surfaces
//! before a connection is attempted.

pub mod pattern;
pub mod script;

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::case::{SourceLocation, TestBody, TestCase, TestDef};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to load test module {}: {reason}", .path.display())]
    ModuleLoad { path: PathBuf, reason: String },

    #[error("duplicate test name '{name}' (defined at {first} and {second})")]
    DuplicateName {
        name: String,
        first: SourceLocation,
        second: SourceLocation,
    },

    #[error("no test modules found in {}", .0.display())]
    NoTestFiles(PathBuf),

    #[error("no tests match selector '{0}'")]
    NothingSelected(String),

    #[error("cannot scan {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Modules and suites
// ---------------------------------------------------------------------------

/// A named group of tests sharing optional setup and teardown hooks.
#[derive(Clone)]
pub struct TestModule {
    name: String,
    path: PathBuf,
    description: Option<String>,
    tests: Vec<TestDef>,
    setup: Option<Arc<dyn TestBody>>,
    teardown: Option<Arc<dyn TestBody>>,
}

impl TestModule {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: PathBuf::from(&name),
            name,
            description: None,
            tests: Vec::new(),
            setup: None,
            teardown: None,
        }
    }

    /// Source file reported in test locations; pass `file!()`.
    pub fn at(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn test(mut self, def: TestDef) -> Self {
        self.tests.push(def);
        self
    }

    /// Hook run before every test of the module.
    pub fn setup(mut self, body: impl TestBody + 'static) -> Self {
        self.setup = Some(Arc::new(body));
        self
    }

    /// Hook run after every test of the module, whatever its outcome.
    pub fn teardown(mut self, body: impl TestBody + 'static) -> Self {
        self.teardown = Some(Arc::new(body));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn tests(&self) -> &[TestDef] {
        &self.tests
    }
}

impl fmt::Debug for TestModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestModule")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("tests", &self.tests)
            .finish_non_exhaustive()
    }
}

/// Modules compiled into the binary. Registering a module is what marks
/// its functions as tests.
#[derive(Debug, Clone, Default)]
pub struct Suite {
    modules: Vec<TestModule>,
}

impl Suite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, module: TestModule) -> Self {
        self.modules.push(module);
        self
    }

    pub fn add(&mut self, module: TestModule) {
        self.modules.push(module);
    }

    pub fn modules(&self) -> &[TestModule] {
        &self.modules
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TestSelector {
    #[default]
    All,
    /// A module name, a qualified `module.test` name or a bare test name,
    /// optionally with `*` / `?` wildcards.
    Pattern(String),
}

impl TestSelector {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            TestSelector::All
        } else {
            TestSelector::Pattern(s.to_string())
        }
    }

    pub fn matches(&self, case: &TestCase) -> bool {
        match self {
            TestSelector::All => true,
            TestSelector::Pattern(p) => [case.module(), case.name(), case.short_name()]
                .iter()
                .any(|candidate| pattern::matches(p, candidate)),
        }
    }
}

impl FromStr for TestSelector {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for TestSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestSelector::All => write!(f, "all"),
            TestSelector::Pattern(p) => write!(f, "{}", p),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered, immutable list of the cases a run will execute.
#[derive(Debug, Clone, Default)]
pub struct TestRegistry {
    cases: Vec<TestCase>,
}

impl TestRegistry {
    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(TestCase::name)
    }
}

/// Collect compiled modules from `suite` and script modules from `dir`,
/// order them, reject duplicates and apply `selector`.
///
/// Modules run in name order, tests in the order their module defines them.
pub fn discover(
    suite: &Suite,
    dir: Option<&Path>,
    selector: &TestSelector,
) -> Result<TestRegistry, DiscoveryError> {
    let mut modules: Vec<TestModule> = suite.modules().to_vec();
    if let Some(dir) = dir {
        modules.extend(script::load_dir(dir)?);
    }
    if modules.is_empty() {
        return Err(DiscoveryError::NoTestFiles(
            dir.map_or_else(|| PathBuf::from("<compiled suite>"), Path::to_path_buf),
        ));
    }
    modules.sort_by(|a, b| a.name.cmp(&b.name));

    // Qualify every test before selecting so a duplicate is an error even
    // when the selector would only pick one of the pair.
    let mut all = Vec::new();
    let mut seen: HashMap<String, SourceLocation> = HashMap::new();
    for module in modules {
        for def in module.tests {
            let case = TestCase::new(
                0,
                &module.name,
                &module.path,
                def,
                module.setup.clone(),
                module.teardown.clone(),
            );
            if let Some(first) = seen.get(case.name()) {
                return Err(DiscoveryError::DuplicateName {
                    name: case.name().to_string(),
                    first: first.clone(),
                    second: case.location().clone(),
                });
            }
            seen.insert(case.name().to_string(), case.location().clone());
            all.push(case);
        }
    }
    let discovered = all.len();

    let cases: Vec<TestCase> = all
        .into_iter()
        .filter(|case| selector.matches(case))
        .enumerate()
        .map(|(index, case)| case.with_index(index))
        .collect();
    if cases.is_empty() {
        return Err(DiscoveryError::NothingSelected(selector.to_string()));
    }

    for case in &cases {
        debug!(index = case.index(), name = case.name(), location = %case.location(), "test registered");
    }
    info!(discovered, selected = cases.len(), selector = %selector, "discovery complete");
    Ok(TestRegistry { cases })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::TestResult;
    use crate::context::TestContext;
    use futures::future::BoxFuture;

    fn noop(_ctx: &TestContext) -> BoxFuture<'_, TestResult> {
        Box::pin(async { Ok(()) })
    }

    fn module(name: &str, tests: &[&str]) -> TestModule {
        tests
            .iter()
            .fold(TestModule::new(name), |m, t| m.test(TestDef::new(*t, noop)))
    }

    #[test]
    fn test_modules_sorted_tests_in_definition_order() {
        let suite = Suite::new()
            .with(module("test_z", &["test_b", "test_a"]))
            .with(module("test_a", &["test_c"]));

        let registry = discover(&suite, None, &TestSelector::All).unwrap();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, ["test_a.test_c", "test_z.test_b", "test_z.test_a"]);
        let indexes: Vec<usize> = registry.cases().iter().map(TestCase::index).collect();
        assert_eq!(indexes, [0, 1, 2]);
    }

    #[test]
    fn test_duplicate_names_rejected_even_when_unselected() {
        let suite = Suite::new()
            .with(module("test_m", &["test_x", "test_y"]))
            .with(module("test_m", &["test_x"]));

        let selector = TestSelector::parse("test_y");
        match discover(&suite, None, &selector) {
            Err(DiscoveryError::DuplicateName { name, .. }) => assert_eq!(name, "test_m.test_x"),
            other => panic!("expected duplicate error, got {:?}", other.map(|r| r.len())),
        }
    }

    #[test]
    fn test_selector_matches_module_qualified_and_short_names() {
        let suite = Suite::new()
            .with(module("test_blinky", &["test_led", "test_button"]))
            .with(module("test_battery", &["test_level"]));

        let by_module = discover(&suite, None, &TestSelector::parse("test_blinky")).unwrap();
        assert_eq!(by_module.len(), 2);

        let by_qualified =
            discover(&suite, None, &TestSelector::parse("test_blinky.test_button")).unwrap();
        assert_eq!(by_qualified.names().collect::<Vec<_>>(), ["test_blinky.test_button"]);
        assert_eq!(by_qualified.cases()[0].index(), 0);

        let by_short = discover(&suite, None, &TestSelector::parse("test_level")).unwrap();
        assert_eq!(by_short.names().collect::<Vec<_>>(), ["test_battery.test_level"]);

        let wildcard = discover(&suite, None, &TestSelector::parse("*.test_l*")).unwrap();
        assert_eq!(wildcard.len(), 2);
    }

    #[test]
    fn test_empty_selection_is_an_error() {
        let suite = Suite::new().with(module("test_blinky", &["test_led"]));
        let err = discover(&suite, None, &TestSelector::parse("test_nope")).unwrap_err();
        assert!(matches!(err, DiscoveryError::NothingSelected(ref s) if s == "test_nope"));
    }

    #[test]
    fn test_no_modules_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover(&Suite::new(), Some(dir.path()), &TestSelector::All).unwrap_err();
        assert!(matches!(err, DiscoveryError::NoTestFiles(_)));
    }

    #[test]
    fn test_selector_parsing() {
        assert_eq!(TestSelector::parse("all"), TestSelector::All);
        assert_eq!(TestSelector::parse("ALL"), TestSelector::All);
        assert_eq!(TestSelector::parse(""), TestSelector::All);
        assert_eq!(
            "test_blinky".parse::<TestSelector>().unwrap(),
            TestSelector::Pattern("test_blinky".into())
        );
    }
}
