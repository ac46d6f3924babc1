//! Suite runner traits and outcome records.
//!
//! A suite runner executes one test suite for one (directory, environment)
//! pair and returns the individual test-case outcomes it reported. The
//! default implementation, [`bundletester::BundletesterRunner`], drives the
//! external `bundletester` binary.
//!
//! ```text
//!   TestInvocation ──► SuiteRunner::run() ──► Vec<TestCaseOutcome>
//!                            │
//!                            ├── exit 0 / report written   → parsed report
//!                            ├── "no tests" exit status     → empty list
//!                            └── failure, no usable report  → one synthesized failure
//! ```

pub mod bundletester;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use bundletester::BundletesterRunner;

/// Result type for suite runner operations.
pub type SuiteResult<T> = Result<T, SuiteError>;

/// Errors that can occur while running a single suite invocation.
///
/// None of these abort a whole test run: the worker pool turns every
/// variant except [`Cancelled`](SuiteError::Cancelled) into one failing
/// outcome for the invocation that produced it.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    /// The suite binary could not be started.
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The suite binary reported success but its report is unusable.
    #[error("Failed to parse report {}: {source}", path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The invocation was terminated before it finished.
    #[error("Suite invocation cancelled")]
    Cancelled,

    /// I/O error handling scratch files or waiting on the child.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One unit of concurrent work: a suite run in one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestInvocation {
    /// Key under which the pool reports this invocation's outcomes.
    pub id: String,

    /// Directory containing the charm or bundle under test.
    pub dir: PathBuf,

    /// Target environment name.
    pub env: String,

    /// Bundle deployment to run, if any.
    pub deployment: Option<String>,

    /// Suite name to exclude from the run.
    pub exclude: Option<String>,

    /// Skip the implicit per-charm suites of a bundle.
    pub skip_implicit: bool,

    /// Deployment constraints forwarded to the suite binary.
    pub constraints: Option<String>,
}

impl TestInvocation {
    /// Creates an invocation for `dir` in `env`, keyed by the environment name.
    pub fn new(dir: impl Into<PathBuf>, env: impl Into<String>) -> Self {
        let env = env.into();
        Self {
            id: env.clone(),
            dir: dir.into(),
            env,
            deployment: None,
            exclude: None,
            skip_implicit: false,
            constraints: None,
        }
    }

    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = Some(deployment.into());
        self
    }

    pub fn with_exclude(mut self, exclude: Option<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn skip_implicit(mut self) -> Self {
        self.skip_implicit = true;
        self
    }

    pub fn with_constraints(mut self, constraints: Option<String>) -> Self {
        self.constraints = constraints;
        self
    }
}

/// A single test-case record as reported by the suite binary.
///
/// The field set mirrors the binary's JSON report. Fields this crate does
/// not know about are kept in `extra` and written back out unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseOutcome {
    /// Command line that ran the test.
    #[serde(default)]
    pub executable: Vec<String>,

    /// Exit status of the test; non-zero is a failure.
    #[serde(default)]
    pub returncode: i32,

    /// Duration in seconds.
    #[serde(default)]
    pub duration: f64,

    /// Suite the test belongs to.
    #[serde(default)]
    pub suite: String,

    /// Test name.
    #[serde(default)]
    pub test: String,

    /// Captured output.
    #[serde(default)]
    pub output: String,

    /// Directory the test ran in.
    #[serde(default)]
    pub dirname: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TestCaseOutcome {
    /// Creates a record for `test` with the given exit status.
    pub fn new(test: impl Into<String>, returncode: i32) -> Self {
        Self {
            executable: Vec::new(),
            returncode,
            duration: 0.0,
            suite: String::new(),
            test: test.into(),
            output: String::new(),
            dirname: String::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Synthesizes the single failing record for an invocation that could
    /// not produce a report.
    pub fn invocation_failure(
        executable: Vec<String>,
        returncode: i32,
        output: impl Into<String>,
        dirname: impl Into<String>,
    ) -> Self {
        Self {
            executable,
            returncode: if returncode == 0 { 1 } else { returncode },
            output: output.into(),
            dirname: dirname.into(),
            ..Self::new("", 1)
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.suite = suite.into();
        self
    }

    /// Returns `true` if this record represents a failing test.
    pub fn is_failure(&self) -> bool {
        self.returncode != 0
    }
}

/// Executes one suite invocation.
///
/// Implementations must honour `cancel`: once it fires, any child process
/// is terminated and [`SuiteError::Cancelled`] is returned.
///
/// # Example Implementation
///
/// ```
/// use async_trait::async_trait;
/// use charmguard::suite::*;
/// use tokio_util::sync::CancellationToken;
///
/// struct AlwaysPasses;
///
/// #[async_trait]
/// impl SuiteRunner for AlwaysPasses {
///     async fn run(
///         &self,
///         invocation: &TestInvocation,
///         _cancel: &CancellationToken,
///     ) -> SuiteResult<Vec<TestCaseOutcome>> {
///         Ok(vec![TestCaseOutcome::new(format!("smoke-{}", invocation.env), 0)])
///     }
/// }
/// ```
#[async_trait]
pub trait SuiteRunner: Send + Sync {
    /// Runs the suite described by `invocation`.
    async fn run(
        &self,
        invocation: &TestInvocation,
        cancel: &CancellationToken,
    ) -> SuiteResult<Vec<TestCaseOutcome>>;

    /// Returns a short name for log messages.
    fn name(&self) -> &str {
        "suite"
    }
}
