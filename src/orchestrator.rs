//! The test pipeline: fetch, classify, test, aggregate.
//!
//! # Architecture
//!
//! ```text
//!   test(url, revision)
//!         │
//!         │ Fetcher::fetch()                       (error ──► error node)
//!         ▼
//!   artifact directory ──► classify()
//!         │
//!         ├── Kind::Bundle ──► BundleTester ──► WorkerPool ──► SuiteRunner
//!         │                    (one invocation per bundle environment,
//!         │                     per selected deployment)
//!         │
//!         └── Kind::Charm ───► CharmTester
//!                                 │ 1. WorkerPool ──► SuiteRunner
//!                                 │    (one invocation per charm environment)
//!                                 │ 2. BundleIndex::bundles_for(name)
//!                                 │ 3. test(bundle url) with the charm swapped in
//!                                 ▼       (re-enters the pipeline)
//!                             ResultNode
//! ```
//!
//! Every step of a fan-out completes before the next begins: the charm's
//! own suite finishes before bundle discovery, and all environments of a
//! deployment finish before its verdict is reduced. Re-entry is bounded by
//! [`GuardianConfig::max_depth`](crate::config::GuardianConfig::max_depth)
//! and by refusing to revisit a URL already on the current path.
//!
//! # Example
//!
//! ```no_run
//! use charmguard::config::Config;
//! use charmguard::fetch::VcsFetcher;
//! use charmguard::orchestrator::{Orchestrator, TestOptions};
//! use charmguard::store::CharmworldIndex;
//! use charmguard::suite::BundletesterRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let orchestrator = Orchestrator::new(
//!         config.clone(),
//!         VcsFetcher::new(),
//!         BundletesterRunner::new(config.suite.clone()),
//!         CharmworldIndex::new(&config.store),
//!     );
//!
//!     let result = orchestrator
//!         .test("gh:charms/apache2", None, &TestOptions::default())
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&result)?);
//!     Ok(())
//! }
//! ```

pub mod bundle;
pub mod charm;
pub mod guard;
pub mod pool;

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::{ArtifactError, Kind, classify};
use crate::config::Config;
use crate::fetch::{FetchError, Fetcher};
use crate::report::{ResultNode, timestamp};
use crate::store::{BundleIndex, StoreError};
use crate::suite::SuiteRunner;

pub use bundle::BundleTester;
pub use charm::CharmTester;
pub use guard::CancellationGuard;
pub use pool::{PoolError, PoolOutcomes, WorkerPool};

/// Result type for pipeline operations.
pub type OrchestratorResult<T> = Result<T, TestError>;

/// Pipeline-wide failures.
///
/// Problems local to one suite invocation never surface here; they are
/// recorded as failing outcomes. Fetch failures are not errors either: they
/// become error nodes in the result tree.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// The fetched directory is not a testable artifact.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// Related bundles could not be looked up.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A swapped-in charm could not be turned into a branch.
    #[error("Failed to prepare charm branch: {0}")]
    Branch(#[source] FetchError),

    /// The run was interrupted.
    #[error("Test run interrupted")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PoolError> for TestError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Cancelled { .. } => TestError::Cancelled,
            PoolError::Signals(e) => TestError::Io(e),
        }
    }
}

/// Caller-controlled options of one test run.
#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    /// Skip testing related bundles of a charm.
    pub shallow: bool,

    /// Fetch into this directory and keep it afterwards. A temporary
    /// directory, removed after the run, is used otherwise.
    pub workspace: Option<PathBuf>,

    /// Deployment constraints passed to the suite binary.
    pub constraints: Option<String>,

    /// Bundle deployment to run instead of the configured selection.
    /// Applies to a top-level bundle only.
    pub deployment: Option<String>,
}

/// A charm to substitute into a bundle under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharmSwap {
    pub name: String,
    pub dir: PathBuf,
}

/// The chain of artifact URLs from the top-level run to the current one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lineage {
    urls: Vec<String>,
}

impl Lineage {
    /// Returns the lineage of `url` tested beneath this one.
    pub fn child(&self, url: &str) -> Self {
        let mut urls = self.urls.clone();
        urls.push(url.to_string());
        Self { urls }
    }

    /// Recursion depth; the top-level artifact is 0.
    pub fn depth(&self) -> usize {
        self.urls.len().saturating_sub(1)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.iter().any(|u| u == url)
    }
}

/// Coordinates fetching and testing of charms and bundles.
///
/// Generic over the three external collaborators so tests can substitute
/// them.
pub struct Orchestrator<F, R, I> {
    config: Config,
    fetcher: F,
    runner: R,
    index: I,
    token: CancellationToken,
}

impl<F, R, I> Orchestrator<F, R, I>
where
    F: Fetcher,
    R: SuiteRunner,
    I: BundleIndex,
{
    pub fn new(config: Config, fetcher: F, runner: R, index: I) -> Self {
        Self {
            config,
            fetcher,
            runner,
            index,
            token: CancellationToken::new(),
        }
    }

    /// Nests this orchestrator's work inside `token`'s cancellation scope.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that interrupts the run when cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fetches and tests the artifact at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error only for pipeline-wide failures; a fetch failure is
    /// reported as an error node.
    pub async fn test(
        &self,
        url: &str,
        revision: Option<&str>,
        options: &TestOptions,
    ) -> OrchestratorResult<ResultNode> {
        self.test_artifact(url, revision, options, None, &Lineage::default())
            .await
    }

    /// One pass of the pipeline for `url`, tested beneath `parent`.
    pub(crate) fn test_artifact<'a>(
        &'a self,
        url: &'a str,
        revision: Option<&'a str>,
        options: &'a TestOptions,
        swap: Option<&'a CharmSwap>,
        parent: &'a Lineage,
    ) -> BoxFuture<'a, OrchestratorResult<ResultNode>> {
        Box::pin(async move {
            if self.token.is_cancelled() {
                return Err(TestError::Cancelled);
            }
            let lineage = parent.child(url);

            // Held until the run finishes; dropping it removes the checkout.
            let scratch;
            let root: &Path = match &options.workspace {
                Some(workspace) => {
                    tokio::fs::create_dir_all(workspace).await?;
                    workspace
                }
                None => {
                    scratch = tempfile::Builder::new().prefix("charmguard-").tempdir()?;
                    scratch.path()
                }
            };

            info!("Fetching {} into {}", url, root.display());
            let fetched = tokio::select! {
                fetched = self.fetcher.fetch(url, revision, root) => fetched,
                _ = self.token.cancelled() => return Err(TestError::Cancelled),
            };
            let dir = match fetched {
                Ok(dir) => dir,
                Err(e) => {
                    warn!("Failed to fetch {}: {}", url, e);
                    return Ok(ResultNode::error(url, e.to_string()));
                }
            };

            let kind = classify(&dir)?;
            debug!("{} is a {}", dir.display(), kind);

            let started = timestamp();
            let node = match (kind, swap) {
                (Kind::Bundle, swap) => {
                    BundleTester::new(&dir, &self.config, &self.runner, &self.token)
                        .test(options, swap)
                        .await?
                }
                (Kind::Charm, None) => {
                    CharmTester::new(self, &dir)
                        .await?
                        .test(options, &lineage)
                        .await?
                }
                (Kind::Charm, Some(_)) => {
                    return Err(ArtifactError::UnexpectedKind {
                        path: dir,
                        expected: Kind::Bundle,
                        found: Kind::Charm,
                    }
                    .into());
                }
            };
            let finished = timestamp();

            let resolved = match self.fetcher.revision(url, revision, &dir).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("Failed to resolve revision of {}: {}", url, e);
                    revision.map(str::to_string)
                }
            };

            info!("{} {}: {:?}", kind, url, node.result);
            Ok(node.with_run(url, resolved, started, finished))
        })
    }
}
