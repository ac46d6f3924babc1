//! charmguard: test orchestration for Juju charms and bundles.
//!
//! A charm is tested on its own in every configured environment and then,
//! recursively, inside every promulgated bundle that deploys it, with the
//! revision under test swapped in. A bundle is tested by running its
//! deployment(s) in every configured bundle environment. Suite runs within
//! one step execute concurrently; the outcome is a single `pass`/`fail`
//! verdict plus the full result tree.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Fetch**: Obtain an artifact from bzr, git, hg, a local path or the
//!   charm store, and resolve its revision
//! - **Artifact**: Classify a fetched directory and read/rewrite its
//!   descriptors
//! - **Suite**: Run the external suite binary for one directory/environment
//! - **Orchestrator**: Worker pool, cancellation, charm and bundle testers
//! - **Store**: Find published bundles that deploy a charm
//! - **Report**: The result tree and verdict reduction
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
//!     let result = orchestrator
//!         .test("lp:~charmers/charms/precise/ghost/trunk", None, &TestOptions::default())
//!         .await?;
//!     std::process::exit(if result.is_fail() { 1 } else { 0 });
//! }
//! ```

pub mod artifact;
pub mod config;
pub mod fetch;
pub mod orchestrator;
pub mod report;
pub mod store;
pub mod suite;

// Re-export commonly used types
pub use artifact::Kind;
pub use config::{Config, load_config};
pub use fetch::{FetchError, Fetcher};
pub use orchestrator::{Orchestrator, TestError, TestOptions};
pub use report::{ResultNode, Verdict};
pub use store::BundleIndex;
pub use suite::{SuiteRunner, TestCaseOutcome, TestInvocation};
