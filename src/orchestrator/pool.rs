//! Bounded worker pool for suite invocations.
//!
//! The [`WorkerPool`] runs a batch of independent [`TestInvocation`]s with at
//! most `max_workers` suite processes alive at once, and collects their
//! outcomes keyed by invocation id. Each pool owns a child cancellation token
//! of its enclosing scope; terminating the pool cancels every outstanding
//! invocation, and a [`CancellationGuard`] wires SIGINT/SIGTERM to that token
//! while [`run`](WorkerPool::run) is in progress.
//!
//! # Example
//!
//! ```no_run
//! use charmguard::orchestrator::WorkerPool;
//! use charmguard::suite::{BundletesterRunner, TestInvocation};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let root = CancellationToken::new();
//! let runner = BundletesterRunner::new(Default::default());
//! let pool = WorkerPool::new(4, &root);
//!
//! let outcomes = pool
//!     .run(&runner, vec![
//!         TestInvocation::new("/tmp/mysql", "local"),
//!         TestInvocation::new("/tmp/mysql", "amazon"),
//!     ])
//!     .await?;
//! println!("local: {:?}", outcomes["local"]);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::guard::CancellationGuard;
use crate::suite::{SuiteError, SuiteRunner, TestCaseOutcome, TestInvocation};

/// Result type for worker pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that abort a whole fan-out.
///
/// Failures of individual invocations are not errors at this level; they
/// are recorded as failing outcomes.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool was terminated before every invocation finished.
    #[error("Worker pool terminated with {abandoned} invocation(s) outstanding")]
    Cancelled { abandoned: usize },

    /// Interrupt handling could not be installed.
    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Outcomes of one fan-out, keyed by invocation id.
pub type PoolOutcomes = BTreeMap<String, Vec<TestCaseOutcome>>;

/// Runs suite invocations concurrently with bounded parallelism.
pub struct WorkerPool {
    max_workers: usize,
    token: CancellationToken,
    parent: CancellationToken,
}

impl WorkerPool {
    /// Creates a pool running at most `max_workers` invocations at once,
    /// nested inside the cancellation scope `parent`.
    pub fn new(max_workers: usize, parent: &CancellationToken) -> Self {
        Self {
            max_workers: max_workers.max(1),
            token: parent.child_token(),
            parent: parent.clone(),
        }
    }

    /// Returns the token cancelled when this pool terminates.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Terminates all outstanding invocations.
    ///
    /// A concurrent [`run`](Self::run) returns [`PoolError::Cancelled`] once
    /// every child process has been stopped.
    pub fn terminate(&self) {
        self.token.cancel();
    }

    /// Runs every invocation and waits for all of them.
    ///
    /// Invocation ids must be unique within one call; a later duplicate
    /// replaces an earlier one in the returned map.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Cancelled`] if the pool was terminated (by
    ///   [`terminate`](Self::terminate), a signal, or the parent scope)
    /// - [`PoolError::Signals`] if interrupt handling could not be set up
    pub async fn run(
        &self,
        runner: &dyn SuiteRunner,
        invocations: Vec<TestInvocation>,
    ) -> PoolResult<PoolOutcomes> {
        if self.token.is_cancelled() {
            return Err(PoolError::Cancelled {
                abandoned: invocations.len(),
            });
        }

        let _guard = CancellationGuard::install(self.token.clone(), self.parent.clone())
            .map_err(PoolError::Signals)?;

        let token = &self.token;
        let results: Vec<_> = stream::iter(invocations)
            .map(|invocation: TestInvocation| async move {
                if token.is_cancelled() {
                    return (invocation, Err(SuiteError::Cancelled));
                }
                debug!(
                    "Starting {} for {} in env {}",
                    runner.name(),
                    invocation.dir.display(),
                    invocation.env
                );
                let result = runner.run(&invocation, token).await;
                (invocation, result)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        if self.token.is_cancelled() {
            let abandoned = results
                .iter()
                .filter(|(_, result)| matches!(result, Err(SuiteError::Cancelled)))
                .count();
            warn!(
                "Worker pool terminated, {} of {} invocation(s) abandoned",
                abandoned,
                results.len()
            );
            return Err(PoolError::Cancelled { abandoned });
        }

        let mut outcomes = PoolOutcomes::new();
        for (invocation, result) in results {
            let records = match result {
                Ok(records) => records,
                Err(SuiteError::Cancelled) => {
                    return Err(PoolError::Cancelled { abandoned: 1 });
                }
                Err(e) => {
                    error!(
                        "{} invocation {} failed: {}",
                        runner.name(),
                        invocation.id,
                        e
                    );
                    vec![TestCaseOutcome::invocation_failure(
                        Vec::new(),
                        1,
                        format!("{} failed: {}", runner.name(), e),
                        invocation.dir.display().to_string(),
                    )]
                }
            };
            outcomes.insert(invocation.id, records);
        }

        Ok(outcomes)
    }
}
