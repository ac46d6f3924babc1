//! Scoped interrupt handling for worker pools.
//!
//! A [`CancellationGuard`] listens for SIGINT and SIGTERM while a pool is
//! running. On a signal it first terminates the pool (cancelling the pool's
//! token, which makes every in-flight invocation kill its child), then
//! forwards the interruption to the enclosing scope by cancelling the
//! previous token. Dropping the guard stops listening, which hands signal
//! handling back to whatever listened before.
//!
//! ```text
//!   signal ──► guard ──► pool token.cancel()      (children terminated)
//!                   └──► previous token.cancel()  (outer scope unwinds)
//! ```

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Forwards SIGINT/SIGTERM to a pool for as long as the guard lives.
pub struct CancellationGuard {
    listener: JoinHandle<()>,
}

impl CancellationGuard {
    /// Starts listening for interrupts on behalf of `pool`.
    ///
    /// `previous` is the token of the enclosing scope; it is cancelled after
    /// the pool so outer cleanup still runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal handlers cannot be registered.
    pub fn install(
        pool: CancellationToken,
        previous: CancellationToken,
    ) -> std::io::Result<Self> {
        #[cfg(unix)]
        let listener = {
            use tokio::signal::unix::{SignalKind, signal};

            let mut interrupt = signal(SignalKind::interrupt())?;
            let mut terminate = signal(SignalKind::terminate())?;
            tokio::spawn(async move {
                let name = tokio::select! {
                    _ = interrupt.recv() => "SIGINT",
                    _ = terminate.recv() => "SIGTERM",
                    _ = pool.cancelled() => return,
                };
                warn!("Received {}, terminating running suites", name);
                pool.cancel();
                previous.cancel();
            })
        };

        #[cfg(not(unix))]
        let listener = tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        warn!("Received interrupt, terminating running suites");
                        pool.cancel();
                        previous.cancel();
                    }
                }
                _ = pool.cancelled() => {}
            }
        });

        Ok(Self { listener })
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_does_not_cancel_without_signal() {
        let pool = CancellationToken::new();
        let previous = CancellationToken::new();

        {
            let _guard = CancellationGuard::install(pool.clone(), previous.clone()).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!pool.is_cancelled());
        assert!(!previous.is_cancelled());
    }

    #[tokio::test]
    async fn test_listener_exits_when_pool_cancelled() {
        let pool = CancellationToken::new();
        let previous = CancellationToken::new();
        let guard = CancellationGuard::install(pool.clone(), previous.clone()).unwrap();

        pool.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !guard.listener.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Cancelling the pool itself must not leak into the outer scope.
        assert!(!previous.is_cancelled());
    }
}
