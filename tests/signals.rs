//! Interrupt forwarding, in its own test binary so the signals sent here
//! never reach pools installed by other tests.
#![cfg(unix)]

use std::time::Duration;

use charmguard::orchestrator::CancellationGuard;
use tokio_util::sync::CancellationToken;

async fn wait_cancelled(token: &CancellationToken) {
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("token was not cancelled");
}

#[tokio::test]
async fn test_sigint_terminates_pool_then_previous_scope() {
    let pool = CancellationToken::new();
    let previous = CancellationToken::new();
    let _guard = CancellationGuard::install(pool.clone(), previous.clone()).unwrap();

    // SAFETY: signalling our own process; the guard has a handler installed.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGINT);
    }

    wait_cancelled(&pool).await;
    wait_cancelled(&previous).await;
}

#[tokio::test]
async fn test_signal_after_drop_is_not_forwarded() {
    let pool = CancellationToken::new();
    let previous = CancellationToken::new();
    drop(CancellationGuard::install(pool.clone(), previous.clone()).unwrap());

    // The tokio handler stays registered, so the signal is swallowed.
    // SAFETY: as above.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTERM);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!pool.is_cancelled());
    assert!(!previous.is_cancelled());
}
