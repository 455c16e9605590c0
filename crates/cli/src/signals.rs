//! Signal handling for cancelling a run.
//!
//! Listens for SIGTERM and SIGINT on Unix platforms and Ctrl+C on all
//! platforms. A signal sets the session's cancellation flag; the executor
//! then stops picking up new instructions and lets in-flight ones finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::style;

/// Wait for a termination signal (SIGTERM, SIGINT, or Ctrl+C).
///
/// Never resolves if no handler could be installed.
pub async fn wait_for_interrupt() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}

/// Set `flag` once a termination signal arrives.
pub async fn cancel_on_interrupt(flag: Arc<AtomicBool>) {
    wait_for_interrupt().await;
    flag.store(true, Ordering::SeqCst);
    eprintln!(
        "{}",
        style::warn("Interrupted: finishing files in progress, then stopping.")
    );
}
