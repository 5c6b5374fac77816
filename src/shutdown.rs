//! Signal handling for a sync run.
//!
//! The first SIGINT (Ctrl+C), SIGTERM or SIGHUP cancels the returned
//! [`CancellationToken`]; the orchestrator then fails in-flight items and
//! closes the run. A second signal force-exits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Wait for the next shutdown signal. Returns `false` if no signal source
/// could be registered.
async fn next_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sighup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hup)) => (term, hup),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "Failed to register signal handlers, Ctrl+C only");
                    return tokio::signal::ctrl_c().await.is_ok();
                }
            };
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.is_ok(),
            _ = sigterm.recv() => true,
            _ = sighup.recv() => true,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.is_ok()
    }
}

/// Install signal handlers and return the token they cancel.
pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            if !next_signal().await {
                tracing::warn!("Signal listener failed, sync can only be stopped by killing the process");
                return;
            }

            let prev = count.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                tracing::info!("Received shutdown signal, cancelling sync...");
                tracing::info!("Press Ctrl+C again to force exit");
                handler_token.cancel();
            } else {
                tracing::warn!("Force exit requested");
                std::process::exit(130);
            }
        }
    });

    token
}
