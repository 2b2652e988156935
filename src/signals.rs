//! Cooperative shutdown wiring.
//!
//! SIGINT/SIGTERM flip a watch flag that the worker checks before each
//! record and the controller checks each monitor tick. Nothing is aborted
//! in place: a worker mid-batch abandons its batch through the retry path,
//! and the controller drives its own teardown.

use tokio::sync::watch;
use tracing::warn;

/// Install signal handlers and return a receiver that observes `true` once
/// shutdown has been requested.
pub fn shutdown_listener() -> std::io::Result<watch::Receiver<bool>> {
    let (tx, rx) = watch::channel(false);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = term.recv() => warn!("received SIGTERM, initiating shutdown"),
                _ = int.recv() => warn!("received SIGINT, initiating shutdown"),
            }
            let _ = tx.send(true);
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("received ctrl-c, initiating shutdown");
                let _ = tx.send(true);
            }
        });
    }

    Ok(rx)
}
