//! Shutdown on SIGINT or SIGTERM.
//!
//! The gRPC servers stop accepting new requests once a signal is received and drain the
//! ones in flight.
use futures::future::select_all;
use std::future::Future;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, warn};

/// Shutdown signal handling.
pub struct Shutdown {}

impl Shutdown {
    /// Completes when the process receives SIGINT or SIGTERM.
    pub async fn wait() {
        match Self::listen(&[SignalKind::interrupt(), SignalKind::terminate()]) {
            Ok(signalled) => {
                let signal = signalled.await;
                warn!(?signal, "Signalled");
            }
            Err(error) => {
                error!(%error, "Failed to register the shutdown signal handlers");
                std::future::pending::<()>().await;
            }
        }
    }

    /// Register handlers for `kinds` and complete with the first one received.
    fn listen(kinds: &[SignalKind]) -> std::io::Result<impl Future<Output = SignalKind>> {
        let waits = kinds
            .iter()
            .map(|&kind| {
                let mut stream = signal(kind)?;
                Ok(Box::pin(async move {
                    stream.recv().await;
                    kind
                }))
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        Ok(async move { select_all(waits).await.0 })
    }
}
