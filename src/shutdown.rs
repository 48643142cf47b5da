use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGINT and SIGTERM.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. The node loops and the HTTP server both watch this token.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            sigterm.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = terminate => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        handler.cancel();
    });

    token
}
