use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Returns a token that is cancelled on SIGINT or SIGTERM.
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl+C will stop the consumer");
            let _ = tokio::signal::ctrl_c().await;
            info!("terminating: via signal");
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("terminating: received SIGINT"),
        _ = sigterm.recv() => info!("terminating: received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("terminating: received Ctrl+C");
}
