use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is
/// received. `PoolRunner::run_loop` only checks the token between passes, so
/// a pass already dispatching jobs runs to completion first. The loop then
/// stops the idle workers and returns.
pub fn install_shutdown_handler() -> std::io::Result<CancellationToken> {
    let token = CancellationToken::new();
    let token_clone = token.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping after the current pass");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping after the current pass");
            }
        }

        token_clone.cancel();
    });

    Ok(token)
}
