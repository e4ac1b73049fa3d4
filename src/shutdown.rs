use tokio_util::sync::CancellationToken;

/// Everything that watches the shutdown token, in the order it drains:
/// the scheduler loop cancels its task runners and waits for their final
/// EndTask appends, the API server stops accepting requests, and the
/// worker stats samplers exit.
const DRAIN_TARGETS: [&str; 3] = ["scheduler", "api", "worker stats"];

/// Returns a token that is cancelled once SIGTERM or SIGINT arrives.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        match first_termination_signal().await {
            Ok(signal) => {
                tracing::info!(signal, draining = ?DRAIN_TARGETS, "Shutdown requested");
                trigger.cancel();
            }
            Err(e) => {
                // Without signal handlers the process only stops by kill;
                // sagas recover on the next start either way.
                tracing::error!(error = %e, "Could not install signal handlers");
            }
        }
    });

    token
}

async fn first_termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}
