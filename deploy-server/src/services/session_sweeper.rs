use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically discard upload sessions the client abandoned.
pub fn start_session_sweeper(state: Arc<AppState>, cancel: CancellationToken) {
    let interval_secs = state.config.uploads.sweep_interval_secs.max(1);
    let max_idle = Duration::from_secs(state.config.uploads.session_idle_timeout_secs);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = state.sessions.sweep_idle(max_idle).await;
                    if removed > 0 {
                        tracing::info!(removed, active = state.sessions.active_sessions(), "Idle upload sessions discarded");
                    }
                }
            }
        }
        tracing::info!("Session sweeper stopped");
    });
}
