use tokio_util::sync::CancellationToken;

/// Sleeps for `secs`, returning `true` if cancelled before the sleep elapsed.
pub async fn sleep_cancellable(secs: f64, cancel: &CancellationToken) -> bool {
    let duration = std::time::Duration::from_secs_f64(secs.max(0.0));
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.cancelled() => true,
    }
}
