use crate::client::BackgroundClient;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Sends an app status update every `interval` until `shutdown` flips to true.
/// The first tick fires one interval after spawning; `init` sends the immediate one.
pub fn spawn_status_reporter(
    client: BackgroundClient,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = client.send_app_status() {
                tracing::debug!(error = %err, "skipping app status update");
            }
        }
        tracing::debug!("status reporter stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use crate::dispatch::{DispatchSink, FeatureFlags, InMemoryStore};
    use crate::transport::DuplexConnector;
    use std::sync::Arc;

    #[tokio::test]
    async fn reporter_exits_once_shutdown_is_signalled() {
        let (connector, _peers) = DuplexConnector::new(1024);
        let sink = DispatchSink::new(Arc::new(InMemoryStore::new()), Arc::new(FeatureFlags::new()));
        let (_visible, visibility) = watch::channel(true);
        let client =
            BackgroundClient::new(ClientOptions::default(), Arc::new(connector), sink, visibility);

        let (stop, stop_rx) = watch::channel(false);
        let task = spawn_status_reporter(client, Duration::from_millis(10), stop_rx);
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert!(!task.is_finished());

        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reporter stops")
            .unwrap();
    }
}
