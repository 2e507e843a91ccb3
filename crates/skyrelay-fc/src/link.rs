//! Connection supervisor for the vehicle telemetry link.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use skyrelay_proto::link::ConnectionState;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::state::{self, LinkView, LinkWriter, SamplePublisher};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("vehicle unreachable: {0}")]
    Unreachable(String),
    #[error("telemetry stream lost: {0}")]
    StreamLost(String),
}

/// Where telemetry comes from: a live MAVLink endpoint or the mock generator.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<(), LinkError>;

    /// Runs the acquisition until the stream ends. Only one acquisition is
    /// active at a time.
    async fn acquire(&self, samples: SamplePublisher) -> Result<(), LinkError>;
}

pub struct VehicleLink {
    source: Arc<dyn TelemetrySource>,
    backoff: Duration,
    writer: LinkWriter,
}

impl VehicleLink {
    pub fn new(source: Arc<dyn TelemetrySource>, backoff: Duration) -> (Self, LinkView) {
        let (writer, view) = state::channel();
        (Self { source, backoff, writer }, view)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.supervise())
    }

    async fn supervise(self) {
        let mut attempt = ConnectionState::Connecting;
        loop {
            self.writer.set_state(attempt);
            info!("vehicle: connecting to {}", self.source.describe());

            match self.source.connect().await {
                Ok(()) => {
                    self.writer.set_state(ConnectionState::Connected);
                    info!("vehicle: connected");
                    match self.source.acquire(self.writer.samples()).await {
                        Ok(()) => warn!("vehicle: telemetry stream ended"),
                        Err(e) => warn!("vehicle: {}", e),
                    }
                }
                Err(e) => error!("vehicle: connection error: {}", e),
            }

            self.writer.set_state(ConnectionState::Disconnected);
            info!("vehicle: retrying in {}s", self.backoff.as_secs_f32());
            tokio::time::sleep(self.backoff).await;
            attempt = ConnectionState::Reconnecting;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSource;
    use tokio::time::{sleep, timeout, Instant};

    const BACKOFF: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn mock_link_connects_and_publishes() {
        let mock = Arc::new(MockSource::new(Duration::from_millis(100)));
        let (link, mut view) = VehicleLink::new(mock.clone(), BACKOFF);
        let task = link.spawn();

        view.wait_for_state(ConnectionState::Connected).await;
        sleep(Duration::from_millis(550)).await;
        assert!(mock.ticks() >= 5);
        let sample = view.latest().unwrap();
        assert!(sample.connected);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_one_backoff_after_outage() {
        let mock = Arc::new(MockSource::new(Duration::from_millis(100)));
        let (link, mut view) = VehicleLink::new(mock.clone(), BACKOFF);
        let task = link.spawn();
        view.wait_for_state(ConnectionState::Connected).await;

        mock.set_online(false);
        view.wait_for_state(ConnectionState::Disconnected).await;
        sleep(BACKOFF * 3).await;
        assert!(!view.is_connected());
        let ticks_during_outage = mock.ticks();

        mock.set_online(true);
        let recovered_at = Instant::now();
        timeout(BACKOFF + Duration::from_millis(100), view.wait_for_state(ConnectionState::Connected))
            .await
            .expect("link did not come back within one backoff");
        assert!(recovered_at.elapsed() <= BACKOFF);

        sleep(Duration::from_millis(350)).await;
        assert!(mock.ticks() > ticks_during_outage, "samples did not resume");
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_source_keeps_retrying() {
        let mock = Arc::new(MockSource::new(Duration::from_millis(100)));
        mock.set_online(false);
        let (link, mut view) = VehicleLink::new(mock.clone(), BACKOFF);
        let task = link.spawn();

        sleep(Duration::from_millis(10)).await;
        view.wait_for_state(ConnectionState::Disconnected).await;
        sleep(BACKOFF + Duration::from_millis(10)).await;
        // second attempt is labelled as a reconnect, then fails again
        assert!(matches!(view.state(), ConnectionState::Disconnected | ConnectionState::Reconnecting));
        assert!(mock.connect_attempts() >= 2);
        assert!(view.latest().is_none());
        task.abort();
    }
}
