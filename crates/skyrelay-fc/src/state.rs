//! Latest-sample cache and link state, written by the supervisor only.

use std::sync::Arc;

use skyrelay_proto::link::ConnectionState;
use skyrelay_proto::telemetry::TelemetrySample;
use tokio::sync::watch;
use tracing::debug;

pub type SampleSlot = Option<Arc<TelemetrySample>>;

pub fn channel() -> (LinkWriter, LinkView) {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (sample_tx, sample_rx) = watch::channel(None);
    let writer = LinkWriter { state: state_tx, samples: SamplePublisher { tx: Arc::new(sample_tx) } };
    let view = LinkView { state: state_rx, sample: sample_rx };
    (writer, view)
}

/// Handed to the active acquisition so it can publish without owning the
/// connection state.
#[derive(Clone)]
pub struct SamplePublisher {
    tx: Arc<watch::Sender<SampleSlot>>,
}

impl SamplePublisher {
    /// Replaces the cached sample in one step.
    pub fn publish(&self, sample: TelemetrySample) {
        self.tx.send_replace(Some(Arc::new(sample)));
    }
}

pub struct LinkWriter {
    state: watch::Sender<ConnectionState>,
    samples: SamplePublisher,
}

impl LinkWriter {
    pub fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!("vehicle: link {} -> {}", prev, next);
        }
    }

    pub fn samples(&self) -> SamplePublisher {
        self.samples.clone()
    }

    pub fn view(&self) -> LinkView {
        LinkView { state: self.state.subscribe(), sample: self.samples.tx.subscribe() }
    }
}

#[derive(Clone)]
pub struct LinkView {
    state: watch::Receiver<ConnectionState>,
    sample: watch::Receiver<SampleSlot>,
}

impl LinkView {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn latest(&self) -> SampleSlot {
        self.sample.borrow().clone()
    }

    /// Resolves once the link reaches `want`. Returns immediately if it is
    /// already there; returns early if the writer is gone.
    #[cfg(test)]
    pub(crate) async fn wait_for_state(&mut self, want: ConnectionState) {
        loop {
            if *self.state.borrow_and_update() == want {
                return;
            }
            if self.state.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_sample;
    use time::OffsetDateTime;

    #[test]
    fn readers_see_whole_published_samples() {
        let (writer, view) = channel();
        assert!(view.latest().is_none());
        assert_eq!(view.state(), ConnectionState::Disconnected);

        let publisher = writer.samples();
        publisher.publish(mock_sample(1, OffsetDateTime::UNIX_EPOCH));
        let held = view.latest().unwrap();
        publisher.publish(mock_sample(2, OffsetDateTime::UNIX_EPOCH));

        // an Arc taken earlier is unaffected by later publishes
        assert_eq!(held.as_ref(), &mock_sample(1, OffsetDateTime::UNIX_EPOCH));
        assert_eq!(view.latest().unwrap().as_ref(), &mock_sample(2, OffsetDateTime::UNIX_EPOCH));
    }

    #[tokio::test]
    async fn wait_for_state_tracks_writer() {
        let (writer, mut view) = channel();
        writer.set_state(ConnectionState::Connected);
        view.wait_for_state(ConnectionState::Connected).await;
        assert!(view.is_connected());

        let mut second = writer.view();
        drop(writer);
        // writer gone: returns instead of hanging
        second.wait_for_state(ConnectionState::Reconnecting).await;
    }
}
