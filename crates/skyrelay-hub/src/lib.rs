//! Fan-out of the latest telemetry sample to live subscribers.

pub mod doctor;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use skyrelay_fc::state::{LinkView, SampleSlot};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Delivery period per subscriber.
    pub tick_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { tick_ms: 100 }
    }
}

impl HubConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Error)]
#[error("subscriber closed: {0}")]
pub struct SinkClosed(pub String);

/// Where one subscriber's JSON messages go.
#[async_trait]
pub trait SampleSink: Send {
    async fn send(&mut self, json: String) -> Result<(), SinkClosed>;
}

#[async_trait]
impl SampleSink for mpsc::Sender<String> {
    async fn send(&mut self, json: String) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, json).await.map_err(|_| SinkClosed("receiver dropped".into()))
    }
}

#[derive(Debug, Serialize)]
pub struct HubStatus {
    pub connected: bool,
    #[serde(serialize_with = "sample_or_empty")]
    pub telemetry: SampleSlot,
    pub clients: usize,
}

fn sample_or_empty<S: Serializer>(slot: &SampleSlot, s: S) -> Result<S::Ok, S::Error> {
    match slot {
        Some(sample) => sample.as_ref().serialize(s),
        None => s.serialize_map(Some(0))?.end(),
    }
}

type Active = Arc<Mutex<HashSet<u64>>>;

fn locked(active: &Active) -> MutexGuard<'_, HashSet<u64>> {
    active.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the subscriber however its delivery loop ends, including the
/// future being dropped mid-await.
struct Registration {
    id: u64,
    active: Active,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let left = {
            let mut set = locked(&self.active);
            set.remove(&self.id);
            set.len()
        };
        info!("hub: subscriber {} left ({} remaining)", self.id, left);
    }
}

pub struct TelemetryHub {
    view: LinkView,
    tick: Duration,
    next_id: AtomicU64,
    active: Active,
}

impl TelemetryHub {
    pub fn new(view: LinkView, tick: Duration) -> Self {
        Self { view, tick, next_id: AtomicU64::new(1), active: Arc::new(Mutex::new(HashSet::new())) }
    }

    fn register(&self) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = {
            let mut set = locked(&self.active);
            set.insert(id);
            set.len()
        };
        info!("hub: subscriber {} joined ({} active)", id, count);
        Registration { id, active: Arc::clone(&self.active) }
    }

    /// Delivers the latest sample to `sink` every tick while the link is
    /// connected. Returns once the sink fails.
    pub async fn serve<S: SampleSink + ?Sized>(&self, sink: &mut S) {
        let reg = self.register();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.view.is_connected() {
                continue;
            }
            let Some(sample) = self.view.latest() else { continue; };
            let json = match serde_json::to_string(sample.as_ref()) {
                Ok(j) => j,
                Err(e) => {
                    warn!("hub: cannot serialise sample: {}", e);
                    continue;
                }
            };
            if let Err(e) = sink.send(json).await {
                info!("hub: dropping subscriber {}: {}", reg.id, e);
                return;
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        locked(&self.active).len()
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            connected: self.view.is_connected(),
            telemetry: self.view.latest(),
            clients: self.subscriber_count(),
        }
    }
}
