//! Synthetic vehicle for running without a simulator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use skyrelay_proto::telemetry::{Attitude, Battery, Health, Position, TelemetrySample, Velocity};
use time::OffsetDateTime;
use tracing::info;

use crate::actions::{CommandError, VehicleActions};
use crate::link::{LinkError, TelemetrySource};
use crate::state::SamplePublisher;

// Zurich, the PX4 SITL default home.
const HOME_LAT: f64 = 47.3977;
const HOME_LON: f64 = 8.5456;

/// Deterministic sample for tick `counter`: a slow circle around home with a
/// bobbing altitude, a draining battery, and a mode flip every 100 ticks.
pub fn mock_sample(counter: u64, timestamp: OffsetDateTime) -> TelemetrySample {
    let c = counter as f64;
    let t = c * 0.1;

    TelemetrySample {
        timestamp,
        connected: true,
        position: Position {
            lat: HOME_LAT + (t * 0.1).sin() * 0.001,
            lon: HOME_LON + (t * 0.1).cos() * 0.001,
            relative_alt_m: (50.0 + (t * 0.2).sin() * 20.0) as f32,
            absolute_alt_m: (450.0 + (t * 0.2).sin() * 20.0) as f32,
        },
        attitude: Attitude {
            roll_deg: ((t * 0.3).sin() * 15.0) as f32,
            pitch_deg: ((t * 0.25).cos() * 10.0) as f32,
            yaw_deg: ((t * 10.0) % 360.0) as f32,
        },
        velocity: Velocity {
            north_m_s: (5.0 + (t * 0.15).sin() * 3.0) as f32,
            east_m_s: (3.0 + (t * 0.15).cos() * 2.0) as f32,
            down_m_s: 0.0,
        },
        battery: Battery {
            voltage_v: (12.6 - c * 0.0001) as f32,
            remaining_percent: (100.0 - c * 0.01).max(20.0) as f32,
        },
        flight_mode: if counter % 200 < 100 { "GUIDED" } else { "STABILIZE" }.to_string(),
        health: Health::all_ok(),
    }
}

pub struct MockSource {
    period: Duration,
    online: AtomicBool,
    counter: AtomicU64,
    attempts: AtomicU64,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl MockSource {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            online: AtomicBool::new(true),
            counter: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    /// Simulated connectivity. Going offline ends the running acquisition
    /// and fails connects until it comes back.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn ticks(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for MockSource {
    fn describe(&self) -> String {
        "mock vehicle".into()
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.online.load(Ordering::SeqCst) {
            info!("vehicle: mock mode, generating synthetic telemetry");
            Ok(())
        } else {
            Err(LinkError::Unreachable("mock vehicle offline".into()))
        }
    }

    async fn acquire(&self, samples: SamplePublisher) -> Result<(), LinkError> {
        loop {
            if !self.online.load(Ordering::SeqCst) {
                return Err(LinkError::StreamLost("mock vehicle went offline".into()));
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            samples.publish(mock_sample(n, OffsetDateTime::now_utc()));
            tokio::time::sleep(self.period).await;
        }
    }
}

/// The mock vehicle accepts everything.
#[async_trait]
impl VehicleActions for MockSource {
    async fn arm(&self) -> Result<(), CommandError> {
        Ok(())
    }

    async fn disarm(&self) -> Result<(), CommandError> {
        Ok(())
    }

    async fn takeoff(&self, _altitude_m: f32) -> Result<(), CommandError> {
        Ok(())
    }

    async fn land(&self) -> Result<(), CommandError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(counter: u64) -> TelemetrySample {
        mock_sample(counter, OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn flight_mode_alternates_every_hundred_ticks() {
        let modes: Vec<String> = (0..400).map(|c| at(c).flight_mode).collect();
        assert!(modes[..100].iter().all(|m| m == "GUIDED"));
        assert!(modes[100..200].iter().all(|m| m == "STABILIZE"));
        assert!(modes[200..300].iter().all(|m| m == "GUIDED"));
        assert!(modes[300..].iter().all(|m| m == "STABILIZE"));
    }

    #[test]
    fn battery_drains_to_a_floor() {
        assert_eq!(at(0).battery.remaining_percent, 100.0);
        assert!((at(1000).battery.remaining_percent - 90.0).abs() < 1e-3);
        assert_eq!(at(100_000).battery.remaining_percent, 20.0);
        assert!(at(1000).battery.voltage_v < at(0).battery.voltage_v);
    }

    #[test]
    fn stays_near_home() {
        for c in (0..5000).step_by(37) {
            let s = at(c);
            assert!((s.position.lat - HOME_LAT).abs() <= 0.001 + 1e-9);
            assert!((s.position.lon - HOME_LON).abs() <= 0.001 + 1e-9);
            assert!((30.0..=70.0).contains(&s.position.relative_alt_m));
            assert!((0.0..360.0).contains(&s.attitude.yaw_deg));
            assert!(s.health.is_armable);
        }
    }

    #[test]
    fn same_tick_same_sample() {
        assert_eq!(at(42), at(42));
        assert_ne!(at(42).position, at(43).position);
    }
}
