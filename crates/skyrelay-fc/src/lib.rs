pub mod actions;
pub mod doctor;
pub mod link;
pub mod mav;
pub mod mock;
pub mod state;

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    /// Generate synthetic telemetry instead of talking to a vehicle.
    pub mock: bool,

    /// MAVLink connection string, e.g. "udpin:0.0.0.0:14540" for PX4 SITL,
    /// "tcpout:127.0.0.1:5760" or "serial:/dev/ttyACM0:57600".
    pub address: String,

    /// Fixed delay between reconnect attempts.
    pub reconnect_backoff_ms: u64,

    /// Minimum spacing between published samples.
    pub sample_period_ms: u64,

    /// How long a connect attempt waits for the first vehicle HEARTBEAT.
    pub heartbeat_timeout_ms: u64,

    /// Silence on an established link longer than this counts as a lost stream.
    pub stream_timeout_ms: u64,

    /// MAVLink ids we use (ground station side).
    pub sys_id: u8,
    pub comp_id: u8,

    pub command_ack_timeout_ms: u64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        Self {
            mock: false,
            address: "udpin:0.0.0.0:14540".into(),
            reconnect_backoff_ms: 5000,
            sample_period_ms: 100,
            heartbeat_timeout_ms: 3000,
            stream_timeout_ms: 5000,
            sys_id: 245,
            comp_id: 190,
            command_ack_timeout_ms: 3000,
        }
    }
}

impl VehicleConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_millis(self.sample_period_ms)
    }
}
