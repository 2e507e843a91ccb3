use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One complete snapshot of vehicle state. Never mutated after construction;
/// the link publishes a fresh value for every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub connected: bool,
    pub position: Position,
    pub attitude: Attitude,
    pub velocity: Velocity,
    pub battery: Battery,
    pub flight_mode: String,
    pub health: Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    pub relative_alt_m: f32,
    pub absolute_alt_m: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Attitude {
    pub roll_deg: f32,
    pub pitch_deg: f32,
    pub yaw_deg: f32,
}

/// NED frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Velocity {
    pub north_m_s: f32,
    pub east_m_s: f32,
    pub down_m_s: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Battery {
    pub voltage_v: f32,
    pub remaining_percent: f32,
}

/// Pre-flight checks as reported by the autopilot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Health {
    pub is_gyrometer_calibration_ok: bool,
    pub is_accelerometer_calibration_ok: bool,
    pub is_magnetometer_calibration_ok: bool,
    pub is_level_calibration_ok: bool,
    pub is_local_position_ok: bool,
    pub is_global_position_ok: bool,
    pub is_home_position_ok: bool,
    pub is_armable: bool,
}

impl Health {
    pub fn all_ok() -> Self {
        Self {
            is_gyrometer_calibration_ok: true,
            is_accelerometer_calibration_ok: true,
            is_magnetometer_calibration_ok: true,
            is_level_calibration_ok: true,
            is_local_position_ok: true,
            is_global_position_ok: true,
            is_home_position_ok: true,
            is_armable: true,
        }
    }
}
