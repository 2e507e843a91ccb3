pub mod camera;
pub mod codec;
pub mod doctor;
pub mod overlay;
pub mod stream;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skyrelay_rpc::TcpConnector;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub enable: bool,
    /// Simulator RPC endpoint.
    pub host: String,
    pub port: u16,
    /// Connect/read/write timeout for the RPC socket.
    pub timeout_ms: u64,
    /// Delay between stream iterations (~30 fps at 33).
    pub frame_interval_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enable: true,
            host: "127.0.0.1".into(),
            port: 41451,
            timeout_ms: 5000,
            frame_interval_ms: 33,
            jpeg_quality: 80,
        }
    }
}

impl VideoConfig {
    pub fn connector(&self) -> TcpConnector {
        TcpConnector {
            host: self.host.clone(),
            port: self.port,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Cameras the simulator exposes on the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Camera {
    FrontCenter,
    BottomCenter,
}

impl Camera {
    pub const ALL: [Camera; 2] = [Camera::FrontCenter, Camera::BottomCenter];

    pub fn name(self) -> &'static str {
        match self {
            Camera::FrontCenter => "front_center",
            Camera::BottomCenter => "bottom_center",
        }
    }

    /// Camera id as the simulator's `simGetImage` expects it.
    pub fn sim_index(self) -> &'static str {
        match self {
            Camera::FrontCenter => "0",
            Camera::BottomCenter => "1",
        }
    }

    pub fn overlay_label(self) -> String {
        format!("CAM: {}", self.name().to_uppercase())
    }
}

impl FromStr for Camera {
    type Err = UnknownCamera;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Camera::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| UnknownCamera(s.to_string()))
    }
}

impl std::fmt::Display for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown camera: {0}")]
pub struct UnknownCamera(pub String);

/// One relabelled JPEG, produced and consumed within a single stream tick.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub camera: Camera,
    pub encoded: Vec<u8>,
    pub ordinal: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("decode frame: {0}")]
    Decode(#[source] image::ImageError),
    #[error("encode frame: {0}")]
    Encode(#[source] image::ImageError),
}
