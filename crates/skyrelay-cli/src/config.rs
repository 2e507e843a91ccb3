use anyhow::{Context, Result};
use serde::Deserialize;
use skyrelay_fc::VehicleConfig;
use skyrelay_hub::HubConfig;
use skyrelay_video::VideoConfig;

pub const DEFAULT_API_KEY: &str = "gcs-secret-key-2024";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub vehicle: VehicleConfig,
    pub hub: HubConfig,
    pub video: VideoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret expected in the `token` query parameter of commands.
    pub api_key: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8000, api_key: DEFAULT_API_KEY.into() }
    }
}

/// No file means all defaults.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}
