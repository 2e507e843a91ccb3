use anyhow::Result;

use crate::VehicleConfig;

const SCHEMES: [&str; 6] = ["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

pub fn check_vehicle(cfg: &VehicleConfig) -> Result<()> {
    if cfg.mock {
        return Ok(());
    }
    anyhow::ensure!(
        SCHEMES.iter().any(|s| cfg.address.starts_with(s)),
        "vehicle.address must start with one of {:?}: {}",
        SCHEMES,
        cfg.address
    );
    anyhow::ensure!(cfg.reconnect_backoff_ms >= 100, "vehicle.reconnect_backoff_ms too small; set >= 100");
    anyhow::ensure!(cfg.sample_period_ms >= 10 && cfg.sample_period_ms <= 1000, "vehicle.sample_period_ms should be 10..1000");
    anyhow::ensure!(cfg.heartbeat_timeout_ms >= 500, "vehicle.heartbeat_timeout_ms too small; set >= 500");
    anyhow::ensure!(cfg.stream_timeout_ms > cfg.sample_period_ms, "vehicle.stream_timeout_ms must exceed sample_period_ms");
    anyhow::ensure!(cfg.sys_id != 0, "vehicle.sys_id must be non-zero");
    Ok(())
}
