use anyhow::Result;

use crate::HubConfig;

pub fn check_hub(cfg: &HubConfig) -> Result<()> {
    anyhow::ensure!(cfg.tick_ms >= 10, "hub.tick_ms too small; set >= 10");
    anyhow::ensure!(cfg.tick_ms <= 1000, "hub.tick_ms above 1000 makes the dashboard feel dead");
    Ok(())
}
