use anyhow::Result;

use crate::VideoConfig;

pub fn check_video(cfg: &VideoConfig) -> Result<()> {
    if !cfg.enable {
        return Ok(());
    }
    anyhow::ensure!(!cfg.host.is_empty(), "video.host missing");
    anyhow::ensure!(cfg.port != 0, "video.port invalid");
    anyhow::ensure!(cfg.timeout_ms >= 100, "video.timeout_ms too small; set >= 100");
    anyhow::ensure!(cfg.frame_interval_ms >= 1 && cfg.frame_interval_ms <= 1000, "video.frame_interval_ms should be 1..1000");
    anyhow::ensure!(cfg.jpeg_quality >= 1 && cfg.jpeg_quality <= 100, "video.jpeg_quality should be 1..100");
    Ok(())
}
