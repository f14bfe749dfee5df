use anyhow::Result;

use crate::mav::Endpoint;
use crate::{AutopilotConfig, CameraConfig, GcsConfig, LinkConfig};

/// Rates must be finite and positive; NaN fails the `> 0` test on its own.
fn rate(name: &str, hz: f64) -> Result<()> {
    anyhow::ensure!(hz.is_finite() && hz > 0.0, "{} must be a positive number, got {}", name, hz);
    Ok(())
}

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    Endpoint::parse(&cfg.url)?;
    anyhow::ensure!(cfg.system_id != 0, "link.system_id 0 is the broadcast id");
    Ok(())
}

pub fn check_autopilot(cfg: &AutopilotConfig) -> Result<()> {
    rate("autopilot.heartbeat_hz", cfg.heartbeat_hz)?;
    rate("autopilot.tx_hz", cfg.tx_hz)?;
    Ok(())
}

pub fn check_gcs(cfg: &GcsConfig) -> Result<()> {
    rate("gcs.heartbeat_hz", cfg.heartbeat_hz)?;
    anyhow::ensure!(cfg.handshake_attempts > 0, "gcs.handshake_attempts must be at least 1");
    anyhow::ensure!(cfg.retry_period_ms > 0, "gcs.retry_period_ms must be positive");
    anyhow::ensure!(
        cfg.link_timeout_ms >= cfg.retry_period_ms,
        "gcs.link_timeout_ms shorter than one retry period"
    );
    Ok(())
}

pub fn check_camera(cfg: &CameraConfig) -> Result<()> {
    rate("camera.heartbeat_hz", cfg.heartbeat_hz)?;
    if let Some(prog) = cfg.capture_cmd.first() {
        anyhow::ensure!(!prog.is_empty(), "camera.capture_cmd has an empty program name");
    }
    Ok(())
}
