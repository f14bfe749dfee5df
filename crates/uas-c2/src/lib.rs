pub mod bus;
pub mod camera;
pub mod command;
pub mod connect;
pub mod controller;
pub mod dispatch;
pub mod doctor;
pub mod framing;
pub mod heartbeat;
pub mod link_state;
pub mod mav;
pub mod session;
pub mod shutdown;
pub mod transport;

pub use camera::CameraNode;
pub use connect::Connect;
pub use controller::Controller;
pub use shutdown::{Shutdown, StopHandle};
pub use transport::{Inbound, SharedTransport, Transport};

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use uas_modes::CustomSubmode;

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    /// MAVLink connection string: `udpin:`, `udpout:`, `udpbcast:`, `tcpin:`,
    /// `tcpout:` or `serial:<dev>:<baud>`.
    pub url: String,

    /// Our MAVLink system id. For a GCS this is the id the autopilot will
    /// lock its control session to.
    pub system_id: u8,

    #[serde(default = "default_component_id")]
    pub component_id: u8,

    /// Sign outbound frames with the shared key and drop inbound frames
    /// that are not signed with it.
    #[serde(default = "default_signing")]
    pub signing: bool,
}

fn default_component_id() -> u8 {
    1
}

fn default_signing() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutopilotConfig {
    pub heartbeat_hz: f64,

    /// Rate at which queued acks are flushed to the link.
    pub tx_hz: f64,

    /// Release the control session when the controlling peer has been silent
    /// this long. 0 disables the check.
    pub session_timeout_ms: u64,

    /// When false the boot sequence runs at start instead of waiting for a
    /// DO_SET_MODE to BOOT.
    pub wait_for_boot: bool,

    /// Submode the boot sequence walks to.
    pub boot_target: CustomSubmode,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            heartbeat_hz: 1.0,
            tx_hz: 60.0,
            session_timeout_ms: 5000,
            wait_for_boot: true,
            boot_target: CustomSubmode::GroundDisarmed,
        }
    }
}

impl AutopilotConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_ms > 0).then(|| Duration::from_millis(self.session_timeout_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    pub heartbeat_hz: f64,
    pub handshake_attempts: u32,
    pub handshake_period_ms: u64,
    pub retry_period_ms: u64,
    pub max_retries: u32,

    /// Peer is considered gone after this long without a heartbeat.
    pub link_timeout_ms: u64,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            heartbeat_hz: 1.0,
            handshake_attempts: 5,
            handshake_period_ms: 1000,
            retry_period_ms: 1000,
            max_retries: 5,
            link_timeout_ms: 5000,
        }
    }
}

impl GcsConfig {
    pub fn handshake_period(&self) -> Duration {
        Duration::from_millis(self.handshake_period_ms)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub heartbeat_hz: f64,
    pub session_timeout_ms: u64,

    /// Program and arguments that write one JPEG to stdout. Empty only
    /// counts triggers.
    pub capture_cmd: Vec<String>,

    /// Captured frames land here as `capture-NNNNN.jpg`.
    pub output_dir: PathBuf,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            heartbeat_hz: 1.0,
            session_timeout_ms: 5000,
            capture_cmd: ["libcamera-still", "-n", "-t", "1", "-o", "-"].map(String::from).to_vec(),
            output_dir: PathBuf::from("captures"),
        }
    }
}

impl CameraConfig {
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session_timeout_ms > 0).then(|| Duration::from_millis(self.session_timeout_ms))
    }
}
