use mavlink::common::{MavMessage, HEARTBEAT_DATA};
use uas_proto::Packet;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::shutdown::Shutdown;
use crate::transport::{self, SharedTransport};

/// Rates outside 0.2..=1000 Hz are clamped; NaN falls back to 1 Hz.
pub fn period(hz: f64) -> Duration {
    let hz = if hz.is_nan() { 1.0 } else { hz.clamp(0.2, 1000.0) };
    Duration::from_secs_f64(1.0 / hz)
}

/// Broadcasts whatever `next` returns at `hz` until stopped. `next`
/// returning `None` skips that beat.
pub async fn run<F>(link: SharedTransport, hz: f64, mut shutdown: Shutdown, mut next: F)
where
    F: FnMut() -> Option<HEARTBEAT_DATA>,
{
    let mut tick = tokio::time::interval(period(hz));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = tick.tick() => {}
        }
        let Some(hb) = next() else {
            continue;
        };
        match transport::send(&link, &Packet::Mav(MavMessage::HEARTBEAT(hb))) {
            Ok(()) => debug!("heartbeat: sent"),
            Err(e) => warn!("heartbeat: send failed: {:#}", e),
        }
    }
    debug!("heartbeat: stopped");
}
