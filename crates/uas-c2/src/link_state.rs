use mavlink::common::MavMessage;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uas_proto::telemetry::PeerStatus;
use uas_proto::Packet;

use crate::transport::Inbound;

/// What one end knows about the node on the other end of the link.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub peer_id: u8,
    pub peer: Option<PeerStatus>,
    pub last_heartbeat: Option<Instant>,
    pub heartbeats: u64,
}

pub type SharedLinkStatus = Arc<Mutex<LinkStatus>>;

impl LinkStatus {
    pub fn new(peer_id: u8) -> Self {
        Self { peer_id, peer: None, last_heartbeat: None, heartbeats: 0 }
    }

    pub fn shared(peer_id: u8) -> SharedLinkStatus {
        Arc::new(Mutex::new(Self::new(peer_id)))
    }

    /// Records the frame if it is a heartbeat from the tracked peer.
    pub fn observe(&mut self, inbound: &Inbound) -> bool {
        let Packet::Mav(MavMessage::HEARTBEAT(hb)) = &inbound.msg else {
            return false;
        };
        if inbound.source() != self.peer_id {
            return false;
        }
        self.peer = Some(PeerStatus::from_heartbeat(self.peer_id, hb));
        self.last_heartbeat = Some(Instant::now());
        self.heartbeats += 1;
        true
    }

    pub fn hb_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| t.elapsed())
    }

    /// False before the first heartbeat and after `timeout` of silence.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        self.hb_age().is_some_and(|age| age <= timeout)
    }
}

/// Feeds a batch of frames into a shared status; lock poisoning only loses
/// the liveness update.
pub fn observe_all(status: &SharedLinkStatus, frames: &[Inbound]) {
    if let Ok(mut st) = status.lock() {
        for f in frames {
            st.observe(f);
        }
    }
}
