//! In-process broadcast link. Every port sees every frame except its own,
//! like nodes on one radio channel. Used by tests and simulation.
//!
//! Frames cross the bus as encoded bytes, so ports exercise the same
//! framing and signing as a real radio link.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use uas_proto::{Packet, SigningKey};

use crate::framing::Framing;
use crate::transport::{Inbound, Transport};

type Wire = Arc<[u8]>;

type LossFilter = Box<dyn FnMut(&Packet) -> bool + Send>;

#[derive(Clone)]
pub struct LoopbackBus {
    tx: broadcast::Sender<Wire>,
}

impl LoopbackBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// An unsigned port.
    pub fn port(&self, system_id: u8, component_id: u8) -> LoopbackPort {
        LoopbackPort {
            tx: self.tx.clone(),
            rx: self.tx.subscribe(),
            framing: Framing::new(system_id, component_id, None),
            drop_outbound: None,
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

pub struct LoopbackPort {
    tx: broadcast::Sender<Wire>,
    rx: broadcast::Receiver<Wire>,
    framing: Framing,
    drop_outbound: Option<LossFilter>,
}

impl LoopbackPort {
    /// Signs everything sent and drops inbound frames not signed with `key`.
    pub fn signed(mut self, key: SigningKey) -> Self {
        self.framing = Framing::new(self.framing.system_id(), self.framing.component_id(), Some(key));
        self
    }

    /// Silently discards outbound frames for which `filter` returns true,
    /// simulating a lossy link in one direction.
    pub fn with_outbound_loss<F>(mut self, filter: F) -> Self
    where
        F: FnMut(&Packet) -> bool + Send + 'static,
    {
        self.drop_outbound = Some(Box::new(filter));
        self
    }
}

impl Transport for LoopbackPort {
    fn system_id(&self) -> u8 {
        self.framing.system_id()
    }

    fn component_id(&self) -> u8 {
        self.framing.component_id()
    }

    fn send(&mut self, msg: &Packet) -> Result<()> {
        let bytes = self.framing.encode(msg);
        if self.drop_outbound.as_mut().is_some_and(|lost| lost(msg)) {
            return Ok(());
        }
        // no receivers is a lost frame, not an error
        let _ = self.tx.send(Arc::from(bytes));
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Inbound>> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(bytes) => {
                    if let Some(m) = self.framing.accept(&bytes) {
                        return Ok(Some(m));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => {
                    warn!("bus: port {} dropped {} frames", self.framing.system_id(), n);
                }
                Err(TryRecvError::Closed) => anyhow::bail!("bus closed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::MavMessage;
    use uas_proto::telemetry::{peer_heartbeat, NodeRole};

    fn hb() -> Packet {
        Packet::Mav(MavMessage::HEARTBEAT(peer_heartbeat(NodeRole::Gcs)))
    }

    #[test]
    fn ports_do_not_hear_themselves() {
        let bus = LoopbackBus::new(16);
        let mut a = bus.port(1, 1);
        let mut b = bus.port(2, 1);

        a.send(&hb()).unwrap();
        assert!(a.try_recv().unwrap().is_none());
        let got = b.try_recv().unwrap().expect("b hears a");
        assert_eq!(got.source(), 1);
        assert_eq!(got.header.sequence, 1);
        assert!(b.try_recv().unwrap().is_none());
    }

    #[test]
    fn lagging_port_keeps_newest_frames() {
        let bus = LoopbackBus::new(2);
        let mut a = bus.port(1, 1);
        let mut b = bus.port(2, 1);
        for _ in 0..5 {
            a.send(&hb()).unwrap();
        }
        let mut n = 0;
        while b.try_recv().unwrap().is_some() {
            n += 1;
        }
        assert_eq!(n, 2);
    }

    #[test]
    fn outbound_loss_filter_can_drop_just_the_first_frame() {
        let bus = LoopbackBus::new(16);
        let mut lost = false;
        let mut a = bus.port(1, 1).with_outbound_loss(move |_| !std::mem::replace(&mut lost, true));
        let mut b = bus.port(2, 1);
        a.send(&hb()).unwrap();
        a.send(&hb()).unwrap();
        let got = b.try_recv().unwrap().expect("second frame arrives");
        // the dropped frame still used up a sequence number
        assert_eq!(got.header.sequence, 2);
        assert!(b.try_recv().unwrap().is_none());
    }

    #[test]
    fn signed_ports_ignore_unsigned_senders() {
        let bus = LoopbackBus::new(16);
        let k = SigningKey::from_bytes([5; 32]);
        let mut a = bus.port(1, 1).signed(k.clone());
        let mut b = bus.port(2, 1).signed(k);
        let mut c = bus.port(3, 1);

        c.send(&hb()).unwrap();
        assert!(b.try_recv().unwrap().is_none());
        a.send(&hb()).unwrap();
        assert_eq!(b.try_recv().unwrap().map(|m| m.source()), Some(1));
        // the unsigned port accepts anything
        assert_eq!(c.try_recv().unwrap().map(|m| m.source()), Some(1));
    }
}
