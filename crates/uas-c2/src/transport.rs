//! The raw link underneath every node: best-effort send, non-blocking
//! receive, no delivery or ordering guarantee.

use anyhow::{anyhow, Result};
use mavlink::MavHeader;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

use uas_proto::Packet;

/// A received frame together with who sent it.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub header: MavHeader,
    pub msg: Packet,
}

impl Inbound {
    pub fn source(&self) -> u8 {
        self.header.system_id
    }
}

pub trait Transport: Send {
    fn system_id(&self) -> u8;

    fn component_id(&self) -> u8;

    fn send(&mut self, msg: &Packet) -> Result<()>;

    /// Returns `Ok(None)` when nothing is queued; never blocks.
    fn try_recv(&mut self) -> Result<Option<Inbound>>;

    fn close(&mut self) {}
}

/// Several loops of one node share a link. The lock is only held for a
/// single send or a queue drain, never across an await.
pub type SharedTransport = Arc<Mutex<Box<dyn Transport>>>;

pub fn shared<T: Transport + 'static>(t: T) -> SharedTransport {
    Arc::new(Mutex::new(Box::new(t)))
}

fn lock(link: &SharedTransport) -> Result<MutexGuard<'_, Box<dyn Transport>>> {
    link.lock().map_err(|_| anyhow!("transport lock poisoned"))
}

pub fn send(link: &SharedTransport, msg: &Packet) -> Result<()> {
    lock(link)?.send(msg)
}

/// Everything currently queued, oldest first. An error after some frames
/// were read ends the drain early but keeps those frames; it is only
/// returned when nothing could be read at all.
pub fn drain(link: &SharedTransport) -> Result<Vec<Inbound>> {
    let mut t = lock(link)?;
    let mut out = Vec::new();
    loop {
        match t.try_recv() {
            Ok(Some(m)) => out.push(m),
            Ok(None) => break,
            Err(e) if out.is_empty() => return Err(e),
            Err(e) => {
                warn!("transport: recv failed after {} frames: {:#}", out.len(), e);
                break;
            }
        }
    }
    Ok(out)
}

/// (system id, component id) of the local end.
pub fn local_ids(link: &SharedTransport) -> Result<(u8, u8)> {
    let t = lock(link)?;
    Ok((t.system_id(), t.component_id()))
}

pub fn close(link: &SharedTransport) {
    if let Ok(mut t) = link.lock() {
        t.close();
    }
}
