//! Sending side of the command channel: encode, send, and optionally wait
//! for the matching COMMAND_ACK with a bounded number of resends.

use anyhow::Result;
use mavlink::common::{MavFrame, MavMessage, COMMAND_INT_DATA, COMMAND_LONG_DATA};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use uas_proto::command::pad_params;
use uas_proto::{AckPolicy, AckResult, CommandName, Packet};

use crate::link_state::{observe_all, SharedLinkStatus};
use crate::shutdown::Shutdown;
use crate::transport::{self, Inbound, SharedTransport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandShape {
    /// COMMAND_LONG, seven floats.
    Long,
    /// COMMAND_INT: params 1-4 as floats, 5/6 rounded into x/y, 7 as z.
    Int { frame: MavFrame },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub name: CommandName,
    pub params: [f64; 7],
    pub shape: CommandShape,
    pub requires_ack: bool,
    pub period: Duration,
    pub max_retries: u32,
}

impl CommandRequest {
    pub fn long(name: CommandName, params: &[f64]) -> Self {
        Self {
            name,
            params: pad_params(params),
            shape: CommandShape::Long,
            requires_ack: false,
            period: Duration::from_secs(1),
            max_retries: 5,
        }
    }

    pub fn int(name: CommandName, frame: MavFrame, params: &[f64]) -> Self {
        Self { shape: CommandShape::Int { frame }, ..Self::long(name, params) }
    }

    pub fn with_ack(mut self, period: Duration, max_retries: u32) -> Self {
        self.requires_ack = true;
        self.period = period;
        self.max_retries = max_retries;
        self
    }

    pub fn encode(&self, target_system: u8, target_component: u8) -> MavMessage {
        let p = &self.params;
        match self.shape {
            CommandShape::Long => MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
                target_system,
                target_component,
                command: self.name.mav_cmd(),
                confirmation: 0,
                param1: p[0] as f32,
                param2: p[1] as f32,
                param3: p[2] as f32,
                param4: p[3] as f32,
                param5: p[4] as f32,
                param6: p[5] as f32,
                param7: p[6] as f32,
            }),
            CommandShape::Int { frame } => MavMessage::COMMAND_INT(COMMAND_INT_DATA {
                target_system,
                target_component,
                frame,
                command: self.name.mav_cmd(),
                current: 0,
                autocontinue: 0,
                param1: p[0] as f32,
                param2: p[1] as f32,
                param3: p[2] as f32,
                param4: p[3] as f32,
                x: p[4].round() as i32,
                y: p[5].round() as i32,
                z: p[6] as f32,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandOutcome {
    /// Fire-and-forget: sent once, nothing awaited.
    Sent,
    Accepted(AckResult),
    Failed(AckResult),
    /// No accepting ack, but the target's heartbeat shows the command took
    /// effect.
    Observed,
    TimedOut,
    Cancelled,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Sent | CommandOutcome::Accepted(_) | CommandOutcome::Observed)
    }
}

/// Suspends the local heartbeat while a command cycle is in flight.
struct HeartbeatInhibit<'a>(&'a AtomicBool);

impl<'a> HeartbeatInhibit<'a> {
    fn hold(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for HeartbeatInhibit<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Command initiator bound to one target node.
pub struct CommandSender {
    link: SharedTransport,
    local_id: u8,
    target_system: u8,
    target_component: u8,
    inhibit: Arc<AtomicBool>,
    status: SharedLinkStatus,
}

impl CommandSender {
    pub fn new(
        link: SharedTransport,
        local_id: u8,
        target_system: u8,
        target_component: u8,
        inhibit: Arc<AtomicBool>,
        status: SharedLinkStatus,
    ) -> Self {
        Self { link, local_id, target_system, target_component, inhibit, status }
    }

    /// The ack result if `f` answers `req` from our target to us.
    fn ack_for(&self, req: &CommandRequest, f: &Inbound) -> Option<AckResult> {
        let Packet::Ack(ack) = &f.msg else {
            return None;
        };
        (f.source() == self.target_system && ack.target_system == self.local_id && ack.is_for(req.name.mav_cmd()))
            .then_some(ack.result)
    }

    /// Sends once, then (when an ack is required) waits `period` and resends
    /// up to `max_retries` times. The wait is counted in retries, not wall
    /// clock. A stop signal aborts the wait.
    pub async fn send(&self, req: &CommandRequest, shutdown: &mut Shutdown) -> Result<CommandOutcome> {
        let msg = Packet::Mav(req.encode(self.target_system, self.target_component));
        if !req.requires_ack {
            transport::send(&self.link, &msg)?;
            debug!("cmd: {} sent to {}", req.name, self.target_system);
            return Ok(CommandOutcome::Sent);
        }

        let _inhibit = HeartbeatInhibit::hold(&self.inhibit);
        let started = Instant::now();
        if let Err(e) = transport::send(&self.link, &msg) {
            warn!("cmd: {} send failed: {:#}", req.name, e);
        }

        for attempt in 1..=req.max_retries {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("cmd: {} abandoned on stop", req.name);
                    return Ok(CommandOutcome::Cancelled);
                }
                _ = tokio::time::sleep(req.period) => {}
            }

            let frames = match transport::drain(&self.link) {
                Ok(f) => f,
                Err(e) => {
                    warn!("cmd: recv failed: {:#}", e);
                    Vec::new()
                }
            };
            observe_all(&self.status, &frames);
            for result in frames.iter().filter_map(|f| self.ack_for(req, f)) {
                match AckPolicy::classify(result) {
                    AckPolicy::Done => {
                        info!("cmd: {} {} after {:?}", req.name, result, started.elapsed());
                        return Ok(CommandOutcome::Accepted(result));
                    }
                    AckPolicy::Fail => {
                        warn!("cmd: {} failed: {}", req.name, result);
                        return Ok(CommandOutcome::Failed(result));
                    }
                    AckPolicy::Retry => debug!("cmd: {} temporarily rejected", req.name),
                }
            }

            debug!("cmd: {} resend {}/{}", req.name, attempt, req.max_retries);
            if let Err(e) = transport::send(&self.link, &msg) {
                warn!("cmd: {} resend failed: {:#}", req.name, e);
            }
        }

        warn!(
            "cmd: {} to {} timed out after {} retries ({:?})",
            req.name,
            self.target_system,
            req.max_retries,
            started.elapsed()
        );
        Ok(CommandOutcome::TimedOut)
    }
}
