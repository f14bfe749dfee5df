//! Exclusive-control handshake (CHANGE_OPERATOR_CONTROL).
//!
//! The same two halves serve GCS -> autopilot and operator -> camera: a
//! responder is only identified by its system id and shared key.

use anyhow::Result;
use mavlink::common::{MavMessage, CHANGE_OPERATOR_CONTROL_ACK_DATA, CHANGE_OPERATOR_CONTROL_DATA};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use uas_keys::SharedKey;
use uas_proto::{ControlAck, ControlRequest, Packet};

use crate::link_state::{observe_all, SharedLinkStatus};
use crate::shutdown::Shutdown;
use crate::transport::{self, SharedTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Released,
    Pending,
    Established,
}

/// Controlled-node side. Holds at most one controlling peer.
#[derive(Debug)]
pub struct ControlResponder {
    local_id: u8,
    key: SharedKey,
    remote: Option<u8>,
    last_seen: Option<Instant>,
}

impl ControlResponder {
    pub fn new(local_id: u8, key: SharedKey) -> Self {
        Self { local_id, key, remote: None, last_seen: None }
    }

    pub fn controller(&self) -> Option<u8> {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        match self.remote {
            Some(_) => SessionState::Established,
            None => SessionState::Released,
        }
    }

    pub fn is_controlled_by(&self, src: u8) -> bool {
        self.remote == Some(src)
    }

    /// Answers a control request from `src`. Requests addressed to another
    /// system get no answer.
    pub fn handle(&mut self, src: u8, req: &CHANGE_OPERATOR_CONTROL_DATA) -> Option<CHANGE_OPERATOR_CONTROL_ACK_DATA> {
        if req.target_system != self.local_id {
            return None;
        }
        let ack = self.decide(src, req);
        Some(CHANGE_OPERATOR_CONTROL_ACK_DATA {
            gcs_system_id: src,
            control_request: req.control_request,
            ack: ack.raw(),
        })
    }

    fn decide(&mut self, src: u8, req: &CHANGE_OPERATOR_CONTROL_DATA) -> ControlAck {
        if !self.key.matches(&req.passkey) {
            info!("session: bad key from {}", src);
            return ControlAck::BadKey;
        }
        match ControlRequest::from_raw(req.control_request) {
            Some(ControlRequest::Take) => match self.remote {
                None => {
                    info!("session: {} now controlled by {}", self.local_id, src);
                    self.remote = Some(src);
                    self.last_seen = Some(Instant::now());
                    ControlAck::Accepted
                }
                Some(id) if id == src => {
                    debug!("session: {} re-requested control", src);
                    self.last_seen = Some(Instant::now());
                    ControlAck::Accepted
                }
                Some(id) => {
                    info!("session: {} refused, already controlled by {}", src, id);
                    ControlAck::AlreadyControlled
                }
            },
            Some(ControlRequest::Release) => {
                if let Some(id) = self.remote.take() {
                    info!("session: {} released by {} (held by {})", self.local_id, src, id);
                }
                self.last_seen = None;
                ControlAck::Accepted
            }
            None => {
                info!("session: unknown control_request {} from {}", req.control_request, src);
                ControlAck::BadKey
            }
        }
    }

    /// Any frame from the controlling peer proves it is still there.
    pub fn heard(&mut self, src: u8) {
        if self.is_controlled_by(src) {
            self.last_seen = Some(Instant::now());
        }
    }

    /// Drops the session if the controller has been silent longer than
    /// `timeout`. Returns the dropped peer.
    pub fn expire(&mut self, timeout: Duration) -> Option<u8> {
        let silent = self.last_seen.map(|t| t.elapsed() > timeout).unwrap_or(false);
        if self.remote.is_some() && silent {
            let id = self.remote.take();
            self.last_seen = None;
            warn!("session: controller {:?} silent for {:?}, released", id, timeout);
            return id;
        }
        None
    }

    pub fn release(&mut self) -> Option<u8> {
        self.last_seen = None;
        self.remote.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Established,
    Rejected(ControlAck),
    TimedOut,
    Cancelled,
}

/// Controlling side of one pairing.
#[derive(Debug)]
pub struct ControlInitiator {
    local_id: u8,
    target: u8,
    key: SharedKey,
    state: SessionState,
}

impl ControlInitiator {
    pub fn new(local_id: u8, target: u8, key: SharedKey) -> Self {
        Self { local_id, target, key, state: SessionState::Released }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    pub fn request(&self, req: ControlRequest) -> MavMessage {
        MavMessage::CHANGE_OPERATOR_CONTROL(CHANGE_OPERATOR_CONTROL_DATA {
            target_system: self.target,
            control_request: req as u8,
            version: 0,
            passkey: self.key.passkey(),
        })
    }

    /// Reads a control ack if it answers our take request.
    fn answer(&self, src: u8, msg: &Packet) -> Option<ControlAck> {
        let Packet::Mav(MavMessage::CHANGE_OPERATOR_CONTROL_ACK(ack)) = msg else {
            return None;
        };
        if src != self.target
            || ack.gcs_system_id != self.local_id
            || ack.control_request != ControlRequest::Take as u8
        {
            return None;
        }
        // unknown codes are treated as a key failure
        Some(ControlAck::from_raw(ack.ack).unwrap_or(ControlAck::BadKey))
    }

    /// Sends the take request every `period` until the target answers or
    /// `attempts` periods pass.
    pub async fn establish(
        &mut self,
        link: &SharedTransport,
        status: &SharedLinkStatus,
        attempts: u32,
        period: Duration,
        shutdown: &mut Shutdown,
    ) -> Result<HandshakeOutcome> {
        let req = Packet::Mav(self.request(ControlRequest::Take));
        transport::send(link, &req)?;
        self.state = SessionState::Pending;
        info!("session: requesting control of {}", self.target);

        for attempt in 1..=attempts {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    self.state = SessionState::Released;
                    return Ok(HandshakeOutcome::Cancelled);
                }
                _ = tokio::time::sleep(period) => {}
            }

            let frames = match transport::drain(link) {
                Ok(f) => f,
                Err(e) => {
                    warn!("session: recv failed: {:#}", e);
                    Vec::new()
                }
            };
            observe_all(status, &frames);
            if let Some(code) = frames.iter().find_map(|f| self.answer(f.source(), &f.msg)) {
                if code == ControlAck::Accepted {
                    info!("session: control of {} established", self.target);
                    self.state = SessionState::Established;
                    return Ok(HandshakeOutcome::Established);
                }
                warn!("session: control of {} refused: {:?}", self.target, code);
                self.state = SessionState::Released;
                return Ok(HandshakeOutcome::Rejected(code));
            }

            if attempt < attempts {
                debug!("session: no answer from {}, attempt {}/{}", self.target, attempt + 1, attempts);
                if let Err(e) = transport::send(link, &req) {
                    warn!("session: resend failed: {:#}", e);
                }
            }
        }

        warn!("session: no answer from {} after {} attempts", self.target, attempts);
        self.state = SessionState::Released;
        Ok(HandshakeOutcome::TimedOut)
    }

    /// Sends `request=1`. The answer is not awaited.
    pub fn release(&mut self, link: &SharedTransport) -> Result<()> {
        if self.state == SessionState::Released {
            return Ok(());
        }
        self.state = SessionState::Released;
        info!("session: releasing control of {}", self.target);
        transport::send(link, &Packet::Mav(self.request(ControlRequest::Release)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SharedKey {
        SharedKey::new("s3cret").unwrap()
    }

    fn req(target: u8, request: ControlRequest, passkey: &str) -> CHANGE_OPERATOR_CONTROL_DATA {
        let mut wire = [0u8; 25];
        wire[..passkey.len()].copy_from_slice(passkey.as_bytes());
        CHANGE_OPERATOR_CONTROL_DATA { target_system: target, control_request: request as u8, version: 0, passkey: wire }
    }

    #[test]
    fn first_valid_request_establishes() {
        let mut r = ControlResponder::new(3, key());
        let ack = r.handle(250, &req(3, ControlRequest::Take, "s3cret")).unwrap();
        assert_eq!(ack.ack, 0);
        assert_eq!(ack.gcs_system_id, 250);
        assert_eq!(ack.control_request, 0);
        assert_eq!(r.controller(), Some(250));
        assert_eq!(r.state(), SessionState::Established);
    }

    #[test]
    fn same_initiator_is_re_accepted() {
        let mut r = ControlResponder::new(3, key());
        for _ in 0..3 {
            assert_eq!(r.handle(250, &req(3, ControlRequest::Take, "s3cret")).unwrap().ack, 0);
        }
        assert_eq!(r.controller(), Some(250));
    }

    #[test]
    fn second_initiator_gets_code_3() {
        let mut r = ControlResponder::new(3, key());
        r.handle(250, &req(3, ControlRequest::Take, "s3cret"));
        let ack = r.handle(251, &req(3, ControlRequest::Take, "s3cret")).unwrap();
        assert_eq!(ack.ack, ControlAck::AlreadyControlled.raw());
        assert_eq!(r.controller(), Some(250));
    }

    #[test]
    fn bad_key_wins_over_everything() {
        let mut r = ControlResponder::new(3, key());
        assert_eq!(r.handle(250, &req(3, ControlRequest::Take, "guess")).unwrap().ack, 1);
        assert_eq!(r.controller(), None);

        r.handle(250, &req(3, ControlRequest::Take, "s3cret"));
        // contention would be code 3, but the key is checked first
        assert_eq!(r.handle(251, &req(3, ControlRequest::Take, "guess")).unwrap().ack, 1);
        // a bad-key release leaves the session alone
        let ack = r.handle(250, &req(3, ControlRequest::Release, "guess")).unwrap();
        assert_eq!((ack.ack, ack.control_request), (1, 1));
        assert_eq!(r.controller(), Some(250));
    }

    #[test]
    fn release_clears_and_frees_for_others() {
        let mut r = ControlResponder::new(3, key());
        r.handle(250, &req(3, ControlRequest::Take, "s3cret"));
        assert_eq!(r.handle(250, &req(3, ControlRequest::Release, "s3cret")).unwrap().ack, 0);
        assert_eq!(r.controller(), None);
        assert_eq!(r.handle(251, &req(3, ControlRequest::Take, "s3cret")).unwrap().ack, 0);
        assert_eq!(r.controller(), Some(251));
    }

    #[test]
    fn other_targets_and_unknown_requests() {
        let mut r = ControlResponder::new(3, key());
        assert!(r.handle(250, &req(4, ControlRequest::Take, "s3cret")).is_none());
        let mut odd = req(3, ControlRequest::Take, "s3cret");
        odd.control_request = 7;
        assert_eq!(r.handle(250, &odd).unwrap().ack, 1);
        assert_eq!(r.controller(), None);
    }

    #[test]
    fn silent_controller_expires() {
        let mut r = ControlResponder::new(3, key());
        r.handle(250, &req(3, ControlRequest::Take, "s3cret"));
        assert_eq!(r.expire(Duration::from_secs(5)), None);
        r.last_seen = Some(Instant::now() - Duration::from_millis(100));
        assert_eq!(r.expire(Duration::from_millis(50)), Some(250));
        assert_eq!(r.state(), SessionState::Released);
    }

    #[test]
    fn initiator_only_reads_answers_meant_for_it() {
        let i = ControlInitiator::new(250, 3, key());
        let ack = |gcs, request, code| {
            Packet::Mav(MavMessage::CHANGE_OPERATOR_CONTROL_ACK(CHANGE_OPERATOR_CONTROL_ACK_DATA {
                gcs_system_id: gcs,
                control_request: request,
                ack: code,
            }))
        };
        assert_eq!(i.answer(3, &ack(250, 0, 0)), Some(ControlAck::Accepted));
        assert_eq!(i.answer(3, &ack(250, 0, 3)), Some(ControlAck::AlreadyControlled));
        // other stacks report a key failure as code 2
        assert_eq!(i.answer(3, &ack(250, 0, 2)), Some(ControlAck::BadKeyEncryption));
        assert_eq!(i.answer(3, &ack(250, 0, 9)), Some(ControlAck::BadKey));
        assert_eq!(i.answer(4, &ack(250, 0, 0)), None);
        assert_eq!(i.answer(3, &ack(251, 0, 0)), None);
        assert_eq!(i.answer(3, &ack(250, 1, 0)), None);
    }
}
