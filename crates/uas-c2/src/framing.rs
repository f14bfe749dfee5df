//! Per-link framing state shared by every transport: the outbound sequence
//! counter and signer, and the inbound signature check.

use mavlink::common::MavMessage;
use mavlink::MavHeader;
use tracing::{debug, warn};

use uas_proto::frame::{self, Signer, Verifier};
use uas_proto::{FrameError, Packet, SigningKey};

use crate::transport::Inbound;

#[derive(Debug)]
pub struct Framing {
    hdr: MavHeader,
    signing: Option<(Signer, Verifier)>,
}

impl Framing {
    /// With a key every outbound frame is signed and every inbound frame
    /// outside the control handshake must carry a valid signature.
    pub fn new(system_id: u8, component_id: u8, key: Option<SigningKey>) -> Self {
        Self {
            hdr: MavHeader { system_id, component_id, sequence: 0 },
            signing: key.map(|k| (Signer::new(k.clone(), 0), Verifier::new(k))),
        }
    }

    pub fn system_id(&self) -> u8 {
        self.hdr.system_id
    }

    pub fn component_id(&self) -> u8 {
        self.hdr.component_id
    }

    pub fn is_signed(&self) -> bool {
        self.signing.is_some()
    }

    /// Consumes one sequence number even if the caller then drops the bytes.
    pub fn encode(&mut self, packet: &Packet) -> Vec<u8> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        frame::encode(self.hdr, packet, self.signing.as_mut().map(|(s, _)| s))
    }

    /// `None` for corrupt frames, our own echoes, and frames that fail the
    /// signature check.
    pub fn accept(&mut self, bytes: &[u8]) -> Option<Inbound> {
        let f = match frame::decode(bytes) {
            Ok(f) => f,
            Err(e) => {
                debug!("link: dropped frame: {}", e);
                return None;
            }
        };
        let (sys, comp) = (f.header.system_id, f.header.component_id);
        if (sys, comp) == (self.hdr.system_id, self.hdr.component_id) {
            return None;
        }
        if let Some((_, verifier)) = &mut self.signing {
            if !is_handshake(&f.packet) {
                match verifier.check(bytes) {
                    Ok(()) => {}
                    Err(FrameError::Unsigned) => {
                        debug!("link: unsigned {} from {}/{} dropped", f.packet.name(), sys, comp);
                        return None;
                    }
                    Err(e) => {
                        warn!("link: {} from {}/{} dropped: {}", f.packet.name(), sys, comp, e);
                        return None;
                    }
                }
            }
        }
        Some(Inbound { header: f.header, msg: f.packet })
    }
}

/// The control handshake is exempt from signature checks so a station
/// holding the wrong key still hears that its key was refused.
fn is_handshake(p: &Packet) -> bool {
    matches!(
        p,
        Packet::Mav(MavMessage::CHANGE_OPERATOR_CONTROL(_) | MavMessage::CHANGE_OPERATOR_CONTROL_ACK(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{CHANGE_OPERATOR_CONTROL_ACK_DATA, COMMAND_LONG_DATA};
    use mavlink::common::MavCmd;

    fn key(b: u8) -> Option<SigningKey> {
        Some(SigningKey::from_bytes([b; 32]))
    }

    fn land() -> Packet {
        Packet::Mav(MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: 3,
            target_component: 1,
            command: MavCmd::MAV_CMD_NAV_LAND,
            ..Default::default()
        }))
    }

    #[test]
    fn signed_links_talk_and_sequence_advances() {
        let mut gcs = Framing::new(250, 190, key(9));
        let mut ap = Framing::new(3, 1, key(9));
        let a = gcs.encode(&land());
        let b = gcs.encode(&land());
        assert_eq!(ap.accept(&a).map(|f| f.header.sequence), Some(1));
        assert_eq!(ap.accept(&b).map(|f| f.header.sequence), Some(2));
        // a captured frame played back later is refused
        assert!(ap.accept(&a).is_none());
    }

    #[test]
    fn signed_link_drops_unsigned_and_foreign_frames() {
        let mut ap = Framing::new(3, 1, key(9));
        let mut spoof = Framing::new(250, 77, None);
        let mut stranger = Framing::new(250, 190, key(4));
        assert!(ap.accept(&spoof.encode(&land())).is_none());
        assert!(ap.accept(&stranger.encode(&land())).is_none());
    }

    #[test]
    fn handshake_reply_reaches_a_wrong_key_station() {
        let mut ap = Framing::new(3, 1, key(9));
        let mut gcs = Framing::new(250, 190, key(4));
        let refusal = Packet::Mav(MavMessage::CHANGE_OPERATOR_CONTROL_ACK(CHANGE_OPERATOR_CONTROL_ACK_DATA {
            gcs_system_id: 250,
            control_request: 0,
            ack: 1,
        }));
        let got = gcs.accept(&ap.encode(&refusal)).expect("handshake passes");
        assert_eq!(got.msg, refusal);
    }

    #[test]
    fn own_frames_and_garbage_are_ignored() {
        let mut a = Framing::new(3, 1, None);
        let echo = a.encode(&land());
        assert!(a.accept(&echo).is_none());
        assert!(a.accept(&[0xFD, 1, 2]).is_none());
        // same system, other component is a different node
        assert!(Framing::new(3, 100, None).accept(&echo).is_some());
    }
}
