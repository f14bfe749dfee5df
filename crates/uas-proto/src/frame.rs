//! MAVLink 2 framing with message signing.
//!
//! Payload layouts and CRC_EXTRA seeds come from the `mavlink` dialect; the
//! frame around them (header, X.25 checksum, 13-byte signature block) is
//! built here because the dialect crate cannot sign.

use crc::{Crc, CRC_16_MCRF4XX};
use mavlink::common::MavMessage;
use mavlink::{MavHeader, MavlinkVersion, Message};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

use crate::ack::CommandAck;

pub const STX: u8 = 0xFD;
const HEADER_LEN: usize = 10;
const CRC_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const IFLAG_SIGNED: u8 = 0x01;
pub const MAX_FRAME_LEN: usize = HEADER_LEN + 255 + CRC_LEN + SIGNATURE_LEN;

const X25: Crc<u16> = Crc::<u16>::new(&CRC_16_MCRF4XX);

/// Signing timestamps count 10 µs ticks from 2015-01-01T00:00:00Z.
const SIGNING_EPOCH_UNIX_S: u64 = 1_420_070_400;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated")]
    Truncated,
    #[error("not a MAVLink 2 frame")]
    BadMagic,
    #[error("unsupported incompatibility flags {0:#04x}")]
    Flags(u8),
    #[error("bad checksum on message {0}")]
    BadCrc(u32),
    #[error("message {id}: {reason}")]
    Parse { id: u32, reason: String },
    #[error("unknown COMMAND_ACK result {0}")]
    UnknownAckResult(u8),
    #[error("unsigned frame")]
    Unsigned,
    #[error("bad signature")]
    BadSignature,
    #[error("signature timestamp {0} replayed")]
    Replay(u64),
}

/// Everything a node puts on the wire. COMMAND_ACK travels as its own
/// variant so its extension fields and the full result range survive.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Mav(MavMessage),
    Ack(CommandAck),
}

impl From<MavMessage> for Packet {
    fn from(m: MavMessage) -> Self {
        Packet::Mav(m)
    }
}

impl From<CommandAck> for Packet {
    fn from(a: CommandAck) -> Self {
        Packet::Ack(a)
    }
}

impl Packet {
    pub fn message_id(&self) -> u32 {
        match self {
            Packet::Mav(m) => m.message_id(),
            Packet::Ack(_) => CommandAck::ID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Packet::Mav(m) => m.message_name(),
            Packet::Ack(_) => "COMMAND_ACK",
        }
    }

    fn write_payload(&self, buf: &mut [u8; 255]) -> usize {
        match self {
            Packet::Mav(m) => m.ser(MavlinkVersion::V2, buf),
            Packet::Ack(a) => {
                let mut ack = [0u8; CommandAck::ENCODED_LEN];
                let n = a.encode(&mut ack);
                buf[..n].copy_from_slice(&ack[..n]);
                n
            }
        }
    }

    fn parse(id: u32, payload: &[u8]) -> Result<Self, FrameError> {
        if id == CommandAck::ID {
            return CommandAck::decode(payload).map(Packet::Ack);
        }
        MavMessage::parse(MavlinkVersion::V2, id, payload)
            .map(Packet::Mav)
            .map_err(|e| FrameError::Parse { id, reason: e.to_string() })
    }
}

fn extra_crc(id: u32) -> u8 {
    if id == CommandAck::ID {
        CommandAck::EXTRA_CRC
    } else {
        MavMessage::extra_crc(id)
    }
}

/// 32-byte link signing secret.
#[derive(Clone)]
pub struct SigningKey(Zeroizing<[u8; 32]>);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

fn signature(key: &SigningKey, signed: &[u8]) -> [u8; 6] {
    let mut h = Sha256::new();
    h.update(&key.0[..]);
    h.update(signed);
    let digest = h.finalize();
    let mut out = [0u8; 6];
    out.copy_from_slice(&digest[..6]);
    out
}

fn signing_now() -> u64 {
    let epoch = UNIX_EPOCH + Duration::from_secs(SIGNING_EPOCH_UNIX_S);
    SystemTime::now()
        .duration_since(epoch)
        .map(|d| (d.as_micros() / 10) as u64)
        .unwrap_or(0)
}

/// Outbound half of a signed link: one key, one link id, strictly
/// increasing timestamps.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    link_id: u8,
    last: u64,
}

impl Signer {
    pub fn new(key: SigningKey, link_id: u8) -> Self {
        Self { key, link_id, last: 0 }
    }

    fn next_timestamp(&mut self) -> u64 {
        self.last = signing_now().max(self.last + 1);
        self.last
    }
}

/// Inbound half: checks signatures and rejects timestamps that do not move
/// forward for a given (system, component, link) stream.
#[derive(Debug)]
pub struct Verifier {
    key: SigningKey,
    streams: HashMap<(u8, u8, u8), u64>,
}

impl Verifier {
    pub fn new(key: SigningKey) -> Self {
        Self { key, streams: HashMap::new() }
    }

    /// `frame` must already have passed [`decode`].
    pub fn check(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        if frame.len() < HEADER_LEN || frame[2] & IFLAG_SIGNED == 0 {
            return Err(FrameError::Unsigned);
        }
        let sig_at = frame.len() - 6;
        let expected = signature(&self.key, &frame[..sig_at]);
        let diff = expected.iter().zip(&frame[sig_at..]).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(FrameError::BadSignature);
        }

        let block = &frame[frame.len() - SIGNATURE_LEN..];
        let link_id = block[0];
        let mut ts = [0u8; 8];
        ts[..6].copy_from_slice(&block[1..7]);
        let timestamp = u64::from_le_bytes(ts);
        let last = self.streams.entry((frame[5], frame[6], link_id)).or_insert(0);
        if timestamp <= *last {
            return Err(FrameError::Replay(timestamp));
        }
        *last = timestamp;
        Ok(())
    }
}

/// Serializes `packet` as one MAVLink 2 frame, signed when `signer` is set.
pub fn encode(header: MavHeader, packet: &Packet, signer: Option<&mut Signer>) -> Vec<u8> {
    let mut payload = [0u8; 255];
    let len = packet.write_payload(&mut payload);
    let id = packet.message_id().to_le_bytes();

    let mut out = Vec::with_capacity(HEADER_LEN + len + CRC_LEN + SIGNATURE_LEN);
    out.extend_from_slice(&[
        STX,
        len as u8,
        if signer.is_some() { IFLAG_SIGNED } else { 0 },
        0,
        header.sequence,
        header.system_id,
        header.component_id,
        id[0],
        id[1],
        id[2],
    ]);
    out.extend_from_slice(&payload[..len]);
    let crc = checksum(&out, extra_crc(packet.message_id()));
    out.extend_from_slice(&crc.to_le_bytes());

    if let Some(s) = signer {
        let ts = s.next_timestamp().to_le_bytes();
        out.push(s.link_id);
        out.extend_from_slice(&ts[..6]);
        let sig = signature(&s.key, &out);
        out.extend_from_slice(&sig);
    }
    out
}

/// X.25 over everything after STX up to the end of the payload, seeded
/// with the message's CRC_EXTRA.
fn checksum(header_and_payload: &[u8], extra: u8) -> u16 {
    let mut d = X25.digest();
    d.update(&header_and_payload[1..]);
    d.update(&[extra]);
    d.finalize()
}

/// Total frame length announced by a complete header.
fn frame_len(header: &[u8]) -> usize {
    let sig = if header[2] & IFLAG_SIGNED != 0 { SIGNATURE_LEN } else { 0 };
    HEADER_LEN + header[1] as usize + CRC_LEN + sig
}

fn message_id(frame: &[u8]) -> u32 {
    u32::from_le_bytes([frame[7], frame[8], frame[9], 0])
}

fn crc_ok(frame: &[u8]) -> bool {
    let end = HEADER_LEN + frame[1] as usize;
    let got = u16::from_le_bytes([frame[end], frame[end + 1]]);
    got == checksum(&frame[..end], extra_crc(message_id(frame)))
}

/// A frame whose checksum and payload were valid.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: MavHeader,
    pub packet: Packet,
    pub signed: bool,
}

/// Parses exactly one frame. Signatures are not checked here.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    if bytes[0] != STX {
        return Err(FrameError::BadMagic);
    }
    if bytes[2] & !IFLAG_SIGNED != 0 {
        return Err(FrameError::Flags(bytes[2]));
    }
    if bytes.len() != frame_len(bytes) {
        return Err(FrameError::Truncated);
    }
    let id = message_id(bytes);
    if !crc_ok(bytes) {
        return Err(FrameError::BadCrc(id));
    }
    let payload = &bytes[HEADER_LEN..HEADER_LEN + bytes[1] as usize];
    Ok(Frame {
        header: MavHeader { sequence: bytes[4], system_id: bytes[5], component_id: bytes[6] },
        packet: Packet::parse(id, payload)?,
        signed: bytes[2] & IFLAG_SIGNED != 0,
    })
}

/// Splits a byte stream (serial, TCP, or a run of datagrams) into frames.
/// Bytes before a start marker are skipped; a candidate with a bad
/// checksum costs one byte, so a stray 0xFD cannot swallow real frames.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let Some(start) = self.buf.iter().position(|b| *b == STX) else {
                self.buf.clear();
                return None;
            };
            self.buf.drain(..start);
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            if self.buf[2] & !IFLAG_SIGNED != 0 {
                self.buf.drain(..1);
                continue;
            }
            let len = frame_len(&self.buf);
            if self.buf.len() < len {
                return None;
            }
            if !crc_ok(&self.buf[..len]) {
                self.buf.drain(..1);
                continue;
            }
            return Some(self.buf.drain(..len).collect());
        }
    }
}
