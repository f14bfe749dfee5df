use mavlink::common::{MavCmd, COMMAND_ACK_DATA};
use mavlink::MessageData;
use std::fmt;

use crate::frame::FrameError;

/// MAV_RESULT, including the two wrong-shape codes the pinned dialect
/// predates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckResult {
    Accepted = 0,
    TemporarilyRejected = 1,
    Denied = 2,
    Unsupported = 3,
    Failed = 4,
    InProgress = 5,
    Cancelled = 6,
    CommandLongOnly = 7,
    CommandIntOnly = 8,
}

impl AckResult {
    pub fn from_raw(v: u8) -> Option<Self> {
        Some(match v {
            0 => AckResult::Accepted,
            1 => AckResult::TemporarilyRejected,
            2 => AckResult::Denied,
            3 => AckResult::Unsupported,
            4 => AckResult::Failed,
            5 => AckResult::InProgress,
            6 => AckResult::Cancelled,
            7 => AckResult::CommandLongOnly,
            8 => AckResult::CommandIntOnly,
            _ => return None,
        })
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            AckResult::Accepted => "ACCEPTED",
            AckResult::TemporarilyRejected => "TEMPORARILY_REJECTED",
            AckResult::Denied => "DENIED",
            AckResult::Unsupported => "UNSUPPORTED",
            AckResult::Failed => "FAILED",
            AckResult::InProgress => "IN_PROGRESS",
            AckResult::Cancelled => "CANCELLED",
            AckResult::CommandLongOnly => "COMMAND_LONG_ONLY",
            AckResult::CommandIntOnly => "COMMAND_INT_ONLY",
        }
    }
}

impl fmt::Display for AckResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// COMMAND_ACK with its MAVLink 2 extension fields.
///
/// Wire order is the base fields (command, result) followed by the
/// extensions in declaration order; trailing zero bytes are truncated on
/// send and restored on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    /// Raw MAV_CMD id. Kept raw so unknown commands can still be answered.
    pub command: u16,
    pub result: AckResult,
    pub progress: u8,
    pub result_param2: i32,
    pub target_system: u8,
    pub target_component: u8,
}

impl CommandAck {
    pub const ID: u32 = COMMAND_ACK_DATA::ID;
    pub const EXTRA_CRC: u8 = COMMAND_ACK_DATA::EXTRA_CRC;
    pub const ENCODED_LEN: usize = 10;

    pub fn new(command: MavCmd, result: AckResult, target_system: u8, target_component: u8) -> Self {
        Self {
            command: command as u16,
            result,
            progress: 0,
            result_param2: 0,
            target_system,
            target_component,
        }
    }

    pub fn is_for(&self, command: MavCmd) -> bool {
        self.command == command as u16
    }

    /// Writes the payload into `buf` and returns its truncated length.
    pub fn encode(&self, buf: &mut [u8; Self::ENCODED_LEN]) -> usize {
        buf[0..2].copy_from_slice(&self.command.to_le_bytes());
        buf[2] = self.result.raw();
        buf[3] = self.progress;
        buf[4..8].copy_from_slice(&self.result_param2.to_le_bytes());
        buf[8] = self.target_system;
        buf[9] = self.target_component;
        // at least one byte stays, as for every MAVLink 2 payload
        buf.iter().rposition(|b| *b != 0).map(|i| i + 1).unwrap_or(1)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, FrameError> {
        let mut buf = [0u8; Self::ENCODED_LEN];
        let n = payload.len().min(Self::ENCODED_LEN);
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(Self {
            command: u16::from_le_bytes([buf[0], buf[1]]),
            result: AckResult::from_raw(buf[2]).ok_or(FrameError::UnknownAckResult(buf[2]))?,
            progress: buf[3],
            result_param2: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            target_system: buf[8],
            target_component: buf[9],
        })
    }
}

/// What the command sender does with a COMMAND_ACK result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// ACCEPTED or IN_PROGRESS: stop retrying, success.
    Done,
    /// TEMPORARILY_REJECTED: send again next period.
    Retry,
    /// Anything else: stop retrying, failure.
    Fail,
}

impl AckPolicy {
    pub fn classify(result: AckResult) -> Self {
        match result {
            AckResult::Accepted | AckResult::InProgress => AckPolicy::Done,
            AckResult::TemporarilyRejected => AckPolicy::Retry,
            _ => AckPolicy::Fail,
        }
    }
}

/// CHANGE_OPERATOR_CONTROL.control_request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlRequest {
    Take = 0,
    Release = 1,
}

impl ControlRequest {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(ControlRequest::Take),
            1 => Some(ControlRequest::Release),
            _ => None,
        }
    }
}

/// CHANGE_OPERATOR_CONTROL_ACK.ack. Codes 1 and 2 both mean the key was
/// wrong; responders here only send 1, code 2 comes from other stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlAck {
    Accepted = 0,
    BadKey = 1,
    BadKeyEncryption = 2,
    AlreadyControlled = 3,
}

impl ControlAck {
    pub fn from_raw(v: u8) -> Option<Self> {
        match v {
            0 => Some(ControlAck::Accepted),
            1 => Some(ControlAck::BadKey),
            2 => Some(ControlAck::BadKeyEncryption),
            3 => Some(ControlAck::AlreadyControlled),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_policy_matches_result_codes() {
        assert_eq!(AckPolicy::classify(AckResult::Accepted), AckPolicy::Done);
        assert_eq!(AckPolicy::classify(AckResult::InProgress), AckPolicy::Done);
        assert_eq!(AckPolicy::classify(AckResult::TemporarilyRejected), AckPolicy::Retry);
        assert_eq!(AckPolicy::classify(AckResult::Denied), AckPolicy::Fail);
        assert_eq!(AckPolicy::classify(AckResult::Unsupported), AckPolicy::Fail);
        assert_eq!(AckPolicy::classify(AckResult::CommandIntOnly), AckPolicy::Fail);
        assert_eq!(AckPolicy::classify(AckResult::CommandLongOnly), AckPolicy::Fail);
    }

    #[test]
    fn wrong_shape_codes_have_their_mavlink_values() {
        assert_eq!(AckResult::CommandLongOnly.raw(), 7);
        assert_eq!(AckResult::CommandIntOnly.raw(), 8);
        assert_eq!(AckResult::from_raw(8), Some(AckResult::CommandIntOnly));
        assert_eq!(AckResult::from_raw(9), None);
    }

    #[test]
    fn ack_payload_carries_extension_fields() {
        let ack = CommandAck {
            command: MavCmd::MAV_CMD_DO_REPOSITION as u16,
            result: AckResult::CommandIntOnly,
            progress: 0,
            result_param2: -7,
            target_system: 250,
            target_component: 190,
        };
        let mut buf = [0u8; CommandAck::ENCODED_LEN];
        assert_eq!(ack.encode(&mut buf), CommandAck::ENCODED_LEN);
        assert_eq!(&buf[..3], &[192, 0, 8]);
        assert_eq!(&buf[8..], &[250, 190]);
        assert_eq!(CommandAck::decode(&buf).unwrap(), ack);
    }

    #[test]
    fn truncated_ack_payload_is_zero_filled() {
        let ack = CommandAck::new(MavCmd::MAV_CMD_NAV_LAND, AckResult::Accepted, 0, 0);
        let mut buf = [0u8; CommandAck::ENCODED_LEN];
        let n = ack.encode(&mut buf);
        assert_eq!(n, 1);
        let back = CommandAck::decode(&buf[..n]).unwrap();
        assert!(back.is_for(MavCmd::MAV_CMD_NAV_LAND));
        assert_eq!((back.result, back.target_system), (AckResult::Accepted, 0));
    }

    #[test]
    fn unknown_result_code_is_an_error() {
        assert!(matches!(CommandAck::decode(&[21, 0, 42]), Err(FrameError::UnknownAckResult(42))));
    }

    #[test]
    fn control_codes_round_trip() {
        for v in 0..4u8 {
            assert_eq!(ControlAck::from_raw(v).map(ControlAck::raw), Some(v));
        }
        assert_eq!(ControlAck::from_raw(4), None);
        assert_eq!(ControlRequest::from_raw(1), Some(ControlRequest::Release));
        assert_eq!(ControlRequest::from_raw(2), None);
    }
}
