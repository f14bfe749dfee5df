pub mod ack;
pub mod command;
pub mod frame;
pub mod telemetry;

pub use ack::{AckPolicy, AckResult, CommandAck, ControlAck, ControlRequest};
pub use command::{CommandName, WireShape};
pub use frame::{Frame, FrameError, Packet, SigningKey};

/// lat/lon travel as degrees * 1e7 in COMMAND_INT x/y.
pub const LATLON_SCALE: f64 = 1e7;
pub const FT_TO_M: f64 = 0.3048;
pub const KT_TO_MS: f64 = 0.514444;

/// MAVLink's CHANGE_OPERATOR_CONTROL passkey field width.
pub const PASSKEY_LEN: usize = 25;
