use mavlink::common::{MavAutopilot, MavModeFlag, MavState, MavType, HEARTBEAT_DATA};
use uas_modes::{CustomMode, FlightSnapshot, Mode, State};

/// Tilt-wing VTOL, MAV_TYPE 24.
pub const AUTOPILOT_TYPE: MavType = MavType::MAV_TYPE_VTOL_TILTWING;
pub const AUTOPILOT_KIND: MavAutopilot = MavAutopilot::MAV_AUTOPILOT_GENERIC_WAYPOINTS_AND_SIMPLE_NAVIGATION_ONLY;

/// Nodes that send [`peer_heartbeat`]; the autopilot uses
/// [`vehicle_heartbeat`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Gcs,
    Camera,
}

/// HEARTBEAT for an autopilot: base mode, custom mode and status come from
/// the flight state machine.
pub fn vehicle_heartbeat(s: &FlightSnapshot) -> HEARTBEAT_DATA {
    HEARTBEAT_DATA {
        custom_mode: s.custom_mode.raw() as u32,
        mavtype: AUTOPILOT_TYPE,
        autopilot: AUTOPILOT_KIND,
        base_mode: MavModeFlag::from_bits_truncate(s.mode.raw()),
        system_status: mav_state(s.state),
        mavlink_version: 3,
    }
}

/// HEARTBEAT for nodes without a flight state (GCS, camera).
pub fn peer_heartbeat(role: NodeRole) -> HEARTBEAT_DATA {
    let mavtype = match role {
        NodeRole::Gcs => MavType::MAV_TYPE_GCS,
        NodeRole::Camera => MavType::MAV_TYPE_CAMERA,
    };
    HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::from_bits_truncate(Mode::Preflight.raw()),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    }
}

pub fn mav_state(s: State) -> MavState {
    match s {
        State::Uninit => MavState::MAV_STATE_UNINIT,
        State::Boot => MavState::MAV_STATE_BOOT,
        State::Calibrating => MavState::MAV_STATE_CALIBRATING,
        State::Standby => MavState::MAV_STATE_STANDBY,
        State::Active => MavState::MAV_STATE_ACTIVE,
        State::Critical => MavState::MAV_STATE_CRITICAL,
        State::Emergency => MavState::MAV_STATE_EMERGENCY,
        State::Poweroff => MavState::MAV_STATE_POWEROFF,
    }
}

/// A peer's heartbeat as seen by the other end of the link.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStatus {
    pub system_id: u8,
    pub mavtype: MavType,
    pub mode: Option<Mode>,
    pub custom_mode: Option<CustomMode>,
    pub state: Option<State>,
}

impl PeerStatus {
    pub fn from_heartbeat(system_id: u8, hb: &HEARTBEAT_DATA) -> Self {
        Self {
            system_id,
            mavtype: hb.mavtype,
            mode: Mode::from_raw(hb.base_mode.bits() as u32),
            custom_mode: CustomMode::from_raw(hb.custom_mode),
            state: State::from_raw(hb.system_status as u32),
        }
    }

    pub fn describe(&self) -> String {
        fn or_unknown<T: std::fmt::Display>(v: Option<T>) -> String {
            v.map(|v| v.to_string()).unwrap_or_else(|| "?".into())
        }
        format!(
            "#{} {:?} mode={} custom_mode={} state={}",
            self.system_id,
            self.mavtype,
            or_unknown(self.mode),
            or_unknown(self.custom_mode),
            or_unknown(self.state),
        )
    }
}
