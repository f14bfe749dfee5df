//! Static legality tables for the aircraft's operating phase.
//!
//! Every table is an exhaustive `match` over [`CustomSubmode`], so a missing
//! entry is a compile error rather than a runtime lookup failure. Index 0 of
//! each list is the default for that submode. In [`allowed_submode_changes`]
//! index 0 is the default step up and index 1 (when present) the default
//! step down.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unrecognized {kind}: {value:?}")]
    Unknown { kind: &'static str, value: String },
}

/// Health / readiness of the aircraft. Values match MAV_STATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum State {
    Uninit = 0,
    Boot = 1,
    Calibrating = 2,
    Standby = 3,
    Active = 4,
    Critical = 5,
    Emergency = 6,
    Poweroff = 7,
}

impl State {
    pub const NOMINAL: [State; 5] = [
        State::Uninit,
        State::Boot,
        State::Calibrating,
        State::Standby,
        State::Active,
    ];

    pub const ABNORMAL: [State; 3] = [State::Critical, State::Emergency, State::Poweroff];

    pub fn is_abnormal(self) -> bool {
        Self::ABNORMAL.contains(&self)
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(v: u32) -> Option<Self> {
        Self::NOMINAL
            .iter()
            .chain(Self::ABNORMAL.iter())
            .copied()
            .find(|s| s.raw() as u32 == v)
    }

    pub fn name(self) -> &'static str {
        match self {
            State::Uninit => "UNINIT",
            State::Boot => "BOOT",
            State::Calibrating => "CALIBRATING",
            State::Standby => "STANDBY",
            State::Active => "ACTIVE",
            State::Critical => "CRITICAL",
            State::Emergency => "EMERGENCY",
            State::Poweroff => "POWEROFF",
        }
    }
}

/// Base mode. Values match MAV_MODE (the flag byte sent in HEARTBEAT.base_mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Mode {
    Preflight = 0,
    ManualArmed = 192,
    GuidedArmed = 216,
    AutoArmed = 220,
    AutoDisarmed = 92,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::Preflight,
        Mode::ManualArmed,
        Mode::GuidedArmed,
        Mode::AutoArmed,
        Mode::AutoDisarmed,
    ];

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.raw() as u32 == v)
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Preflight => "PREFLIGHT",
            Mode::ManualArmed => "MANUAL_ARMED",
            Mode::GuidedArmed => "GUIDED_ARMED",
            Mode::AutoArmed => "AUTO_ARMED",
            Mode::AutoDisarmed => "AUTO_DISARMED",
        }
    }
}

/// Coarse flight phase, sent as HEARTBEAT.custom_mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CustomMode {
    Uninit = 0,
    Boot = 1,
    Ground = 2,
    Takeoff = 3,
    Flight = 4,
    Landing = 5,
    Emergency = 9,
}

impl CustomMode {
    pub const ALL: [CustomMode; 7] = [
        CustomMode::Uninit,
        CustomMode::Boot,
        CustomMode::Ground,
        CustomMode::Takeoff,
        CustomMode::Flight,
        CustomMode::Landing,
        CustomMode::Emergency,
    ];

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.raw() as u32 == v)
    }

    pub fn name(self) -> &'static str {
        match self {
            CustomMode::Uninit => "UNINIT",
            CustomMode::Boot => "BOOT",
            CustomMode::Ground => "GROUND",
            CustomMode::Takeoff => "TAKEOFF",
            CustomMode::Flight => "FLIGHT",
            CustomMode::Landing => "LANDING",
            CustomMode::Emergency => "EMERGENCY",
        }
    }
}

/// Fine-grained flight phase. The tens digit is the owning [`CustomMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum CustomSubmode {
    Uninit = 0,
    Boot = 10,
    Shutdown = 11,
    GroundDisarmed = 20,
    GroundArmed = 21,
    TakeoffAscent = 30,
    TakeoffDepart = 31,
    TakeoffTransit = 32,
    FlightNormal = 40,
    FlightManual = 41,
    FlightTerrainAvoidance = 42,
    LandingTransit = 50,
    LandingHover = 51,
    LandingDescent = 52,
    EmergencyMultiMotors = 90,
    EmergencySingleMotor = 91,
    EmergencyGpsFail = 92,
    EmergencyCommFail = 93,
    EmergencyUnknown = 99,
}

use CustomSubmode as S;

const EMERGENCIES: [CustomSubmode; 5] = [
    S::EmergencyMultiMotors,
    S::EmergencySingleMotor,
    S::EmergencyGpsFail,
    S::EmergencyCommFail,
    S::EmergencyUnknown,
];

impl CustomSubmode {
    pub const ALL: [CustomSubmode; 19] = [
        S::Uninit,
        S::Boot,
        S::Shutdown,
        S::GroundDisarmed,
        S::GroundArmed,
        S::TakeoffAscent,
        S::TakeoffDepart,
        S::TakeoffTransit,
        S::FlightNormal,
        S::FlightManual,
        S::FlightTerrainAvoidance,
        S::LandingTransit,
        S::LandingHover,
        S::LandingDescent,
        S::EmergencyMultiMotors,
        S::EmergencySingleMotor,
        S::EmergencyGpsFail,
        S::EmergencyCommFail,
        S::EmergencyUnknown,
    ];

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn from_raw(v: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.raw() as u32 == v)
    }

    pub fn is_emergency(self) -> bool {
        EMERGENCIES.contains(&self)
    }

    pub fn name(self) -> &'static str {
        match self {
            S::Uninit => "UNINIT",
            S::Boot => "BOOT",
            S::Shutdown => "SHUTDOWN",
            S::GroundDisarmed => "GROUND_DISARMED",
            S::GroundArmed => "GROUND_ARMED",
            S::TakeoffAscent => "TAKEOFF_ASCENT",
            S::TakeoffDepart => "TAKEOFF_DEPART",
            S::TakeoffTransit => "TAKEOFF_TRANSIT",
            S::FlightNormal => "FLIGHT_NORMAL",
            S::FlightManual => "FLIGHT_MANUAL",
            S::FlightTerrainAvoidance => "FLIGHT_TERRAIN_AVOIDANCE",
            S::LandingTransit => "LANDING_TRANSIT",
            S::LandingHover => "LANDING_HOVER",
            S::LandingDescent => "LANDING_DESCENT",
            S::EmergencyMultiMotors => "EMERGENCY_MULTI_MOTORS",
            S::EmergencySingleMotor => "EMERGENCY_SINGLE_MOTOR",
            S::EmergencyGpsFail => "EMERGENCY_GPS_FAIL",
            S::EmergencyCommFail => "EMERGENCY_COMM_FAIL",
            S::EmergencyUnknown => "EMERGENCY_UNKNOWN",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for CustomMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for CustomSubmode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Accepts the table name in any case, with or without the CUSTOM_SUBMODE_
// prefix, or the numeric wire value.
impl FromStr for CustomSubmode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if let Ok(n) = t.parse::<u32>() {
            return Self::from_raw(n).ok_or_else(|| unknown("submode", s));
        }
        let upper = t.to_ascii_uppercase();
        let name = upper.strip_prefix("CUSTOM_SUBMODE_").unwrap_or(&upper);
        Self::ALL
            .iter()
            .copied()
            .find(|sm| sm.name() == name)
            .ok_or_else(|| unknown("submode", s))
    }
}

impl FromStr for Mode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if let Ok(n) = t.parse::<u32>() {
            return Self::from_raw(n).ok_or_else(|| unknown("mode", s));
        }
        let upper = t.to_ascii_uppercase();
        let name = upper.strip_prefix("MAV_MODE_").unwrap_or(&upper);
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == name)
            .ok_or_else(|| unknown("mode", s))
    }
}

impl FromStr for CustomMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if let Ok(n) = t.parse::<u32>() {
            return Self::from_raw(n).ok_or_else(|| unknown("custom mode", s));
        }
        let upper = t.to_ascii_uppercase();
        let name = upper.strip_prefix("CUSTOM_MODE_").unwrap_or(&upper);
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name() == name)
            .ok_or_else(|| unknown("custom mode", s))
    }
}

fn unknown(kind: &'static str, value: &str) -> ParseError {
    ParseError::Unknown { kind, value: value.to_string() }
}

// ----- Tables -----

pub fn allowed_modes(sub: CustomSubmode) -> &'static [Mode] {
    use Mode::*;
    match sub {
        S::Uninit | S::Boot | S::Shutdown => &[Preflight],
        S::GroundDisarmed => &[Preflight, AutoDisarmed],
        S::FlightManual => &[ManualArmed],
        S::GroundArmed
        | S::TakeoffAscent
        | S::TakeoffDepart
        | S::TakeoffTransit
        | S::FlightNormal
        | S::FlightTerrainAvoidance
        | S::LandingTransit
        | S::LandingHover
        | S::LandingDescent
        | S::EmergencyMultiMotors
        | S::EmergencySingleMotor
        | S::EmergencyGpsFail
        | S::EmergencyCommFail
        | S::EmergencyUnknown => &[GuidedArmed, AutoArmed],
    }
}

pub fn allowed_custom_modes(sub: CustomSubmode) -> &'static [CustomMode] {
    use CustomMode::*;
    match sub {
        S::Uninit => &[Uninit],
        S::Boot | S::Shutdown => &[Boot],
        S::GroundDisarmed | S::GroundArmed => &[Ground],
        S::TakeoffAscent | S::TakeoffDepart | S::TakeoffTransit => &[Takeoff],
        S::FlightNormal | S::FlightManual | S::FlightTerrainAvoidance => &[Flight],
        S::LandingTransit | S::LandingHover | S::LandingDescent => &[Landing],
        S::EmergencyMultiMotors
        | S::EmergencySingleMotor
        | S::EmergencyGpsFail
        | S::EmergencyCommFail
        | S::EmergencyUnknown => &[Emergency],
    }
}

pub fn allowed_states(sub: CustomSubmode) -> &'static [State] {
    use State::*;
    match sub {
        S::Uninit => &[Uninit, Poweroff, Critical],
        S::Boot => &[Boot, Calibrating, Standby, Critical],
        S::Shutdown => &[Poweroff, Boot, Critical],
        S::GroundDisarmed => &[Standby],
        S::GroundArmed
        | S::TakeoffAscent
        | S::TakeoffDepart
        | S::TakeoffTransit
        | S::FlightNormal
        | S::FlightManual
        | S::FlightTerrainAvoidance
        | S::LandingTransit
        | S::LandingHover
        | S::LandingDescent => &[Active],
        S::EmergencyMultiMotors
        | S::EmergencySingleMotor
        | S::EmergencyGpsFail
        | S::EmergencyCommFail
        | S::EmergencyUnknown => &[Critical, Emergency],
    }
}

pub fn allowed_submode_changes(sub: CustomSubmode) -> &'static [CustomSubmode] {
    match sub {
        S::Uninit => &[S::Boot],
        S::Boot => &[S::GroundDisarmed, S::Shutdown],
        S::Shutdown => &[S::Uninit, S::Boot],
        S::GroundDisarmed => &[S::GroundArmed, S::Shutdown],
        S::GroundArmed => &[S::TakeoffAscent, S::GroundDisarmed],
        S::TakeoffAscent => &[
            S::TakeoffDepart, S::LandingDescent,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::TakeoffDepart => &[
            S::TakeoffTransit, S::LandingHover,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::TakeoffTransit => &[
            S::FlightNormal, S::LandingTransit,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::FlightNormal => &[
            S::LandingTransit, S::FlightTerrainAvoidance, S::FlightManual,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::FlightManual => &[
            S::FlightNormal,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::FlightTerrainAvoidance => &[
            S::FlightNormal, S::FlightManual,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::LandingTransit => &[
            S::LandingHover, S::TakeoffTransit,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::LandingHover => &[
            S::LandingDescent, S::TakeoffDepart,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::LandingDescent => &[
            S::GroundDisarmed, S::TakeoffAscent,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::EmergencyMultiMotors => &[
            S::LandingDescent, S::LandingHover, S::FlightNormal,
            S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::EmergencySingleMotor => &[
            S::LandingDescent, S::LandingHover, S::FlightNormal,
            S::EmergencyMultiMotors, S::EmergencyGpsFail, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::EmergencyGpsFail => &[
            S::LandingDescent, S::LandingHover, S::FlightNormal,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyCommFail, S::EmergencyUnknown,
        ],
        S::EmergencyCommFail => &[
            S::LandingDescent, S::LandingHover, S::FlightNormal,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyUnknown,
        ],
        S::EmergencyUnknown => &[
            S::LandingDescent, S::LandingHover, S::FlightNormal,
            S::EmergencyMultiMotors, S::EmergencySingleMotor, S::EmergencyGpsFail, S::EmergencyCommFail,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_submode_has_all_four_tables() {
        for sub in CustomSubmode::ALL {
            assert!(!allowed_modes(sub).is_empty(), "{sub} has no modes");
            assert!(!allowed_custom_modes(sub).is_empty(), "{sub} has no custom modes");
            assert!(!allowed_states(sub).is_empty(), "{sub} has no states");
            assert!(!allowed_submode_changes(sub).is_empty(), "{sub} has no successors");
        }
    }

    #[test]
    fn submode_graph_reaches_everything_from_uninit() {
        let mut seen = HashSet::new();
        let mut queue = vec![CustomSubmode::Uninit];
        while let Some(sub) = queue.pop() {
            if seen.insert(sub) {
                queue.extend(allowed_submode_changes(sub).iter().copied());
            }
        }
        for sub in CustomSubmode::ALL {
            assert!(seen.contains(&sub), "{sub} unreachable from UNINIT");
        }
    }

    #[test]
    fn no_submode_lists_itself_as_successor() {
        for sub in CustomSubmode::ALL {
            assert!(!allowed_submode_changes(sub).contains(&sub), "{sub} loops to itself");
        }
    }

    #[test]
    fn emergency_submodes_map_to_emergency_custom_mode() {
        for sub in EMERGENCIES {
            assert!(sub.is_emergency());
            assert_eq!(allowed_custom_modes(sub), &[CustomMode::Emergency]);
        }
    }

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!("ground_armed".parse::<CustomSubmode>(), Ok(CustomSubmode::GroundArmed));
        assert_eq!("CUSTOM_SUBMODE_FLIGHT_NORMAL".parse::<CustomSubmode>(), Ok(CustomSubmode::FlightNormal));
        assert_eq!("52".parse::<CustomSubmode>(), Ok(CustomSubmode::LandingDescent));
        assert_eq!("MAV_MODE_AUTO_ARMED".parse::<Mode>(), Ok(Mode::AutoArmed));
        assert_eq!("flight".parse::<CustomMode>(), Ok(CustomMode::Flight));
    }

    #[test]
    fn rejects_unknown_names() {
        assert!("TAKEOFF_HOVER".parse::<CustomSubmode>().is_err());
        assert!("53".parse::<CustomSubmode>().is_err());
        assert!("".parse::<Mode>().is_err());
    }

    #[test]
    fn state_partition_is_disjoint() {
        for s in State::NOMINAL {
            assert!(!s.is_abnormal());
        }
        for s in State::ABNORMAL {
            assert!(s.is_abnormal());
        }
        assert_eq!(State::from_raw(6), Some(State::Emergency));
        assert_eq!(State::from_raw(8), None);
    }
}
