//! Named commands understood by the autopilot and camera nodes, and which
//! wire shape each one may travel in.

use std::fmt;
use std::str::FromStr;

use mavlink::common::MavCmd;

/// COMMAND_LONG carries seven floats; COMMAND_INT carries four floats, a
/// frame and scaled-integer x/y/z.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    Long,
    Int,
    Either,
}

impl WireShape {
    pub fn accepts_long(self) -> bool {
        matches!(self, WireShape::Long | WireShape::Either)
    }

    pub fn accepts_int(self) -> bool {
        matches!(self, WireShape::Int | WireShape::Either)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized command name: {0:?}")]
pub struct UnknownCommand(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    DoSetMode,
    DoChangeAltitude,
    DoChangeSpeed,
    DoReposition,
    NavVtolTakeoff,
    NavLand,
    NavVtolLand,
    NavReturnToLaunch,
    NavLoiterUnlim,
    DoGimbalManagerPitchyaw,
    DoSetRoiNone,
    DoSetRoiLocation,
    ImageStartCapture,
    ImageStopCapture,
}

impl CommandName {
    pub const ALL: [CommandName; 14] = [
        CommandName::DoSetMode,
        CommandName::DoChangeAltitude,
        CommandName::DoChangeSpeed,
        CommandName::DoReposition,
        CommandName::NavVtolTakeoff,
        CommandName::NavLand,
        CommandName::NavVtolLand,
        CommandName::NavReturnToLaunch,
        CommandName::NavLoiterUnlim,
        CommandName::DoGimbalManagerPitchyaw,
        CommandName::DoSetRoiNone,
        CommandName::DoSetRoiLocation,
        CommandName::ImageStartCapture,
        CommandName::ImageStopCapture,
    ];

    pub fn mav_cmd(self) -> MavCmd {
        match self {
            CommandName::DoSetMode => MavCmd::MAV_CMD_DO_SET_MODE,
            CommandName::DoChangeAltitude => MavCmd::MAV_CMD_DO_CHANGE_ALTITUDE,
            CommandName::DoChangeSpeed => MavCmd::MAV_CMD_DO_CHANGE_SPEED,
            CommandName::DoReposition => MavCmd::MAV_CMD_DO_REPOSITION,
            CommandName::NavVtolTakeoff => MavCmd::MAV_CMD_NAV_VTOL_TAKEOFF,
            CommandName::NavLand => MavCmd::MAV_CMD_NAV_LAND,
            CommandName::NavVtolLand => MavCmd::MAV_CMD_NAV_VTOL_LAND,
            CommandName::NavReturnToLaunch => MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH,
            CommandName::NavLoiterUnlim => MavCmd::MAV_CMD_NAV_LOITER_UNLIM,
            CommandName::DoGimbalManagerPitchyaw => MavCmd::MAV_CMD_DO_GIMBAL_MANAGER_PITCHYAW,
            CommandName::DoSetRoiNone => MavCmd::MAV_CMD_DO_SET_ROI_NONE,
            CommandName::DoSetRoiLocation => MavCmd::MAV_CMD_DO_SET_ROI_LOCATION,
            CommandName::ImageStartCapture => MavCmd::MAV_CMD_IMAGE_START_CAPTURE,
            CommandName::ImageStopCapture => MavCmd::MAV_CMD_IMAGE_STOP_CAPTURE,
        }
    }

    pub fn from_mav_cmd(cmd: MavCmd) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.mav_cmd() == cmd)
    }

    /// Position-carrying commands need COMMAND_INT for full lat/lon precision;
    /// mode and setpoint changes are COMMAND_LONG only.
    pub fn shape(self) -> WireShape {
        match self {
            CommandName::DoSetMode
            | CommandName::DoChangeAltitude
            | CommandName::DoChangeSpeed
            | CommandName::NavReturnToLaunch
            | CommandName::NavLoiterUnlim
            | CommandName::DoGimbalManagerPitchyaw
            | CommandName::DoSetRoiNone => WireShape::Long,
            CommandName::DoReposition
            | CommandName::NavVtolTakeoff
            | CommandName::NavLand
            | CommandName::NavVtolLand
            | CommandName::DoSetRoiLocation => WireShape::Int,
            CommandName::ImageStartCapture | CommandName::ImageStopCapture => WireShape::Either,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandName::DoSetMode => "DO_SET_MODE",
            CommandName::DoChangeAltitude => "DO_CHANGE_ALTITUDE",
            CommandName::DoChangeSpeed => "DO_CHANGE_SPEED",
            CommandName::DoReposition => "DO_REPOSITION",
            CommandName::NavVtolTakeoff => "NAV_VTOL_TAKEOFF",
            CommandName::NavLand => "NAV_LAND",
            CommandName::NavVtolLand => "NAV_VTOL_LAND",
            CommandName::NavReturnToLaunch => "NAV_RETURN_TO_LAUNCH",
            CommandName::NavLoiterUnlim => "NAV_LOITER_UNLIM",
            CommandName::DoGimbalManagerPitchyaw => "DO_GIMBAL_MANAGER_PITCHYAW",
            CommandName::DoSetRoiNone => "DO_SET_ROI_NONE",
            CommandName::DoSetRoiLocation => "DO_SET_ROI_LOCATION",
            CommandName::ImageStartCapture => "IMAGE_START_CAPTURE",
            CommandName::ImageStopCapture => "IMAGE_STOP_CAPTURE",
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CommandName {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("MAV_CMD_").unwrap_or(&upper);
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name() == name)
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

/// Pads with zeros or truncates to exactly seven parameter slots. Kept in
/// f64 so scaled lat/lon survive until they are rounded into COMMAND_INT.
pub fn pad_params(params: &[f64]) -> [f64; 7] {
    let mut out = [0.0f64; 7];
    for (slot, v) in out.iter_mut().zip(params) {
        *slot = *v;
    }
    out
}
