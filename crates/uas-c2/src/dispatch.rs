//! Receiving side of the command channel: shape check, execution and the
//! COMMAND_ACK that goes back.

use mavlink::common::{MavCmd, MavMessage, COMMAND_INT_DATA, COMMAND_LONG_DATA};
use tracing::{debug, warn};

use uas_modes::{FlightStateMachine, ModeRequest};
use uas_proto::{AckResult, CommandAck, CommandName, Packet};

use crate::session::ControlResponder;
use crate::transport::Inbound;

/// A node that executes commands from its controlling peer.
pub trait Responder {
    /// Whether this node knows `name` at all.
    fn accepts(&self, name: CommandName) -> bool;

    /// Runs a command whose shape has already been checked. `params` holds
    /// param1..4 followed by param5..7 (x, y, z for COMMAND_INT, with x and
    /// y exact).
    fn execute(&mut self, name: CommandName, params: &[f64; 7]) -> AckResult;
}

pub fn dispatch_long<R: Responder + ?Sized>(r: &mut R, cmd: &COMMAND_LONG_DATA) -> AckResult {
    let Some(name) = known(r, cmd.command) else {
        return AckResult::Unsupported;
    };
    if !name.shape().accepts_long() {
        debug!("dispatch: {} arrived as COMMAND_LONG", name);
        return AckResult::CommandIntOnly;
    }
    let params = [cmd.param1, cmd.param2, cmd.param3, cmd.param4, cmd.param5, cmd.param6, cmd.param7];
    r.execute(name, &params.map(f64::from))
}

pub fn dispatch_int<R: Responder + ?Sized>(r: &mut R, cmd: &COMMAND_INT_DATA) -> AckResult {
    let Some(name) = known(r, cmd.command) else {
        return AckResult::Unsupported;
    };
    if !name.shape().accepts_int() {
        debug!("dispatch: {} arrived as COMMAND_INT", name);
        return AckResult::CommandLongOnly;
    }
    let params = [
        f64::from(cmd.param1),
        f64::from(cmd.param2),
        f64::from(cmd.param3),
        f64::from(cmd.param4),
        f64::from(cmd.x),
        f64::from(cmd.y),
        f64::from(cmd.z),
    ];
    r.execute(name, &params)
}

fn known<R: Responder + ?Sized>(r: &R, cmd: MavCmd) -> Option<CommandName> {
    let name = CommandName::from_mav_cmd(cmd).filter(|n| r.accepts(*n));
    if name.is_none() {
        debug!("dispatch: unsupported command {:?}", cmd);
    }
    name
}

/// COMMAND_ACK addressed back to the sender of `command`.
pub fn command_ack(command: MavCmd, result: AckResult, target_system: u8, target_component: u8) -> CommandAck {
    CommandAck::new(command, result, target_system, target_component)
}

/// Runs one inbound frame through the control session and `r`, returning
/// the reply if there is one. Commands from anyone but the session holder
/// are dropped without an answer. `local` is our (system, component).
pub fn serve<R: Responder + ?Sized>(
    local: (u8, u8),
    session: &mut ControlResponder,
    r: &mut R,
    f: &Inbound,
) -> Option<Packet> {
    let src = f.source();
    session.heard(src);
    let Packet::Mav(msg) = &f.msg else {
        return None;
    };
    let (command, result) = match msg {
        MavMessage::CHANGE_OPERATOR_CONTROL(req) => {
            return session.handle(src, req).map(|ack| MavMessage::CHANGE_OPERATOR_CONTROL_ACK(ack).into());
        }
        MavMessage::COMMAND_LONG(cmd) if addressed(local, cmd.target_system, cmd.target_component) => {
            if !authorized(session, src) {
                return None;
            }
            (cmd.command, dispatch_long(r, cmd))
        }
        MavMessage::COMMAND_INT(cmd) if addressed(local, cmd.target_system, cmd.target_component) => {
            if !authorized(session, src) {
                return None;
            }
            (cmd.command, dispatch_int(r, cmd))
        }
        _ => return None,
    };
    Some(command_ack(command, result, src, f.header.component_id).into())
}

/// Component 0 addresses every component of the system.
fn addressed((system, component): (u8, u8), target_system: u8, target_component: u8) -> bool {
    target_system == system && (target_component == 0 || target_component == component)
}

fn authorized(session: &ControlResponder, src: u8) -> bool {
    let ok = session.is_controlled_by(src);
    if !ok {
        debug!("dispatch: ignoring command from {}, controller is {:?}", src, session.controller());
    }
    ok
}

/// The autopilot: DO_SET_MODE drives the flight state machine, every other
/// flight command is acknowledged for the control loop to pick up.
impl Responder for FlightStateMachine {
    fn accepts(&self, name: CommandName) -> bool {
        !matches!(name, CommandName::ImageStartCapture | CommandName::ImageStopCapture)
    }

    fn execute(&mut self, name: CommandName, params: &[f64; 7]) -> AckResult {
        if name != CommandName::DoSetMode {
            debug!("dispatch: {} acknowledged", name);
            return AckResult::Accepted;
        }
        let [mode, custom_mode, custom_submode, ..] = params.map(|p| p as f32);
        match ModeRequest::from_params(mode, custom_mode, custom_submode).and_then(|req| self.apply(req)) {
            Ok(()) => AckResult::Accepted,
            Err(e) => {
                warn!("dispatch: set mode denied: {}", e);
                AckResult::Denied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::MavFrame;
    use mavlink::MavHeader;
    use uas_keys::SharedKey;
    use uas_modes::{CustomSubmode, State};

    fn long(command: MavCmd, p: [f32; 3]) -> COMMAND_LONG_DATA {
        COMMAND_LONG_DATA {
            target_system: 3,
            target_component: 1,
            command,
            confirmation: 0,
            param1: p[0],
            param2: p[1],
            param3: p[2],
            param4: 0.0,
            param5: 0.0,
            param6: 0.0,
            param7: 0.0,
        }
    }

    fn int(command: MavCmd) -> COMMAND_INT_DATA {
        COMMAND_INT_DATA {
            target_system: 3,
            target_component: 1,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT_INT,
            command,
            current: 0,
            autocontinue: 0,
            param1: 0.0,
            param2: 0.0,
            param3: 0.0,
            param4: 0.0,
            x: 473_977_421,
            y: 85_455_938,
            z: 30.0,
        }
    }

    fn set_mode(sub: CustomSubmode) -> COMMAND_LONG_DATA {
        long(MavCmd::MAV_CMD_DO_SET_MODE, ModeRequest::for_submode(sub).params())
    }

    #[test]
    fn set_mode_accepted_then_denied() {
        let mut fsm = FlightStateMachine::new();
        assert_eq!(dispatch_long(&mut fsm, &set_mode(CustomSubmode::Boot)), AckResult::Accepted);
        assert_eq!(fsm.custom_submode(), CustomSubmode::Boot);
        assert!(fsm.take_boot_request());

        // BOOT -> FLIGHT_NORMAL is not an edge
        assert_eq!(dispatch_long(&mut fsm, &set_mode(CustomSubmode::FlightNormal)), AckResult::Denied);
        assert_eq!(fsm.custom_submode(), CustomSubmode::Boot);
        assert_eq!(fsm.state(), State::Boot);
    }

    #[test]
    fn garbage_mode_params_are_denied() {
        let mut fsm = FlightStateMachine::new();
        let before = fsm.snapshot();
        let cmd = long(MavCmd::MAV_CMD_DO_SET_MODE, [0.0, 1.0, 10.5]);
        assert_eq!(dispatch_long(&mut fsm, &cmd), AckResult::Denied);
        let cmd = long(MavCmd::MAV_CMD_DO_SET_MODE, [0.0, 1.0, 77.0]);
        assert_eq!(dispatch_long(&mut fsm, &cmd), AckResult::Denied);
        assert_eq!(fsm.snapshot(), before);
    }

    #[test]
    fn wrong_shape_gets_dedicated_result() {
        let mut fsm = FlightStateMachine::new();
        assert_eq!(
            dispatch_long(&mut fsm, &long(MavCmd::MAV_CMD_DO_REPOSITION, [0.0; 3])),
            AckResult::CommandIntOnly
        );
        assert_eq!(dispatch_int(&mut fsm, &int(MavCmd::MAV_CMD_DO_SET_MODE)), AckResult::CommandLongOnly);
        assert_eq!(dispatch_int(&mut fsm, &int(MavCmd::MAV_CMD_DO_REPOSITION)), AckResult::Accepted);
        assert_eq!(fsm.custom_submode(), CustomSubmode::Uninit);
    }

    #[test]
    fn unknown_commands_are_unsupported() {
        let mut fsm = FlightStateMachine::new();
        let cmd = long(MavCmd::MAV_CMD_DO_FLIGHTTERMINATION, [1.0, 0.0, 0.0]);
        assert_eq!(dispatch_long(&mut fsm, &cmd), AckResult::Unsupported);
        // camera commands are not the autopilot's
        let cmd = long(MavCmd::MAV_CMD_IMAGE_START_CAPTURE, [0.0; 3]);
        assert_eq!(dispatch_long(&mut fsm, &cmd), AckResult::Unsupported);
    }

    #[test]
    fn other_flight_commands_are_accepted() {
        let mut fsm = FlightStateMachine::new();
        let cmd = long(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, [0.0; 3]);
        assert_eq!(dispatch_long(&mut fsm, &cmd), AckResult::Accepted);
    }

    /// Remembers the last parameters it was handed.
    #[derive(Default)]
    struct Recorder(Option<[f64; 7]>);

    impl Responder for Recorder {
        fn accepts(&self, _name: CommandName) -> bool {
            true
        }

        fn execute(&mut self, _name: CommandName, params: &[f64; 7]) -> AckResult {
            self.0 = Some(*params);
            AckResult::Accepted
        }
    }

    #[test]
    fn int_coordinates_reach_the_responder_exactly() {
        let mut r = Recorder::default();
        dispatch_int(&mut r, &int(MavCmd::MAV_CMD_DO_REPOSITION));
        let p = r.0.unwrap();
        // as f32 these would round to 473_977_408 and 85_455_936
        assert_eq!(p[4], 473_977_421.0);
        assert_eq!(p[5], 85_455_938.0);
        assert_eq!(p[6], 30.0);
    }

    #[test]
    fn ack_is_addressed_to_sender() {
        let ack = command_ack(MavCmd::MAV_CMD_NAV_LAND, AckResult::Accepted, 250, 190);
        assert!(ack.is_for(MavCmd::MAV_CMD_NAV_LAND));
        assert_eq!((ack.target_system, ack.target_component), (250, 190));
    }

    fn from(system_id: u8, component_id: u8, msg: MavMessage) -> Inbound {
        Inbound { header: MavHeader { system_id, component_id, sequence: 0 }, msg: msg.into() }
    }

    #[test]
    fn serve_answers_only_the_session_holder() {
        let key = SharedKey::new("k").unwrap();
        let mut session = ControlResponder::new(3, key.clone());
        let mut fsm = FlightStateMachine::new();
        let boot = MavMessage::COMMAND_LONG(set_mode(CustomSubmode::Boot));

        assert!(serve((3, 1), &mut session, &mut fsm, &from(250, 190, boot.clone())).is_none());

        let take = MavMessage::CHANGE_OPERATOR_CONTROL(mavlink::common::CHANGE_OPERATOR_CONTROL_DATA {
            target_system: 3,
            control_request: 0,
            version: 0,
            passkey: key.passkey(),
        });
        let reply = serve((3, 1), &mut session, &mut fsm, &from(250, 190, take));
        assert!(matches!(reply, Some(Packet::Mav(MavMessage::CHANGE_OPERATOR_CONTROL_ACK(a))) if a.ack == 0));

        let Some(Packet::Ack(ack)) = serve((3, 1), &mut session, &mut fsm, &from(250, 190, boot)) else {
            panic!("expected COMMAND_ACK")
        };
        assert_eq!(ack.result, AckResult::Accepted);
        assert_eq!((ack.target_system, ack.target_component), (250, 190));

        // another component of the system is not the addressee
        let mut other = set_mode(CustomSubmode::Boot);
        other.target_component = 100;
        let other = from(250, 190, MavMessage::COMMAND_LONG(other));
        assert!(serve((3, 1), &mut session, &mut fsm, &other).is_none());
    }
}
