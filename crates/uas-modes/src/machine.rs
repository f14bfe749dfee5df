use serde::Serialize;
use tracing::{debug, info};

use crate::registry::{
    allowed_custom_modes, allowed_modes, allowed_states, allowed_submode_changes, CustomMode,
    CustomSubmode, Mode, State,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejected {
    #[error("submode change {from} -> {to} is not allowed")]
    IllegalTransition { from: CustomSubmode, to: CustomSubmode },
    #[error("state {state} is not allowed in submode {submode}")]
    StateNotAllowed { state: State, submode: CustomSubmode },
    #[error("unknown mode value {0}")]
    UnknownMode(u32),
    #[error("unknown custom mode value {0}")]
    UnknownCustomMode(u32),
    #[error("unknown submode value {0}")]
    UnknownSubmode(u32),
    #[error("unknown state value {0}")]
    UnknownState(u32),
    #[error("parameter {0} is not a non-negative integer")]
    NotIntegral(f32),
}

/// Read-only copy of the four fields, handed to every reader outside the
/// owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlightSnapshot {
    pub state: State,
    pub mode: Mode,
    pub custom_mode: CustomMode,
    pub custom_submode: CustomSubmode,
}

impl Default for FlightSnapshot {
    fn default() -> Self {
        Self {
            state: State::Uninit,
            mode: Mode::Preflight,
            custom_mode: CustomMode::Uninit,
            custom_submode: CustomSubmode::Uninit,
        }
    }
}

impl FlightSnapshot {
    /// True when all four fields are members of the current submode's tables.
    pub fn is_legal(&self) -> bool {
        allowed_modes(self.custom_submode).contains(&self.mode)
            && allowed_custom_modes(self.custom_submode).contains(&self.custom_mode)
            && allowed_states(self.custom_submode).contains(&self.state)
    }
}

/// A DO_SET_MODE request decoded from wire parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeRequest {
    pub mode: Mode,
    pub custom_mode: CustomMode,
    pub custom_submode: CustomSubmode,
}

impl ModeRequest {
    /// Decodes param1..param3 of a DO_SET_MODE command. Fractional, negative
    /// and unknown values are rejected rather than truncated.
    pub fn from_params(mode: f32, custom_mode: f32, custom_submode: f32) -> Result<Self, Rejected> {
        let mode = integral(mode)?;
        let custom_mode = integral(custom_mode)?;
        let custom_submode = integral(custom_submode)?;
        Ok(Self {
            mode: Mode::from_raw(mode).ok_or(Rejected::UnknownMode(mode))?,
            custom_mode: CustomMode::from_raw(custom_mode).ok_or(Rejected::UnknownCustomMode(custom_mode))?,
            custom_submode: CustomSubmode::from_raw(custom_submode)
                .ok_or(Rejected::UnknownSubmode(custom_submode))?,
        })
    }

    /// Request for `custom_submode` using the registry defaults for the rest.
    pub fn for_submode(custom_submode: CustomSubmode) -> Self {
        Self {
            mode: allowed_modes(custom_submode)[0],
            custom_mode: allowed_custom_modes(custom_submode)[0],
            custom_submode,
        }
    }

    pub fn params(&self) -> [f32; 3] {
        [
            self.mode.raw() as f32,
            self.custom_mode.raw() as f32,
            self.custom_submode.raw() as f32,
        ]
    }
}

fn integral(v: f32) -> Result<u32, Rejected> {
    if !v.is_finite() || v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f32 {
        return Err(Rejected::NotIntegral(v));
    }
    Ok(v as u32)
}

/// The aircraft's operating phase. One instance per autopilot, owned and
/// mutated by a single loop; everyone else reads [`FlightSnapshot`]s.
#[derive(Debug)]
pub struct FlightStateMachine {
    state: State,
    mode: Mode,
    custom_mode: CustomMode,
    custom_submode: CustomSubmode,
    boot_requested: bool,
}

impl Default for FlightStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FlightStateMachine {
    pub fn new() -> Self {
        let s = FlightSnapshot::default();
        Self {
            state: s.state,
            mode: s.mode,
            custom_mode: s.custom_mode,
            custom_submode: s.custom_submode,
            boot_requested: false,
        }
    }

    pub fn snapshot(&self) -> FlightSnapshot {
        FlightSnapshot {
            state: self.state,
            mode: self.mode,
            custom_mode: self.custom_mode,
            custom_submode: self.custom_submode,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn custom_mode(&self) -> CustomMode {
        self.custom_mode
    }

    pub fn custom_submode(&self) -> CustomSubmode {
        self.custom_submode
    }

    /// Consumes the one-shot boot latch set by an UNINIT -> BOOT request.
    pub fn take_boot_request(&mut self) -> bool {
        std::mem::take(&mut self.boot_requested)
    }

    pub fn apply(&mut self, req: ModeRequest) -> Result<(), Rejected> {
        self.set_mode(req.mode, req.custom_mode, req.custom_submode)
    }

    /// Validates and applies a mode change. On rejection none of the four
    /// fields change.
    ///
    /// MANUAL_ARMED while the *current* custom mode is FLIGHT is a manual
    /// override: the submode becomes FLIGHT_MANUAL regardless of the submode
    /// graph and the requested submode is ignored.
    pub fn set_mode(
        &mut self,
        mode: Mode,
        custom_mode: CustomMode,
        custom_submode: CustomSubmode,
    ) -> Result<(), Rejected> {
        if mode == Mode::ManualArmed && self.custom_mode == CustomMode::Flight {
            self.log_submode(CustomSubmode::FlightManual);
            self.custom_submode = CustomSubmode::FlightManual;
            self.mode = mode;
            self.state = State::Active;
            return Ok(());
        }

        if self.custom_submode == CustomSubmode::Uninit && custom_submode == CustomSubmode::Boot {
            self.boot_requested = true;
        }

        let mut next_state = self.state;
        if custom_submode != self.custom_submode {
            if !allowed_submode_changes(self.custom_submode).contains(&custom_submode) {
                return Err(Rejected::IllegalTransition { from: self.custom_submode, to: custom_submode });
            }
            next_state = resolve_state(self.state, custom_submode);
        }

        let next_mode = pick(allowed_modes(custom_submode), mode);
        let next_custom_mode = pick(allowed_custom_modes(custom_submode), custom_mode);

        self.log_submode(custom_submode);
        self.custom_submode = custom_submode;
        self.state = next_state;
        self.mode = next_mode;
        self.custom_mode = next_custom_mode;
        Ok(())
    }

    /// Default step up: successor index 0, with registry defaults for mode
    /// and custom mode.
    pub fn inc_mode(&mut self) {
        let next = allowed_submode_changes(self.custom_submode)[0];
        self.step_to(next);
    }

    /// Default step down: successor index 1. FLIGHT_MANUAL,
    /// FLIGHT_TERRAIN_AVOIDANCE and UNINIT have no step down and step up instead.
    pub fn dec_mode(&mut self) {
        let no_step_down = matches!(
            self.custom_submode,
            CustomSubmode::FlightManual | CustomSubmode::FlightTerrainAvoidance | CustomSubmode::Uninit
        );
        match allowed_submode_changes(self.custom_submode).get(1) {
            Some(&prev) if !no_step_down => self.step_to(prev),
            _ => {
                debug!("dec_mode: no step down from {}, stepping up", self.custom_submode);
                self.inc_mode();
            }
        }
    }

    pub fn set_state(&mut self, state: State) -> Result<(), Rejected> {
        if !allowed_states(self.custom_submode).contains(&state) {
            debug!("set_state: {} rejected in {}", state, self.custom_submode);
            return Err(Rejected::StateNotAllowed { state, submode: self.custom_submode });
        }
        self.state = state;
        Ok(())
    }

    /// Raw-value variant used by the wire path; unknown values never reach
    /// the tables.
    pub fn set_state_raw(&mut self, state: u32) -> Result<(), Rejected> {
        let state = State::from_raw(state).ok_or(Rejected::UnknownState(state))?;
        self.set_state(state)
    }

    fn step_to(&mut self, next: CustomSubmode) {
        self.log_submode(next);
        self.state = resolve_state(self.state, next);
        self.mode = allowed_modes(next)[0];
        self.custom_mode = allowed_custom_modes(next)[0];
        self.custom_submode = next;
    }

    fn log_submode(&self, next: CustomSubmode) {
        if next != self.custom_submode {
            info!("submode: {} -> {}", self.custom_submode, next);
        }
    }
}

fn pick<T: Copy + PartialEq>(allowed: &[T], wanted: T) -> T {
    if allowed.contains(&wanted) { wanted } else { allowed[0] }
}

// Abnormal states stick across submode changes as long as the new submode
// still allows them.
fn resolve_state(current: State, next: CustomSubmode) -> State {
    let allowed = allowed_states(next);
    if current.is_abnormal() && allowed.contains(&current) {
        current
    } else {
        allowed[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(sub: CustomSubmode) -> FlightStateMachine {
        let mut fsm = FlightStateMachine::new();
        let mut guard = 0;
        while fsm.custom_submode() != sub {
            fsm.inc_mode();
            guard += 1;
            assert!(guard < 32, "{sub} not reachable by inc_mode");
        }
        fsm
    }

    #[test]
    fn starts_uninit_preflight() {
        let fsm = FlightStateMachine::new();
        assert_eq!(fsm.snapshot(), FlightSnapshot::default());
        assert!(fsm.snapshot().is_legal());
    }

    #[test]
    fn uninit_to_boot_latches_boot_once() {
        let mut fsm = FlightStateMachine::new();
        fsm.set_mode(Mode::Preflight, CustomMode::Boot, CustomSubmode::Boot).unwrap();
        assert_eq!(fsm.custom_submode(), CustomSubmode::Boot);
        assert_eq!(fsm.custom_mode(), CustomMode::Boot);
        assert_eq!(fsm.state(), State::Boot);
        assert!(fsm.take_boot_request());
        assert!(!fsm.take_boot_request());
    }

    #[test]
    fn manual_override_uses_current_custom_mode() {
        let mut fsm = at(CustomSubmode::FlightNormal);
        assert_eq!(fsm.custom_mode(), CustomMode::Flight);

        // requested submode is ignored on the override path
        fsm.set_mode(Mode::ManualArmed, CustomMode::Ground, CustomSubmode::GroundArmed).unwrap();
        let s = fsm.snapshot();
        assert_eq!(s.custom_submode, CustomSubmode::FlightManual);
        assert_eq!(s.mode, Mode::ManualArmed);
        assert_eq!(s.state, State::Active);
        assert!(s.is_legal());
    }

    #[test]
    fn manual_request_on_ground_goes_through_the_graph() {
        let mut fsm = at(CustomSubmode::GroundArmed);
        let before = fsm.snapshot();
        // requested custom mode is FLIGHT but the current one is GROUND
        let err = fsm
            .set_mode(Mode::ManualArmed, CustomMode::Flight, CustomSubmode::FlightManual)
            .unwrap_err();
        assert_eq!(
            err,
            Rejected::IllegalTransition { from: CustomSubmode::GroundArmed, to: CustomSubmode::FlightManual }
        );
        assert_eq!(fsm.snapshot(), before);
    }

    #[test]
    fn illegal_jump_leaves_fields_unchanged() {
        let mut fsm = at(CustomSubmode::FlightNormal);
        let before = fsm.snapshot();
        let res = fsm.set_mode(Mode::AutoArmed, CustomMode::Landing, CustomSubmode::LandingHover);
        assert!(matches!(res, Err(Rejected::IllegalTransition { .. })));
        assert_eq!(fsm.snapshot(), before);
    }

    #[test]
    fn mode_and_custom_mode_fall_back_to_defaults() {
        let mut fsm = at(CustomSubmode::GroundDisarmed);
        fsm.set_mode(Mode::Preflight, CustomMode::Landing, CustomSubmode::GroundArmed).unwrap();
        let s = fsm.snapshot();
        assert_eq!(s.mode, Mode::GuidedArmed);
        assert_eq!(s.custom_mode, CustomMode::Ground);
        assert_eq!(s.state, State::Active);

        fsm.set_mode(Mode::AutoArmed, CustomMode::Ground, CustomSubmode::GroundArmed).unwrap();
        assert_eq!(fsm.mode(), Mode::AutoArmed);
    }

    #[test]
    fn same_submode_keeps_state() {
        let mut fsm = at(CustomSubmode::Boot);
        fsm.set_state(State::Calibrating).unwrap();
        fsm.set_mode(Mode::Preflight, CustomMode::Boot, CustomSubmode::Boot).unwrap();
        assert_eq!(fsm.state(), State::Calibrating);
    }

    #[test]
    fn abnormal_state_survives_when_allowed() {
        let mut fsm = at(CustomSubmode::FlightNormal);
        fsm.set_mode(Mode::AutoArmed, CustomMode::Emergency, CustomSubmode::EmergencyGpsFail).unwrap();
        assert_eq!(fsm.state(), State::Critical);
        fsm.set_state(State::Emergency).unwrap();
        fsm.set_mode(Mode::AutoArmed, CustomMode::Emergency, CustomSubmode::EmergencyCommFail).unwrap();
        assert_eq!(fsm.state(), State::Emergency);
        // LANDING_DESCENT only allows ACTIVE
        fsm.set_mode(Mode::AutoArmed, CustomMode::Landing, CustomSubmode::LandingDescent).unwrap();
        assert_eq!(fsm.state(), State::Active);
        assert!(fsm.snapshot().is_legal());
    }

    #[test]
    fn set_state_checks_table() {
        let mut fsm = at(CustomSubmode::Boot);
        assert!(fsm.set_state(State::Standby).is_ok());
        assert_eq!(
            fsm.set_state(State::Active),
            Err(Rejected::StateNotAllowed { state: State::Active, submode: CustomSubmode::Boot })
        );
        assert_eq!(fsm.state(), State::Standby);
        assert_eq!(fsm.set_state_raw(42), Err(Rejected::UnknownState(42)));
    }

    #[test]
    fn dec_mode_steps_down_or_delegates() {
        let mut fsm = at(CustomSubmode::GroundArmed);
        fsm.dec_mode();
        assert_eq!(fsm.custom_submode(), CustomSubmode::GroundDisarmed);
        fsm.dec_mode();
        assert_eq!(fsm.custom_submode(), CustomSubmode::Shutdown);
        assert_eq!(fsm.state(), State::Poweroff);

        let mut fsm = FlightStateMachine::new();
        fsm.dec_mode();
        assert_eq!(fsm.custom_submode(), CustomSubmode::Boot);

        let mut fsm = at(CustomSubmode::FlightNormal);
        fsm.set_mode(Mode::ManualArmed, CustomMode::Flight, CustomSubmode::FlightManual).unwrap();
        fsm.dec_mode();
        assert_eq!(fsm.custom_submode(), CustomSubmode::FlightNormal);
    }

    #[test]
    fn inc_mode_reaches_operational_submode_from_anywhere() {
        for start in CustomSubmode::ALL {
            let mut sub = start;
            let mut reached = false;
            for _ in 0..CustomSubmode::ALL.len() {
                sub = allowed_submode_changes(sub)[0];
                assert!(CustomSubmode::ALL.contains(&sub));
                if sub == CustomSubmode::FlightNormal || sub.name().starts_with("LANDING") {
                    reached = true;
                    break;
                }
            }
            assert!(reached, "inc_mode from {start} never reaches FLIGHT_NORMAL or LANDING");
        }
    }

    #[test]
    fn reachable_states_stay_legal_under_random_requests() {
        // xorshift keeps the walk deterministic without a dev-dependency
        let mut seed: u32 = 0x9e37_79b9;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        let mut fsm = FlightStateMachine::new();
        for _ in 0..20_000 {
            let r = next();
            match r % 5 {
                0 => fsm.inc_mode(),
                1 => fsm.dec_mode(),
                2 => {
                    let s = State::NOMINAL.iter().chain(State::ABNORMAL.iter()).nth((r as usize >> 3) % 8).copied();
                    if let Some(s) = s {
                        let _ = fsm.set_state(s);
                    }
                }
                _ => {
                    let mode = Mode::ALL[(r as usize >> 3) % Mode::ALL.len()];
                    let cm = CustomMode::ALL[(r as usize >> 7) % CustomMode::ALL.len()];
                    let sub = CustomSubmode::ALL[(r as usize >> 11) % CustomSubmode::ALL.len()];
                    let _ = fsm.set_mode(mode, cm, sub);
                }
            }
            let snap = fsm.snapshot();
            assert!(snap.is_legal(), "illegal tuple exposed: {snap:?}");
        }
    }

    #[test]
    fn decodes_wire_params() {
        let req = ModeRequest::from_params(0.0, 1.0, 10.0).unwrap();
        assert_eq!(req.custom_submode, CustomSubmode::Boot);
        assert_eq!(req.params(), [0.0, 1.0, 10.0]);
        assert_eq!(ModeRequest::from_params(0.0, 1.0, 10.5), Err(Rejected::NotIntegral(10.5)));
        assert_eq!(ModeRequest::from_params(3.0, 1.0, 10.0), Err(Rejected::UnknownMode(3)));
        assert_eq!(ModeRequest::from_params(0.0, 1.0, 33.0), Err(Rejected::UnknownSubmode(33)));
        assert!(ModeRequest::from_params(f32::NAN, 1.0, 10.0).is_err());
    }
}
