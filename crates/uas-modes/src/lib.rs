pub mod machine;
pub mod registry;

pub use machine::{FlightSnapshot, FlightStateMachine, ModeRequest, Rejected};
pub use registry::{CustomMode, CustomSubmode, Mode, ParseError, State};
