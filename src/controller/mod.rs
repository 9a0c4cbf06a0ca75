//! Closed-loop zero-feed dispatch: decision, slew limiting, distribution and
//! the runtime that drives them.

pub mod dispatch;
pub mod distributor;
pub mod error;
pub mod events;
pub mod fleet;
pub mod runtime;
pub mod slew;
pub mod state;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{
    decide, ControllerStatus, CycleOutcome, Decision, DispatchController, DispatchSettings,
    FleetCapacity,
};
pub use distributor::{distribute, DistributionReport};
pub use error::DispatchError;
pub use events::{EventEntry, EventLevel, EventLog, EVENT_LOG_CAPACITY};
pub use fleet::Fleet;
pub use runtime::{ControlCommand, ControlLoop, ControllerHandle, LoopClosed, LoopTimings};
pub use slew::{SlewLimiter, SlewOutcome};
pub use state::{ControllerState, Setpoint};
pub use status::{HealthLevel, HealthVerdict, SystemSnapshot};
