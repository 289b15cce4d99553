//! Run state machine: lifecycle states, legal transitions, and the control
//! signals a driver observes.

pub mod control;
pub mod state;

pub use self::control::{RunControl, StopReason};
pub use self::state::{RunEvent, RunStatus, TransitionError};
