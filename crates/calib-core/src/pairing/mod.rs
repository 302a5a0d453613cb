//! Pairing protocol: states, events and the transition function.

pub mod machine;
pub mod state;

pub use machine::{unix_time_now, PairingStateMachine};
pub use state::{
    PairingAction, PairingError, PairingEvent, PairingState, StageStatus, Transition, UserIntent,
};
