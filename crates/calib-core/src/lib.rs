//! # calib-core
//!
//! Shared library for the calib-peer pairing handshake.
//!
//! This crate holds everything that does not touch the network: peer
//! identities and host election, the text wire format, and the pairing state
//! machine.  The `calib-peer` crate wires it to a transport and a console.
//!
//! # Architecture
//!
//! ```text
//! domain     PeerId, PeerSet, HostRole, elect_host
//! protocol   PairingMessage, payload types, encode_message / decode_message
//! pairing    PairingStateMachine: handle(event) -> Transition { state, actions, error }
//! ```
//!
//! # Quick start
//!
//! ```rust
//! use calib_core::{PairingEvent, PairingState, PairingStateMachine, PeerId, UserIntent};
//!
//! let mut machine = PairingStateMachine::new(PeerId(10));
//! machine.handle(PairingEvent::PeerConnected(PeerId(3))).unwrap();
//! machine.handle(PairingEvent::User(UserIntent::Start)).unwrap();
//! let transition = machine.handle(PairingEvent::User(UserIntent::Search)).unwrap();
//!
//! assert_eq!(transition.state, PairingState::Selecting);
//! assert!(machine.role().is_host());
//! ```

pub mod domain;
pub mod pairing;
pub mod protocol;

pub use domain::{elect_host, ElectionError, HostRole, PeerId, PeerSet};
pub use pairing::{
    PairingAction, PairingError, PairingEvent, PairingState, PairingStateMachine, StageStatus,
    Transition, UserIntent,
};
pub use protocol::{
    decode_message, encode_message, CalibrationSample, CalibrationStage, PairingMessage,
    ProtocolError, SERVICE_TYPE,
};
