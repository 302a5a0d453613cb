//! Domain entities for the calibration handshake.
//!
//! Pure types with no I/O: peer identities, the connected-peer set, the host
//! role and the election rule that derives it.  Everything in here can be
//! tested without a transport or a runtime.

pub mod peer;

pub use peer::{elect_host, ElectionError, HostRole, PeerId, PeerSet};
