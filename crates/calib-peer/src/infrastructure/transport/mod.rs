//! Peer-to-peer transport abstraction.
//!
//! A [`Transport`] discovers nearby peers that share the same service type,
//! exchanges invitations with them, and delivers opaque byte messages to the
//! ones that joined the session.  Everything it observes is reported as a
//! [`TransportEvent`] on the channel returned by the concrete constructor.
//!
//! # Session lifecycle (for beginners)
//!
//! ```text
//!   advertise()          browse()
//!       │                   │
//!       ▼                   ▼
//!  other side sees     we see PeerFound(peer)
//!  PeerFound(us)            │ invite(peer)
//!                           ▼
//!                  peer sees InvitationReceived(us)
//!                           │ respond_to_invitation(us, true)
//!                           ▼
//!          both sides see StateChanged { peer, Connected }
//! ```
//!
//! Implementations:
//!
//! - **`udp`** – LAN transport: JSON frames over UDP with broadcast discovery.
//! - **`memory`** – in-process hub used by tests and single-process demos.

pub mod memory;
pub mod udp;

use std::net::SocketAddr;

use async_trait::async_trait;
use calib_core::PeerId;
use thiserror::Error;

/// Delivery guarantee requested for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reliability {
    /// Best effort; may be lost or reordered.
    #[default]
    Unreliable,
    /// Sent with extra effort, such as repeated datagrams; still not a
    /// delivery guarantee.
    Reliable,
}

/// Membership state of a remote peer in our session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotConnected,
    Connecting,
    Connected,
}

/// Everything a transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A peer advertising the same service came into range.
    PeerFound { peer: PeerId, name: String },
    /// A previously found peer stopped advertising or timed out.
    PeerLost(PeerId),
    /// A peer asked to join our session.
    InvitationReceived { from: PeerId, name: String },
    /// A peer's session membership changed.
    StateChanged { peer: PeerId, state: PeerState },
    /// A connected peer sent us data.
    DataReceived { from: PeerId, data: Vec<u8> },
}

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket could not be bound.
    #[error("failed to bind transport socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error occurred while sending.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    /// The transport carries text and the payload is not UTF-8.
    #[error("payload is not UTF-8 text: {0}")]
    NotText(#[from] std::str::Utf8Error),

    /// The peer is not known to the transport.
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// There is no pending invitation from the peer.
    #[error("no pending invitation from {0}")]
    NoInvitation(PeerId),

    /// The transport has been stopped.
    #[error("transport is closed")]
    Closed,
}

/// Discovery, session membership and message delivery.
///
/// Infrastructure implementations use UDP or an in-memory hub; test doubles
/// record calls.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity this transport advertises.
    fn local_peer(&self) -> PeerId;

    /// Makes the local peer discoverable.
    async fn advertise(&self) -> Result<(), TransportError>;

    /// Starts reporting nearby peers as [`TransportEvent::PeerFound`].
    async fn browse(&self) -> Result<(), TransportError>;

    /// Invites a found peer into the session.  Inviting a peer that is
    /// already connected or already invited does nothing.
    async fn invite(&self, peer: PeerId) -> Result<(), TransportError>;

    /// Answers an invitation previously reported by
    /// [`TransportEvent::InvitationReceived`].
    async fn respond_to_invitation(&self, peer: PeerId, accept: bool)
        -> Result<(), TransportError>;

    /// Sends `data` to each peer in `to`.  Peers that are not connected are
    /// skipped.
    async fn send(
        &self,
        data: &[u8],
        to: &[PeerId],
        reliability: Reliability,
    ) -> Result<(), TransportError>;

    /// Leaves the session and stops discovery.
    async fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub use memory::{MemoryNetwork, MemoryTransport};
pub use udp::{UdpTransport, UdpTransportConfig};
