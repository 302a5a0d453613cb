//! Peer identity, connected-peer set and host election.
//!
//! Every device taking part in the handshake is identified by a [`PeerId`]: a
//! signed 64-bit hash that is stable for the lifetime of the process.  The
//! only property the protocol relies on is that identities are *totally
//! ordered* and *unique*, which is what makes host election deterministic.
//!
//! # Host election (for beginners)
//!
//! Two devices that have just discovered each other need to agree on which one
//! drives the calibration exchange without talking about it first.  Each side
//! runs the same rule locally:
//!
//! ```text
//! I am host  ⇔  my id is strictly greater than every connected peer's id
//! ```
//!
//! Because both sides see each other and ids are unique, exactly one of them
//! ends up as host.  A node with no connected peers is host by vacuous truth.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, totally ordered identifier of a device.
///
/// Rendered as a decimal integer on the wire (`select:<id>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub i64);

impl PeerId {
    /// Returns the raw numeric hash.
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for PeerId {
    fn from(value: i64) -> Self {
        PeerId(value)
    }
}

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(PeerId)
    }
}

/// The set of currently connected peers.
///
/// Backed by a `BTreeSet` so iteration is in ascending id order and the
/// maximum is cheap to find.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    peers: BTreeSet<PeerId>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer.  Returns `false` if it was already present.
    pub fn insert(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    /// Removes a peer.  Returns `false` if it was not present.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        self.peers.remove(&peer)
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Iterates the peers in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.iter().copied()
    }

    /// Returns the peers as a vector, ascending.
    pub fn to_vec(&self) -> Vec<PeerId> {
        self.iter().collect()
    }

    /// Returns the peer whose id equals `hash`, if connected.
    pub fn resolve(&self, hash: i64) -> Option<PeerId> {
        self.peers.get(&PeerId(hash)).copied()
    }

    /// Returns the highest connected id.
    pub fn max(&self) -> Option<PeerId> {
        self.peers.iter().next_back().copied()
    }
}

impl FromIterator<PeerId> for PeerSet {
    fn from_iter<I: IntoIterator<Item = PeerId>>(iter: I) -> Self {
        Self {
            peers: iter.into_iter().collect(),
        }
    }
}

/// Outcome of host election.
///
/// Starts as `Unknown` and is resolved once per Searching → Selecting
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HostRole {
    #[default]
    Unknown,
    Host,
    Client,
}

impl HostRole {
    pub fn is_host(self) -> bool {
        matches!(self, HostRole::Host)
    }

    pub fn is_client(self) -> bool {
        matches!(self, HostRole::Client)
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, HostRole::Unknown)
    }
}

/// Error returned when host election cannot produce a decision.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ElectionError {
    /// A connected peer reports the same identity as the local node, so the
    /// ordering cannot separate them.
    #[error("peer identity {0} is not unique; host cannot be determined")]
    DuplicateIdentity(PeerId),
}

/// Decides whether `local` is host among `peers`.
///
/// `local` is host when its id is strictly greater than every connected id;
/// an empty set therefore yields [`HostRole::Host`].
///
/// # Errors
///
/// Returns [`ElectionError::DuplicateIdentity`] if `peers` contains `local`.
///
/// # Examples
///
/// ```rust
/// use calib_core::domain::peer::{elect_host, HostRole, PeerId, PeerSet};
///
/// let peers: PeerSet = [PeerId(3)].into_iter().collect();
/// assert_eq!(elect_host(PeerId(10), &peers), Ok(HostRole::Host));
/// ```
pub fn elect_host(local: PeerId, peers: &PeerSet) -> Result<HostRole, ElectionError> {
    if peers.contains(local) {
        return Err(ElectionError::DuplicateIdentity(local));
    }
    match peers.max() {
        Some(highest) if highest > local => Ok(HostRole::Client),
        _ => Ok(HostRole::Host),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
