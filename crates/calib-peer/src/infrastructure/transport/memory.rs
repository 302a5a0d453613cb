//! In-process transport hub.
//!
//! A [`MemoryNetwork`] plays the role of the air between devices: every
//! [`MemoryTransport`] joined to it can discover, invite and message the
//! others.  Delivery is lossless and ordered per sender, which makes it the
//! transport of choice for deterministic tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use calib_core::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

use super::{PeerState, Reliability, Transport, TransportError, TransportEvent};

/// Capacity of each node's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 128;

struct Node {
    name: String,
    advertising: bool,
    browsing: bool,
    events: mpsc::Sender<TransportEvent>,
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerId, Node>,
    /// Connected pairs, stored as `(lower, higher)`.
    links: BTreeSet<(PeerId, PeerId)>,
    /// Outstanding invitations as `(inviter, invitee)`.
    pending: BTreeSet<(PeerId, PeerId)>,
}

impl Hub {
    fn linked(&self, a: PeerId, b: PeerId) -> bool {
        self.links.contains(&link(a, b))
    }

    fn sender(&self, peer: PeerId) -> Option<mpsc::Sender<TransportEvent>> {
        self.nodes.get(&peer).map(|n| n.events.clone())
    }
}

fn link(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a < b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Events collected under the hub lock and delivered after it is released.
type Outbox = Vec<(mpsc::Sender<TransportEvent>, TransportEvent)>;

async fn deliver(outbox: Outbox) {
    for (tx, event) in outbox {
        // A closed receiver means that node is shutting down.
        let _ = tx.send(event).await;
    }
}

/// Shared in-memory medium.  Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a node and returns its transport plus event receiver.
    pub fn join(
        &self,
        local: PeerId,
        name: impl Into<String>,
    ) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.lock().nodes.insert(
            local,
            Node {
                name: name.into(),
                advertising: false,
                browsing: false,
                events: tx,
            },
        );
        let transport = MemoryTransport {
            network: self.clone(),
            local,
        };
        (transport, rx)
    }

    /// Removes a node as if it went out of range.
    pub async fn remove(&self, peer: PeerId) {
        let outbox = {
            let mut hub = self.lock();
            if hub.nodes.remove(&peer).is_none() {
                return;
            }
            hub.pending.retain(|&(a, b)| a != peer && b != peer);

            let mut outbox = Outbox::new();
            let linked: Vec<PeerId> = hub
                .links
                .iter()
                .filter_map(|&(a, b)| match (a == peer, b == peer) {
                    (true, _) => Some(b),
                    (_, true) => Some(a),
                    _ => None,
                })
                .collect();
            hub.links.retain(|&(a, b)| a != peer && b != peer);

            for node in hub.nodes.values().filter(|n| n.browsing) {
                outbox.push((node.events.clone(), TransportEvent::PeerLost(peer)));
            }
            for other in linked {
                if let Some(tx) = hub.sender(other) {
                    outbox.push((
                        tx,
                        TransportEvent::StateChanged {
                            peer,
                            state: PeerState::NotConnected,
                        },
                    ));
                }
            }
            outbox
        };
        deliver(outbox).await;
    }

    /// Number of connected pairs.
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }
}

/// One node's handle on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn advertise(&self) -> Result<(), TransportError> {
        let outbox = {
            let mut hub = self.network.lock();
            let name = {
                let node = hub.nodes.get_mut(&self.local).ok_or(TransportError::Closed)?;
                node.advertising = true;
                node.name.clone()
            };
            hub.nodes
                .iter()
                .filter(|&(&id, n)| id != self.local && n.browsing)
                .map(|(_, n)| {
                    (
                        n.events.clone(),
                        TransportEvent::PeerFound {
                            peer: self.local,
                            name: name.clone(),
                        },
                    )
                })
                .collect::<Outbox>()
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn browse(&self) -> Result<(), TransportError> {
        let outbox = {
            let mut hub = self.network.lock();
            let node = hub.nodes.get_mut(&self.local).ok_or(TransportError::Closed)?;
            node.browsing = true;
            let tx = node.events.clone();
            hub.nodes
                .iter()
                .filter(|&(&id, n)| id != self.local && n.advertising)
                .map(|(&id, n)| {
                    (
                        tx.clone(),
                        TransportEvent::PeerFound {
                            peer: id,
                            name: n.name.clone(),
                        },
                    )
                })
                .collect::<Outbox>()
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn invite(&self, peer: PeerId) -> Result<(), TransportError> {
        let outbox = {
            let mut hub = self.network.lock();
            let name = hub
                .nodes
                .get(&self.local)
                .map(|n| n.name.clone())
                .ok_or(TransportError::Closed)?;
            if hub.linked(self.local, peer) || hub.pending.contains(&(self.local, peer)) {
                debug!(%peer, "invite skipped, already connected or invited");
                return Ok(());
            }
            let target = hub
                .nodes
                .get(&peer)
                .filter(|n| n.advertising)
                .map(|n| n.events.clone())
                .ok_or(TransportError::UnknownPeer(peer))?;
            hub.pending.insert((self.local, peer));
            vec![(
                target,
                TransportEvent::InvitationReceived {
                    from: self.local,
                    name,
                },
            )]
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn respond_to_invitation(
        &self,
        peer: PeerId,
        accept: bool,
    ) -> Result<(), TransportError> {
        let outbox = {
            let mut hub = self.network.lock();
            if !hub.pending.remove(&(peer, self.local)) {
                return Err(TransportError::NoInvitation(peer));
            }
            let (Some(inviter), Some(me)) = (hub.sender(peer), hub.sender(self.local)) else {
                return Err(TransportError::UnknownPeer(peer));
            };

            if !accept {
                vec![(
                    inviter,
                    TransportEvent::StateChanged {
                        peer: self.local,
                        state: PeerState::NotConnected,
                    },
                )]
            } else if hub.links.insert(link(self.local, peer)) {
                vec![
                    (
                        inviter,
                        TransportEvent::StateChanged {
                            peer: self.local,
                            state: PeerState::Connected,
                        },
                    ),
                    (
                        me,
                        TransportEvent::StateChanged {
                            peer,
                            state: PeerState::Connected,
                        },
                    ),
                ]
            } else {
                Vec::new()
            }
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn send(
        &self,
        data: &[u8],
        to: &[PeerId],
        _reliability: Reliability,
    ) -> Result<(), TransportError> {
        let outbox = {
            let hub = self.network.lock();
            if !hub.nodes.contains_key(&self.local) {
                return Err(TransportError::Closed);
            }
            to.iter()
                .copied()
                .filter(|&peer| hub.linked(self.local, peer))
                .filter_map(|peer| hub.sender(peer))
                .map(|tx| {
                    (
                        tx,
                        TransportEvent::DataReceived {
                            from: self.local,
                            data: data.to_vec(),
                        },
                    )
                })
                .collect::<Outbox>()
        };
        deliver(outbox).await;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        self.network.remove(self.local).await;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
