//! LAN transport over UDP.
//!
//! Every node binds one UDP socket on the discovery port.  While advertising it
//! broadcasts an `announce` frame at a fixed interval; while browsing it turns
//! announces from unseen peers into [`TransportEvent::PeerFound`].  Invitations,
//! replies and message data are unicast to the address the peer last announced
//! from.  A peer that has not been heard from within the peer timeout is
//! reported lost.
//!
//! All frames are JSON objects tagged with the service type, so nodes running
//! a different service on the same port ignore each other:
//!
//! ```json
//! {"service":"example-chat","body":{"type":"announce","peer":42,"name":"desk"}}
//! ```
//!
//! The receive side runs on a dedicated thread with a short read timeout so
//! the loop can announce and expire stale peers between datagrams.
//!
//! Message text travels in `data` frames stamped with a per-sender sequence
//! number.  [`Reliability::Reliable`] sends repeat the datagram a few times;
//! receivers drop anything not newer than the last sequence number they
//! delivered from that peer, so repeats and stale reorderings never surface.
//!
//! Only one node per host can bind a given discovery port.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use calib_core::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{PeerState, Reliability, Transport, TransportError, TransportEvent};
use crate::infrastructure::config::PeerConfig;

/// Socket read timeout; bounds how late an announce or expiry can be.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Largest datagram we accept.
const MAX_DATAGRAM: usize = 8192;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Datagrams sent per [`Reliability::Reliable`] message.
const RELIABLE_COPIES: usize = 3;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Socket addresses and timings for [`UdpTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct UdpTransportConfig {
    /// Service type shared by peers that may see each other.
    pub service_type: String,
    /// Local address to bind.
    pub bind_addr: SocketAddr,
    /// Where announces are sent; the LAN broadcast address by default.
    pub announce_addr: SocketAddr,
    pub announce_interval: Duration,
    /// Silence after which a peer is reported lost.
    pub peer_timeout: Duration,
    /// How long an unanswered invitation stays pending.
    pub invite_timeout: Duration,
}

impl UdpTransportConfig {
    pub fn from_config(config: &PeerConfig) -> Self {
        let port = config.discovery_port;
        Self {
            service_type: config.service_type.clone(),
            bind_addr: SocketAddr::new(config.bind_ip(), port),
            announce_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port),
            announce_interval: config.announce_interval(),
            peer_timeout: config.peer_timeout(),
            invite_timeout: config.invite_timeout(),
        }
    }
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self::from_config(&PeerConfig::default())
    }
}

// ── Wire frames ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    service: String,
    body: Frame,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Announce { peer: PeerId, name: String },
    Invite { from: PeerId, to: PeerId, name: String },
    InviteReply { from: PeerId, to: PeerId, accept: bool },
    Data { from: PeerId, to: PeerId, seq: u64, text: String },
    Leave { peer: PeerId },
}

// ── Peer table ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PeerEntry {
    name: String,
    addr: SocketAddr,
    last_seen: Instant,
    state: PeerState,
}

/// Discovery and membership bookkeeping, independent of the socket.
#[derive(Debug)]
struct PeerTable {
    local: PeerId,
    service: String,
    advertising: bool,
    browsing: bool,
    peers: HashMap<PeerId, PeerEntry>,
    outbound_invites: HashMap<PeerId, Instant>,
    inbound_invites: HashSet<PeerId>,
    /// Highest data sequence number delivered per peer.
    delivered: HashMap<PeerId, u64>,
}

impl PeerTable {
    fn new(local: PeerId, service: String) -> Self {
        Self {
            local,
            service,
            advertising: false,
            browsing: false,
            peers: HashMap::new(),
            outbound_invites: HashMap::new(),
            inbound_invites: HashSet::new(),
            delivered: HashMap::new(),
        }
    }

    /// Records `peer` at `addr`.  Returns `true` if it was not known before.
    fn touch(&mut self, peer: PeerId, name: &str, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.get_mut(&peer) {
            Some(entry) => {
                entry.addr = addr;
                entry.last_seen = now;
                if entry.name != name {
                    entry.name = name.to_string();
                }
                false
            }
            None => {
                self.peers.insert(
                    peer,
                    PeerEntry {
                        name: name.to_string(),
                        addr,
                        last_seen: now,
                        state: PeerState::NotConnected,
                    },
                );
                true
            }
        }
    }

    fn set_state(&mut self, peer: PeerId, state: PeerState) -> Option<TransportEvent> {
        let entry = self.peers.get_mut(&peer)?;
        if entry.state == state {
            return None;
        }
        entry.state = state;
        Some(TransportEvent::StateChanged { peer, state })
    }

    fn on_frame(&mut self, envelope: Envelope, src: SocketAddr, now: Instant) -> Vec<TransportEvent> {
        if envelope.service != self.service {
            debug!(service = %envelope.service, %src, "ignoring frame for other service");
            return Vec::new();
        }

        let mut events = Vec::new();
        match envelope.body {
            Frame::Announce { peer, name } => {
                if peer != self.local && self.touch(peer, &name, src, now) && self.browsing {
                    events.push(TransportEvent::PeerFound { peer, name });
                }
            }
            Frame::Invite { from, to, name } => {
                if to != self.local || !self.advertising {
                    return events;
                }
                if self.touch(from, &name, src, now) && self.browsing {
                    events.push(TransportEvent::PeerFound {
                        peer: from,
                        name: name.clone(),
                    });
                }
                self.inbound_invites.insert(from);
                events.push(TransportEvent::InvitationReceived { from, name });
            }
            Frame::InviteReply { from, to, accept } => {
                if to != self.local || self.outbound_invites.remove(&from).is_none() {
                    return events;
                }
                if accept {
                    events.extend(self.set_state(from, PeerState::Connected));
                } else {
                    events.extend(self.abandon_invite(from));
                }
            }
            Frame::Data { from, to, seq, text } => {
                if to != self.local {
                    return events;
                }
                match self.peers.get_mut(&from) {
                    Some(entry) if entry.state == PeerState::Connected => {
                        entry.last_seen = now;
                        let last = self.delivered.entry(from).or_insert(0);
                        if seq <= *last {
                            debug!(%from, seq, "dropping repeated data frame");
                        } else {
                            *last = seq;
                            events.push(TransportEvent::DataReceived {
                                from,
                                data: text.into_bytes(),
                            });
                        }
                    }
                    _ => debug!(%from, "dropping data from peer outside the session"),
                }
            }
            Frame::Leave { peer } => events.extend(self.forget(peer)),
        }
        events
    }

    /// Drops a peer we were still trying to connect to back to
    /// `NotConnected`.  A peer that got connected some other way, such as by
    /// us accepting its own invitation, keeps its state.
    fn abandon_invite(&mut self, peer: PeerId) -> Option<TransportEvent> {
        let connecting = self
            .peers
            .get(&peer)
            .is_some_and(|e| e.state == PeerState::Connecting);
        if connecting {
            self.set_state(peer, PeerState::NotConnected)
        } else {
            None
        }
    }

    fn forget(&mut self, peer: PeerId) -> Vec<TransportEvent> {
        self.outbound_invites.remove(&peer);
        self.inbound_invites.remove(&peer);
        self.delivered.remove(&peer);
        let Some(entry) = self.peers.remove(&peer) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        if self.browsing {
            events.push(TransportEvent::PeerLost(peer));
        }
        if entry.state != PeerState::NotConnected {
            events.push(TransportEvent::StateChanged {
                peer,
                state: PeerState::NotConnected,
            });
        }
        events
    }

    /// Expires silent peers and unanswered invitations.
    fn sweep(&mut self, now: Instant, peer_timeout: Duration, invite_timeout: Duration) -> Vec<TransportEvent> {
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > peer_timeout)
            .map(|(&id, _)| id)
            .collect();
        let expired: Vec<PeerId> = self
            .outbound_invites
            .iter()
            .filter(|&(_, &sent)| now.saturating_duration_since(sent) > invite_timeout)
            .map(|(&id, _)| id)
            .collect();

        let mut events = Vec::new();
        for peer in stale {
            info!(%peer, "peer timed out");
            events.extend(self.forget(peer));
        }
        for peer in expired {
            debug!(%peer, "invitation timed out");
            self.outbound_invites.remove(&peer);
            if let Some(event) = self.abandon_invite(peer) {
                events.push(event);
                // Report the peer again so the owner can retry the invitation.
                if let Some(entry) = self.peers.get(&peer).filter(|_| self.browsing) {
                    events.push(TransportEvent::PeerFound {
                        peer,
                        name: entry.name.clone(),
                    });
                }
            }
        }
        events
    }

    /// Consumes a pending invitation from `peer`.  Returns where to send the
    /// reply and, on accept, the resulting state change.
    fn answer_invitation(
        &mut self,
        peer: PeerId,
        accept: bool,
    ) -> Result<(SocketAddr, Option<TransportEvent>), TransportError> {
        if !self.inbound_invites.remove(&peer) {
            return Err(TransportError::NoInvitation(peer));
        }
        let addr = self
            .peers
            .get(&peer)
            .map(|e| e.addr)
            .ok_or(TransportError::UnknownPeer(peer))?;
        let event = if accept {
            self.set_state(peer, PeerState::Connected)
        } else {
            None
        };
        Ok((addr, event))
    }

    /// `PeerFound` for every peer seen before browsing started.
    fn start_browsing(&mut self) -> Vec<TransportEvent> {
        if self.browsing {
            return Vec::new();
        }
        self.browsing = true;
        self.peers
            .iter()
            .map(|(&peer, e)| TransportEvent::PeerFound {
                peer,
                name: e.name.clone(),
            })
            .collect()
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

struct Shared {
    config: UdpTransportConfig,
    name: String,
    table: Mutex<PeerTable>,
    running: AtomicBool,
    next_seq: AtomicU64,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, PeerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn envelope(&self, body: Frame) -> Envelope {
        Envelope {
            service: self.config.service_type.clone(),
            body,
        }
    }
}

fn send_frame(socket: &UdpSocket, envelope: &Envelope, dest: SocketAddr) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(envelope)?;
    socket.send_to(&bytes, dest)?;
    Ok(())
}

/// UDP implementation of [`Transport`].
pub struct UdpTransport {
    local: PeerId,
    socket: UdpSocket,
    shared: Arc<Shared>,
    events: mpsc::Sender<TransportEvent>,
}

impl UdpTransport {
    /// Binds the socket and starts the receive thread.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the socket cannot be bound.
    pub fn bind(
        config: UdpTransportConfig,
        local: PeerId,
        name: impl Into<String>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let addr = config.bind_addr;
        let socket =
            UdpSocket::bind(addr).map_err(|source| TransportError::BindFailed { addr, source })?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let reader = socket.try_clone()?;

        let shared = Arc::new(Shared {
            table: Mutex::new(PeerTable::new(local, config.service_type.clone())),
            config,
            name: name.into(),
            running: AtomicBool::new(true),
            next_seq: AtomicU64::new(1),
        });
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let thread_shared = Arc::clone(&shared);
        let thread_tx = tx.clone();
        std::thread::Builder::new()
            .name("calib-udp".to_string())
            .spawn(move || receive_loop(reader, thread_shared, thread_tx))?;

        info!(%local, "UDP transport listening on {}", socket.local_addr()?);
        Ok((
            Self {
                local,
                socket,
                shared,
                events: tx,
            },
            rx,
        ))
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    async fn emit(&self, events: Vec<TransportEvent>) {
        for event in events {
            if self.events.send(event).await.is_err() {
                break;
            }
        }
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.shared.running.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn advertise(&self) -> Result<(), TransportError> {
        self.ensure_running()?;
        self.shared.table().advertising = true;
        Ok(())
    }

    async fn browse(&self) -> Result<(), TransportError> {
        self.ensure_running()?;
        let events = self.shared.table().start_browsing();
        self.emit(events).await;
        Ok(())
    }

    async fn invite(&self, peer: PeerId) -> Result<(), TransportError> {
        self.ensure_running()?;
        let (addr, events) = {
            let mut table = self.shared.table();
            let entry = table.peers.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
            if entry.state == PeerState::Connected || table.outbound_invites.contains_key(&peer) {
                return Ok(());
            }
            let addr = entry.addr;
            table.outbound_invites.insert(peer, Instant::now());
            (addr, table.set_state(peer, PeerState::Connecting))
        };
        let frame = self.shared.envelope(Frame::Invite {
            from: self.local,
            to: peer,
            name: self.shared.name.clone(),
        });
        send_frame(&self.socket, &frame, addr)?;
        self.emit(events.into_iter().collect()).await;
        Ok(())
    }

    async fn respond_to_invitation(
        &self,
        peer: PeerId,
        accept: bool,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let (addr, events) = self.shared.table().answer_invitation(peer, accept)?;
        let frame = self.shared.envelope(Frame::InviteReply {
            from: self.local,
            to: peer,
            accept,
        });
        send_frame(&self.socket, &frame, addr)?;
        self.emit(events.into_iter().collect()).await;
        Ok(())
    }

    async fn send(
        &self,
        data: &[u8],
        to: &[PeerId],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        let text = std::str::from_utf8(data)?;
        let copies = match reliability {
            Reliability::Unreliable => 1,
            Reliability::Reliable => RELIABLE_COPIES,
        };
        let targets: Vec<(PeerId, SocketAddr)> = {
            let table = self.shared.table();
            to.iter()
                .filter_map(|&peer| {
                    table
                        .peers
                        .get(&peer)
                        .filter(|e| e.state == PeerState::Connected)
                        .map(|e| (peer, e.addr))
                })
                .collect()
        };

        let mut result = Ok(());
        for (peer, addr) in targets {
            let frame = self.shared.envelope(Frame::Data {
                from: self.local,
                to: peer,
                seq: self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
                text: text.to_string(),
            });
            for _ in 0..copies {
                if let Err(e) = send_frame(&self.socket, &frame, addr) {
                    warn!(%peer, "send failed: {e}");
                    result = Err(e);
                    break;
                }
            }
        }
        result
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if !self.shared.running.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let leave = self.shared.envelope(Frame::Leave { peer: self.local });
        send_frame(&self.socket, &leave, self.shared.config.announce_addr)?;
        info!("UDP transport stopped");
        Ok(())
    }
}

// ── Receive thread ────────────────────────────────────────────────────────────

fn receive_loop(socket: UdpSocket, shared: Arc<Shared>, tx: mpsc::Sender<TransportEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut last_announce: Option<Instant> = None;
    let announce = shared.envelope(Frame::Announce {
        peer: shared.table().local,
        name: shared.name.clone(),
    });

    while shared.running.load(Ordering::Relaxed) {
        let advertising = shared.table().advertising;
        let due = last_announce.map_or(true, |t| t.elapsed() >= shared.config.announce_interval);
        if advertising && due {
            if let Err(e) = send_frame(&socket, &announce, shared.config.announce_addr) {
                warn!("announce failed: {e}");
            }
            last_announce = Some(Instant::now());
        }

        let mut events = match socket.recv_from(&mut buf) {
            Ok((len, src)) => match serde_json::from_slice::<Envelope>(&buf[..len]) {
                Ok(envelope) => shared.table().on_frame(envelope, src, Instant::now()),
                Err(e) => {
                    debug!("failed to decode datagram from {src}: {e}");
                    Vec::new()
                }
            },
            Err(e) if is_timeout_error(&e) => Vec::new(),
            Err(e) => {
                error!("transport recv error: {e}");
                Vec::new()
            }
        };
        events.extend(shared.table().sweep(
            Instant::now(),
            shared.config.peer_timeout,
            shared.config.invite_timeout,
        ));

        for event in events {
            if tx.blocking_send(event).is_err() {
                // Receiver dropped; the owner is shutting down.
                return;
            }
        }
    }

    debug!("UDP receive loop stopped");
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
