//! PeerSession: session membership on top of a [`Transport`].
//!
//! The session turns raw transport events into the three notifications the
//! pairing service cares about: a peer joined, a peer left, a peer said
//! something.  Along the way it
//!
//! - invites every discovered peer and answers invitations, as decided by an
//!   [`InvitationPolicy`];
//! - tracks the set of connected peers, emitting a notification only when the
//!   set actually changes;
//! - decodes inbound bytes as UTF-8 and remembers the latest message.
//!
//! # Event pump (for beginners)
//!
//! [`PeerSession::start`] spawns one Tokio task that drains the transport's
//! event channel.  Because a single task handles the events one by one, the
//! [`SessionEvent`]s it emits keep the transport's arrival order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use calib_core::{PairingEvent, PeerId, PeerSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::pairing::MessageSender;
use crate::infrastructure::transport::{
    PeerState, Reliability, Transport, TransportError, TransportEvent,
};

/// Capacity of the session's outbound event channel.
const SESSION_CHANNEL_CAPACITY: usize = 256;

// ── Invitation policy ─────────────────────────────────────────────────────────

/// Decides which peers we invite and whose invitations we accept.
pub trait InvitationPolicy: Send + Sync {
    /// Whether to invite a peer that was just discovered.
    fn should_invite(&self, _peer: PeerId, _name: &str) -> bool {
        true
    }

    /// Whether to accept an invitation from `peer`.
    fn should_accept(&self, peer: PeerId, name: &str) -> bool;
}

/// Invites everyone and accepts every invitation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl InvitationPolicy for AcceptAll {
    fn should_accept(&self, _peer: PeerId, _name: &str) -> bool {
        true
    }
}

// ── Session events ────────────────────────────────────────────────────────────

/// Notifications emitted by a [`PeerSession`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    MessageReceived { from: PeerId, text: String },
}

impl From<SessionEvent> for PairingEvent {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::PeerConnected(peer) => PairingEvent::PeerConnected(peer),
            SessionEvent::PeerDisconnected(peer) => PairingEvent::PeerDisconnected(peer),
            SessionEvent::MessageReceived { from, text } => {
                PairingEvent::MessageReceived { from, text }
            }
        }
    }
}

/// The most recent message received from any peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub from: PeerId,
    pub text: String,
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct PeerSession {
    transport: Arc<dyn Transport>,
    policy: Arc<dyn InvitationPolicy>,
    peers: Mutex<PeerSet>,
    last_message: Mutex<Option<InboundMessage>>,
    started: AtomicBool,
    transport_rx: tokio::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    events_tx: mpsc::Sender<SessionEvent>,
}

impl PeerSession {
    /// Creates a session over `transport`, whose events arrive on
    /// `transport_rx`.  Nothing happens until [`start`](Self::start).
    pub fn new(
        transport: Arc<dyn Transport>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        policy: Arc<dyn InvitationPolicy>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        let session = Arc::new(Self {
            transport,
            policy,
            peers: Mutex::new(PeerSet::new()),
            last_message: Mutex::new(None),
            started: AtomicBool::new(false),
            transport_rx: tokio::sync::Mutex::new(Some(transport_rx)),
            events_tx,
        });
        (session, events_rx)
    }

    pub fn local_id(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Starts advertising and browsing, and spawns the event pump.
    ///
    /// Calling it again after a successful start does nothing.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if advertising or browsing fails; the
    /// session can then be started again.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("session already started");
            return Ok(());
        }

        let mut slot = self.transport_rx.lock().await;
        let Some(rx) = slot.take() else {
            return Ok(());
        };

        let started = async {
            self.transport.advertise().await?;
            self.transport.browse().await
        };
        if let Err(e) = started.await {
            *slot = Some(rx);
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        info!(local = %self.local_id(), "peer session started");
        tokio::spawn(Arc::clone(self).pump(rx));
        Ok(())
    }

    /// Sends `text` to every connected peer.  Does nothing without peers.
    ///
    /// # Errors
    ///
    /// Returns the transport's send error.
    pub async fn broadcast(&self, text: &str) -> Result<(), TransportError> {
        let peers = self.connected_peers().to_vec();
        if peers.is_empty() {
            debug!("broadcast skipped, no connected peers");
            return Ok(());
        }
        self.transport
            .send(text.as_bytes(), &peers, Reliability::Unreliable)
            .await
    }

    /// Sends `text` to those of `peers` that are connected.  Directed sends
    /// carry selection and stage steps, so they ask for reliable delivery.
    ///
    /// # Errors
    ///
    /// Returns the transport's send error.
    pub async fn send_to(&self, text: &str, peers: &[PeerId]) -> Result<(), TransportError> {
        let connected = self.connected_peers();
        let targets: Vec<PeerId> = peers
            .iter()
            .copied()
            .filter(|&p| connected.contains(p))
            .collect();
        if targets.len() < peers.len() {
            debug!(
                skipped = peers.len() - targets.len(),
                "send skipped peers that are not connected"
            );
        }
        if targets.is_empty() {
            return Ok(());
        }
        self.transport
            .send(text.as_bytes(), &targets, Reliability::Reliable)
            .await
    }

    pub fn connected_peers(&self) -> PeerSet {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_message(&self) -> Option<InboundMessage> {
        self.last_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Leaves the session.
    ///
    /// # Errors
    ///
    /// Returns the transport's error.
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.transport.stop().await
    }

    // ── Event pump ────────────────────────────────────────────────────────────

    async fn pump(self: Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            self.on_transport_event(event).await;
        }
        debug!("transport event channel closed");
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerFound { peer, name } => self.on_peer_discovered(peer, &name).await,

            TransportEvent::InvitationReceived { from, name } => {
                let accept = self.policy.should_accept(from, &name);
                info!(%from, %name, accept, "invitation received");
                if let Err(e) = self.transport.respond_to_invitation(from, accept).await {
                    warn!(%from, "failed to answer invitation: {e}");
                }
            }

            TransportEvent::StateChanged { peer, state } => match state {
                PeerState::Connected => self.on_peer_connected(peer).await,
                PeerState::NotConnected => self.on_peer_disconnected(peer).await,
                PeerState::Connecting => debug!(%peer, "peer connecting"),
            },

            TransportEvent::PeerLost(peer) => {
                debug!(%peer, "peer lost");
                self.on_peer_disconnected(peer).await;
            }

            TransportEvent::DataReceived { from, data } => {
                self.on_message_received(from, data).await
            }
        }
    }

    async fn on_peer_discovered(&self, peer: PeerId, name: &str) {
        if self.connected_peers().contains(peer) {
            return;
        }
        if !self.policy.should_invite(peer, name) {
            debug!(%peer, %name, "policy declined to invite");
            return;
        }
        debug!(%peer, %name, "inviting discovered peer");
        if let Err(e) = self.transport.invite(peer).await {
            warn!(%peer, "failed to invite: {e}");
        }
    }

    async fn on_peer_connected(&self, peer: PeerId) {
        let added = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer);
        if added {
            info!(%peer, "peer connected");
            self.emit(SessionEvent::PeerConnected(peer)).await;
        }
    }

    async fn on_peer_disconnected(&self, peer: PeerId) {
        let removed = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
        if removed {
            info!(%peer, "peer disconnected");
            self.emit(SessionEvent::PeerDisconnected(peer)).await;
        }
    }

    async fn on_message_received(&self, from: PeerId, data: Vec<u8>) {
        let text = match String::from_utf8(data) {
            Ok(text) => text,
            Err(e) => {
                warn!(%from, "dropping message that is not UTF-8: {e}");
                return;
            }
        };
        *self
            .last_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(InboundMessage {
            from,
            text: text.clone(),
        });
        self.emit(SessionEvent::MessageReceived { from, text }).await;
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events_tx.send(event).await.is_err() {
            debug!("session event receiver dropped");
        }
    }
}

#[async_trait]
impl MessageSender for PeerSession {
    async fn broadcast(&self, text: &str) -> Result<(), String> {
        PeerSession::broadcast(self, text)
            .await
            .map_err(|e| e.to_string())
    }

    async fn send_to(&self, text: &str, peers: &[PeerId]) -> Result<(), String> {
        PeerSession::send_to(self, text, peers)
            .await
            .map_err(|e| e.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::MemoryNetwork;
    use std::time::Duration;

    const A: PeerId = PeerId(10);
    const B: PeerId = PeerId(3);

    struct RejectAll;

    impl InvitationPolicy for RejectAll {
        fn should_accept(&self, _peer: PeerId, _name: &str) -> bool {
            false
        }
    }

    /// Records every send; reports no events of its own.
    #[derive(Default)]
    struct RecordingTransport {
        sends: Mutex<Vec<(Vec<u8>, Vec<PeerId>, Reliability)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn local_peer(&self) -> PeerId {
            A
        }

        async fn advertise(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn browse(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn invite(&self, _peer: PeerId) -> Result<(), TransportError> {
            Ok(())
        }

        async fn respond_to_invitation(
            &self,
            _peer: PeerId,
            _accept: bool,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(
            &self,
            data: &[u8],
            to: &[PeerId],
            reliability: Reliability,
        ) -> Result<(), TransportError> {
            self.sends
                .lock()
                .unwrap()
                .push((data.to_vec(), to.to_vec(), reliability));
            Ok(())
        }
    }

    fn join(
        network: &MemoryNetwork,
        id: PeerId,
        policy: Arc<dyn InvitationPolicy>,
    ) -> (Arc<PeerSession>, mpsc::Receiver<SessionEvent>) {
        let (transport, rx) = network.join(id, format!("node-{id}"));
        PeerSession::new(Arc::new(transport), rx, policy)
    }

    async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session channel closed")
    }

    async fn connected_pair() -> (
        MemoryNetwork,
        (Arc<PeerSession>, mpsc::Receiver<SessionEvent>),
        (Arc<PeerSession>, mpsc::Receiver<SessionEvent>),
    ) {
        let network = MemoryNetwork::new();
        let (a, mut a_rx) = join(&network, A, Arc::new(AcceptAll));
        let (b, mut b_rx) = join(&network, B, Arc::new(AcceptAll));
        a.start().await.unwrap();
        b.start().await.unwrap();
        assert_eq!(next_event(&mut a_rx).await, SessionEvent::PeerConnected(B));
        assert_eq!(next_event(&mut b_rx).await, SessionEvent::PeerConnected(A));
        (network, (a, a_rx), (b, b_rx))
    }

    #[test]
    fn test_session_event_converts_to_pairing_event() {
        let event: PairingEvent = SessionEvent::MessageReceived {
            from: A,
            text: "Hello".to_string(),
        }
        .into();
        assert_eq!(
            event,
            PairingEvent::MessageReceived {
                from: A,
                text: "Hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_two_sessions_discover_and_connect() {
        let (network, (a, _), (b, _)) = connected_pair().await;

        assert_eq!(a.connected_peers().to_vec(), vec![B]);
        assert_eq!(b.connected_peers().to_vec(), vec![A]);
        assert_eq!(network.link_count(), 1);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (_network, (a, _), _) = connected_pair().await;

        assert!(a.start().await.is_ok());
        assert_eq!(a.connected_peers().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_text_and_records_last_message() {
        // Arrange
        let (_network, (a, _), (b, mut b_rx)) = connected_pair().await;

        // Act
        a.broadcast("Hello").await.unwrap();

        // Assert
        assert_eq!(
            next_event(&mut b_rx).await,
            SessionEvent::MessageReceived {
                from: A,
                text: "Hello".to_string()
            }
        );
        assert_eq!(
            b.last_message(),
            Some(InboundMessage {
                from: A,
                text: "Hello".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (_network, (a, _), (_b, mut b_rx)) = connected_pair().await;

        for text in ["reqHMDPosition", "successHMDPosition", "reset"] {
            a.send_to(text, &[B]).await.unwrap();
        }

        for expected in ["reqHMDPosition", "successHMDPosition", "reset"] {
            match next_event(&mut b_rx).await {
                SessionEvent::MessageReceived { text, .. } => assert_eq!(text, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_peers_is_a_no_op() {
        let network = MemoryNetwork::new();
        let (a, _rx) = join(&network, A, Arc::new(AcceptAll));
        a.start().await.unwrap();

        assert!(a.broadcast("Hello").await.is_ok());
    }

    #[tokio::test]
    async fn test_send_to_skips_peers_that_are_not_connected() {
        let (_network, (a, _), (_b, mut b_rx)) = connected_pair().await;

        a.send_to("searched", &[PeerId(99)]).await.unwrap();
        a.send_to("Hello", &[PeerId(99), B]).await.unwrap();

        assert_eq!(
            next_event(&mut b_rx).await,
            SessionEvent::MessageReceived {
                from: A,
                text: "Hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_directed_sends_ask_for_reliable_delivery() {
        // Arrange: B joins through a transport that only records.
        let transport = Arc::new(RecordingTransport::default());
        let (tx, rx) = mpsc::channel(8);
        let (session, mut events) = PeerSession::new(transport.clone(), rx, Arc::new(AcceptAll));
        session.start().await.unwrap();
        tx.send(TransportEvent::StateChanged {
            peer: B,
            state: PeerState::Connected,
        })
        .await
        .unwrap();
        assert_eq!(next_event(&mut events).await, SessionEvent::PeerConnected(B));

        // Act
        session.broadcast("searched").await.unwrap();
        session.send_to("select:10", &[B]).await.unwrap();

        // Assert
        assert_eq!(
            *transport.sends.lock().unwrap(),
            vec![
                (b"searched".to_vec(), vec![B], Reliability::Unreliable),
                (b"select:10".to_vec(), vec![B], Reliability::Reliable),
            ]
        );
    }

    #[tokio::test]
    async fn test_rejecting_policy_keeps_peers_apart() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = join(&network, A, Arc::new(RejectAll));
        let (b, _b_rx) = join(&network, B, Arc::new(RejectAll));

        a.start().await.unwrap();
        b.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(a.connected_peers().is_empty());
        assert!(b.connected_peers().is_empty());
        assert_eq!(network.link_count(), 0);
    }

    #[tokio::test]
    async fn test_removed_peer_is_reported_disconnected() {
        let (network, (a, mut a_rx), _) = connected_pair().await;

        network.remove(B).await;

        assert_eq!(next_event(&mut a_rx).await, SessionEvent::PeerDisconnected(B));
        assert!(a.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_non_utf8_data_is_dropped() {
        // Arrange: a raw transport that accepts the session's invitation.
        let network = MemoryNetwork::new();
        let (raw, mut raw_rx) = network.join(B, "raw");
        raw.advertise().await.unwrap();
        let (a, mut a_rx) = join(&network, A, Arc::new(AcceptAll));
        a.start().await.unwrap();
        match tokio::time::timeout(Duration::from_secs(2), raw_rx.recv()).await {
            Ok(Some(TransportEvent::InvitationReceived { from, .. })) => {
                assert_eq!(from, A);
                raw.respond_to_invitation(A, true).await.unwrap();
            }
            other => panic!("expected an invitation, got {other:?}"),
        }
        assert_eq!(next_event(&mut a_rx).await, SessionEvent::PeerConnected(B));

        // Act
        raw.send(&[0xff, 0xfe], &[A], Reliability::Unreliable)
            .await
            .unwrap();
        raw.send(b"searched", &[A], Reliability::Unreliable)
            .await
            .unwrap();

        // Assert
        assert_eq!(
            next_event(&mut a_rx).await,
            SessionEvent::MessageReceived {
                from: B,
                text: "searched".to_string()
            }
        );
    }
}
