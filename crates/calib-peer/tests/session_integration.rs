//! Integration tests: two complete nodes over the in-memory network.
//!
//! Each node is a `PeerSession` feeding a `PairingService`, exactly as the
//! binary wires them, with only the transport swapped for `MemoryNetwork`.
//! User intents are injected on the intent channels and progress is observed
//! through the published snapshots.

use std::sync::Arc;
use std::time::Duration;

use calib_core::{HostRole, PairingState, PairingStateMachine, PeerId, StageStatus, UserIntent};
use calib_peer::application::pairing::{PairingService, PairingSnapshot};
use calib_peer::infrastructure::session::{AcceptAll, PeerSession};
use calib_peer::infrastructure::transport::MemoryNetwork;
use tokio::sync::{mpsc, watch};

const HOST: PeerId = PeerId(10);
const CLIENT: PeerId = PeerId(3);

struct Node {
    session: Arc<PeerSession>,
    intents: mpsc::Sender<UserIntent>,
    snapshots: watch::Receiver<PairingSnapshot>,
}

impl Node {
    async fn spawn(network: &MemoryNetwork, id: PeerId) -> Self {
        let (transport, transport_rx) = network.join(id, format!("node-{id}"));
        let (session, session_rx) =
            PeerSession::new(Arc::new(transport), transport_rx, Arc::new(AcceptAll));
        let (service, snapshots) =
            PairingService::new(PairingStateMachine::new(id), session.clone());
        let (intents, intent_rx) = mpsc::channel(16);
        tokio::spawn(service.run(session_rx, intent_rx));
        session.start().await.expect("session must start");
        Self {
            session,
            intents,
            snapshots,
        }
    }

    async fn intent(&self, intent: UserIntent) {
        self.intents.send(intent).await.expect("service must be running");
    }

    /// Waits until the published snapshot satisfies `predicate`.
    async fn wait_for(&mut self, what: &str, predicate: impl FnMut(&PairingSnapshot) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), self.snapshots.wait_for(predicate))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
            .expect("service dropped its snapshot sender");
    }

    fn snapshot(&self) -> PairingSnapshot {
        self.snapshots.borrow().clone()
    }
}

/// Two connected nodes, both in `Selecting`, the host seeing the client as
/// selectable.
async fn nodes_in_selecting() -> (MemoryNetwork, Node, Node) {
    let network = MemoryNetwork::new();
    let mut host = Node::spawn(&network, HOST).await;
    let mut client = Node::spawn(&network, CLIENT).await;

    host.wait_for("host connected", |s| s.connected_peers == vec![CLIENT])
        .await;
    client
        .wait_for("client connected", |s| s.connected_peers == vec![HOST])
        .await;

    for node in [&host, &client] {
        node.intent(UserIntent::Start).await;
        node.intent(UserIntent::Search).await;
    }
    host.wait_for("host selecting", |s| {
        s.state == PairingState::Selecting && s.selectable_peers == vec![CLIENT]
    })
    .await;
    client
        .wait_for("client selecting", |s| s.state == PairingState::Selecting)
        .await;

    (network, host, client)
}

async fn select_client(host: &mut Node, client: &mut Node) {
    host.intent(UserIntent::SelectPeer(CLIENT)).await;
    host.wait_for("host in HMD stage", |s| s.state == PairingState::HmdCoordinate)
        .await;
    client
        .wait_for("client in HMD stage", |s| {
            s.state == PairingState::HmdCoordinate
        })
        .await;
}

async fn run_stage(host: &mut Node, client: &mut Node, next: PairingState) {
    host.intent(UserIntent::BeginStage).await;
    host.wait_for("sample to confirm", |s| {
        s.stage_status == StageStatus::AwaitingConfirmation
    })
    .await;
    host.intent(UserIntent::ConfirmSuccess).await;
    host.wait_for("host advanced", |s| s.state == next).await;
    client.wait_for("client advanced", |s| s.state == next).await;
}

#[tokio::test]
async fn test_two_nodes_complete_the_handshake() {
    // Arrange
    let (_network, mut host, mut client) = nodes_in_selecting().await;
    assert_eq!(host.snapshot().role, HostRole::Host);
    assert_eq!(client.snapshot().role, HostRole::Client);

    // Act
    select_client(&mut host, &mut client).await;
    run_stage(&mut host, &mut client, PairingState::BothIndexFingerCoordinate).await;
    run_stage(&mut host, &mut client, PairingState::Prepared).await;

    // Assert
    let host_view = host.snapshot();
    assert_eq!(host_view.selected, Some(CLIENT));
    assert_eq!(host_view.samples.len(), 2);
    assert_eq!(client.snapshot().selected, Some(HOST));
    assert_eq!(
        client.session.last_message().map(|m| m.text),
        Some("successBothIndexFingerCoordinate".to_string())
    );
}

#[tokio::test]
async fn test_rejected_sample_keeps_both_nodes_in_stage() {
    let (_network, mut host, mut client) = nodes_in_selecting().await;
    select_client(&mut host, &mut client).await;

    host.intent(UserIntent::BeginStage).await;
    host.wait_for("sample to confirm", |s| {
        s.stage_status == StageStatus::AwaitingConfirmation
    })
    .await;
    client
        .wait_for("client answered", |s| {
            s.stage_status == StageStatus::AwaitingConfirmation
        })
        .await;
    host.intent(UserIntent::ConfirmFailure).await;

    client
        .wait_for("client reset", |s| s.stage_status == StageStatus::Idle)
        .await;
    assert_eq!(host.snapshot().state, PairingState::HmdCoordinate);
    assert_eq!(host.snapshot().stage_status, StageStatus::Idle);
    assert_eq!(client.snapshot().state, PairingState::HmdCoordinate);
}

#[tokio::test]
async fn test_client_sees_host_leave() {
    let (network, _host, mut client) = nodes_in_selecting().await;

    network.remove(HOST).await;

    client
        .wait_for("host gone", |s| s.connected_peers.is_empty())
        .await;
    assert_eq!(client.snapshot().state, PairingState::Selecting);
}

#[tokio::test]
async fn test_select_before_peer_searched_is_reported() {
    // Arrange: only the host searches.
    let network = MemoryNetwork::new();
    let mut host = Node::spawn(&network, HOST).await;
    let _client = Node::spawn(&network, CLIENT).await;
    host.wait_for("host connected", |s| s.connected_peers == vec![CLIENT])
        .await;
    host.intent(UserIntent::Start).await;
    host.intent(UserIntent::Search).await;
    host.wait_for("host selecting", |s| s.state == PairingState::Selecting)
        .await;

    // Act
    host.intent(UserIntent::SelectPeer(CLIENT)).await;

    // Assert
    host.wait_for("error surfaced", |s| s.last_error.is_some())
        .await;
    assert_eq!(host.snapshot().state, PairingState::Selecting);
    assert_eq!(host.snapshot().selected, None);
}
