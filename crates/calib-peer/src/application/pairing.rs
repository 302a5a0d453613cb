//! PairingService: the single task that owns the pairing state machine.
//!
//! Network notifications and user intents arrive on two `mpsc` channels and
//! are applied to the [`PairingStateMachine`] one at a time, in arrival order.
//! The messages each transition asks for are encoded to wire text and handed
//! to a [`MessageSender`].  After every event a fresh [`PairingSnapshot`] is
//! published on a `watch` channel for the presentation layer.
//!
//! # Why a single owner? (for beginners)
//!
//! The machine is plain data with a synchronous `handle` method.  Instead of
//! sharing it behind a lock, every mutation is funnelled through this task, so
//! two events can never interleave half-way through a transition.  Sends are
//! fire-and-forget: the service never waits for a reply; a reply is just the
//! next event on the channel.

use std::sync::Arc;

use async_trait::async_trait;
use calib_core::{
    encode_message, CalibrationSample, CalibrationStage, HostRole, PairingAction, PairingError,
    PairingEvent, PairingState, PairingStateMachine, PeerId, StageStatus, UserIntent,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

// ── Abstractions ──────────────────────────────────────────────────────────────

/// Delivers encoded protocol text to peers.
///
/// The infrastructure implementation is the peer session; tests use a
/// recording double.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Sends `text` to every connected peer.
    async fn broadcast(&self, text: &str) -> Result<(), String>;

    /// Sends `text` to the listed peers.
    async fn send_to(&self, text: &str, peers: &[PeerId]) -> Result<(), String>;
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// A message as it arrived, before decoding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedText {
    pub from: PeerId,
    pub text: String,
}

/// Everything the presentation layer shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PairingSnapshot {
    pub local_id: PeerId,
    pub state: PairingState,
    pub role: HostRole,
    pub stage_status: StageStatus,
    pub selected: Option<PeerId>,
    pub connected_peers: Vec<PeerId>,
    /// Connected peers that announced `searched`; what the host may select.
    pub selectable_peers: Vec<PeerId>,
    pub last_received: Option<ReceivedText>,
    /// Decoded samples, in stage order.
    pub samples: Vec<CalibrationSample>,
    /// The last rejected user intent, until the next accepted one.
    pub last_error: Option<String>,
}

impl PairingSnapshot {
    fn capture(
        machine: &PairingStateMachine,
        last_received: Option<ReceivedText>,
        last_error: Option<String>,
    ) -> Self {
        let samples = [CalibrationStage::Hmd, CalibrationStage::BothIndexFinger]
            .into_iter()
            .filter_map(|stage| machine.latest_sample(stage).cloned())
            .collect();

        Self {
            local_id: machine.local_id(),
            state: machine.state(),
            role: machine.role(),
            stage_status: machine.stage_status(),
            selected: machine.selected(),
            connected_peers: machine.connected_peers().to_vec(),
            selectable_peers: machine.selectable_peers(),
            last_received,
            samples,
            last_error,
        }
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Owns the pairing state machine and drives it from channels.
pub struct PairingService {
    machine: PairingStateMachine,
    sender: Arc<dyn MessageSender>,
    snapshot_tx: watch::Sender<PairingSnapshot>,
    last_received: Option<ReceivedText>,
    last_error: Option<String>,
}

impl PairingService {
    /// Wraps `machine`; returns the service and a receiver of its snapshots.
    pub fn new(
        machine: PairingStateMachine,
        sender: Arc<dyn MessageSender>,
    ) -> (Self, watch::Receiver<PairingSnapshot>) {
        let (snapshot_tx, snapshot_rx) =
            watch::channel(PairingSnapshot::capture(&machine, None, None));
        let service = Self {
            machine,
            sender,
            snapshot_tx,
            last_received: None,
            last_error: None,
        };
        (service, snapshot_rx)
    }

    /// Another receiver of the snapshots.
    pub fn subscribe(&self) -> watch::Receiver<PairingSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn machine(&self) -> &PairingStateMachine {
        &self.machine
    }

    /// Applies one event, carries out the resulting sends and publishes a
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns the machine's error when the event was rejected.  The state is
    /// unchanged in that case and the snapshot still gets published.  A failed
    /// host election is returned too, after its `Hello` was sent.  Send
    /// failures are logged and not returned.
    pub async fn handle(&mut self, event: PairingEvent) -> Result<(), PairingError> {
        let is_intent = matches!(event, PairingEvent::User(_));
        let kind = event_kind(&event);
        if let PairingEvent::MessageReceived { from, text } = &event {
            self.last_received = Some(ReceivedText {
                from: *from,
                text: text.clone(),
            });
        }

        let outcome = match self.machine.handle(event) {
            Ok(transition) => {
                self.execute(transition.actions).await;
                transition.error.map_or(Ok(()), Err)
            }
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(()) if is_intent => self.last_error = None,
            Ok(()) => {}
            Err(e) if is_intent => {
                warn!("intent rejected: {e}");
                self.last_error = Some(e.to_string());
            }
            Err(e) => warn!("{kind} ignored: {e}"),
        }

        self.publish();
        outcome
    }

    /// Processes events until both channels are closed.
    pub async fn run<E>(
        mut self,
        mut network_rx: mpsc::Receiver<E>,
        mut intent_rx: mpsc::Receiver<UserIntent>,
    ) where
        E: Into<PairingEvent> + Send + 'static,
    {
        loop {
            let event = tokio::select! {
                Some(event) = network_rx.recv() => event.into(),
                Some(intent) = intent_rx.recv() => PairingEvent::User(intent),
                else => break,
            };
            // Errors are already logged and published by `handle`.
            let _ = self.handle(event).await;
        }
        debug!("pairing service stopped");
    }

    async fn execute(&self, actions: Vec<PairingAction>) {
        for action in actions {
            let (message, to) = match action {
                PairingAction::Broadcast(message) => (message, None),
                PairingAction::Send { to, message } => (message, Some(to)),
            };

            let text = match encode_message(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("could not encode {}: {e}", message.kind());
                    continue;
                }
            };

            let sent = match to {
                None => self.sender.broadcast(&text).await,
                Some(peer) => self.sender.send_to(&text, &[peer]).await,
            };
            match sent {
                Ok(()) => debug!("sent {} to {:?}", message.kind(), to),
                Err(e) => warn!("failed to send {}: {e}", message.kind()),
            }
        }
    }

    fn publish(&self) {
        let snapshot = PairingSnapshot::capture(
            &self.machine,
            self.last_received.clone(),
            self.last_error.clone(),
        );
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn event_kind(event: &PairingEvent) -> &'static str {
    match event {
        PairingEvent::User(intent) => intent.name(),
        PairingEvent::PeerConnected(_) => "peer connected",
        PairingEvent::PeerDisconnected(_) => "peer disconnected",
        PairingEvent::MessageReceived { .. } => "message",
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
