//! The six-state pairing handshake as a pure transition function.
//!
//! # How it fits together (for beginners)
//!
//! The machine never touches the network.  The caller feeds it one
//! [`PairingEvent`] at a time (a button press, a peer joining, a text message
//! arriving) and gets back a [`Transition`] describing the new state and the
//! messages that must now be sent.  Because every request/response pair is
//! modelled as two independent transitions, a peer that never answers simply
//! leaves the machine where it is; nothing ever blocks.
//!
//! Retries are made safe by idempotence: the host may resend `select:`, a
//! stage request or `success` as often as it likes, and a client that has
//! already advanced re-acknowledges late duplicates instead of advancing
//! twice.

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::domain::peer::{elect_host, HostRole, PeerId, PeerSet};
use crate::pairing::state::{
    PairingAction, PairingError, PairingEvent, PairingState, StageStatus, Transition, UserIntent,
};
use crate::protocol::codec::decode_message;
use crate::protocol::messages::{CalibrationSample, CalibrationStage, PairingMessage};

/// Seconds since the Unix epoch, saturating to 0 before it.
pub fn unix_time_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Owner of the protocol state for one local device.
///
/// All mutation goes through [`PairingStateMachine::handle`]; the caller is
/// responsible for serializing calls (one owner task, or a mutex).
#[derive(Debug, Clone)]
pub struct PairingStateMachine {
    local: PeerId,
    state: PairingState,
    role: HostRole,
    peers: PeerSet,
    /// Peers that announced `searched`; only these may be selected.
    searched: BTreeSet<PeerId>,
    selected: Option<PeerId>,
    stage_status: StageStatus,
    samples: HashMap<CalibrationStage, CalibrationSample>,
    clock: fn() -> i64,
}

impl PairingStateMachine {
    pub fn new(local: PeerId) -> Self {
        Self::with_clock(local, unix_time_now)
    }

    /// Creates a machine that timestamps its samples with `clock`.
    pub fn with_clock(local: PeerId, clock: fn() -> i64) -> Self {
        Self {
            local,
            state: PairingState::Initial,
            role: HostRole::Unknown,
            peers: PeerSet::new(),
            searched: BTreeSet::new(),
            selected: None,
            stage_status: StageStatus::Idle,
            samples: HashMap::new(),
            clock,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn role(&self) -> HostRole {
        self.role
    }

    pub fn selected(&self) -> Option<PeerId> {
        self.selected
    }

    pub fn stage_status(&self) -> StageStatus {
        self.stage_status
    }

    pub fn connected_peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Connected peers that have announced `searched` and can be selected.
    pub fn selectable_peers(&self) -> Vec<PeerId> {
        self.searched
            .iter()
            .copied()
            .filter(|p| self.peers.contains(*p))
            .collect()
    }

    /// The last sample the host decoded for `stage`.
    pub fn latest_sample(&self, stage: CalibrationStage) -> Option<&CalibrationSample> {
        self.samples.get(&stage)
    }

    /// Host side: a sample is waiting for the user's verdict.
    pub fn is_communicating(&self) -> bool {
        self.role.is_host() && self.stage_status == StageStatus::AwaitingConfirmation
    }

    // ── Transition function ───────────────────────────────────────────────────

    /// Applies one event.
    ///
    /// # Errors
    ///
    /// Any [`PairingError`].  The machine is left exactly as it was and no
    /// actions are produced.  A failed host election is the one failure that
    /// is returned inside an `Ok` [`Transition`], because its `Hello` still
    /// goes out.
    pub fn handle(&mut self, event: PairingEvent) -> Result<Transition, PairingError> {
        let actions = match event {
            PairingEvent::User(UserIntent::Search) if self.state == PairingState::Searching => {
                return Ok(self.search());
            }
            PairingEvent::User(intent) => self.on_intent(intent)?,
            PairingEvent::PeerConnected(peer) => {
                if self.peers.insert(peer) {
                    debug!(%peer, "peer connected");
                }
                Vec::new()
            }
            PairingEvent::PeerDisconnected(peer) => {
                self.on_peer_disconnected(peer);
                Vec::new()
            }
            PairingEvent::MessageReceived { from, text } => {
                let message = decode_message(&text)?;
                debug!(%from, kind = message.kind(), "message received");
                self.on_message(from, message)?
            }
        };

        Ok(Transition {
            state: self.state,
            actions,
            error: None,
        })
    }

    /// Broadcasts `Hello`, then elects the host.  On success the machine moves
    /// to `Selecting` and announces `searched`; on failure it stays in
    /// `Searching` and the error rides along with the `Hello`.
    fn search(&mut self) -> Transition {
        let mut actions = vec![PairingAction::Broadcast(PairingMessage::Hello)];
        let error = match elect_host(self.local, &self.peers) {
            Ok(role) => {
                self.role = role;
                info!(?role, peers = self.peers.len(), "host election complete");
                self.enter(PairingState::Selecting);
                actions.push(PairingAction::Broadcast(PairingMessage::Searched));
                None
            }
            Err(e) => Some(PairingError::from(e)),
        };
        Transition {
            state: self.state,
            actions,
            error,
        }
    }

    // ── User intents ──────────────────────────────────────────────────────────

    fn on_intent(&mut self, intent: UserIntent) -> Result<Vec<PairingAction>, PairingError> {
        match (intent, self.state) {
            (UserIntent::Start, PairingState::Initial) => {
                self.enter(PairingState::Searching);
                Ok(Vec::new())
            }

            (UserIntent::ReturnToStart, PairingState::Searching) => {
                self.reset_all();
                Ok(Vec::new())
            }

            (UserIntent::ReturnToStart, PairingState::Selecting) if self.role.is_client() => {
                self.role = HostRole::Unknown;
                self.enter(PairingState::Searching);
                Ok(Vec::new())
            }

            (UserIntent::SelectPeer(peer), PairingState::Selecting) if self.role.is_host() => {
                self.select_peer(peer)
            }

            (UserIntent::BeginStage, state) if self.role.is_host() => match state.stage() {
                Some(stage)
                    if matches!(
                        self.stage_status,
                        StageStatus::Idle | StageStatus::AwaitingResponse
                    ) =>
                {
                    let to = self.partner()?;
                    self.stage_status = StageStatus::AwaitingResponse;
                    Ok(vec![PairingAction::Send {
                        to,
                        message: PairingMessage::Request(stage),
                    }])
                }
                _ => Err(self.not_allowed(intent)),
            },

            (UserIntent::ConfirmSuccess, state) if self.role.is_host() => match state.stage() {
                Some(stage)
                    if matches!(
                        self.stage_status,
                        StageStatus::AwaitingConfirmation | StageStatus::AwaitingAck
                    ) =>
                {
                    let to = self.partner()?;
                    self.stage_status = StageStatus::AwaitingAck;
                    Ok(vec![PairingAction::Send {
                        to,
                        message: PairingMessage::Success(stage),
                    }])
                }
                _ => Err(self.not_allowed(intent)),
            },

            (UserIntent::ConfirmFailure, state)
                if self.role.is_host()
                    && state.stage().is_some()
                    && self.stage_status == StageStatus::AwaitingConfirmation =>
            {
                let to = self.partner()?;
                self.stage_status = StageStatus::Idle;
                info!(?state, "sample rejected, stage restarts");
                Ok(vec![PairingAction::Send {
                    to,
                    message: PairingMessage::Reset,
                }])
            }

            _ => Err(self.not_allowed(intent)),
        }
    }

    fn select_peer(&mut self, peer: PeerId) -> Result<Vec<PairingAction>, PairingError> {
        match self.selected {
            Some(current) if current != peer => return Err(PairingError::AlreadySelected(current)),
            Some(_) => debug!(%peer, "resending select"),
            None => {
                if !self.peers.contains(peer) {
                    return Err(PairingError::PeerNotConnected(peer));
                }
                if !self.searched.contains(&peer) {
                    return Err(PairingError::PeerNotReady(peer));
                }
                self.selected = Some(peer);
                info!(%peer, "partner selected");
            }
        }
        Ok(vec![PairingAction::Send {
            to: peer,
            message: PairingMessage::Select(self.local),
        }])
    }

    // ── Inbound messages ──────────────────────────────────────────────────────

    fn on_message(
        &mut self,
        from: PeerId,
        message: PairingMessage,
    ) -> Result<Vec<PairingAction>, PairingError> {
        if self.state.has_partner() && self.selected != Some(from) {
            debug!(%from, kind = message.kind(), "ignoring message from non-partner");
            return Ok(Vec::new());
        }

        let actions = match message {
            PairingMessage::Hello => Vec::new(),

            PairingMessage::Searched => {
                if !self.state.has_partner() && self.searched.insert(from) {
                    debug!(%from, "peer is ready to be selected");
                }
                Vec::new()
            }

            PairingMessage::Select(hash) => self.on_select(from, hash)?,

            PairingMessage::ReceivedSelect => {
                if self.state == PairingState::Selecting
                    && self.role.is_host()
                    && self.selected == Some(from)
                {
                    self.enter(PairingState::HmdCoordinate);
                } else {
                    debug!(%from, state = ?self.state, "ignoring receivedSelect");
                }
                Vec::new()
            }

            PairingMessage::Request(stage) => {
                if self.role.is_client() && self.state.stage() == Some(stage) {
                    let sample = CalibrationSample::stub(stage, (self.clock)());
                    self.stage_status = StageStatus::AwaitingConfirmation;
                    vec![PairingAction::Send {
                        to: from,
                        message: PairingMessage::Response(sample),
                    }]
                } else {
                    debug!(?stage, state = ?self.state, "ignoring request");
                    Vec::new()
                }
            }

            PairingMessage::Response(sample) => {
                let stage = sample.stage();
                if self.role.is_host()
                    && self.state.stage() == Some(stage)
                    && self.stage_status != StageStatus::AwaitingAck
                {
                    info!(?stage, unix_time = sample.unix_time(), "sample received");
                    self.samples.insert(stage, sample);
                    self.stage_status = StageStatus::AwaitingConfirmation;
                } else {
                    debug!(?stage, state = ?self.state, "ignoring response");
                }
                Vec::new()
            }

            PairingMessage::Success(stage) => {
                if !self.role.is_client() {
                    Vec::new()
                } else if self.state.stage() == Some(stage) {
                    self.advance();
                    vec![ack(from, stage)]
                } else if self.state.completed_stage() == Some(stage) {
                    debug!(?stage, "re-acknowledging duplicate success");
                    vec![ack(from, stage)]
                } else {
                    Vec::new()
                }
            }

            PairingMessage::ReceivedSuccess(stage) => {
                if self.role.is_host()
                    && self.state.stage() == Some(stage)
                    && self.stage_status == StageStatus::AwaitingAck
                {
                    self.advance();
                } else {
                    debug!(?stage, state = ?self.state, "ignoring receivedSuccess");
                }
                Vec::new()
            }

            PairingMessage::Reset => {
                if self.state.stage().is_some() {
                    self.stage_status = StageStatus::Idle;
                    info!(state = ?self.state, "stage reset by partner");
                }
                Vec::new()
            }
        };
        Ok(actions)
    }

    fn on_select(&mut self, from: PeerId, hash: PeerId) -> Result<Vec<PairingAction>, PairingError> {
        if !self.role.is_client() {
            return Ok(Vec::new());
        }
        match self.state {
            PairingState::Selecting => {
                let host = self
                    .peers
                    .resolve(hash.value())
                    .ok_or(PairingError::UnresolvedPeer(hash))?;
                self.selected = Some(host);
                info!(%host, "selected by host");
                self.enter(PairingState::HmdCoordinate);
                Ok(vec![PairingAction::Send {
                    to: host,
                    message: PairingMessage::ReceivedSelect,
                }])
            }
            // Host retried because our first receivedSelect was lost.
            state if state.has_partner() && self.selected == Some(hash) => {
                debug!(%from, "re-acknowledging duplicate select");
                Ok(vec![PairingAction::Send {
                    to: from,
                    message: PairingMessage::ReceivedSelect,
                }])
            }
            _ => Ok(Vec::new()),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn on_peer_disconnected(&mut self, peer: PeerId) {
        if !self.peers.remove(peer) {
            return;
        }
        self.searched.remove(&peer);
        if self.selected == Some(peer) && self.state == PairingState::Selecting {
            // Not confirmed yet, so the host may pick someone else.
            self.selected = None;
            info!(%peer, "selected peer left before confirming, selection cleared");
        } else if self.selected == Some(peer) {
            warn!(%peer, state = ?self.state, "pairing partner disconnected");
        } else {
            debug!(%peer, "peer disconnected");
        }
    }

    fn enter(&mut self, next: PairingState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "pairing state changed");
        }
        self.state = next;
        self.stage_status = StageStatus::Idle;
    }

    fn advance(&mut self) {
        match self.state {
            PairingState::HmdCoordinate => self.enter(PairingState::BothIndexFingerCoordinate),
            PairingState::BothIndexFingerCoordinate => self.enter(PairingState::Prepared),
            _ => {}
        }
    }

    fn reset_all(&mut self) {
        self.role = HostRole::Unknown;
        self.selected = None;
        self.searched.clear();
        self.samples.clear();
        self.enter(PairingState::Initial);
    }

    fn partner(&self) -> Result<PeerId, PairingError> {
        self.selected.ok_or(PairingError::NoPartner)
    }

    fn not_allowed(&self, intent: UserIntent) -> PairingError {
        PairingError::IntentNotAllowed {
            intent: intent.name(),
            state: self.state,
            role: self.role,
        }
    }
}

fn ack(to: PeerId, stage: CalibrationStage) -> PairingAction {
    PairingAction::Send {
        to,
        message: PairingMessage::ReceivedSuccess(stage),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
