//! States, events, actions and errors of the pairing state machine.
//!
//! The machine is driven by [`PairingEvent`]s and answers each one with a
//! [`Transition`]: the state it ended in plus the [`PairingAction`]s the caller
//! must carry out (messages to send).  It performs no I/O itself.
//!
//! # Protocol states
//!
//! ```text
//! Initial ──► Searching ──► Selecting ──► HMDCoordinate ──► BothIndexFingerCoordinate ──► Prepared
//!                 ▲             │
//!                 └─────────────┘  (client "return to start")
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::peer::{ElectionError, HostRole, PeerId};
use crate::protocol::codec::ProtocolError;
use crate::protocol::messages::{CalibrationStage, PairingMessage};

/// Top-level protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PairingState {
    /// Nothing started yet.
    #[default]
    Initial,
    /// The user is about to search for nearby peers.
    Searching,
    /// Host election done; the host picks a partner, the client waits for it.
    Selecting,
    /// First calibration stage: the headset position exchange.
    HmdCoordinate,
    /// Second calibration stage: the index-finger position exchange.
    BothIndexFingerCoordinate,
    /// Handshake complete.  Terminal.
    Prepared,
}

impl PairingState {
    /// The calibration stage this state runs, if any.
    pub fn stage(self) -> Option<CalibrationStage> {
        match self {
            PairingState::HmdCoordinate => Some(CalibrationStage::Hmd),
            PairingState::BothIndexFingerCoordinate => Some(CalibrationStage::BothIndexFinger),
            _ => None,
        }
    }

    /// The calibration stage that was completed to reach this state, if any.
    pub fn completed_stage(self) -> Option<CalibrationStage> {
        match self {
            PairingState::BothIndexFingerCoordinate => Some(CalibrationStage::Hmd),
            PairingState::Prepared => Some(CalibrationStage::BothIndexFinger),
            _ => None,
        }
    }

    /// Whether a partner has been chosen in this state.
    pub fn has_partner(self) -> bool {
        matches!(
            self,
            PairingState::HmdCoordinate
                | PairingState::BothIndexFingerCoordinate
                | PairingState::Prepared
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PairingState::Prepared)
    }
}

/// Progress within the current calibration stage.
///
/// Host: `Idle → AwaitingResponse → AwaitingConfirmation → AwaitingAck`.
/// Client: `Idle → AwaitingConfirmation` once it has answered a request.
/// A `reset` (or the host's "no") returns to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StageStatus {
    #[default]
    Idle,
    /// Host sent the request and waits for the sample.
    AwaitingResponse,
    /// A sample is on the table and the host's verdict is pending.
    AwaitingConfirmation,
    /// Host sent `success` and waits for `receivedSuccess`.
    AwaitingAck,
}

/// Intents forwarded by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserIntent {
    /// Leave `Initial`.
    Start,
    /// Broadcast presence, elect the host and move to `Selecting`.
    Search,
    /// Back out of `Searching` (to `Initial`) or out of a client's `Selecting`
    /// (to `Searching`).
    ReturnToStart,
    /// Host only: pick the pairing partner.
    SelectPeer(PeerId),
    /// Host only: request the current stage's sample.
    BeginStage,
    /// Host only: the sample matched what the user observed.
    ConfirmSuccess,
    /// Host only: the sample did not match; start the stage over.
    ConfirmFailure,
}

impl UserIntent {
    pub fn name(self) -> &'static str {
        match self {
            UserIntent::Start => "start",
            UserIntent::Search => "search",
            UserIntent::ReturnToStart => "return to start",
            UserIntent::SelectPeer(_) => "select peer",
            UserIntent::BeginStage => "begin stage",
            UserIntent::ConfirmSuccess => "confirm success",
            UserIntent::ConfirmFailure => "confirm failure",
        }
    }
}

/// Everything the state machine reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    User(UserIntent),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// Raw text received from a peer, in arrival order.
    MessageReceived { from: PeerId, text: String },
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingAction {
    /// Send to every connected peer.
    Broadcast(PairingMessage),
    /// Send to a single peer.
    Send { to: PeerId, message: PairingMessage },
}

/// Result of handling one event.
#[derive(Debug, PartialEq)]
pub struct Transition {
    /// State after the event.
    pub state: PairingState,
    /// Messages to send, in order.
    pub actions: Vec<PairingAction>,
    /// A failure reported alongside actions that still go out.  Only a failed
    /// host election does this: `Hello` is broadcast before the election runs.
    pub error: Option<PairingError>,
}

/// Recoverable failures.  The machine's state is unchanged whenever `handle`
/// returns one of these.
#[derive(Debug, Error, PartialEq)]
pub enum PairingError {
    /// The message could not be decoded; it was discarded.
    #[error("discarded inbound message: {0}")]
    Protocol(#[from] ProtocolError),

    /// Host election failed during `Search`.
    #[error("could not determine the host: {0}")]
    HostElection(#[from] ElectionError),

    /// A `select:` message named a peer that is not connected.
    #[error("select references unknown peer {0}")]
    UnresolvedPeer(PeerId),

    /// The user picked a peer that is not connected.
    #[error("peer {0} is not connected")]
    PeerNotConnected(PeerId),

    /// The user picked a peer that has not announced `searched` yet.
    #[error("peer {0} has not finished searching yet")]
    PeerNotReady(PeerId),

    /// A different partner was already selected.
    #[error("peer {0} is already selected")]
    AlreadySelected(PeerId),

    /// No partner is recorded although the state requires one.
    #[error("no pairing partner selected")]
    NoPartner,

    /// The intent does not apply to the current state or role.
    #[error("cannot {intent} while {state:?} as {role:?}")]
    IntentNotAllowed {
        intent: &'static str,
        state: PairingState,
        role: HostRole,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_state_default_is_initial() {
        assert_eq!(PairingState::default(), PairingState::Initial);
    }

    #[test]
    fn test_stage_states_map_to_calibration_stages() {
        assert_eq!(PairingState::HmdCoordinate.stage(), Some(CalibrationStage::Hmd));
        assert_eq!(
            PairingState::BothIndexFingerCoordinate.stage(),
            Some(CalibrationStage::BothIndexFinger)
        );
        assert_eq!(PairingState::Selecting.stage(), None);
        assert_eq!(PairingState::Prepared.stage(), None);
    }

    #[test]
    fn test_completed_stage_lags_one_behind() {
        assert_eq!(PairingState::HmdCoordinate.completed_stage(), None);
        assert_eq!(
            PairingState::BothIndexFingerCoordinate.completed_stage(),
            Some(CalibrationStage::Hmd)
        );
        assert_eq!(
            PairingState::Prepared.completed_stage(),
            Some(CalibrationStage::BothIndexFinger)
        );
    }

    #[test]
    fn test_only_stage_and_terminal_states_have_a_partner() {
        assert!(!PairingState::Selecting.has_partner());
        assert!(PairingState::HmdCoordinate.has_partner());
        assert!(PairingState::Prepared.has_partner());
        assert!(PairingState::Prepared.is_terminal());
    }
}
