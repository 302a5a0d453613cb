//! All calibration handshake message types.
//!
//! Messages travel as UTF-8 text.  There are two shapes:
//!
//! - **Control tokens**: a fixed string with no payload, e.g. `receivedSelect`.
//! - **Prefixed tokens**: a fixed prefix followed by a payload, e.g.
//!   `select:42` or `resHMDPosition{"unixTime":1734511201,"HMDPosition":[...]}`.
//!
//! The JSON field names (`unixTime`, `HMDPosition`, `indexFingerPosition`) are
//! part of the wire format and must not be renamed.

use serde::{Deserialize, Serialize};

use crate::domain::peer::PeerId;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Service identifier that peers must share to discover each other.
pub const SERVICE_TYPE: &str = "example-chat";

/// Number of floats in an HMD position sample.
pub const HMD_POSITION_LEN: usize = 6;

/// Number of floats per hand in an index-finger position sample.
pub const INDEX_FINGER_POSITION_LEN: usize = 4;

/// Wire tokens.
pub mod tokens {
    pub const HELLO: &str = "Hello";
    pub const SEARCHED: &str = "searched";
    pub const RECEIVED_SELECT: &str = "receivedSelect";
    pub const RESET: &str = "reset";

    pub const REQ_HMD_POSITION: &str = "reqHMDPosition";
    pub const SUCCESS_HMD_POSITION: &str = "successHMDPosition";
    pub const RECEIVED_SUCCESS_HMD_POSITION: &str = "receivedSuccessHMDPosition";

    pub const REQ_BOTH_INDEX_FINGER: &str = "reqBothIndexFingerCoordinate";
    pub const SUCCESS_BOTH_INDEX_FINGER: &str = "successBothIndexFingerCoordinate";
    pub const RECEIVED_SUCCESS_BOTH_INDEX_FINGER: &str =
        "receivedSuccessBothIndexFingerCoordinate";

    pub const SELECT_PREFIX: &str = "select:";
    pub const RES_HMD_POSITION_PREFIX: &str = "resHMDPosition";
    pub const RES_BOTH_INDEX_FINGER_PREFIX: &str = "resBothIndexFingerCoordinate";
}

// ── Calibration stages ────────────────────────────────────────────────────────

/// The two request/response exchanges of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalibrationStage {
    /// Host touches the client's headset; client reports its HMD position.
    Hmd,
    /// Both users touch index fingers; client reports both finger positions.
    BothIndexFinger,
}

impl CalibrationStage {
    pub fn request_token(self) -> &'static str {
        match self {
            CalibrationStage::Hmd => tokens::REQ_HMD_POSITION,
            CalibrationStage::BothIndexFinger => tokens::REQ_BOTH_INDEX_FINGER,
        }
    }

    pub fn response_prefix(self) -> &'static str {
        match self {
            CalibrationStage::Hmd => tokens::RES_HMD_POSITION_PREFIX,
            CalibrationStage::BothIndexFinger => tokens::RES_BOTH_INDEX_FINGER_PREFIX,
        }
    }

    pub fn success_token(self) -> &'static str {
        match self {
            CalibrationStage::Hmd => tokens::SUCCESS_HMD_POSITION,
            CalibrationStage::BothIndexFinger => tokens::SUCCESS_BOTH_INDEX_FINGER,
        }
    }

    pub fn received_success_token(self) -> &'static str {
        match self {
            CalibrationStage::Hmd => tokens::RECEIVED_SUCCESS_HMD_POSITION,
            CalibrationStage::BothIndexFinger => tokens::RECEIVED_SUCCESS_BOTH_INDEX_FINGER,
        }
    }

    /// The stage before this one, if any.
    pub fn previous(self) -> Option<CalibrationStage> {
        match self {
            CalibrationStage::Hmd => None,
            CalibrationStage::BothIndexFinger => Some(CalibrationStage::Hmd),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Headset position sample, sent by the client in `resHMDPosition`.
///
/// ```json
/// {"unixTime":1734511201,"HMDPosition":[0.0,0.0,0.0,0.0,0.0,0.0]}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmdCoordinate {
    /// Seconds since the Unix epoch when the sample was taken.
    #[serde(rename = "unixTime")]
    pub unix_time: i64,
    /// Position and orientation of the headset.
    #[serde(rename = "HMDPosition")]
    pub position: Vec<f32>,
}

impl HmdCoordinate {
    /// Builds the placeholder sample sent while no tracking source is wired in.
    pub fn stub(unix_time: i64) -> Self {
        Self {
            unix_time,
            position: vec![0.0; HMD_POSITION_LEN],
        }
    }
}

/// Left and right index-finger positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexFingerPosition {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

/// Both-index-finger sample, sent by the client in
/// `resBothIndexFingerCoordinate`.
///
/// ```json
/// {"unixTime":1734511201,"indexFingerPosition":{"left":[0.0,0.0,0.0,0.0],"right":[0.0,0.0,0.0,0.0]}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BothIndexFingerCoordinate {
    #[serde(rename = "unixTime")]
    pub unix_time: i64,
    #[serde(rename = "indexFingerPosition")]
    pub index_finger_position: IndexFingerPosition,
}

impl BothIndexFingerCoordinate {
    /// Builds the placeholder sample sent while no tracking source is wired in.
    pub fn stub(unix_time: i64) -> Self {
        Self {
            unix_time,
            index_finger_position: IndexFingerPosition {
                left: vec![0.0; INDEX_FINGER_POSITION_LEN],
                right: vec![0.0; INDEX_FINGER_POSITION_LEN],
            },
        }
    }
}

/// A decoded calibration response of either stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationSample {
    Hmd(HmdCoordinate),
    BothIndexFinger(BothIndexFingerCoordinate),
}

impl CalibrationSample {
    /// Builds the placeholder sample for `stage`.
    pub fn stub(stage: CalibrationStage, unix_time: i64) -> Self {
        match stage {
            CalibrationStage::Hmd => CalibrationSample::Hmd(HmdCoordinate::stub(unix_time)),
            CalibrationStage::BothIndexFinger => {
                CalibrationSample::BothIndexFinger(BothIndexFingerCoordinate::stub(unix_time))
            }
        }
    }

    pub fn stage(&self) -> CalibrationStage {
        match self {
            CalibrationSample::Hmd(_) => CalibrationStage::Hmd,
            CalibrationSample::BothIndexFinger(_) => CalibrationStage::BothIndexFinger,
        }
    }

    pub fn unix_time(&self) -> i64 {
        match self {
            CalibrationSample::Hmd(c) => c.unix_time,
            CalibrationSample::BothIndexFinger(c) => c.unix_time,
        }
    }
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Every message of the handshake, discriminated by token.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingMessage {
    /// `Hello`: first broadcast when the user starts searching.
    Hello,
    /// `searched`: the sender finished host election and is selecting.
    Searched,
    /// `select:<id>`: the host picked the receiver; carries the host's id.
    Select(PeerId),
    /// `receivedSelect`: the client accepted the selection.
    ReceivedSelect,
    /// `reqHMDPosition` / `reqBothIndexFingerCoordinate`.
    Request(CalibrationStage),
    /// `resHMDPosition<json>` / `resBothIndexFingerCoordinate<json>`.
    Response(CalibrationSample),
    /// `successHMDPosition` / `successBothIndexFingerCoordinate`.
    Success(CalibrationStage),
    /// `receivedSuccessHMDPosition` / `receivedSuccessBothIndexFingerCoordinate`.
    ReceivedSuccess(CalibrationStage),
    /// `reset`: the host rejected the last sample; the stage starts over.
    Reset,
}

impl PairingMessage {
    /// Short name for logging; never includes the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            PairingMessage::Hello => tokens::HELLO,
            PairingMessage::Searched => tokens::SEARCHED,
            PairingMessage::Select(_) => tokens::SELECT_PREFIX,
            PairingMessage::ReceivedSelect => tokens::RECEIVED_SELECT,
            PairingMessage::Request(stage) => stage.request_token(),
            PairingMessage::Response(sample) => sample.stage().response_prefix(),
            PairingMessage::Success(stage) => stage.success_token(),
            PairingMessage::ReceivedSuccess(stage) => stage.received_success_token(),
            PairingMessage::Reset => tokens::RESET,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmd_stub_has_six_zero_floats() {
        let c = HmdCoordinate::stub(1_700_000_000);
        assert_eq!(c.position, vec![0.0; 6]);
        assert_eq!(c.unix_time, 1_700_000_000);
    }

    #[test]
    fn test_both_index_finger_stub_has_four_zero_floats_per_hand() {
        let c = BothIndexFingerCoordinate::stub(5);
        assert_eq!(c.index_finger_position.left, vec![0.0; 4]);
        assert_eq!(c.index_finger_position.right, vec![0.0; 4]);
    }

    #[test]
    fn test_hmd_json_uses_wire_field_names() {
        let json = serde_json::to_value(HmdCoordinate::stub(12)).unwrap();
        assert_eq!(json["unixTime"], 12);
        assert_eq!(json["HMDPosition"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_both_index_finger_json_uses_wire_field_names() {
        let json = serde_json::to_value(BothIndexFingerCoordinate::stub(3)).unwrap();
        assert_eq!(json["unixTime"], 3);
        assert_eq!(json["indexFingerPosition"]["left"].as_array().unwrap().len(), 4);
        assert_eq!(json["indexFingerPosition"]["right"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_stage_tokens_are_distinct() {
        let hmd = CalibrationStage::Hmd;
        let fingers = CalibrationStage::BothIndexFinger;
        assert_ne!(hmd.request_token(), fingers.request_token());
        assert_ne!(hmd.success_token(), fingers.success_token());
        assert_ne!(hmd.received_success_token(), fingers.received_success_token());
        assert_eq!(fingers.previous(), Some(hmd));
        assert_eq!(hmd.previous(), None);
    }

    #[test]
    fn test_calibration_sample_stage_matches_variant() {
        let sample = CalibrationSample::stub(CalibrationStage::BothIndexFinger, 9);
        assert_eq!(sample.stage(), CalibrationStage::BothIndexFinger);
        assert_eq!(sample.unix_time(), 9);
    }
}
