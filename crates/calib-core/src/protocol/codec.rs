//! Text codec for encoding and decoding handshake messages.
//!
//! Wire format:
//! ```text
//! <control token>                e.g. receivedSelect
//! select:<decimal id>            e.g. select:-4213
//! <response prefix><json>        e.g. resHMDPosition{"unixTime":1,"HMDPosition":[...]}
//! ```
//!
//! Decoding dispatches on an exact control-token match first, then on the
//! longest matching prefix.  Anything else is [`ProtocolError::UnknownToken`].

use crate::domain::peer::PeerId;
use crate::protocol::messages::{
    tokens, BothIndexFingerCoordinate, CalibrationSample, CalibrationStage, HmdCoordinate,
    PairingMessage,
};
use thiserror::Error;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The text matches neither a control token nor a known prefix.
    #[error("unknown message: {0:?}")]
    UnknownToken(String),

    /// A response payload is not valid JSON for its schema.
    #[error("malformed {token} payload: {reason}")]
    MalformedPayload { token: &'static str, reason: String },

    /// The `select:` payload is not a decimal integer.
    #[error("invalid peer reference in select message: {0:?}")]
    InvalidPeerReference(String),

    /// A payload could not be serialized.
    #[error("failed to encode {token} payload: {reason}")]
    Encode { token: &'static str, reason: String },
}

/// Prefixed tokens, longest first so the first match is the longest one.
const PREFIXES: [&str; 3] = [
    tokens::RES_BOTH_INDEX_FINGER_PREFIX,
    tokens::RES_HMD_POSITION_PREFIX,
    tokens::SELECT_PREFIX,
];

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`PairingMessage`] into its wire text.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if a payload cannot be serialized.
///
/// # Examples
///
/// ```rust
/// use calib_core::protocol::{decode_message, encode_message};
/// use calib_core::protocol::messages::PairingMessage;
/// use calib_core::PeerId;
///
/// let text = encode_message(&PairingMessage::Select(PeerId(42))).unwrap();
/// assert_eq!(text, "select:42");
/// assert_eq!(decode_message(&text).unwrap(), PairingMessage::Select(PeerId(42)));
/// ```
pub fn encode_message(msg: &PairingMessage) -> Result<String, ProtocolError> {
    let text = match msg {
        PairingMessage::Hello => tokens::HELLO.to_string(),
        PairingMessage::Searched => tokens::SEARCHED.to_string(),
        PairingMessage::Select(peer) => format!("{}{}", tokens::SELECT_PREFIX, peer.value()),
        PairingMessage::ReceivedSelect => tokens::RECEIVED_SELECT.to_string(),
        PairingMessage::Request(stage) => stage.request_token().to_string(),
        PairingMessage::Response(sample) => encode_response(sample)?,
        PairingMessage::Success(stage) => stage.success_token().to_string(),
        PairingMessage::ReceivedSuccess(stage) => stage.received_success_token().to_string(),
        PairingMessage::Reset => tokens::RESET.to_string(),
    };
    Ok(text)
}

/// Decodes one [`PairingMessage`] from wire text.
///
/// # Errors
///
/// - [`ProtocolError::UnknownToken`] when nothing matches.
/// - [`ProtocolError::InvalidPeerReference`] for a non-numeric `select:` id.
/// - [`ProtocolError::MalformedPayload`] for a response with invalid JSON.
///
/// # Examples
///
/// ```rust
/// use calib_core::protocol::{decode_message, ProtocolError};
///
/// assert!(matches!(
///     decode_message("resHMDPosition{not json}"),
///     Err(ProtocolError::MalformedPayload { .. })
/// ));
/// ```
pub fn decode_message(text: &str) -> Result<PairingMessage, ProtocolError> {
    if let Some(msg) = decode_control_token(text) {
        return Ok(msg);
    }

    let prefix = PREFIXES
        .iter()
        .copied()
        .find(|p| text.starts_with(p))
        .ok_or_else(|| ProtocolError::UnknownToken(text.to_string()))?;
    let payload = &text[prefix.len()..];

    match prefix {
        tokens::SELECT_PREFIX => payload
            .parse::<PeerId>()
            .map(PairingMessage::Select)
            .map_err(|_| ProtocolError::InvalidPeerReference(payload.to_string())),
        tokens::RES_HMD_POSITION_PREFIX => {
            decode_payload::<HmdCoordinate>(tokens::RES_HMD_POSITION_PREFIX, payload)
                .map(|c| PairingMessage::Response(CalibrationSample::Hmd(c)))
        }
        _ => decode_payload::<BothIndexFingerCoordinate>(tokens::RES_BOTH_INDEX_FINGER_PREFIX, payload)
            .map(|c| PairingMessage::Response(CalibrationSample::BothIndexFinger(c))),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn decode_control_token(text: &str) -> Option<PairingMessage> {
    use CalibrationStage::{BothIndexFinger, Hmd};

    let msg = match text {
        tokens::HELLO => PairingMessage::Hello,
        tokens::SEARCHED => PairingMessage::Searched,
        tokens::RECEIVED_SELECT => PairingMessage::ReceivedSelect,
        tokens::RESET => PairingMessage::Reset,
        tokens::REQ_HMD_POSITION => PairingMessage::Request(Hmd),
        tokens::SUCCESS_HMD_POSITION => PairingMessage::Success(Hmd),
        tokens::RECEIVED_SUCCESS_HMD_POSITION => PairingMessage::ReceivedSuccess(Hmd),
        tokens::REQ_BOTH_INDEX_FINGER => PairingMessage::Request(BothIndexFinger),
        tokens::SUCCESS_BOTH_INDEX_FINGER => PairingMessage::Success(BothIndexFinger),
        tokens::RECEIVED_SUCCESS_BOTH_INDEX_FINGER => PairingMessage::ReceivedSuccess(BothIndexFinger),
        _ => return None,
    };
    Some(msg)
}

fn encode_response(sample: &CalibrationSample) -> Result<String, ProtocolError> {
    let token = sample.stage().response_prefix();
    let json = match sample {
        CalibrationSample::Hmd(c) => serde_json::to_string(c),
        CalibrationSample::BothIndexFinger(c) => serde_json::to_string(c),
    }
    .map_err(|e| ProtocolError::Encode {
        token,
        reason: e.to_string(),
    })?;
    Ok(format!("{token}{json}"))
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    token: &'static str,
    payload: &str,
) -> Result<T, ProtocolError> {
    serde_json::from_str(payload).map_err(|e| ProtocolError::MalformedPayload {
        token,
        reason: e.to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::IndexFingerPosition;

    #[test]
    fn test_prefixes_are_ordered_longest_first() {
        assert!(PREFIXES.windows(2).all(|w| w[0].len() >= w[1].len()));
    }

    #[test]
    fn test_decode_select_extracts_peer_id() {
        assert_eq!(decode_message("select:42"), Ok(PairingMessage::Select(PeerId(42))));
    }

    #[test]
    fn test_decode_select_accepts_negative_id() {
        assert_eq!(
            decode_message("select:-9001"),
            Ok(PairingMessage::Select(PeerId(-9001)))
        );
    }

    #[test]
    fn test_decode_select_with_garbage_is_invalid_peer_reference() {
        assert_eq!(
            decode_message("select:abc"),
            Err(ProtocolError::InvalidPeerReference("abc".to_string()))
        );
    }

    #[test]
    fn test_decode_hmd_response_reads_json_after_fourteen_char_prefix() {
        // Arrange
        let text = r#"resHMDPosition{"unixTime":1734511201,"HMDPosition":[1.5,0.0,0.0,0.0,0.0,-2.25]}"#;
        assert_eq!(tokens::RES_HMD_POSITION_PREFIX.len(), 14);

        // Act
        let msg = decode_message(text).unwrap();

        // Assert
        assert_eq!(
            msg,
            PairingMessage::Response(CalibrationSample::Hmd(HmdCoordinate {
                unix_time: 1734511201,
                position: vec![1.5, 0.0, 0.0, 0.0, 0.0, -2.25],
            }))
        );
    }

    #[test]
    fn test_decode_both_index_finger_response() {
        let text = r#"resBothIndexFingerCoordinate{"unixTime":7,"indexFingerPosition":{"left":[0.5],"right":[0.25,1.0]}}"#;
        assert_eq!(
            decode_message(text).unwrap(),
            PairingMessage::Response(CalibrationSample::BothIndexFinger(
                BothIndexFingerCoordinate {
                    unix_time: 7,
                    index_finger_position: IndexFingerPosition {
                        left: vec![0.5],
                        right: vec![0.25, 1.0],
                    },
                }
            ))
        );
    }

    #[test]
    fn test_decode_malformed_json_is_recoverable_error() {
        let result = decode_message("resHMDPosition{not json}");
        assert!(matches!(
            result,
            Err(ProtocolError::MalformedPayload {
                token: tokens::RES_HMD_POSITION_PREFIX,
                ..
            })
        ));
    }

    #[test]
    fn test_decode_response_prefix_without_payload_is_malformed() {
        assert!(matches!(
            decode_message("resBothIndexFingerCoordinate"),
            Err(ProtocolError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_decode_control_tokens_match_exactly() {
        assert_eq!(decode_message("Hello"), Ok(PairingMessage::Hello));
        assert_eq!(decode_message("searched"), Ok(PairingMessage::Searched));
        assert_eq!(decode_message("reset"), Ok(PairingMessage::Reset));
        assert_eq!(
            decode_message("reqHMDPosition"),
            Ok(PairingMessage::Request(CalibrationStage::Hmd))
        );
        assert_eq!(
            decode_message("receivedSuccessBothIndexFingerCoordinate"),
            Ok(PairingMessage::ReceivedSuccess(CalibrationStage::BothIndexFinger))
        );
    }

    #[test]
    fn test_decode_token_with_trailing_text_is_unknown() {
        assert_eq!(
            decode_message("searched!"),
            Err(ProtocolError::UnknownToken("searched!".to_string()))
        );
        assert!(matches!(decode_message(""), Err(ProtocolError::UnknownToken(_))));
    }

    #[test]
    fn test_encode_control_tokens_match_wire_strings() {
        assert_eq!(encode_message(&PairingMessage::ReceivedSelect).unwrap(), "receivedSelect");
        assert_eq!(
            encode_message(&PairingMessage::Success(CalibrationStage::Hmd)).unwrap(),
            "successHMDPosition"
        );
        assert_eq!(
            encode_message(&PairingMessage::Request(CalibrationStage::BothIndexFinger)).unwrap(),
            "reqBothIndexFingerCoordinate"
        );
    }

    #[test]
    fn test_hmd_round_trip_preserves_time_and_floats_exactly() {
        let original = PairingMessage::Response(CalibrationSample::Hmd(HmdCoordinate {
            unix_time: 1_734_511_201,
            position: vec![0.1, -3.3333333, 1e-7, 123456.79, 42.0, 0.0],
        }));
        let text = encode_message(&original).unwrap();
        assert!(text.starts_with("resHMDPosition{"));
        assert_eq!(decode_message(&text).unwrap(), original);
    }

    #[test]
    fn test_both_index_finger_round_trip_preserves_values_exactly() {
        let original = PairingMessage::Response(CalibrationSample::BothIndexFinger(
            BothIndexFingerCoordinate {
                unix_time: -1,
                index_finger_position: IndexFingerPosition {
                    left: vec![0.3, 0.7, -0.9, 2.5],
                    right: vec![9.75, 0.0, 1.1, -0.000_1],
                },
            },
        ));
        let text = encode_message(&original).unwrap();
        assert_eq!(decode_message(&text).unwrap(), original);
    }
}
