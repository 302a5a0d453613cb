//! Line-oriented console front end.
//!
//! Parses the commands typed on stdin into [`ConsoleCommand`]s and renders
//! [`PairingSnapshot`]s as short human-readable screens: one line of status
//! plus a hint naming the command that moves the handshake forward.
//!
//! | Command        | Intent                         |
//! |----------------|--------------------------------|
//! | `start`        | `Start`                        |
//! | `search`       | `Search`                       |
//! | `back`         | `ReturnToStart`                |
//! | `select <id>`  | `SelectPeer(id)` (host)        |
//! | `begin`        | `BeginStage` (host)            |
//! | `yes` / `no`   | `ConfirmSuccess` / `ConfirmFailure` (host) |
//! | `status`, `help`, `quit` | local only           |

use std::fmt::Write as _;

use calib_core::{
    CalibrationSample, CalibrationStage, HostRole, PairingState, PeerId, StageStatus, UserIntent,
};
use thiserror::Error;

use crate::application::pairing::PairingSnapshot;

pub const HELP_TEXT: &str = "\
commands:
  start           leave the start screen
  search          look for peers and elect the host
  back            return to the previous screen
  select <id>     (host) pick the peer to calibrate with
  begin           (host) request the current calibration sample
  yes | no        (host) accept or reject the sample
  status          print the current state
  help            print this text
  quit            exit";

/// A parsed console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Intent(UserIntent),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("empty command")]
    Empty,

    #[error("unknown command {0:?}; type `help` for a list")]
    Unknown(String),

    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),

    #[error("{0:?} is not a peer id")]
    InvalidPeer(String),
}

/// Parses one line of user input.  Case-insensitive; surrounding whitespace
/// is ignored.
///
/// # Errors
///
/// A [`ConsoleError`] describing what is wrong with the line.
pub fn parse_command(line: &str) -> Result<ConsoleCommand, ConsoleError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err(ConsoleError::Empty);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "start" => ConsoleCommand::Intent(UserIntent::Start),
        "search" => ConsoleCommand::Intent(UserIntent::Search),
        "back" => ConsoleCommand::Intent(UserIntent::ReturnToStart),
        "begin" => ConsoleCommand::Intent(UserIntent::BeginStage),
        "yes" | "y" => ConsoleCommand::Intent(UserIntent::ConfirmSuccess),
        "no" | "n" => ConsoleCommand::Intent(UserIntent::ConfirmFailure),
        "select" => {
            let arg = words.next().ok_or(ConsoleError::MissingArgument("select"))?;
            let id = arg
                .parse::<i64>()
                .map_err(|_| ConsoleError::InvalidPeer(arg.to_string()))?;
            ConsoleCommand::Intent(UserIntent::SelectPeer(PeerId(id)))
        }
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => return Err(ConsoleError::Unknown(verb.to_string())),
    };
    Ok(command)
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn stage_label(stage: CalibrationStage) -> &'static str {
    match stage {
        CalibrationStage::Hmd => "headset position",
        CalibrationStage::BothIndexFinger => "index finger positions",
    }
}

fn describe_sample(sample: &CalibrationSample) -> String {
    match sample {
        CalibrationSample::Hmd(c) => format!("HMD {:?} at {}", c.position, c.unix_time),
        CalibrationSample::BothIndexFinger(c) => format!(
            "left {:?} right {:?} at {}",
            c.index_finger_position.left, c.index_finger_position.right, c.unix_time
        ),
    }
}

fn hint(s: &PairingSnapshot) -> String {
    match (s.state, s.role) {
        (PairingState::Initial, _) => "type `start` to begin".to_string(),
        (PairingState::Searching, _) => format!(
            "{} peer(s) connected; type `search` when everyone is nearby",
            s.connected_peers.len()
        ),
        (PairingState::Selecting, HostRole::Host) if s.selectable_peers.is_empty() => {
            "host: waiting for peers to finish searching".to_string()
        }
        (PairingState::Selecting, HostRole::Host) => {
            let ids: Vec<String> = s.selectable_peers.iter().map(|p| p.to_string()).collect();
            format!("host: `select <id>` one of [{}]", ids.join(", "))
        }
        (PairingState::Selecting, _) => {
            "client: waiting for the host to select this device (`back` to search again)"
                .to_string()
        }
        (PairingState::HmdCoordinate | PairingState::BothIndexFingerCoordinate, role) => {
            let label = s.state.stage().map(stage_label).unwrap_or_default();
            if role.is_host() {
                match s.stage_status {
                    StageStatus::Idle => format!("type `begin` to request the {label}"),
                    StageStatus::AwaitingResponse => {
                        format!("waiting for the {label} (`begin` to ask again)")
                    }
                    StageStatus::AwaitingConfirmation => {
                        format!("does the {label} match? `yes` or `no`")
                    }
                    StageStatus::AwaitingAck => {
                        "waiting for acknowledgement (`yes` to resend)".to_string()
                    }
                }
            } else {
                format!("client: the host is checking the {label}")
            }
        }
        (PairingState::Prepared, _) => "calibration complete".to_string(),
    }
}

/// Renders a snapshot as a few lines of text.
pub fn render_snapshot(s: &PairingSnapshot) -> String {
    let mut out = format!("[{} {:?} {:?}]", s.local_id, s.state, s.role);
    if let Some(peer) = s.selected {
        let _ = write!(out, " partner {peer}");
    }
    let _ = write!(out, "\n  {}", hint(s));

    if s.role.is_host() && s.stage_status == StageStatus::AwaitingConfirmation {
        let current = s
            .state
            .stage()
            .and_then(|stage| s.samples.iter().find(|x| x.stage() == stage));
        if let Some(sample) = current {
            let _ = write!(out, "\n  received: {}", describe_sample(sample));
        }
    }

    if let Some(error) = &s.last_error {
        let _ = write!(out, "\n  error: {error}");
        if s.state == PairingState::Searching {
            out.push_str(" (type `back` to return to start)");
        }
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use calib_core::CalibrationSample;

    fn snapshot(state: PairingState, role: HostRole) -> PairingSnapshot {
        PairingSnapshot {
            local_id: PeerId(10),
            state,
            role,
            stage_status: StageStatus::Idle,
            selected: None,
            connected_peers: vec![PeerId(3)],
            selectable_peers: Vec::new(),
            last_received: None,
            samples: Vec::new(),
            last_error: None,
        }
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(
            parse_command("start"),
            Ok(ConsoleCommand::Intent(UserIntent::Start))
        );
        assert_eq!(
            parse_command("  SEARCH "),
            Ok(ConsoleCommand::Intent(UserIntent::Search))
        );
        assert_eq!(
            parse_command("back"),
            Ok(ConsoleCommand::Intent(UserIntent::ReturnToStart))
        );
        assert_eq!(
            parse_command("yes"),
            Ok(ConsoleCommand::Intent(UserIntent::ConfirmSuccess))
        );
        assert_eq!(
            parse_command("n"),
            Ok(ConsoleCommand::Intent(UserIntent::ConfirmFailure))
        );
        assert_eq!(parse_command("quit"), Ok(ConsoleCommand::Quit));
        assert_eq!(parse_command("status"), Ok(ConsoleCommand::Status));
    }

    #[test]
    fn test_parse_select_with_peer_id() {
        assert_eq!(
            parse_command("select 42"),
            Ok(ConsoleCommand::Intent(UserIntent::SelectPeer(PeerId(42))))
        );
    }

    #[test]
    fn test_parse_select_errors() {
        assert_eq!(
            parse_command("select"),
            Err(ConsoleError::MissingArgument("select"))
        );
        assert_eq!(
            parse_command("select bob"),
            Err(ConsoleError::InvalidPeer("bob".to_string()))
        );
    }

    #[test]
    fn test_parse_empty_and_unknown() {
        assert_eq!(parse_command("   "), Err(ConsoleError::Empty));
        assert_eq!(
            parse_command("dance"),
            Err(ConsoleError::Unknown("dance".to_string()))
        );
    }

    #[test]
    fn test_render_host_selecting_lists_selectable_peers() {
        let mut s = snapshot(PairingState::Selecting, HostRole::Host);
        s.selectable_peers = vec![PeerId(3), PeerId(7)];

        let text = render_snapshot(&s);

        assert!(text.contains("[3, 7]"), "{text}");
    }

    #[test]
    fn test_render_searching_error_offers_return_to_start() {
        let mut s = snapshot(PairingState::Searching, HostRole::Unknown);
        s.last_error = Some("could not determine the host".to_string());

        let text = render_snapshot(&s);

        assert!(text.contains("error: could not determine the host"));
        assert!(text.contains("`back`"));
    }

    #[test]
    fn test_render_host_awaiting_confirmation_shows_sample() {
        let mut s = snapshot(PairingState::HmdCoordinate, HostRole::Host);
        s.selected = Some(PeerId(3));
        s.stage_status = StageStatus::AwaitingConfirmation;
        s.samples = vec![CalibrationSample::stub(CalibrationStage::Hmd, 1_700_000_000)];

        let text = render_snapshot(&s);

        assert!(text.contains("partner 3"));
        assert!(text.contains("`yes` or `no`"));
        assert!(text.contains("received: HMD"));
    }

    #[test]
    fn test_render_prepared() {
        let text = render_snapshot(&snapshot(PairingState::Prepared, HostRole::Client));
        assert!(text.contains("calibration complete"));
    }
}
