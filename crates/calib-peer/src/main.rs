//! calib-peer entry point.
//!
//! Wires the UDP transport, the peer session and the pairing service together
//! and drives them from stdin.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ Cli::resolve_config()    -- calib-peer.toml or the given path, plus flags
//!  └─ UdpTransport::bind()     -- discovery + datagram thread
//!  └─ PeerSession::start()     -- invitations, connected peers (Tokio task)
//!  └─ PairingService::run()    -- owns the state machine (Tokio task)
//!  └─ snapshot printer         -- renders every state change (Tokio task)
//!  └─ stdin loop               -- console commands → user intents
//! ```
//!
//! Usage: `calib-peer [OPTIONS] [CONFIG]`; see `calib-peer --help`.  Log level
//! is overridden by `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use calib_core::PairingStateMachine;
use calib_peer::application::pairing::PairingService;
use calib_peer::infrastructure::config::{
    load_config, load_or_default, save_config, PeerConfig, CONFIG_FILE_NAME,
};
use calib_peer::infrastructure::console::{
    parse_command, render_snapshot, ConsoleCommand, ConsoleError, HELP_TEXT,
};
use calib_peer::infrastructure::identity::generate_peer_id;
use calib_peer::infrastructure::session::{AcceptAll, PeerSession};
use calib_peer::infrastructure::transport::{UdpTransport, UdpTransportConfig};

const INTENT_CHANNEL_CAPACITY: usize = 32;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Calibration handshake peer.
///
/// Finds other peers on the LAN, elects a host and walks the HMD and
/// index-finger calibration stages from the console.
#[derive(Debug, Parser)]
#[command(name = "calib-peer", version)]
struct Cli {
    /// Config file to load instead of `calib-peer.toml` in the working
    /// directory.
    config: Option<PathBuf>,

    /// UDP port for discovery and peer traffic.
    #[arg(long, env = "CALIB_PORT")]
    port: Option<u16>,

    /// Name advertised to other peers.
    #[arg(long, env = "CALIB_NAME")]
    name: Option<String>,

    /// Discovery namespace; only peers with the same value see each other.
    #[arg(long, env = "CALIB_SERVICE")]
    service: Option<String>,

    /// `tracing` level used when `RUST_LOG` is not set.
    #[arg(long, env = "CALIB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write the effective configuration to this file and exit.
    #[arg(long, value_name = "PATH")]
    write_config: Option<PathBuf>,
}

impl Cli {
    /// Loads the config file and applies the command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or the result does not
    /// validate.
    fn resolve_config(&self) -> anyhow::Result<PeerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => load_or_default().with_context(|| format!("loading {CONFIG_FILE_NAME}"))?,
        };
        self.apply_overrides(&mut config);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut PeerConfig) {
        if let Some(port) = self.port {
            config.discovery_port = port;
        }
        if let Some(name) = &self.name {
            config.display_name = name.clone();
        }
        if let Some(service) = &self.service {
            config.service_type = service.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.resolve_config()?;

    if let Some(path) = &cli.write_config {
        save_config(&config, path)
            .with_context(|| format!("writing config {}", path.display()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    // Logs go to stderr so they do not interleave with the console screens.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let local = generate_peer_id();
    info!(
        %local,
        name = %config.display_name,
        service = %config.service_type,
        "calib-peer starting"
    );

    // ── Transport and session ─────────────────────────────────────────────────
    let (transport, transport_rx) = UdpTransport::bind(
        UdpTransportConfig::from_config(&config),
        local,
        config.display_name.clone(),
    )
    .context("binding UDP transport")?;

    let (session, session_rx) =
        PeerSession::new(Arc::new(transport), transport_rx, Arc::new(AcceptAll));
    session.start().await.context("starting peer session")?;

    // ── Pairing service ───────────────────────────────────────────────────────
    let (service, snapshots) =
        PairingService::new(PairingStateMachine::new(local), session.clone());
    let status_rx = snapshots.clone();
    let (intent_tx, intent_rx) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
    let service_task = tokio::spawn(service.run(session_rx, intent_rx));

    // ── Snapshot printer ──────────────────────────────────────────────────────
    let mut printer_rx = snapshots;
    tokio::spawn(async move {
        let mut last = String::new();
        while printer_rx.changed().await.is_ok() {
            let text = render_snapshot(&printer_rx.borrow_and_update());
            if text != last {
                println!("{text}");
                last = text;
            }
        }
    });

    println!("{}", render_snapshot(&status_rx.borrow()));
    println!("type `help` for commands");

    // ── Console loop ──────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => line,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        };

        match parse_command(&line) {
            Ok(ConsoleCommand::Intent(intent)) => {
                if intent_tx.send(intent).await.is_err() {
                    warn!("pairing service is gone");
                    break;
                }
            }
            Ok(ConsoleCommand::Status) => println!("{}", render_snapshot(&status_rx.borrow())),
            Ok(ConsoleCommand::Help) => println!("{HELP_TEXT}"),
            Ok(ConsoleCommand::Quit) => break,
            Err(ConsoleError::Empty) => {}
            Err(e) => println!("{e}"),
        }
    }

    if let Err(e) = session.stop().await {
        warn!("failed to leave the session cleanly: {e}");
    }
    service_task.abort();
    info!("calib-peer stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_without_arguments_has_no_overrides() {
        let cli = Cli::parse_from(["calib-peer"]);

        assert!(cli.config.is_none());
        assert!(cli.write_config.is_none());
        let mut config = PeerConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config, PeerConfig::default());
    }

    #[test]
    fn test_cli_positional_argument_is_config_path() {
        let cli = Cli::parse_from(["calib-peer", "lab.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("lab.toml")));
    }

    #[test]
    fn test_cli_help_is_not_taken_as_config_path() {
        let err = Cli::try_parse_from(["calib-peer", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_cli_overrides_replace_config_values() {
        // Arrange
        let cli = Cli::parse_from([
            "calib-peer",
            "--port",
            "25000",
            "--name",
            "bench-2",
            "--service",
            "calib-lab",
            "--log-level",
            "debug",
        ]);
        let mut config = PeerConfig::default();

        // Act
        cli.apply_overrides(&mut config);

        // Assert
        assert_eq!(config.discovery_port, 25000);
        assert_eq!(config.display_name, "bench-2");
        assert_eq!(config.service_type, "calib-lab");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.peer_timeout_ms, PeerConfig::default().peer_timeout_ms);
    }

    #[test]
    fn test_resolve_config_rejects_invalid_service_override() {
        let cli = Cli::parse_from(["calib-peer", "--service", "Not_Valid"]);
        assert!(cli.resolve_config().is_err());
    }

    #[test]
    fn test_resolve_config_reports_missing_config_file() {
        let cli = Cli::parse_from(["calib-peer", "/nonexistent/calib-peer-test.toml"]);
        let err = cli.resolve_config().unwrap_err();
        assert!(format!("{err:#}").contains("calib-peer-test.toml"));
    }
}
