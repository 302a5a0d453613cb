//! Application layer of the calib-peer node.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (here: the `calib-core` state machine) and the infrastructure (sockets,
//! files, the terminal).  Code in this layer:
//!
//! - **Orchestrates** the domain to fulfil a goal: run the pairing handshake.
//! - **Depends on abstractions** ([`pairing::MessageSender`]) rather than on a
//!   concrete transport, so tests can substitute a recording double.
//! - **Contains no OS calls, no network I/O, no file system access**.
//!
//! # Sub-modules
//!
//! - **`pairing`** – the `PairingService` actor that owns the state machine,
//!   sends what its transitions ask for and publishes snapshots.

pub mod pairing;
