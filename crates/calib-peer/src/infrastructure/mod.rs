//! Infrastructure layer of the calib-peer node.
//!
//! Contains the OS-facing adapters: the peer-to-peer transports, the session
//! that tracks connected peers, file-based configuration, the console front
//! end and local identity generation.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `calib_core`, but MUST NOT be imported by the `application` layer.

pub mod config;
pub mod console;
pub mod identity;
pub mod session;
pub mod transport;
