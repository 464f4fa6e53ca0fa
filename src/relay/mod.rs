//! # Relay Module
//!
//! Everything between a browser client and the remote recognition service.
//!
//! ## Module Structure:
//! - **protocol**: client and upstream message types
//! - **signer**: request signing for the upstream handshake
//! - **transport**: one upstream WebSocket connection
//! - **session**: per-client relay session (connect, send, drain, translate, close)
//! - **registry**: live clients by id
//! - **error**: upstream error type

pub mod error;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod signer;
pub mod transport;

#[cfg(test)]
pub mod testing;
