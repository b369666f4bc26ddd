//! Session adapter backed by an external sidecar process.
//!
//! The sidecar hosts the real messaging session and speaks a small JSON
//! protocol over WebSocket; see [`protocol`].

pub mod adapter;
pub mod error;
pub mod protocol;

pub use adapter::{BridgeAdapter, BridgeConfig};
pub use error::BridgeError;
