//! qtun-core: Shared library for the qtun tunneling protocol.
//!
//! This crate provides:
//! - Control-plane message definitions and the newline-delimited JSON codec
//! - The port forward model (directions, transports, wire shape)
//! - SOCKS5 negotiation for dynamic forwards
//! - The catalog adapter trait consumed by the server
//! - Traffic counters and the bidirectional pair-pipe
//! - Logging setup and constants

pub mod catalog;
pub mod constants;
pub mod error;
pub mod forward;
pub mod logging;
pub mod meter;
pub mod net;
pub mod pipe;
pub mod protocol;
pub mod socks;

pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use meter::TrafficCounters;
