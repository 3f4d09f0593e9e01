//! Capture PLC traffic on one link and relay the UDP payloads, byte for byte,
//! to a collector on another.

pub mod api;
pub mod capture;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod limiter;
pub mod pipeline;
pub mod stats;
pub mod supervisor;
