//! Error types for the relay.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Rejected configuration. Fatal at startup, never reaches the pipeline.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid IP address '{value}': {source}")]
    InvalidIp {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("port {0} is not in valid range (1-65535)")]
    InvalidPort(u32),

    #[error(
        "invalid interface name '{0}': must contain only alphanumeric characters, \
         hyphens, dots, and underscores"
    )]
    InvalidInterface(String),

    #[error("interface name '{0}' too long (max 15 characters)")]
    InterfaceTooLong(String),

    #[error("capture filter cannot be empty")]
    EmptyFilter,

    #[error("unbalanced parentheses in capture filter '{0}'")]
    UnbalancedFilter(String),

    #[error("capture filter '{0}' doesn't contain any recognized keywords")]
    UnrecognizedFilter(String),

    #[error("invalid log level '{0}'; must be one of: CRITICAL, DEBUG, ERROR, INFO, WARNING")]
    InvalidLogLevel(String),

    #[error("packet size {0} is not in valid range (64-65535)")]
    InvalidPacketSize(usize),

    #[error("rate limit too high: {0} (max 1000000 pps)")]
    RateLimitTooHigh(u64),

    #[error("socket timeout must be a positive number of seconds, got {0}")]
    InvalidSocketTimeout(f64),

    #[error("stats interval must be positive")]
    InvalidStatsInterval,

    #[error("invalid allowed network '{0}'")]
    InvalidAllowedNetwork(String),
}

/// Failure of the external capture collaborator.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device '{0}' not found")]
    DeviceNotFound(String),

    #[error("capture error: {0}")]
    Pcap(#[from] pcap::Error),
}

/// A datagram that could not be relayed. By the time the caller sees this the
/// forwarding socket has already been recreated.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("failed to send datagram to {destination}: {source}")]
    Send {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no forwarding socket available: {0}")]
    Unavailable(#[source] io::Error),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Forward(#[from] ForwardError),
}
