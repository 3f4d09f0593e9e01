use ipnet::IpNet;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Raw application configuration, loadable from YAML and overridden by CLI
/// flags or environment variables. Turned into [`Settings`] by
/// [`Config::validate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network interface to capture on.
    pub interface: String,

    /// Capture filter expression handed to libpcap.
    pub filter: String,

    /// Address the captured payloads are relayed to.
    pub destination_ip: String,

    /// Port the captured payloads are relayed to.
    pub destination_port: u32,

    /// DEBUG, INFO, WARNING, ERROR or CRITICAL.
    pub log_level: String,

    /// Largest UDP payload that is relayed, in bytes.
    pub max_packet_size: usize,

    /// Packets per second admitted to the relay (0 = unlimited).
    pub rate_limit: u64,

    /// Send timeout for the relay socket, in seconds.
    pub socket_timeout: f64,

    /// Port for the health/metrics listener (0 = disabled).
    pub health_check_port: u16,

    /// CIDRs allowed to reach the health/metrics listener (empty = allow all).
    pub allowed_ips: Vec<String>,

    /// Seconds between periodic statistics summaries.
    pub stats_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            filter: "udp".to_string(),
            destination_ip: "127.0.0.1".to_string(),
            destination_port: 8514,
            log_level: "INFO".to_string(),
            max_packet_size: 65535,
            rate_limit: 0,
            socket_timeout: 5.0,
            health_check_port: 8080,
            allowed_ips: Vec::new(),
            stats_interval: 60,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Merge CLI args into config (CLI and environment take precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(ref interface) = cli.interface {
            self.interface = interface.clone();
        }
        if let Some(ref filter) = cli.filter {
            self.filter = filter.clone();
        }
        if let Some(ref ip) = cli.destination_ip {
            self.destination_ip = ip.clone();
        }
        if let Some(port) = cli.destination_port {
            self.destination_port = port;
        }
        if let Some(ref level) = cli.log_level {
            self.log_level = level.clone();
        }
        if let Some(size) = cli.max_packet_size {
            self.max_packet_size = size;
        }
        if let Some(rate) = cli.rate_limit {
            self.rate_limit = rate;
        }
        if let Some(timeout) = cli.socket_timeout {
            self.socket_timeout = timeout;
        }
        if let Some(port) = cli.health_check_port {
            self.health_check_port = port;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
        if let Some(interval) = cli.stats_interval {
            self.stats_interval = interval;
        }
    }

    /// Check every field and produce the immutable [`Settings`].
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let interface = validate_interface(&self.interface)?;
        let filter = validate_filter(&self.filter)?;
        let ip = validate_ip_address(&self.destination_ip)?;
        let port = validate_port(self.destination_port)?;
        let log_level = self.log_level.parse::<LogLevel>()?;
        let max_packet_size = validate_packet_size(self.max_packet_size)?;
        let rate_limit = validate_rate_limit(self.rate_limit)?;

        let socket_timeout = validate_socket_timeout(self.socket_timeout)?;
        if self.stats_interval == 0 {
            return Err(ConfigError::InvalidStatsInterval);
        }

        let allowed_ips = self
            .allowed_ips
            .iter()
            .map(|s| parse_network(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Settings {
            interface,
            filter,
            destination: SocketAddr::new(ip, port),
            log_level,
            max_packet_size,
            rate_limit,
            socket_timeout,
            health_check_port: (self.health_check_port != 0).then_some(self.health_check_port),
            allowed_ips,
            stats_interval: Duration::from_secs(self.stats_interval),
        })
    }
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub interface: String,
    pub filter: String,
    pub destination: SocketAddr,
    pub log_level: LogLevel,
    pub max_packet_size: usize,
    pub rate_limit: u32,
    pub socket_timeout: Duration,
    pub health_check_port: Option<u16>,
    pub allowed_ips: Vec<IpNet>,
    pub stats_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive for `tracing_subscriber::EnvFilter`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

const FILTER_KEYWORDS: &[&str] = &[
    "udp", "tcp", "icmp", "ip", "host", "port", "net", "src", "dst", "and", "or", "not",
];

/// Linux caps interface names at IFNAMSIZ - 1.
const MAX_INTERFACE_LEN: usize = 15;

pub fn validate_ip_address(value: &str) -> Result<IpAddr, ConfigError> {
    value.parse().map_err(|source| ConfigError::InvalidIp {
        value: value.to_string(),
        source,
    })
}

pub fn validate_port(port: u32) -> Result<u16, ConfigError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ConfigError::InvalidPort(port)),
    }
}

pub fn validate_interface(name: &str) -> Result<String, ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if name.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidInterface(name.to_string()));
    }
    if name.len() > MAX_INTERFACE_LEN {
        return Err(ConfigError::InterfaceTooLong(name.to_string()));
    }
    Ok(name.to_string())
}

/// Cheap sanity check before libpcap compiles the expression for real.
pub fn validate_filter(filter: &str) -> Result<String, ConfigError> {
    if filter.trim().is_empty() {
        return Err(ConfigError::EmptyFilter);
    }

    let mut depth: i64 = 0;
    for c in filter.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err(ConfigError::UnbalancedFilter(filter.to_string()));
        }
    }
    if depth != 0 {
        return Err(ConfigError::UnbalancedFilter(filter.to_string()));
    }

    let lower = filter.to_lowercase();
    if !FILTER_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return Err(ConfigError::UnrecognizedFilter(filter.to_string()));
    }

    Ok(filter.to_string())
}

pub fn validate_packet_size(size: usize) -> Result<usize, ConfigError> {
    if (64..=65535).contains(&size) {
        Ok(size)
    } else {
        Err(ConfigError::InvalidPacketSize(size))
    }
}

pub fn validate_rate_limit(rate: u64) -> Result<u32, ConfigError> {
    if rate > 1_000_000 {
        return Err(ConfigError::RateLimitTooHigh(rate));
    }
    Ok(rate as u32)
}

/// Seconds to a socket I/O timeout. The OS rejects a zero timeout, so values
/// that round down to zero are refused along with non-finite ones.
pub fn validate_socket_timeout(seconds: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(timeout) if !timeout.is_zero() => Ok(timeout),
        _ => Err(ConfigError::InvalidSocketTimeout(seconds)),
    }
}

fn parse_network(value: &str) -> Result<IpNet, ConfigError> {
    let value = value.trim();
    value
        .parse::<IpNet>()
        .or_else(|_| value.parse::<IpAddr>().map(IpNet::from))
        .map_err(|_| ConfigError::InvalidAllowedNetwork(value.to_string()))
}

use clap::Parser;

/// plc-relay: capture PLC traffic and relay UDP payloads to a collector
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to YAML config file.
    #[arg(short, long, env = "PLC_RELAY_CONFIG")]
    pub config: Option<String>,

    /// Network interface to capture on (e.g., eth0).
    #[arg(short, long, env = "INTERFACE")]
    pub interface: Option<String>,

    /// Capture filter expression (e.g., "udp and port 2222").
    #[arg(short, long, env = "FILTER")]
    pub filter: Option<String>,

    /// Destination IP the payloads are relayed to.
    #[arg(long, env = "DESTINATION_IP")]
    pub destination_ip: Option<String>,

    /// Destination UDP port.
    #[arg(long, env = "DESTINATION_PORT")]
    pub destination_port: Option<u32>,

    /// Log level: DEBUG, INFO, WARNING, ERROR, CRITICAL.
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Largest payload relayed, in bytes (64-65535).
    #[arg(long, env = "MAX_PACKET_SIZE")]
    pub max_packet_size: Option<usize>,

    /// Packets per second admitted (0 = unlimited).
    #[arg(long, env = "RATE_LIMIT")]
    pub rate_limit: Option<u64>,

    /// Relay socket timeout in seconds.
    #[arg(long, env = "SOCKET_TIMEOUT")]
    pub socket_timeout: Option<f64>,

    /// Health/metrics listener port (0 = disabled).
    #[arg(long, env = "HEALTH_CHECK_PORT")]
    pub health_check_port: Option<u16>,

    /// IP CIDRs allowed to reach the health listener. Repeat or comma-separate.
    #[arg(long, env = "ALLOWED_IPS", value_delimiter = ',')]
    pub allowed_ips: Vec<String>,

    /// Seconds between statistics summaries.
    #[arg(long, env = "STATS_INTERVAL")]
    pub stats_interval: Option<u64>,
}
