//! Configuration file for the headlink CLI.

use headlink_core::{ConnectionConfig, ReliableConfig};
use headlink_nat::gather::default_local_addresses;
use headlink_nat::{PunchConfig, StunConfig};
use headlink_signaling::SessionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// headlink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    /// STUN configuration
    #[serde(default)]
    pub stun: StunSection,
    /// Hole punching configuration
    #[serde(default)]
    pub punch: PunchSection,
    /// Reliable channel configuration
    #[serde(default)]
    pub reliable: ReliableSection,
    /// Connection configuration
    #[serde(default)]
    pub connection: ConnectionSection,
    /// Handshake configuration
    #[serde(default)]
    pub handshake: HandshakeSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// STUN configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StunSection {
    /// Query a STUN server for a server-reflexive candidate
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// STUN server as `host:port`
    #[serde(default = "default_stun_server")]
    pub server: String,
    /// Binding response timeout
    #[serde(default = "default_stun_timeout_ms")]
    pub timeout_ms: u64,
    /// Server name resolution timeout
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
}

/// Hole punching configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PunchSection {
    /// Probes per candidate
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Wait after each probe
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

/// Reliable channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReliableSection {
    /// Age before an unacknowledged packet is retransmitted
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// Retransmissions before giving up on a packet
    #[serde(default = "default_max_retransmits")]
    pub max_retransmits: u32,
    /// Retransmit timer period
    #[serde(default = "default_retransmit_tick_ms")]
    pub retransmit_tick_ms: u64,
    /// Early arrivals buffered ahead of the next expected packet
    #[serde(default = "default_reorder_window")]
    pub reorder_window: u32,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionSection {
    /// Longest single receive wait
    #[serde(default = "default_recv_poll_interval_ms")]
    pub recv_poll_interval_ms: u64,
    /// Largest accepted datagram
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
    /// Pause after a receive error
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    /// Keepalive probe interval, 0 disables keepalives
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    /// Close the link after this long without hearing from the peer, 0 never
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
}

/// Handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeSection {
    /// Upper bound on one handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub timeout_ms: u64,
    /// Preferred local UDP port
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
    /// Host candidate addresses; empty means the primary outbound address
    #[serde(default)]
    pub local_addresses: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_true() -> bool {
    true
}

fn default_stun_server() -> String {
    headlink_nat::stun::DEFAULT_STUN_SERVER.to_string()
}

fn default_stun_timeout_ms() -> u64 {
    250
}

fn default_resolve_timeout_ms() -> u64 {
    2_000
}

fn default_max_attempts() -> u32 {
    100
}

fn default_probe_interval_ms() -> u64 {
    1
}

fn default_ack_timeout_ms() -> u64 {
    500
}

fn default_max_retransmits() -> u32 {
    5
}

fn default_retransmit_tick_ms() -> u64 {
    100
}

fn default_reorder_window() -> u32 {
    1024
}

fn default_recv_poll_interval_ms() -> u64 {
    250
}

fn default_recv_buffer_size() -> usize {
    2048
}

fn default_error_backoff_ms() -> u64 {
    100
}

fn default_keepalive_ms() -> u64 {
    500
}

fn default_peer_timeout_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StunSection {
    fn default() -> Self {
        Self {
            enabled: true,
            server: default_stun_server(),
            timeout_ms: default_stun_timeout_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
        }
    }
}

impl Default for PunchSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl Default for ReliableSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retransmits: default_max_retransmits(),
            retransmit_tick_ms: default_retransmit_tick_ms(),
            reorder_window: default_reorder_window(),
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            recv_poll_interval_ms: default_recv_poll_interval_ms(),
            recv_buffer_size: default_recv_buffer_size(),
            error_backoff_ms: default_error_backoff_ms(),
            keepalive_ms: default_keepalive_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
        }
    }
}

impl Default for HandshakeSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_handshake_timeout_ms(),
            udp_port: None,
            local_addresses: Vec::new(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("headlink/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.stun.enabled {
            validate_host_port(&self.stun.server, "STUN server")?;
        }
        if self.stun.timeout_ms == 0 {
            anyhow::bail!("STUN timeout must be greater than zero");
        }

        if self.punch.max_attempts == 0 {
            anyhow::bail!("Punch max_attempts must be at least 1");
        }

        if self.reliable.ack_timeout_ms == 0 || self.reliable.retransmit_tick_ms == 0 {
            anyhow::bail!("Reliable ack_timeout_ms and retransmit_tick_ms must be greater than zero");
        }
        if self.reliable.reorder_window == 0 {
            anyhow::bail!("Reliable reorder_window must be at least 1");
        }

        // Header plus at least one payload byte
        if self.connection.recv_buffer_size <= headlink_core::HEADER_SIZE
            || self.connection.recv_buffer_size > 65_535
        {
            anyhow::bail!(
                "Receive buffer size must be between {} and 65535 bytes",
                headlink_core::HEADER_SIZE + 1
            );
        }
        if self.connection.recv_poll_interval_ms == 0 {
            anyhow::bail!("Receive poll interval must be greater than zero");
        }
        if self.connection.peer_timeout_ms != 0
            && self.connection.keepalive_ms >= self.connection.peer_timeout_ms
        {
            anyhow::bail!("Peer timeout must be longer than the keepalive interval");
        }

        if self.handshake.timeout_ms == 0 {
            anyhow::bail!("Handshake timeout must be greater than zero");
        }
        self.local_addresses()?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Host candidate addresses
    ///
    /// # Errors
    ///
    /// Returns an error if an address is not a valid IPv4 address.
    pub fn local_addresses(&self) -> anyhow::Result<Vec<Ipv4Addr>> {
        if self.handshake.local_addresses.is_empty() {
            return Ok(default_local_addresses());
        }
        self.handshake
            .local_addresses
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|_| anyhow::anyhow!("Invalid local address: {}", addr))
            })
            .collect()
    }

    /// STUN client settings, `None` when STUN is disabled
    #[must_use]
    pub fn stun_config(&self) -> Option<StunConfig> {
        self.stun.enabled.then(|| StunConfig {
            server: self.stun.server.clone(),
            timeout: Duration::from_millis(self.stun.timeout_ms),
            resolve_timeout: Duration::from_millis(self.stun.resolve_timeout_ms),
        })
    }

    /// Hole punching settings
    #[must_use]
    pub fn punch_config(&self) -> PunchConfig {
        PunchConfig {
            max_attempts: self.punch.max_attempts,
            probe_interval: Duration::from_millis(self.punch.probe_interval_ms),
        }
    }

    /// Connection settings
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            recv_poll_interval: Duration::from_millis(self.connection.recv_poll_interval_ms),
            recv_buffer_size: self.connection.recv_buffer_size,
            error_backoff: Duration::from_millis(self.connection.error_backoff_ms),
            keepalive_interval: non_zero_ms(self.connection.keepalive_ms),
            peer_timeout: non_zero_ms(self.connection.peer_timeout_ms),
            reliable: ReliableConfig {
                ack_timeout: Duration::from_millis(self.reliable.ack_timeout_ms),
                max_retransmits: self.reliable.max_retransmits,
                retransmit_tick: Duration::from_millis(self.reliable.retransmit_tick_ms),
                reorder_window: self.reliable.reorder_window,
            },
        }
    }

    /// Signaling session settings for `local_uid`
    ///
    /// # Errors
    ///
    /// Returns an error if a local address is invalid.
    pub fn session_config(&self, local_uid: &str) -> anyhow::Result<SessionConfig> {
        Ok(SessionConfig {
            local_addresses: self.local_addresses()?,
            udp_port_hint: self.handshake.udp_port,
            stun: self.stun_config(),
            punch: self.punch_config(),
            connection: self.connection_config(),
            handshake_timeout: Duration::from_millis(self.handshake.timeout_ms),
            ..SessionConfig::new(local_uid)
        })
    }
}

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Validate host:port format
fn validate_host_port(addr: &str, name: &str) -> anyhow::Result<()> {
    let Some((host, port_str)) = addr.rsplit_once(':') else {
        anyhow::bail!(
            "{} '{}' missing port (expected format: host:port)",
            name,
            addr
        );
    };

    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("{} '{}' has invalid port: {}", name, addr, port_str))?;

    if port == 0 {
        anyhow::bail!("{} '{}' has invalid port: 0", name, addr);
    }

    if host.is_empty() {
        anyhow::bail!("{} '{}' has empty hostname", name, addr);
    }

    if host.contains('/') || host.contains('\\') {
        anyhow::bail!("{} '{}' contains invalid characters", name, addr);
    }

    Ok(())
}
