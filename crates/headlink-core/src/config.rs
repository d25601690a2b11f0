//! Connection and channel timing configuration.

use std::time::Duration;

/// Reliable channel retransmission settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableConfig {
    /// Age after which an unacknowledged packet is retransmitted
    pub ack_timeout: Duration,
    /// Retransmissions before a packet is dropped as undeliverable
    pub max_retransmits: u32,
    /// How often the retransmit timer scans pending packets
    pub retransmit_tick: Duration,
    /// How far ahead of the next expected sequence number an early arrival
    /// may be and still be buffered; anything further is dropped unacknowledged
    pub reorder_window: u32,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(500),
            max_retransmits: 5,
            retransmit_tick: Duration::from_millis(100),
            reorder_window: 1024,
        }
    }
}

/// Connection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Upper bound on a single receive wait; the loop re-checks its
    /// running flag at least this often
    pub recv_poll_interval: Duration,
    /// Largest datagram accepted, header included. Sends that would
    /// exceed it are refused and larger arrivals are discarded.
    pub recv_buffer_size: usize,
    /// Pause after a transient receive error
    pub error_backoff: Duration,
    /// Interval between keepalive probes to the peer, `None` to send none
    pub keepalive_interval: Option<Duration>,
    /// Silence after which the peer is presumed gone and the connection
    /// closes itself, `None` to wait forever
    pub peer_timeout: Option<Duration>,
    /// Settings for reliable channels opened on this connection
    pub reliable: ReliableConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            recv_poll_interval: Duration::from_millis(250),
            recv_buffer_size: 2048,
            error_backoff: Duration::from_millis(100),
            keepalive_interval: Some(Duration::from_millis(500)),
            peer_timeout: Some(Duration::from_secs(5)),
            reliable: ReliableConfig::default(),
        }
    }
}
