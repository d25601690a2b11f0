//! # headlink Transport
//!
//! Datagram transport layer for the headlink data path.
//!
//! This crate provides:
//! - The [`Transport`] trait every higher layer is written against
//! - A Tokio UDP implementation ([`UdpTransport`]) configured through socket2
//! - Shared transport statistics
//!
//! Nothing above this crate touches a socket directly. Swapping the platform
//! (desktop, embedded, test doubles) means providing another `Transport`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod udp;

pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::UdpTransport;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Receive buffer size requested from the kernel
    pub recv_buffer_size: usize,
    /// Send buffer size requested from the kernel
    pub send_buffer_size: usize,
    /// Set `SO_REUSEADDR` before binding
    pub reuse_address: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            reuse_address: false,
        }
    }
}
