//! Transport trait abstraction.
//!
//! Every component above the socket (STUN queries, hole punching, the
//! connection receive loop) is written against [`Transport`], so the same
//! protocol logic runs on any datagram backend. Receiving comes in three
//! flavours: blocking ([`Transport::recv_from`]), bounded
//! ([`Transport::recv_timeout`]) and polling ([`Transport::try_recv_from`]).
//! The last two report "nothing arrived" as `Ok(None)` rather than as an error.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to {addr}: {reason}")]
    BindFailed {
        /// Address the bind was attempted on
        addr: SocketAddr,
        /// Underlying failure
        reason: String,
    },
}

impl TransportError {
    /// Whether the failure leaves the transport usable for a later attempt.
    ///
    /// I/O errors on a live socket (ICMP port unreachable surfacing as
    /// `ConnectionRefused`, transient `WouldBlock`, etc.) are transient.
    /// A closed transport never recovers.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// # Examples
///
/// ```no_run
/// use headlink_transport::{Transport, UdpTransport};
/// use std::net::SocketAddr;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let transport = UdpTransport::bind(addr).await?;
///
/// transport.send_to(b"ping", "127.0.0.1:50000".parse()?).await?;
///
/// let mut buf = vec![0u8; 1500];
/// match transport.recv_timeout(&mut buf, Duration::from_millis(250)).await? {
///     Some((size, from)) => println!("Received {} bytes from {}", size, from),
///     None => println!("Nothing yet"),
/// }
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`, returning the number of bytes sent.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after [`Transport::close`], or
    /// `TransportError::Io` if the send fails.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Wait for the next datagram.
    ///
    /// Returns the number of bytes written into `buf` and the sender's address.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the transport is closed (including
    /// while the call is waiting), or `TransportError::Io` on a receive failure.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Poll for a datagram without waiting.
    ///
    /// Returns `Ok(None)` when nothing is queued.
    ///
    /// # Errors
    /// Same as [`Transport::recv_from`].
    fn try_recv_from(&self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>>;

    /// Wait at most `wait` for a datagram.
    ///
    /// Returns `Ok(None)` if the wait elapsed with nothing received.
    ///
    /// # Errors
    /// Same as [`Transport::recv_from`].
    async fn recv_timeout(
        &self,
        buf: &mut [u8],
        wait: Duration,
    ) -> TransportResult<Option<(usize, SocketAddr)>> {
        match tokio::time::timeout(wait, self.recv_from(buf)).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport.
    ///
    /// After calling this method, all subsequent operations return
    /// `TransportError::Closed`. Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transport that never receives anything.
    struct Silent {
        closed: Mutex<bool>,
    }

    #[async_trait]
    impl Transport for Silent {
        async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> TransportResult<usize> {
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
            std::future::pending().await
        }

        fn try_recv_from(&self, _buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
            Ok(None)
        }

        fn local_addr(&self) -> TransportResult<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 9)))
        }

        async fn close(&self) -> TransportResult<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::BindFailed {
            addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            reason: "address in use".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to bind to 0.0.0.0:5000: address in use"
        );
    }

    #[test]
    fn test_transport_error_transient() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(TransportError::from(io_err).is_transient());
        assert!(!TransportError::Closed.is_transient());
    }

    #[tokio::test]
    async fn test_default_recv_timeout_reports_none() {
        let transport = Silent {
            closed: Mutex::new(false),
        };
        let mut buf = [0u8; 16];
        let result = transport
            .recv_timeout(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_default_stats_are_empty() {
        let transport = Silent {
            closed: Mutex::new(false),
        };
        assert_eq!(transport.stats(), TransportStats::default());
        transport.close().await.unwrap();
        assert!(transport.is_closed());
    }
}
