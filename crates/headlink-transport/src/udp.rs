//! Tokio UDP transport.
//!
//! Sockets are created through socket2 so buffer sizes and address reuse can
//! be set before binding, then handed to Tokio in non-blocking mode.

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::watch;

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl Counters {
    fn sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn received(&self, bytes: usize) {
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }
}

/// UDP transport using Tokio.
///
/// Clones share the same socket, close flag and statistics. The socket itself
/// is released when the last clone is dropped; [`Transport::close`] makes every
/// clone refuse further I/O immediately and wakes any task blocked in
/// [`Transport::recv_from`].
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<watch::Sender<bool>>,
    counters: Arc<Counters>,
}

impl UdpTransport {
    /// Bind a new transport with the default [`TransportConfig`].
    ///
    /// Use port 0 for an ephemeral port.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with_config(addr, &TransportConfig::default()).await
    }

    /// Bind a new transport with explicit socket options.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the socket cannot be created or bound.
    pub async fn bind_with_config<A: Into<SocketAddr>>(
        addr: A,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        let addr = addr.into();
        let bind_failed = |e: io::Error| TransportError::BindFailed {
            addr,
            reason: e.to_string(),
        };

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_failed)?;

        if config.reuse_address {
            socket2.set_reuse_address(true).map_err(bind_failed)?;
        }

        // Kernels clamp these to their own limits; a refusal is not fatal.
        if let Err(e) = socket2.set_recv_buffer_size(config.recv_buffer_size) {
            tracing::debug!("Could not set receive buffer size: {}", e);
        }
        if let Err(e) = socket2.set_send_buffer_size(config.send_buffer_size) {
            tracing::debug!("Could not set send buffer size: {}", e);
        }

        socket2.bind(&addr.into()).map_err(bind_failed)?;
        socket2.set_nonblocking(true).map_err(bind_failed)?;

        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_failed)?;

        tracing::trace!("UDP transport bound to {:?}", socket.local_addr().ok());
        Ok(Self::from_socket(socket))
    }

    /// Wrap an already-bound Tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(closed),
            counters: Arc::new(Counters::default()),
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if *self.closed.borrow() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        self.ensure_open()?;

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters.sent(sent);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        self.ensure_open()?;

        let mut closed = self.closed.subscribe();
        let result = tokio::select! {
            result = self.socket.recv_from(buf) => result,
            _ = closed.wait_for(|closed| *closed) => return Err(TransportError::Closed),
        };

        match result {
            Ok((size, addr)) => {
                self.counters.received(size);
                Ok((size, addr))
            }
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> TransportResult<Option<(usize, SocketAddr)>> {
        self.ensure_open()?;

        match self.socket.try_recv_from(buf) {
            Ok((size, addr)) => {
                self.counters.received(size);
                Ok(Some((size, addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                self.counters.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            recv_errors: c.recv_errors.load(Ordering::Relaxed),
        }
    }
}
