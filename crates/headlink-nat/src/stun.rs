//! STUN Binding (RFC 5389 subset)
//!
//! Only what server-reflexive discovery needs: an attribute-less Binding
//! request, and a Binding success response carrying XOR-MAPPED-ADDRESS for
//! IPv4. Responses are validated in a fixed order (length, message type,
//! magic cookie, transaction id) before any attribute is looked at.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Transaction ID (96 bits)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use headlink_transport::{Transport, TransportError};
use rand::RngCore;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;

/// STUN magic cookie (0x2112A442)
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// STUN message header size (20 bytes)
pub const HEADER_SIZE: usize = 20;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS_RESPONSE: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

/// Largest datagram read while waiting for a response
const MAX_RESPONSE_SIZE: usize = 2048;

/// 96-bit STUN transaction identifier
pub type TransactionId = [u8; 12];

/// Build a Binding request with a fresh random transaction id.
///
/// The message is header-only: type 0x0001, length 0, magic cookie,
/// then the transaction id.
#[must_use]
pub fn build_binding_request() -> ([u8; HEADER_SIZE], TransactionId) {
    let mut transaction_id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut transaction_id);
    (encode_header(BINDING_REQUEST, 0, &transaction_id), transaction_id)
}

fn encode_header(msg_type: u16, length: u16, transaction_id: &TransactionId) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..2].copy_from_slice(&msg_type.to_be_bytes());
    header[2..4].copy_from_slice(&length.to_be_bytes());
    header[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    header[8..20].copy_from_slice(transaction_id);
    header
}

/// Build a Binding success response carrying one IPv4 XOR-MAPPED-ADDRESS.
///
/// Used by loopback STUN responders in tests and diagnostics.
#[must_use]
pub fn encode_binding_response(transaction_id: &TransactionId, mapped: SocketAddrV4) -> Vec<u8> {
    let xor_port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let xor_addr = u32::from(*mapped.ip()) ^ MAGIC_COOKIE;

    let mut msg = Vec::with_capacity(HEADER_SIZE + 12);
    msg.extend_from_slice(&encode_header(BINDING_SUCCESS_RESPONSE, 12, transaction_id));
    msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&8u16.to_be_bytes());
    msg.push(0);
    msg.push(FAMILY_IPV4);
    msg.extend_from_slice(&xor_port.to_be_bytes());
    msg.extend_from_slice(&xor_addr.to_be_bytes());
    msg
}

/// Validate a Binding response and extract the IPv4 XOR-MAPPED-ADDRESS.
///
/// Checks run in order: length ≥ 20, type 0x0101, magic cookie,
/// transaction id. Attributes are then walked from offset 20, each padded to
/// a 4-byte boundary; the first IPv4 XOR-MAPPED-ADDRESS wins and any other
/// attribute or address family is skipped.
///
/// # Errors
///
/// Returns the first check that failed, or
/// `StunError::MissingXorMappedAddress` if the walk ends without a usable
/// attribute (including when an attribute is truncated).
pub fn decode_binding_response(
    data: &[u8],
    expected_transaction_id: &TransactionId,
) -> Result<SocketAddrV4, StunError> {
    if data.len() < HEADER_SIZE {
        return Err(StunError::MessageTooShort(data.len()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_SUCCESS_RESPONSE {
        return Err(StunError::InvalidMessageType(msg_type));
    }

    let cookie = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::InvalidMagicCookie(cookie));
    }

    if &data[8..20] != expected_transaction_id {
        return Err(StunError::TransactionMismatch);
    }

    let mut offset = HEADER_SIZE;
    while offset + 4 <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            if value_end > data.len() || attr_len < 8 {
                break;
            }
            let value = &data[value_start..value_end];
            if value[1] == FAMILY_IPV4 {
                let port = u16::from_be_bytes([value[2], value[3]]) ^ (MAGIC_COOKIE >> 16) as u16;
                let addr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]) ^ MAGIC_COOKIE;
                return Ok(SocketAddrV4::new(Ipv4Addr::from(addr), port));
            }
        }

        // Round up to the 4-byte attribute boundary
        offset = (value_end + 3) & !3;
    }

    Err(StunError::MissingXorMappedAddress)
}

/// Option-returning form of [`decode_binding_response`].
///
/// `None` means "no candidate"; the reason is only interesting for logs.
#[must_use]
pub fn parse_binding_response(
    data: &[u8],
    expected_transaction_id: &TransactionId,
) -> Option<SocketAddrV4> {
    decode_binding_response(data, expected_transaction_id).ok()
}

/// STUN client configuration
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// STUN server as `host:port`
    pub server: String,
    /// How long to wait for a Binding response
    pub timeout: Duration,
    /// How long the one-off server name resolution may take
    pub resolve_timeout: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_STUN_SERVER.to_string(),
            timeout: Duration::from_millis(250),
            resolve_timeout: Duration::from_secs(2),
        }
    }
}

/// STUN client for server-reflexive address discovery.
///
/// The server name is resolved on first use and the address is cached for
/// the lifetime of the client; share one client (behind an `Arc`) across
/// every gather in the process. A failed resolution is not cached and will be
/// retried by the next query.
#[derive(Debug)]
pub struct StunClient {
    config: StunConfig,
    server_addr: OnceCell<SocketAddr>,
}

impl StunClient {
    /// Create a client that resolves `config.server` lazily.
    #[must_use]
    pub fn new(config: StunConfig) -> Self {
        Self {
            config,
            server_addr: OnceCell::new(),
        }
    }

    /// Create a client with an already-resolved server address.
    #[must_use]
    pub fn with_server_addr(config: StunConfig, server_addr: SocketAddr) -> Self {
        Self {
            config,
            server_addr: OnceCell::new_with(Some(server_addr)),
        }
    }

    /// Client configuration
    #[must_use]
    pub fn config(&self) -> &StunConfig {
        &self.config
    }

    /// Resolve the STUN server, returning the cached address after the first success.
    ///
    /// # Errors
    ///
    /// Returns `StunError::Resolve` if lookup fails or exceeds
    /// `resolve_timeout`, or `StunError::NoIpv4Address` if the name has no
    /// IPv4 address.
    pub async fn server_addr(&self) -> Result<SocketAddr, StunError> {
        self.server_addr
            .get_or_try_init(|| async {
                let server = self.config.server.as_str();
                let lookup = tokio::time::timeout(
                    self.config.resolve_timeout,
                    tokio::net::lookup_host(server),
                )
                .await
                .map_err(|_| StunError::Resolve {
                    server: server.to_string(),
                    reason: "timed out".to_string(),
                })?
                .map_err(|e| StunError::Resolve {
                    server: server.to_string(),
                    reason: e.to_string(),
                })?;

                let mut addrs = lookup;
                let addr = addrs
                    .find(SocketAddr::is_ipv4)
                    .ok_or_else(|| StunError::NoIpv4Address(server.to_string()))?;
                tracing::debug!("Resolved STUN server {} to {}", server, addr);
                Ok(addr)
            })
            .await
            .copied()
    }

    /// Discover the server-reflexive address of `transport`.
    ///
    /// Sends one Binding request and waits up to the configured timeout.
    /// Datagrams that are not a valid response to this request are ignored
    /// until the deadline.
    ///
    /// # Errors
    ///
    /// Returns `StunError::Timeout` if no valid response arrives in time,
    /// a resolution error, or `StunError::Transport` if the transport is
    /// closed or the request cannot be sent.
    pub async fn query(&self, transport: &dyn Transport) -> Result<SocketAddrV4, StunError> {
        let server = self.server_addr().await?;
        let (request, transaction_id) = build_binding_request();
        transport.send_to(&request, server).await?;

        let deadline = Instant::now() + self.config.timeout;
        let mut buf = [0u8; MAX_RESPONSE_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StunError::Timeout);
            }

            match transport.recv_timeout(&mut buf, remaining).await {
                Ok(Some((len, from))) => match decode_binding_response(&buf[..len], &transaction_id) {
                    Ok(mapped) => {
                        tracing::debug!("STUN server {} reports mapped address {}", from, mapped);
                        return Ok(mapped);
                    }
                    Err(e) => {
                        tracing::trace!("Ignoring datagram from {} during STUN query: {}", from, e);
                    }
                },
                Ok(None) => return Err(StunError::Timeout),
                Err(e) if e.is_transient() => {
                    tracing::trace!("Receive error during STUN query: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// STUN errors
#[derive(Debug, thiserror::Error)]
pub enum StunError {
    /// Transport failure while sending or receiving
    #[error("STUN transport error: {0}")]
    Transport(#[from] TransportError),

    /// No valid response within the configured timeout
    #[error("STUN query timeout")]
    Timeout,

    /// Fewer bytes than a STUN header
    #[error("STUN message too short ({0} bytes)")]
    MessageTooShort(usize),

    /// Not a Binding success response
    #[error("Unexpected STUN message type 0x{0:04x}")]
    InvalidMessageType(u16),

    /// Magic cookie mismatch
    #[error("Invalid STUN magic cookie 0x{0:08x}")]
    InvalidMagicCookie(u32),

    /// Transaction id does not match the request
    #[error("Transaction ID mismatch")]
    TransactionMismatch,

    /// No IPv4 XOR-MAPPED-ADDRESS in the response
    #[error("No IPv4 XOR-MAPPED-ADDRESS in STUN response")]
    MissingXorMappedAddress,

    /// Server name lookup failed
    #[error("Failed to resolve STUN server {server}: {reason}")]
    Resolve {
        /// Configured server
        server: String,
        /// Failure detail
        reason: String,
    },

    /// Server name has no IPv4 address
    #[error("STUN server {0} has no IPv4 address")]
    NoIpv4Address(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use headlink_transport::UdpTransport;

    const TID: TransactionId = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn mapped() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 54321)
    }

    #[test]
    fn test_magic_cookie() {
        assert_eq!(MAGIC_COOKIE, 0x2112_A442);
    }

    #[test]
    fn test_build_binding_request_layout() {
        let (request, tid) = build_binding_request();
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&request[8..20], &tid);
    }

    #[test]
    fn test_build_binding_request_fresh_transaction_ids() {
        let (_, a) = build_binding_request();
        let (_, b) = build_binding_request();
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_handcrafted_response() {
        // 203.0.113.7:54321 XOR-encoded by hand
        let port = 54321u16 ^ 0x2112;
        let addr = u32::from_be_bytes([203, 0, 113, 7]) ^ 0x2112_A442;

        let mut msg = vec![0x01, 0x01, 0x00, 0x0C, 0x21, 0x12, 0xA4, 0x42];
        msg.extend_from_slice(&TID);
        msg.extend_from_slice(&[0x00, 0x20, 0x00, 0x08, 0x00, 0x01]);
        msg.extend_from_slice(&port.to_be_bytes());
        msg.extend_from_slice(&addr.to_be_bytes());

        assert_eq!(parse_binding_response(&msg, &TID), Some(mapped()));
    }

    #[test]
    fn test_encode_matches_decode() {
        let msg = encode_binding_response(&TID, mapped());
        assert_eq!(decode_binding_response(&msg, &TID).unwrap(), mapped());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let msg = encode_binding_response(&TID, mapped());
        assert!(parse_binding_response(&msg[..19], &TID).is_none());
        assert!(matches!(
            decode_binding_response(&msg[..19], &TID),
            Err(StunError::MessageTooShort(19))
        ));
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let mut msg = encode_binding_response(&TID, mapped());
        msg[1] = 0x11; // 0x0111 binding error response
        assert!(parse_binding_response(&msg, &TID).is_none());
        assert!(matches!(
            decode_binding_response(&msg, &TID),
            Err(StunError::InvalidMessageType(0x0111))
        ));
    }

    #[test]
    fn test_parse_rejects_wrong_cookie() {
        let mut msg = encode_binding_response(&TID, mapped());
        msg[4] = 0xFF;
        assert!(matches!(
            decode_binding_response(&msg, &TID),
            Err(StunError::InvalidMagicCookie(_))
        ));
    }

    #[test]
    fn test_parse_rejects_transaction_mismatch() {
        let msg = encode_binding_response(&TID, mapped());
        let mut other = TID;
        other[11] ^= 0xFF;
        assert!(parse_binding_response(&msg, &other).is_none());
    }

    #[test]
    fn test_validation_order_type_before_cookie() {
        let mut msg = encode_binding_response(&TID, mapped());
        msg[1] = 0x11;
        msg[4] = 0xFF;
        assert!(matches!(
            decode_binding_response(&msg, &TID),
            Err(StunError::InvalidMessageType(_))
        ));
    }

    #[test]
    fn test_parse_skips_other_attributes_with_padding() {
        let mut msg = encode_header(BINDING_SUCCESS_RESPONSE, 0, &TID).to_vec();
        // SOFTWARE attribute, 5-byte value padded to 8
        msg.extend_from_slice(&[0x80, 0x22, 0x00, 0x05]);
        msg.extend_from_slice(b"relay\0\0\0");
        let response = encode_binding_response(&TID, mapped());
        msg.extend_from_slice(&response[HEADER_SIZE..]);

        assert_eq!(parse_binding_response(&msg, &TID), Some(mapped()));
    }

    #[test]
    fn test_parse_skips_ipv6_family() {
        let mut msg = encode_header(BINDING_SUCCESS_RESPONSE, 0, &TID).to_vec();
        msg.extend_from_slice(&[0x00, 0x20, 0x00, 0x14, 0x00, 0x02, 0x00, 0x00]);
        msg.extend_from_slice(&[0u8; 16]);
        let response = encode_binding_response(&TID, mapped());
        msg.extend_from_slice(&response[HEADER_SIZE..]);

        assert_eq!(parse_binding_response(&msg, &TID), Some(mapped()));
    }

    #[test]
    fn test_parse_truncated_attribute() {
        let msg = encode_binding_response(&TID, mapped());
        let cut = &msg[..msg.len() - 2];
        assert!(matches!(
            decode_binding_response(cut, &TID),
            Err(StunError::MissingXorMappedAddress)
        ));
    }

    #[test]
    fn test_parse_header_only_response() {
        let msg = encode_header(BINDING_SUCCESS_RESPONSE, 0, &TID);
        assert!(parse_binding_response(&msg, &TID).is_none());
    }

    #[test]
    fn test_stun_config_default() {
        let config = StunConfig::default();
        assert_eq!(config.server, "stun.l.google.com:19302");
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_stun_error_display() {
        assert_eq!(StunError::Timeout.to_string(), "STUN query timeout");
        assert_eq!(
            StunError::InvalidMessageType(0x0111).to_string(),
            "Unexpected STUN message type 0x0111"
        );
        assert_eq!(
            StunError::TransactionMismatch.to_string(),
            "Transaction ID mismatch"
        );
    }

    /// Answers one Binding request with the sender's own address.
    async fn spawn_responder(noise_first: bool) -> SocketAddr {
        let server = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, HEADER_SIZE);
            let mut tid = [0u8; 12];
            tid.copy_from_slice(&buf[8..20]);
            let SocketAddr::V4(from_v4) = from else {
                panic!("expected IPv4 client");
            };
            if noise_first {
                server.send_to(b"not stun", from).await.unwrap();
            }
            let response = encode_binding_response(&tid, from_v4);
            server.send_to(&response, from).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_query_loopback_server() {
        let server = spawn_responder(false).await;
        let client = StunClient::with_server_addr(StunConfig::default(), server);
        let transport = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();

        let mapped = client.query(&transport).await.unwrap();
        assert_eq!(SocketAddr::V4(mapped), transport.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_query_ignores_noise() {
        let server = spawn_responder(true).await;
        let client = StunClient::with_server_addr(StunConfig::default(), server);
        let transport = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();

        let mapped = client.query(&transport).await.unwrap();
        assert_eq!(mapped.port(), transport.local_addr().unwrap().port());
    }

    #[tokio::test]
    async fn test_query_times_out() {
        // Bound but silent server
        let silent = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let config = StunConfig {
            timeout: Duration::from_millis(50),
            ..StunConfig::default()
        };
        let client = StunClient::with_server_addr(config, silent.local_addr().unwrap());
        let transport = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = client.query(&transport).await;
        assert!(matches!(result, Err(StunError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_server_addr_resolves_and_caches() {
        let config = StunConfig {
            server: "127.0.0.1:3478".to_string(),
            ..StunConfig::default()
        };
        let client = StunClient::new(config);
        let first = client.server_addr().await.unwrap();
        let second = client.server_addr().await.unwrap();
        assert_eq!(first, SocketAddr::from(([127, 0, 0, 1], 3478)));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_server_addr_rejects_ipv6_only() {
        let config = StunConfig {
            server: "[::1]:3478".to_string(),
            ..StunConfig::default()
        };
        let client = StunClient::new(config);
        assert!(matches!(
            client.server_addr().await,
            Err(StunError::NoIpv4Address(_))
        ));
    }
}
