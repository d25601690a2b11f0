//! UDP Hole Punching
//!
//! Both ends fire probes at each other's candidates from the socket they
//! gathered on. The first datagram that arrives from exactly the targeted
//! address proves the NAT bindings are open in both directions.
//!
//! Probe datagrams are 20 bytes: an 8-byte magic, a 64-bit per-puncher nonce
//! and a 32-bit attempt counter. The magic starts with `H` (0x48), whose
//! reserved flag bits can never appear in a data packet header, so probes
//! that straggle in after a connection is up are told apart from channel
//! traffic by their first byte.

use crate::gather::Candidate;
use headlink_transport::{Transport, TransportError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Magic prefix of a probe
pub const PROBE_MAGIC: [u8; 8] = *b"HLNK-PRB";
/// Magic prefix of a probe reply
pub const REPLY_MAGIC: [u8; 8] = *b"HLNK-RSP";
/// Size of a probe or probe reply on the wire
pub const PROBE_SIZE: usize = 20;

const RECV_BUFFER_SIZE: usize = 2048;
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Probe or probe reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// Sent while punching
    Probe,
    /// Answer to a received probe
    Reply,
}

/// A decoded probe datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    /// Probe or reply
    pub kind: ProbeKind,
    /// Identifies the puncher that sent the original probe
    pub nonce: u64,
    /// Attempt number within that puncher's budget
    pub attempt: u32,
}

impl Probe {
    /// Create a probe
    #[must_use]
    pub fn new(nonce: u64, attempt: u32) -> Self {
        Self {
            kind: ProbeKind::Probe,
            nonce,
            attempt,
        }
    }

    /// The reply to this probe, echoing its nonce and attempt
    #[must_use]
    pub fn reply(&self) -> Self {
        Self {
            kind: ProbeKind::Reply,
            ..*self
        }
    }

    /// Encode to wire format
    #[must_use]
    pub fn encode(&self) -> [u8; PROBE_SIZE] {
        let mut buf = [0u8; PROBE_SIZE];
        buf[0..8].copy_from_slice(match self.kind {
            ProbeKind::Probe => &PROBE_MAGIC,
            ProbeKind::Reply => &REPLY_MAGIC,
        });
        buf[8..16].copy_from_slice(&self.nonce.to_be_bytes());
        buf[16..20].copy_from_slice(&self.attempt.to_be_bytes());
        buf
    }

    /// Decode from wire format, `None` if `data` is not a probe
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != PROBE_SIZE {
            return None;
        }
        let kind = if data[0..8] == PROBE_MAGIC {
            ProbeKind::Probe
        } else if data[0..8] == REPLY_MAGIC {
            ProbeKind::Reply
        } else {
            return None;
        };

        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&data[8..16]);
        let mut attempt = [0u8; 4];
        attempt.copy_from_slice(&data[16..20]);

        Some(Self {
            kind,
            nonce: u64::from_be_bytes(nonce),
            attempt: u32::from_be_bytes(attempt),
        })
    }
}

/// Hole punching configuration
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Probes sent per candidate before giving up on it
    pub max_attempts: u32,
    /// Receive wait after each probe
    pub probe_interval: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            probe_interval: Duration::from_millis(1),
        }
    }
}

/// Hole puncher for one gathered socket.
///
/// The puncher borrows the transport; it never closes it. On success the
/// caller hands the same transport to the connection, on failure the caller
/// releases it.
pub struct HolePuncher {
    transport: Arc<dyn Transport>,
    config: PunchConfig,
    nonce: u64,
}

impl HolePuncher {
    /// Create a hole puncher over `transport`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: PunchConfig) -> Self {
        Self {
            transport,
            config,
            nonce: rand::random(),
        }
    }

    /// The transport probes are sent from
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Give the transport back
    #[must_use]
    pub fn into_transport(self) -> Arc<dyn Transport> {
        self.transport
    }

    /// Punch towards `peer`.
    ///
    /// Each attempt sends one probe and waits up to `probe_interval` for
    /// any datagram. A datagram from exactly `peer`, whatever its payload,
    /// ends the punch successfully; if it was itself a probe it is answered
    /// first so the peer's own punch completes too. Datagrams from any other
    /// address get a probe back (the peer may be behind a symmetric NAT) and
    /// the punch carries on. Transient send/receive errors use up an attempt
    /// but do not abort.
    ///
    /// Returns `false` once `max_attempts` probes went unanswered or the
    /// transport is closed.
    pub async fn punch(&self, peer: SocketAddr) -> bool {
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        for attempt in 0..self.config.max_attempts {
            let probe = Probe::new(self.nonce, attempt).encode();
            match self.transport.send_to(&probe, peer).await {
                Ok(_) => {}
                Err(TransportError::Closed) => return false,
                Err(e) => tracing::trace!("Probe {} to {} failed: {}", attempt, peer, e),
            }

            match self
                .transport
                .recv_timeout(&mut buf, self.config.probe_interval)
                .await
            {
                Ok(Some((len, from))) if from == peer => {
                    if let Some(received) = Probe::decode(&buf[..len]) {
                        if received.kind == ProbeKind::Probe {
                            if let Err(e) =
                                self.transport.send_to(&received.reply().encode(), peer).await
                            {
                                tracing::trace!("Reply to probe from {} failed: {}", peer, e);
                            }
                        }
                    }
                    tracing::info!("Hole punched to {} after {} probe(s)", peer, attempt + 1);
                    return true;
                }
                Ok(Some((_, from))) => {
                    tracing::debug!("Datagram from unexpected {} while punching {}", from, peer);
                    if let Err(e) = self.transport.send_to(&probe, from).await {
                        tracing::trace!("Probe back to {} failed: {}", from, e);
                    }
                }
                Ok(None) => {}
                Err(TransportError::Closed) => return false,
                Err(e) => tracing::trace!("Receive while punching {} failed: {}", peer, e),
            }
        }

        tracing::debug!(
            "No answer from {} after {} probes",
            peer,
            self.config.max_attempts
        );
        false
    }

    /// Punch each candidate in the order given, stopping at the first success.
    ///
    /// Returns the address that answered.
    pub async fn punch_candidates(&self, candidates: &[Candidate]) -> Option<SocketAddr> {
        for candidate in candidates {
            let addr = candidate.socket_addr();
            tracing::debug!("Punching candidate {}", candidate);
            if self.punch(addr).await {
                return Some(addr);
            }
            if self.transport.is_closed() {
                break;
            }
        }
        None
    }

    /// Answer every probe received until the transport is closed.
    ///
    /// Runs on the side that is waiting for the peer to start punching; the
    /// replies open this side's NAT binding towards whichever address the
    /// peer's probes arrive from. Cancel by dropping the future or closing
    /// the transport.
    pub async fn respond_to_probes(&self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.transport.recv_from(&mut buf).await {
                Ok((len, from)) => match Probe::decode(&buf[..len]) {
                    Some(probe) if probe.kind == ProbeKind::Probe => {
                        tracing::trace!("Answering probe {} from {}", probe.attempt, from);
                        if let Err(TransportError::Closed) =
                            self.transport.send_to(&probe.reply().encode(), from).await
                        {
                            break;
                        }
                    }
                    _ => tracing::trace!("Ignoring {} byte datagram from {}", len, from),
                },
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::trace!("Receive while answering probes failed: {}", e);
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for HolePuncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HolePuncher")
            .field("local_addr", &self.transport.local_addr().ok())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headlink_transport::UdpTransport;
    use std::net::Ipv4Addr;
    use tokio::time::timeout;

    async fn loopback() -> Arc<dyn Transport> {
        Arc::new(
            UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap(),
        )
    }

    fn quick() -> PunchConfig {
        PunchConfig {
            max_attempts: 20,
            probe_interval: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_probe_wire_format() {
        let probe = Probe::new(0x0102_0304_0506_0708, 9);
        let bytes = probe.encode();
        assert_eq!(&bytes[0..8], b"HLNK-PRB");
        assert_eq!(&bytes[8..16], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 9]);
        assert_eq!(Probe::decode(&bytes), Some(probe));
    }

    #[test]
    fn test_probe_reply_echoes() {
        let probe = Probe::new(42, 3);
        let reply = probe.reply();
        assert_eq!(reply.kind, ProbeKind::Reply);
        assert_eq!(reply.nonce, 42);
        assert_eq!(reply.attempt, 3);
        assert_eq!(&reply.encode()[0..8], b"HLNK-RSP");
    }

    #[test]
    fn test_probe_decode_rejects_other_data() {
        assert!(Probe::decode(b"HLNK-PRB").is_none());
        assert!(Probe::decode(&[0u8; PROBE_SIZE]).is_none());
        let mut long = Probe::new(1, 1).encode().to_vec();
        long.push(0);
        assert!(Probe::decode(&long).is_none());
    }

    #[test]
    fn test_probe_magic_sets_reserved_flag_bits() {
        assert_ne!(PROBE_MAGIC[0] & 0xFE, 0);
        assert_ne!(REPLY_MAGIC[0] & 0xFE, 0);
    }

    #[test]
    fn test_punch_config_default() {
        let config = PunchConfig::default();
        assert_eq!(config.max_attempts, 100);
        assert_eq!(config.probe_interval, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_simultaneous_loopback_punch() {
        let a = loopback().await;
        let b = loopback().await;
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        let puncher_a = HolePuncher::new(a, quick());
        let puncher_b = HolePuncher::new(b, quick());

        let (ok_a, ok_b) = tokio::join!(puncher_a.punch(b_addr), puncher_b.punch(a_addr));
        assert!(ok_a);
        assert!(ok_b);
    }

    #[tokio::test]
    async fn test_punch_against_responder() {
        let responder = HolePuncher::new(loopback().await, quick());
        let responder_addr = responder.transport().local_addr().unwrap();
        let answering = tokio::spawn(async move { responder.respond_to_probes().await });

        let puncher = HolePuncher::new(loopback().await, PunchConfig::default());
        assert!(puncher.punch(responder_addr).await);
        answering.abort();
    }

    #[tokio::test]
    async fn test_punch_no_responder_exhausts_attempts() {
        let silent = loopback().await;
        let silent_addr = silent.local_addr().unwrap();

        let config = PunchConfig {
            max_attempts: 10,
            probe_interval: Duration::from_millis(2),
        };
        let puncher = HolePuncher::new(loopback().await, config);
        assert!(!puncher.punch(silent_addr).await);

        // Every attempt reached the silent socket
        let mut buf = [0u8; 64];
        let mut seen = 0;
        while let Ok(Some(_)) = silent
            .recv_timeout(&mut buf, Duration::from_millis(50))
            .await
        {
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[tokio::test]
    async fn test_punch_probes_back_unexpected_sender() {
        let silent_peer = loopback().await;
        let stranger = loopback().await;
        let puncher = HolePuncher::new(loopback().await, quick());
        let puncher_addr = puncher.transport().local_addr().unwrap();

        stranger.send_to(b"hello?", puncher_addr).await.unwrap();
        assert!(!puncher.punch(silent_peer.local_addr().unwrap()).await);

        let mut buf = [0u8; 64];
        let (len, from) = timeout(Duration::from_secs(1), stranger.recv_from(&mut buf))
            .await
            .expect("stranger got no probe")
            .unwrap();
        assert_eq!(from, puncher_addr);
        assert_eq!(Probe::decode(&buf[..len]).map(|p| p.kind), Some(ProbeKind::Probe));
    }

    /// Socket whose probe replies never leave
    struct RepliesFail(UdpTransport);

    #[async_trait::async_trait]
    impl Transport for RepliesFail {
        async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> headlink_transport::TransportResult<usize> {
            if buf.starts_with(&REPLY_MAGIC) {
                return Err(TransportError::Io(std::io::Error::other("reply refused")));
            }
            self.0.send_to(buf, addr).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> headlink_transport::TransportResult<(usize, SocketAddr)> {
            self.0.recv_from(buf).await
        }

        fn try_recv_from(
            &self,
            buf: &mut [u8],
        ) -> headlink_transport::TransportResult<Option<(usize, SocketAddr)>> {
            self.0.try_recv_from(buf)
        }

        fn local_addr(&self) -> headlink_transport::TransportResult<SocketAddr> {
            self.0.local_addr()
        }

        async fn close(&self) -> headlink_transport::TransportResult<()> {
            self.0.close().await
        }

        fn is_closed(&self) -> bool {
            self.0.is_closed()
        }
    }

    #[tokio::test]
    async fn test_failed_reply_does_not_fail_punch() {
        let peer = loopback().await;
        let inner = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let local_addr = inner.local_addr().unwrap();
        let puncher = HolePuncher::new(Arc::new(RepliesFail(inner)), quick());

        peer.send_to(&Probe::new(5, 0).encode(), local_addr).await.unwrap();
        assert!(puncher.punch(peer.local_addr().unwrap()).await);

        // Only the puncher's own probe got through
        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(Probe::decode(&buf[..len]).map(|p| p.kind), Some(ProbeKind::Probe));
        assert!(matches!(
            peer.recv_timeout(&mut buf, Duration::from_millis(50)).await,
            Ok(None)
        ));
    }

    #[tokio::test]
    async fn test_punch_candidates_in_order() {
        let dead = loopback().await;
        let dead_port = dead.local_addr().unwrap().port();

        let responder = HolePuncher::new(loopback().await, quick());
        let live_port = responder.transport().local_addr().unwrap().port();
        let answering = tokio::spawn(async move { responder.respond_to_probes().await });

        let candidates = [
            Candidate::host(Ipv4Addr::LOCALHOST, dead_port),
            Candidate::host(Ipv4Addr::LOCALHOST, live_port),
        ];
        let puncher = HolePuncher::new(loopback().await, quick());
        let winner = puncher.punch_candidates(&candidates).await;
        assert_eq!(winner, Some(candidates[1].socket_addr()));
        answering.abort();
    }

    #[tokio::test]
    async fn test_punch_candidates_empty() {
        let puncher = HolePuncher::new(loopback().await, quick());
        assert_eq!(puncher.punch_candidates(&[]).await, None);
    }

    #[tokio::test]
    async fn test_punch_does_not_close_transport() {
        let silent = loopback().await;
        let puncher = HolePuncher::new(loopback().await, quick());
        puncher.punch(silent.local_addr().unwrap()).await;
        assert!(!puncher.into_transport().is_closed());
    }

    #[tokio::test]
    async fn test_respond_to_probes_stops_on_close() {
        let transport = loopback().await;
        let responder = HolePuncher::new(transport.clone(), quick());
        let handle = tokio::spawn(async move { responder.respond_to_probes().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.close().await.unwrap();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("responder kept running")
            .unwrap();
    }

    #[tokio::test]
    async fn test_punch_on_closed_transport_fails_fast() {
        let transport = loopback().await;
        transport.close().await.unwrap();
        let puncher = HolePuncher::new(transport, PunchConfig::default());
        assert!(!puncher.punch(SocketAddr::from(([127, 0, 0, 1], 9))).await);
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn probe_never_looks_like_a_data_packet(nonce in any::<u64>(), attempt in any::<u32>()) {
                let probe = Probe::new(nonce, attempt);
                for bytes in [probe.encode(), probe.reply().encode()] {
                    // Only bit 0 of the first byte is a defined packet flag
                    prop_assert_ne!(bytes[0] & !0x01, 0);
                    prop_assert_eq!(
                        Probe::decode(&bytes).map(|p| (p.nonce, p.attempt)),
                        Some((nonce, attempt))
                    );
                }
            }

            #[test]
            fn decode_rejects_foreign_datagrams(data in prop::collection::vec(any::<u8>(), 0..64)) {
                prop_assume!(!data.starts_with(&PROBE_MAGIC) && !data.starts_with(&REPLY_MAGIC));
                prop_assert!(Probe::decode(&data).is_none());
            }
        }
    }
}
