//! Candidate gathering
//!
//! One UDP socket per handshake. Every supplied local address becomes a host
//! candidate on the bound port, and a single STUN query on the same socket
//! adds a server-reflexive candidate when it succeeds.

use crate::stun::StunClient;
use headlink_transport::{Transport, TransportConfig, TransportError, UdpTransport};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Public address learned from a STUN server
    Srflx,
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::Srflx => write!(f, "srflx"),
        }
    }
}

/// An address/port an endpoint may be reachable at.
///
/// Serializes as `{"type": "host", "address": "192.168.1.20", "port": 40000}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    /// Candidate type
    #[serde(rename = "type")]
    pub candidate_type: CandidateType,
    /// IPv4 address
    pub address: Ipv4Addr,
    /// UDP port
    pub port: u16,
}

impl Candidate {
    /// Create a host candidate
    #[must_use]
    pub fn host(address: Ipv4Addr, port: u16) -> Self {
        Self {
            candidate_type: CandidateType::Host,
            address,
            port,
        }
    }

    /// Create a server-reflexive candidate
    #[must_use]
    pub fn srflx(mapped: SocketAddrV4) -> Self {
        Self {
            candidate_type: CandidateType::Srflx,
            address: *mapped.ip(),
            port: mapped.port(),
        }
    }

    /// Address to probe for this candidate
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl std::fmt::Display for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}:{}", self.candidate_type, self.address, self.port)
    }
}

/// Gathering errors
#[derive(Debug, thiserror::Error)]
pub enum GatherError {
    /// No UDP socket could be bound
    #[error("Failed to bind candidate socket: {0}")]
    Bind(#[source] TransportError),

    /// The bound socket reported no local address
    #[error("Candidate socket unusable: {0}")]
    Transport(#[source] TransportError),
}

/// Gathers host and server-reflexive candidates for one fresh socket.
#[derive(Debug, Clone)]
pub struct CandidateGatherer {
    stun: Option<Arc<StunClient>>,
    transport_config: TransportConfig,
}

impl CandidateGatherer {
    /// Gatherer that also asks `stun` for a server-reflexive candidate.
    #[must_use]
    pub fn new(stun: Arc<StunClient>) -> Self {
        Self {
            stun: Some(stun),
            transport_config: TransportConfig::default(),
        }
    }

    /// Gatherer that only produces host candidates.
    #[must_use]
    pub fn host_only() -> Self {
        Self {
            stun: None,
            transport_config: TransportConfig::default(),
        }
    }

    /// Override socket options for gathered sockets.
    #[must_use]
    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Bind one UDP socket and collect its candidates.
    ///
    /// The socket binds `0.0.0.0:<port_hint>`, falling back to an ephemeral
    /// port if the hinted one is taken. Host candidates come first, one per
    /// distinct entry of `local_addresses`, in the order given; a srflx
    /// candidate is appended when the STUN query succeeds. STUN failure only
    /// means a missing candidate.
    ///
    /// The returned transport is owned by the caller: it becomes the
    /// connection's socket after a successful punch, and is released by
    /// dropping it otherwise.
    ///
    /// # Errors
    ///
    /// Returns `GatherError::Bind` if no socket could be bound at all.
    pub async fn gather(
        &self,
        local_addresses: &[Ipv4Addr],
        port_hint: Option<u16>,
    ) -> Result<(UdpTransport, Vec<Candidate>), GatherError> {
        let transport = self.bind(port_hint).await?;
        let port = transport.local_addr().map_err(GatherError::Transport)?.port();

        let mut candidates: Vec<Candidate> = Vec::with_capacity(local_addresses.len() + 1);
        for &address in local_addresses {
            let candidate = Candidate::host(address, port);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }

        if let Some(stun) = &self.stun {
            match stun.query(&transport).await {
                Ok(mapped) => {
                    tracing::debug!("Server-reflexive candidate {}", mapped);
                    candidates.push(Candidate::srflx(mapped));
                }
                Err(e) => {
                    tracing::info!("No server-reflexive candidate: {}", e);
                }
            }
        }

        tracing::debug!(
            "Gathered {} candidate(s) on port {}",
            candidates.len(),
            port
        );
        Ok((transport, candidates))
    }

    async fn bind(&self, port_hint: Option<u16>) -> Result<UdpTransport, GatherError> {
        let any = |port: u16| SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));

        if let Some(port) = port_hint.filter(|p| *p != 0) {
            match UdpTransport::bind_with_config(any(port), &self.transport_config).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    tracing::warn!("Hinted UDP port {} unavailable ({}), using ephemeral port", port, e);
                }
            }
        }

        UdpTransport::bind_with_config(any(0), &self.transport_config)
            .await
            .map_err(GatherError::Bind)
    }
}

/// Best-effort primary IPv4 address of this host.
///
/// Asks the routing table which source address would reach a public
/// address (no datagram is sent). Falls back to loopback when the host has
/// no route.
#[must_use]
pub fn default_local_addresses() -> Vec<Ipv4Addr> {
    let routed = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .ok()
        .and_then(|addr| match addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        });

    match routed {
        Some(ip) => vec![ip],
        None => vec![Ipv4Addr::LOCALHOST],
    }
}
