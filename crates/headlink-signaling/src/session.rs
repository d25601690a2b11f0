//! Handshake orchestration.
//!
//! A [`Session`] turns signaling messages into hole-punched connections. It
//! owns the pending handshake registry and the live connections for one
//! local endpoint, and is handed around by clone rather than kept in a
//! global.

use crate::error::SignalingError;
use crate::message::SignalMessage;
use crate::registry::{HandshakeRegistry, PendingHandshake, Role};
use async_trait::async_trait;
use headlink_core::{
    Channel, ChannelKind, CloseReason, Connection, ConnectionConfig, MessageHandler,
};
use headlink_nat::gather::default_local_addresses;
use headlink_nat::{Candidate, CandidateGatherer, HolePuncher, PunchConfig, StunClient, StunConfig};
use headlink_transport::{Transport, TransportConfig, UdpTransport};
use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Outbound half of the signaling channel.
///
/// Messages are handed over already addressed (`to_uid`/`from_uid`); the
/// sink only has to deliver them.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Deliver one message to the signaling channel.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Sink` if the channel is gone.
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;
}

#[async_trait]
impl SignalingSink for mpsc::UnboundedSender<SignalMessage> {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        mpsc::UnboundedSender::send(self, message)
            .map_err(|e| SignalingError::Sink(format!("receiver dropped {}", e.0.type_name())))
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// This endpoint's id on the signaling channel
    pub local_uid: String,
    /// Addresses advertised as host candidates
    pub local_addresses: Vec<Ipv4Addr>,
    /// Preferred local UDP port; an ephemeral port is used if it is taken
    pub udp_port_hint: Option<u16>,
    /// STUN settings, `None` to gather host candidates only
    pub stun: Option<StunConfig>,
    /// Hole punching settings
    pub punch: PunchConfig,
    /// Settings for established connections
    pub connection: ConnectionConfig,
    /// Socket settings for gathered sockets
    pub transport: TransportConfig,
    /// Upper bound on one handshake, from gather to connection
    pub handshake_timeout: Duration,
    /// Channels opened on every new connection, in id order
    pub default_channels: Vec<ChannelKind>,
}

impl SessionConfig {
    /// Defaults for `local_uid`, advertising the primary outbound address
    pub fn new(local_uid: impl Into<String>) -> Self {
        Self {
            local_uid: local_uid.into(),
            local_addresses: default_local_addresses(),
            udp_port_hint: None,
            stun: Some(StunConfig::default()),
            punch: PunchConfig::default(),
            connection: ConnectionConfig::default(),
            transport: TransportConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            default_channels: vec![ChannelKind::Reliable, ChannelKind::Unreliable],
        }
    }
}

/// Session lifecycle notifications
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A handshake produced a running connection
    Connected {
        /// Remote endpoint
        peer_id: String,
        /// The new connection
        connection: Connection,
        /// Default channels, in [`SessionConfig::default_channels`] order
        channels: Vec<Channel>,
    },
    /// A handshake ended without a connection
    Failed {
        /// Remote endpoint
        peer_id: String,
        /// What went wrong
        reason: String,
    },
    /// A connection was closed by this side or went silent past its
    /// peer timeout
    Closed {
        /// Remote endpoint
        peer_id: String,
    },
}

/// Outcome of handling one signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// OFFER sent, waiting for the ANSWER
    Offered,
    /// Connection established with the peer at this address
    Connected(SocketAddr),
    /// Handshake failed; resources are released
    Failed(String),
    /// Nothing to do for this message
    Ignored,
}

struct SessionInner {
    config: SessionConfig,
    gatherer: CandidateGatherer,
    sink: Arc<dyn SignalingSink>,
    handler: Option<Arc<dyn MessageHandler>>,
    registry: Mutex<HandshakeRegistry>,
    connections: Mutex<HashMap<String, Connection>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    next_handshake_id: AtomicU64,
}

/// Signaling session for one local endpoint.
///
/// Cloning is cheap; clones share the registry and connections.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Create a session.
    ///
    /// `handler` is attached to every default channel of every connection.
    /// Lifecycle events arrive on the returned receiver; dropping it is
    /// allowed.
    pub fn new(
        config: SessionConfig,
        sink: Arc<dyn SignalingSink>,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let gatherer = match &config.stun {
            Some(stun) => CandidateGatherer::new(Arc::new(StunClient::new(stun.clone()))),
            None => CandidateGatherer::host_only(),
        }
        .with_transport_config(config.transport.clone());

        let (events, events_rx) = mpsc::unbounded_channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                gatherer,
                sink,
                handler,
                registry: Mutex::new(HandshakeRegistry::new()),
                connections: Mutex::new(HashMap::new()),
                events,
                next_handshake_id: AtomicU64::new(1),
            }),
        };
        (session, events_rx)
    }

    /// Session configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// This endpoint's id
    #[must_use]
    pub fn local_uid(&self) -> &str {
        &self.inner.config.local_uid
    }

    /// Live connection to `peer_id`
    pub async fn connection(&self, peer_id: &str) -> Option<Connection> {
        self.inner.connections.lock().await.get(peer_id).cloned()
    }

    /// Peers with a live connection
    pub async fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.connections.lock().await.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Peers with a handshake in flight
    pub async fn pending_handshakes(&self) -> Vec<String> {
        self.inner.registry.lock().await.peers()
    }

    /// Handle one JSON message from the signaling channel.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed messages and for sink failures.
    pub async fn handle_text(&self, text: &str) -> Result<HandshakeStatus, SignalingError> {
        match SignalMessage::parse(text)? {
            Some(message) => self.handle_message(message).await,
            None => Ok(HandshakeStatus::Ignored),
        }
    }

    /// Handle one parsed signaling message.
    ///
    /// Handshake failures are reported through the returned status, a
    /// `UDP_CONNECTION_RESULT` message and a [`SessionEvent::Failed`].
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Sink` if a reply could not be sent.
    pub async fn handle_message(
        &self,
        message: SignalMessage,
    ) -> Result<HandshakeStatus, SignalingError> {
        tracing::debug!("Handling {}", message.type_name());
        match message {
            SignalMessage::InitiateUdpConnection { to_uid } => self.initiate(&to_uid).await,
            SignalMessage::Offer {
                from_uid,
                candidates,
                ..
            } => self.accept_offer(&from_uid, candidates).await,
            SignalMessage::Answer {
                from_uid,
                candidates,
                ..
            } => self.accept_answer(&from_uid, candidates).await,
            SignalMessage::UdpConnectionResult {
                uid,
                success,
                message,
                ..
            } => {
                if success {
                    tracing::info!("{} reports connection established", uid);
                } else if uid != self.local_uid() && self.cancel_handshake(&uid).await {
                    tracing::info!("{} reports handshake failure: {}", uid, message);
                    self.emit(SessionEvent::Failed {
                        peer_id: uid,
                        reason: format!("peer reported failure: {message}"),
                    });
                }
                Ok(HandshakeStatus::Ignored)
            }
        }
    }

    /// Start a handshake with `peer_id` as the initiator.
    ///
    /// Gathers candidates, answers the peer's probes in the background until
    /// the ANSWER arrives or the handshake times out, and sends the OFFER.
    /// Any existing handshake or connection with the peer is torn down first.
    ///
    /// # Errors
    ///
    /// Returns `SignalingError::Sink` if the OFFER could not be sent; the
    /// handshake is cancelled in that case.
    pub async fn initiate(&self, peer_id: &str) -> Result<HandshakeStatus, SignalingError> {
        self.release_peer(peer_id).await;

        let (transport, candidates) = match self.gather().await {
            Ok(gathered) => gathered,
            Err(reason) => return self.fail(peer_id, reason).await,
        };

        let id = self.inner.next_handshake_id.fetch_add(1, Ordering::Relaxed);
        let probe_task = tokio::spawn(answer_probes(
            Arc::downgrade(&self.inner),
            peer_id.to_string(),
            id,
            Arc::clone(&transport),
        ));
        let handshake = PendingHandshake::new(id, transport, Role::Initiator, candidates.clone())
            .with_probe_task(probe_task);
        self.register(peer_id, handshake).await;

        tracing::info!(
            "Offering {} candidate(s) to {}",
            candidates.len(),
            peer_id
        );
        let offer = SignalMessage::Offer {
            from_uid: self.local_uid().to_string(),
            to_uid: Some(peer_id.to_string()),
            candidates,
        };
        if let Err(e) = self.inner.sink.send(offer).await {
            self.cancel_handshake(peer_id).await;
            return Err(e);
        }
        Ok(HandshakeStatus::Offered)
    }

    /// Abandon the pending handshake with `peer_id`, closing its socket.
    ///
    /// Returns `false` if there was none.
    pub async fn cancel_handshake(&self, peer_id: &str) -> bool {
        let handshake = self.inner.registry.lock().await.take(peer_id);
        match handshake {
            Some(handshake) => {
                tracing::debug!("Cancelling {} handshake with {}", handshake.role(), peer_id);
                handshake.release().await;
                true
            }
            None => false,
        }
    }

    /// Close the connection to `peer_id`.
    ///
    /// Returns `false` if there was none.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        let connection = self.inner.connections.lock().await.remove(peer_id);
        match connection {
            Some(connection) => {
                connection.close().await;
                tracing::info!("Disconnected from {}", peer_id);
                self.emit(SessionEvent::Closed {
                    peer_id: peer_id.to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// Cancel every handshake and close every connection
    pub async fn shutdown(&self) {
        let pending = self.inner.registry.lock().await.drain();
        for (peer_id, handshake) in pending {
            tracing::debug!("Releasing handshake with {}", peer_id);
            handshake.release().await;
        }

        let connections: Vec<(String, Connection)> =
            self.inner.connections.lock().await.drain().collect();
        for (peer_id, connection) in connections {
            connection.close().await;
            self.emit(SessionEvent::Closed { peer_id });
        }
        tracing::info!("Session {} shut down", self.local_uid());
    }

    async fn accept_offer(
        &self,
        peer_id: &str,
        candidates: Vec<Candidate>,
    ) -> Result<HandshakeStatus, SignalingError> {
        self.release_peer(peer_id).await;

        let (transport, local_candidates) = match self.gather().await {
            Ok(gathered) => gathered,
            Err(reason) => return self.fail(peer_id, reason).await,
        };

        let id = self.inner.next_handshake_id.fetch_add(1, Ordering::Relaxed);
        let handshake =
            PendingHandshake::new(id, Arc::clone(&transport), Role::Responder, local_candidates);
        self.register(peer_id, handshake).await;

        tracing::info!(
            "Punching {} offered candidate(s) from {}",
            candidates.len(),
            peer_id
        );
        let puncher = HolePuncher::new(transport, self.inner.config.punch.clone());
        let punched = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            puncher.punch_candidates(&candidates),
        )
        .await
        .ok()
        .flatten();

        let Some(handshake) = self.inner.registry.lock().await.take_if(peer_id, id) else {
            tracing::debug!("Handshake with {} was cancelled while punching", peer_id);
            return Ok(HandshakeStatus::Failed("handshake cancelled".to_string()));
        };

        let Some(peer_addr) = punched else {
            handshake.release().await;
            return self
                .fail(peer_id, "no offered candidate answered".to_string())
                .await;
        };

        let answer = SignalMessage::Answer {
            from_uid: self.local_uid().to_string(),
            to_uid: peer_id.to_string(),
            candidates: handshake.local_candidates().to_vec(),
        };
        self.establish(peer_id, handshake.into_transport(), peer_addr)
            .await;
        self.inner.sink.send(answer).await?;
        self.report(peer_id, true, format!("connected to {peer_addr}"))
            .await?;
        Ok(HandshakeStatus::Connected(peer_addr))
    }

    async fn accept_answer(
        &self,
        peer_id: &str,
        candidates: Vec<Candidate>,
    ) -> Result<HandshakeStatus, SignalingError> {
        let handshake = {
            let mut registry = self.inner.registry.lock().await;
            match registry.role(peer_id) {
                Some(Role::Initiator) => registry.take(peer_id),
                _ => None,
            }
        };
        let Some(handshake) = handshake else {
            tracing::warn!("ANSWER from {} without a pending offer", peer_id);
            return Ok(HandshakeStatus::Failed(
                "no pending offer for this peer".to_string(),
            ));
        };

        tracing::info!(
            "Punching {} answered candidate(s) from {}",
            candidates.len(),
            peer_id
        );
        let puncher = HolePuncher::new(handshake.into_transport(), self.inner.config.punch.clone());
        let punched = tokio::time::timeout(
            self.inner.config.handshake_timeout,
            puncher.punch_candidates(&candidates),
        )
        .await
        .ok()
        .flatten();
        let transport = puncher.into_transport();

        let Some(peer_addr) = punched else {
            if let Err(e) = transport.close().await {
                tracing::debug!("Error closing handshake socket: {}", e);
            }
            return self
                .fail(peer_id, "no answered candidate answered".to_string())
                .await;
        };

        self.establish(peer_id, transport, peer_addr).await;
        self.report(peer_id, true, format!("connected to {peer_addr}"))
            .await?;
        Ok(HandshakeStatus::Connected(peer_addr))
    }

    async fn gather(&self) -> Result<(Arc<dyn Transport>, Vec<Candidate>), String> {
        let config = &self.inner.config;
        let gathered = tokio::time::timeout(
            config.handshake_timeout,
            self.inner
                .gatherer
                .gather(&config.local_addresses, config.udp_port_hint),
        )
        .await;

        match gathered {
            Ok(Ok((transport, candidates))) if candidates.is_empty() => {
                close_quietly(&transport).await;
                Err("no local candidates".to_string())
            }
            Ok(Ok((transport, candidates))) => {
                let transport: Arc<dyn Transport> = Arc::new(transport);
                Ok((transport, candidates))
            }
            Ok(Err(e)) => Err(format!("candidate gathering failed: {e}")),
            Err(_) => Err("candidate gathering timed out".to_string()),
        }
    }

    async fn register(&self, peer_id: &str, handshake: PendingHandshake) {
        let replaced = self.inner.registry.lock().await.insert(peer_id, handshake);
        if let Some(old) = replaced {
            old.release().await;
        }
    }

    async fn release_peer(&self, peer_id: &str) {
        self.cancel_handshake(peer_id).await;
        self.disconnect(peer_id).await;
    }

    async fn establish(&self, peer_id: &str, transport: Arc<dyn Transport>, peer_addr: SocketAddr) {
        let connection = Connection::new(
            transport,
            peer_addr,
            peer_id,
            self.inner.config.connection.clone(),
        );

        let mut channels = Vec::with_capacity(self.inner.config.default_channels.len());
        for &kind in &self.inner.config.default_channels {
            match connection
                .open_channel_with_handler(kind, self.inner.handler.clone())
                .await
            {
                Ok(channel) => channels.push(channel),
                Err(e) => tracing::warn!("Failed to open {} channel to {}: {}", kind, peer_id, e),
            }
        }
        connection.start().await;
        tokio::spawn(watch_liveness(
            Arc::downgrade(&self.inner),
            peer_id.to_string(),
            connection.closed(),
        ));

        let replaced = self
            .inner
            .connections
            .lock()
            .await
            .insert(peer_id.to_string(), connection.clone());
        if let Some(old) = replaced {
            old.close().await;
        }

        tracing::info!("Connected to {} at {}", peer_id, peer_addr);
        self.emit(SessionEvent::Connected {
            peer_id: peer_id.to_string(),
            connection,
            channels,
        });
    }

    async fn fail(&self, peer_id: &str, reason: String) -> Result<HandshakeStatus, SignalingError> {
        tracing::warn!("Handshake with {} failed: {}", peer_id, reason);
        self.emit(SessionEvent::Failed {
            peer_id: peer_id.to_string(),
            reason: reason.clone(),
        });
        self.report(peer_id, false, reason.clone()).await?;
        Ok(HandshakeStatus::Failed(reason))
    }

    async fn report(&self, peer_id: &str, success: bool, message: String) -> Result<(), SignalingError> {
        self.inner
            .sink
            .send(SignalMessage::UdpConnectionResult {
                uid: self.local_uid().to_string(),
                peer_uid: peer_id.to_string(),
                success,
                message,
            })
            .await
    }

    async fn expire(&self, peer_id: &str, id: u64) {
        let handshake = self.inner.registry.lock().await.take_if(peer_id, id);
        let Some(mut handshake) = handshake else {
            return;
        };
        handshake.detach_probe_task();
        handshake.release().await;

        if let Err(e) = self
            .fail(peer_id, "handshake timed out waiting for ANSWER".to_string())
            .await
        {
            tracing::warn!("Failed to report handshake timeout: {}", e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::trace!("Session event receiver dropped");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("local_uid", &self.inner.config.local_uid)
            .finish_non_exhaustive()
    }
}

/// Initiator's background task: answer probes until the ANSWER stops it or
/// the handshake times out.
async fn answer_probes(
    session: Weak<SessionInner>,
    peer_id: String,
    id: u64,
    transport: Arc<dyn Transport>,
) {
    let (timeout, punch) = match session.upgrade() {
        Some(inner) => (inner.config.handshake_timeout, inner.config.punch.clone()),
        None => return,
    };

    let puncher = HolePuncher::new(transport, punch);
    if tokio::time::timeout(timeout, puncher.respond_to_probes())
        .await
        .is_ok()
    {
        // Socket closed: the handshake was released elsewhere.
        return;
    }
    drop(puncher);

    if let Some(inner) = session.upgrade() {
        Session { inner }.expire(&peer_id, id).await;
    }
}

/// Drop a connection that closed itself because the peer went silent.
///
/// Local closes are reported by whoever closed the connection.
async fn watch_liveness(
    session: Weak<SessionInner>,
    peer_id: String,
    closed: impl Future<Output = CloseReason>,
) {
    if closed.await != CloseReason::PeerTimeout {
        return;
    }
    let Some(inner) = session.upgrade() else {
        return;
    };

    // A newer connection to the same peer is still running and stays
    let removed = {
        let mut connections = inner.connections.lock().await;
        match connections.get(&peer_id) {
            Some(connection) if !connection.is_running() => connections.remove(&peer_id),
            _ => None,
        }
    };
    if removed.is_some() {
        tracing::warn!("Connection to {} lost", peer_id);
        Session { inner }.emit(SessionEvent::Closed { peer_id });
    }
}

async fn close_quietly(transport: &UdpTransport) {
    if let Err(e) = transport.close().await {
        tracing::debug!("Error closing unused socket: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headlink_core::ChannelEvent;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(uid: &str) -> SessionConfig {
        SessionConfig {
            local_addresses: vec![Ipv4Addr::LOCALHOST],
            stun: None,
            handshake_timeout: Duration::from_secs(3),
            ..SessionConfig::new(uid)
        }
    }

    struct Endpoint {
        session: Session,
        outbox: mpsc::UnboundedReceiver<SignalMessage>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        delivered: mpsc::UnboundedReceiver<ChannelEvent>,
    }

    fn endpoint(config: SessionConfig) -> Endpoint {
        let (sink, outbox) = mpsc::unbounded_channel::<SignalMessage>();
        let (handler, delivered) = mpsc::unbounded_channel::<ChannelEvent>();
        let (session, events) = Session::new(config, Arc::new(sink), Some(Arc::new(handler)));
        Endpoint {
            session,
            outbox,
            events,
            delivered,
        }
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_full_handshake_and_data() {
        let mut controller = endpoint(config("controller"));
        let mut head = endpoint(config("head"));

        let status = controller.session.initiate("head").await.unwrap();
        assert_eq!(status, HandshakeStatus::Offered);
        assert_eq!(controller.session.pending_handshakes().await, vec!["head"]);

        let offer = next(&mut controller.outbox).await;
        assert!(matches!(
            &offer,
            SignalMessage::Offer { from_uid, to_uid: Some(to), candidates }
                if from_uid == "controller" && to == "head" && !candidates.is_empty()
        ));

        let status = head.session.handle_message(offer).await.unwrap();
        assert!(matches!(status, HandshakeStatus::Connected(_)));
        assert!(head.session.pending_handshakes().await.is_empty());

        let answer = next(&mut head.outbox).await;
        assert_eq!(answer.type_name(), "ANSWER");
        let result = next(&mut head.outbox).await;
        assert!(matches!(
            result,
            SignalMessage::UdpConnectionResult { success: true, ref uid, .. } if uid == "head"
        ));

        let status = controller.session.handle_message(answer).await.unwrap();
        assert!(matches!(status, HandshakeStatus::Connected(_)));
        assert!(controller.session.pending_handshakes().await.is_empty());
        assert_eq!(controller.session.connected_peers().await, vec!["head"]);

        let SessionEvent::Connected { channels, .. } = next(&mut controller.events).await else {
            panic!("expected Connected");
        };
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].kind(), ChannelKind::Reliable);
        assert_eq!(channels[1].kind(), ChannelKind::Unreliable);
        assert!(matches!(
            next(&mut head.events).await,
            SessionEvent::Connected { .. }
        ));

        channels[0].send(b"arm").await.unwrap();
        match next(&mut head.delivered).await {
            ChannelEvent::Message { channel, payload } => {
                assert_eq!(channel.peer_id, "controller");
                assert_eq!(channel.channel_id, 1);
                assert_eq!(payload, b"arm");
            }
            other => panic!("unexpected {other:?}"),
        }

        controller.session.shutdown().await;
        head.session.shutdown().await;
    }

    #[tokio::test]
    async fn test_answer_without_offer_fails_cleanly() {
        let mut controller = endpoint(config("controller"));
        let status = controller
            .session
            .handle_message(SignalMessage::Answer {
                from_uid: "head".to_string(),
                to_uid: "controller".to_string(),
                candidates: vec![Candidate::host(Ipv4Addr::LOCALHOST, 9)],
            })
            .await
            .unwrap();

        assert!(matches!(status, HandshakeStatus::Failed(_)));
        assert!(controller.session.connection("head").await.is_none());
        assert!(controller.outbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_offer_with_silent_candidates_fails() {
        let silent = UdpTransport::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let port = silent.local_addr().unwrap().port();

        let mut cfg = config("head");
        cfg.punch = PunchConfig {
            max_attempts: 5,
            probe_interval: Duration::from_millis(5),
        };
        let mut head = endpoint(cfg);

        let status = head
            .session
            .handle_message(SignalMessage::Offer {
                from_uid: "controller".to_string(),
                to_uid: None,
                candidates: vec![Candidate::host(Ipv4Addr::LOCALHOST, port)],
            })
            .await
            .unwrap();

        assert!(matches!(status, HandshakeStatus::Failed(_)));
        assert!(head.session.pending_handshakes().await.is_empty());
        assert!(head.session.connection("controller").await.is_none());
        assert!(matches!(
            next(&mut head.outbox).await,
            SignalMessage::UdpConnectionResult { success: false, .. }
        ));
        assert!(matches!(
            next(&mut head.events).await,
            SessionEvent::Failed { ref peer_id, .. } if peer_id == "controller"
        ));
    }

    #[tokio::test]
    async fn test_initiator_times_out_without_answer() {
        let mut cfg = config("controller");
        cfg.handshake_timeout = Duration::from_millis(100);
        let mut controller = endpoint(cfg);

        controller.session.initiate("head").await.unwrap();
        assert_eq!(next(&mut controller.outbox).await.type_name(), "OFFER");

        assert!(matches!(
            next(&mut controller.events).await,
            SessionEvent::Failed { ref peer_id, .. } if peer_id == "head"
        ));
        assert!(controller.session.pending_handshakes().await.is_empty());
        assert!(matches!(
            next(&mut controller.outbox).await,
            SignalMessage::UdpConnectionResult { success: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_peer_failure_result_cancels_pending() {
        let mut controller = endpoint(config("controller"));
        controller.session.initiate("head").await.unwrap();

        let status = controller
            .session
            .handle_text(
                r#"{"type":"UDP_CONNECTION_RESULT","uid":"head","peer_uid":"controller","success":false,"message":"no route"}"#,
            )
            .await
            .unwrap();

        assert_eq!(status, HandshakeStatus::Ignored);
        assert!(controller.session.pending_handshakes().await.is_empty());
        assert!(matches!(
            next(&mut controller.events).await,
            SessionEvent::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn test_reinitiate_replaces_pending() {
        let controller = endpoint(config("controller"));
        controller.session.initiate("head").await.unwrap();
        controller.session.initiate("head").await.unwrap();
        assert_eq!(controller.session.pending_handshakes().await, vec!["head"]);
        assert!(controller.session.cancel_handshake("head").await);
        assert!(!controller.session.cancel_handshake("head").await);
    }

    #[tokio::test]
    async fn test_unrelated_text_is_ignored() {
        let controller = endpoint(config("controller"));
        let status = controller
            .session
            .handle_text(r#"{"type":"SLIDER","value":3}"#)
            .await
            .unwrap();
        assert_eq!(status, HandshakeStatus::Ignored);
        assert!(controller.session.handle_text("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_closed_sink_cancels_offer() {
        let (sink, outbox) = mpsc::unbounded_channel::<SignalMessage>();
        drop(outbox);
        let (session, _events) = Session::new(config("controller"), Arc::new(sink), None);

        assert!(matches!(
            session.initiate("head").await,
            Err(SignalingError::Sink(_))
        ));
        assert!(session.pending_handshakes().await.is_empty());
    }
}
