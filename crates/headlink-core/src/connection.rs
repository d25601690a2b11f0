//! Connection: one socket, one peer, many channels.
//!
//! A [`Connection`] owns the transport that hole punching validated and an
//! arena of channel state keyed by channel id. [`Channel`] handles refer back
//! to the connection through a `Weak` pointer, so handles never keep a
//! closed or dropped connection alive.
//!
//! Background work:
//! - one receive loop per connection, the only place datagrams are read
//! - one retransmit timer per reliable channel
//! - one keepalive timer per connection, which probes the peer to hold the
//!   NAT binding open and closes the connection once the peer falls silent
//!
//! All of them hold only a `Weak` reference between iterations and stop on
//! their own once the connection is closed or dropped.

use crate::channel::{ChannelKind, ReliableChannel, UnreliableChannel};
use crate::config::ConnectionConfig;
use crate::error::ChannelError;
use crate::handler::{ChannelInfo, MessageHandler};
use crate::HEADER_SIZE;
use crate::packet::Packet;
use headlink_nat::hole_punch::{Probe, ProbeKind};
use headlink_transport::{Transport, TransportError, TransportStats};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Why a connection stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// [`Connection::close`] was called
    Local,
    /// Nothing arrived from the peer within `peer_timeout`
    PeerTimeout,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::PeerTimeout => write!(f, "peer timed out"),
        }
    }
}

enum ChannelState {
    Unreliable(UnreliableChannel),
    Reliable(ReliableChannel),
}

struct ChannelEntry {
    info: ChannelInfo,
    state: ChannelState,
    handler: Option<Arc<dyn MessageHandler>>,
    retransmit_task: Option<JoinHandle<()>>,
}

impl ChannelEntry {
    fn close(&mut self) {
        match &mut self.state {
            ChannelState::Unreliable(c) => c.close(),
            ChannelState::Reliable(c) => c.close(),
        }
        if let Some(task) = self.retransmit_task.take() {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        match &self.state {
            ChannelState::Unreliable(c) => c.is_closed(),
            ChannelState::Reliable(c) => c.is_closed(),
        }
    }
}

struct ConnectionState {
    channels: HashMap<u16, ChannelEntry>,
    next_channel_id: u16,
    recv_task: Option<JoinHandle<()>>,
}

impl ConnectionState {
    fn allocate_channel_id(&mut self) -> Result<u16, ChannelError> {
        for _ in 0..u16::MAX {
            let id = self.next_channel_id;
            self.next_channel_id = match id.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            if id != 0 && !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ChannelError::ChannelIdsExhausted)
    }
}

struct ConnectionInner {
    transport: Arc<dyn Transport>,
    peer_addr: SocketAddr,
    peer_id: String,
    config: ConnectionConfig,
    running: AtomicBool,
    started: AtomicBool,
    state: Mutex<ConnectionState>,
    epoch: Instant,
    // Milliseconds after `epoch` of the last datagram from the peer
    last_heard_ms: AtomicU64,
    closed: watch::Sender<Option<CloseReason>>,
}

/// Channel counters at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Channel id
    pub channel_id: u16,
    /// Channel variant
    pub kind: ChannelKind,
    /// Sequence number of the next send
    pub next_seq_out: u32,
    /// Next sequence number expected (reliable) or accepted (unreliable)
    pub next_seq_in: u32,
    /// Unacknowledged outbound packets (always 0 for unreliable)
    pub pending: usize,
    /// Early arrivals held for reordering (always 0 for unreliable)
    pub buffered: usize,
    /// Whether the channel is closed
    pub closed: bool,
}

/// Data connection to one peer.
///
/// Cloning is cheap; clones share the same socket and channels.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a validated transport/peer pair.
    ///
    /// Nothing is received until [`Connection::start`] is called.
    pub fn new(
        transport: Arc<dyn Transport>,
        peer_addr: SocketAddr,
        peer_id: impl Into<String>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                transport,
                peer_addr,
                peer_id: peer_id.into(),
                config,
                running: AtomicBool::new(true),
                started: AtomicBool::new(false),
                state: Mutex::new(ConnectionState {
                    channels: HashMap::new(),
                    next_channel_id: 1,
                    recv_task: None,
                }),
                epoch: Instant::now(),
                last_heard_ms: AtomicU64::new(0),
                closed: watch::Sender::new(None),
            }),
        }
    }

    /// Start the receive loop and the keepalive timer. Calling it again has
    /// no effect.
    ///
    /// The peer timeout counts from here.
    pub async fn start(&self) {
        if !self.is_running() || self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.touch();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(receive_loop(weak.clone()));
        self.inner.state.lock().await.recv_task = Some(task);

        let config = &self.inner.config;
        let tick = match (config.keepalive_interval, config.peer_timeout) {
            (Some(interval), _) => Some(interval),
            (None, Some(timeout)) => Some((timeout / 4).max(Duration::from_millis(10))),
            (None, None) => None,
        };
        if let Some(tick) = tick {
            tokio::spawn(keepalive_loop(weak, tick));
        }

        tracing::info!(
            "Connection to {} ({}) started on {:?}",
            self.inner.peer_id,
            self.inner.peer_addr,
            self.inner.transport.local_addr().ok()
        );
    }

    /// Open a channel without a handler.
    ///
    /// # Errors
    ///
    /// See [`Connection::open_channel_with_handler`].
    pub async fn open_channel(&self, kind: ChannelKind) -> Result<Channel, ChannelError> {
        self.open_channel_with_handler(kind, None).await
    }

    /// Open a channel on the next unused channel id.
    ///
    /// Ids are handed out from 1 upwards. Both ends must open their channels
    /// in the same order for the ids to line up.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::ConnectionClosed` after [`Connection::close`],
    /// or `ChannelError::ChannelIdsExhausted`.
    pub async fn open_channel_with_handler(
        &self,
        kind: ChannelKind,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Channel, ChannelError> {
        if !self.is_running() {
            return Err(ChannelError::ConnectionClosed);
        }

        let mut state = self.inner.state.lock().await;
        let channel_id = state.allocate_channel_id()?;

        let (channel_state, retransmit_task) = match kind {
            ChannelKind::Unreliable => (
                ChannelState::Unreliable(UnreliableChannel::new(channel_id)),
                None,
            ),
            ChannelKind::Reliable => {
                let reliable = ReliableChannel::new(channel_id, self.inner.config.reliable.clone());
                let task = tokio::spawn(retransmit_loop(
                    Arc::downgrade(&self.inner),
                    channel_id,
                    self.inner.config.reliable.retransmit_tick,
                ));
                (ChannelState::Reliable(reliable), Some(task))
            }
        };

        state.channels.insert(
            channel_id,
            ChannelEntry {
                info: ChannelInfo {
                    peer_id: self.inner.peer_id.clone(),
                    channel_id,
                    kind,
                },
                state: channel_state,
                handler,
                retransmit_task,
            },
        );

        tracing::debug!(
            "Opened {} channel {} to {}",
            kind,
            channel_id,
            self.inner.peer_id
        );

        Ok(Channel {
            id: channel_id,
            kind,
            connection: Arc::downgrade(&self.inner),
        })
    }

    /// Handle for an already-open channel
    pub async fn channel(&self, channel_id: u16) -> Option<Channel> {
        let state = self.inner.state.lock().await;
        state.channels.get(&channel_id).map(|entry| Channel {
            id: channel_id,
            kind: entry.info.kind,
            connection: Arc::downgrade(&self.inner),
        })
    }

    /// Snapshots of every channel, ordered by id
    pub async fn channels(&self) -> Vec<ChannelSnapshot> {
        let state = self.inner.state.lock().await;
        let mut snapshots: Vec<ChannelSnapshot> = state.channels.values().map(snapshot).collect();
        snapshots.sort_by_key(|s| s.channel_id);
        snapshots
    }

    /// Close the connection.
    ///
    /// Stops the receive loop and every retransmit timer, closes all
    /// channels and the transport. Later sends fail with
    /// `ChannelError::ConnectionClosed`. Closing twice is a no-op.
    pub async fn close(&self) {
        self.inner.shutdown(CloseReason::Local).await;
    }

    /// Whether the connection is still open
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// Why the connection stopped, `None` while it is running
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.closed.borrow()
    }

    /// Resolves once the connection has stopped.
    ///
    /// The returned future does not keep the connection alive; if every
    /// handle is dropped without a close it resolves to
    /// [`CloseReason::Local`].
    pub fn closed(&self) -> impl Future<Output = CloseReason> + Send + 'static {
        let mut rx = self.inner.closed.subscribe();
        async move {
            match rx.wait_for(Option::is_some).await {
                Ok(reason) => (*reason).unwrap_or(CloseReason::Local),
                Err(_) => CloseReason::Local,
            }
        }
    }

    /// Largest payload a single send accepts
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.inner.max_payload()
    }

    /// Time since the last datagram from the peer
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.inner.silence()
    }

    /// Peer address datagrams are accepted from
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Peer identifier
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the address cannot be determined.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.transport.local_addr()
    }

    /// Transport statistics
    #[must_use]
    pub fn stats(&self) -> TransportStats {
        self.inner.transport.stats()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_id", &self.inner.peer_id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("running", &self.is_running())
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

fn snapshot(entry: &ChannelEntry) -> ChannelSnapshot {
    let (next_seq_out, next_seq_in, pending, buffered) = match &entry.state {
        ChannelState::Unreliable(c) => (c.next_seq_out(), c.next_seq_in(), 0, 0),
        ChannelState::Reliable(c) => (
            c.next_seq_out(),
            c.next_seq_in(),
            c.pending_count(),
            c.buffered_count(),
        ),
    };
    ChannelSnapshot {
        channel_id: entry.info.channel_id,
        kind: entry.info.kind,
        next_seq_out,
        next_seq_in,
        pending,
        buffered,
        closed: entry.is_closed(),
    }
}

/// Handle to one channel of a [`Connection`].
///
/// Holds no strong reference to the connection.
#[derive(Clone)]
pub struct Channel {
    id: u16,
    kind: ChannelKind,
    connection: Weak<ConnectionInner>,
}

impl Channel {
    /// Channel id
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Channel variant
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn connection(&self) -> Result<Arc<ConnectionInner>, ChannelError> {
        match self.connection.upgrade() {
            Some(inner) if inner.is_running() => Ok(inner),
            _ => Err(ChannelError::ConnectionClosed),
        }
    }

    /// Send `data`, returning the sequence number it was given.
    ///
    /// Unreliable: transmitted once, an error means the datagram did not
    /// leave. Reliable: the payload is accepted once it is queued; a failed
    /// first transmission is left to the retransmit timer. Success never
    /// means the peer received it.
    ///
    /// # Errors
    ///
    /// `ChannelError::Closed` or `ChannelError::ConnectionClosed` once closed;
    /// `ChannelError::PayloadTooLarge` if the datagram would not fit the
    /// receive buffer; `ChannelError::Transport` if an unreliable datagram
    /// could not be sent.
    pub async fn send(&self, data: &[u8]) -> Result<u32, ChannelError> {
        let inner = self.connection()?;
        let max = inner.max_payload();
        if data.len() > max {
            return Err(ChannelError::PayloadTooLarge {
                len: data.len(),
                max,
            });
        }
        let mut state = inner.state.lock().await;
        let entry = state
            .channels
            .get_mut(&self.id)
            .ok_or(ChannelError::Closed(self.id))?;

        // The lock stays held across the send so datagrams leave in
        // sequence order.
        match &mut entry.state {
            ChannelState::Unreliable(channel) => {
                let (seq, bytes) = channel.prepare_send(data)?;
                inner.transport.send_to(&bytes, inner.peer_addr).await?;
                Ok(seq)
            }
            ChannelState::Reliable(channel) => {
                let (seq, bytes) = channel.prepare_send(data, Instant::now())?;
                match inner.transport.send_to(&bytes, inner.peer_addr).await {
                    Ok(_) => {}
                    Err(TransportError::Closed) => return Err(ChannelError::ConnectionClosed),
                    Err(e) => tracing::debug!(
                        "First transmission of {} on channel {} failed, will retransmit: {}",
                        seq,
                        self.id,
                        e
                    ),
                }
                Ok(seq)
            }
        }
    }

    /// Install or replace the handler payloads are delivered to.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Closed` or `ChannelError::ConnectionClosed`.
    pub async fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<(), ChannelError> {
        let inner = self.connection()?;
        let mut state = inner.state.lock().await;
        match state.channels.get_mut(&self.id) {
            Some(entry) if !entry.is_closed() => {
                entry.handler = Some(handler);
                Ok(())
            }
            _ => Err(ChannelError::Closed(self.id)),
        }
    }

    /// Close this channel; the rest of the connection is unaffected.
    ///
    /// Pending reliable packets are abandoned without delivery-failure
    /// callbacks. The id is not reused.
    pub async fn close(&self) {
        let Some(inner) = self.connection.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().await;
        if let Some(entry) = state.channels.get_mut(&self.id) {
            entry.close();
            tracing::debug!("Closed channel {} to {}", self.id, inner.peer_id);
        }
    }

    /// Current counters, `None` once the connection is gone
    pub async fn snapshot(&self) -> Option<ChannelSnapshot> {
        let inner = self.connection.upgrade()?;
        let state = inner.state.lock().await;
        state.channels.get(&self.id).map(snapshot)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl ConnectionInner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn max_payload(&self) -> usize {
        self.config.recv_buffer_size.saturating_sub(HEADER_SIZE)
    }

    fn touch(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_heard_ms.store(now, Ordering::Relaxed);
    }

    fn silence(&self) -> Duration {
        let last = Duration::from_millis(self.last_heard_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Stop everything and publish `reason`. Returns `false` if the
    /// connection was already closed.
    async fn shutdown(&self, reason: CloseReason) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }

        {
            let mut state = self.state.lock().await;
            for entry in state.channels.values_mut() {
                entry.close();
            }
            if let Some(task) = state.recv_task.take() {
                task.abort();
            }
        }

        if let Err(e) = self.transport.close().await {
            tracing::debug!("Error closing transport to {}: {}", self.peer_id, e);
        }
        self.closed.send_replace(Some(reason));
        tracing::info!("Connection to {} {}", self.peer_id, reason);
        true
    }

    /// Process one datagram completely: validate, route, acknowledge, deliver.
    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if from != self.peer_addr {
            tracing::trace!("Discarding {} bytes from unexpected {}", data.len(), from);
            return;
        }
        self.touch();

        if let Some(probe) = Probe::decode(data) {
            if probe.kind == ProbeKind::Probe {
                if let Err(e) = self.transport.send_to(&probe.reply().encode(), from).await {
                    tracing::debug!("Failed to answer late probe from {}: {}", from, e);
                }
            }
            return;
        }

        let packet = match Packet::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!("Discarding malformed packet from {}: {}", from, e);
                return;
            }
        };

        let (info, handler, ack, delivered) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.channels.get_mut(&packet.channel_id) else {
                tracing::trace!("Discarding packet for unknown channel {}", packet.channel_id);
                return;
            };

            let (ack, delivered) = match &mut entry.state {
                ChannelState::Unreliable(channel) => {
                    if channel.on_receive(&packet) {
                        (None, vec![packet.payload.to_vec()])
                    } else {
                        tracing::trace!(
                            "Dropping stale seq {} on channel {}",
                            packet.seq_num,
                            packet.channel_id
                        );
                        (None, Vec::new())
                    }
                }
                ChannelState::Reliable(channel) => {
                    let outcome = channel.on_receive(&packet);
                    (outcome.ack, outcome.delivered)
                }
            };
            (entry.info.clone(), entry.handler.clone(), ack, delivered)
        };

        if let Some(ack) = ack {
            if let Err(e) = self.transport.send_to(&ack, self.peer_addr).await {
                tracing::debug!(
                    "Failed to ACK seq {} on channel {}: {}",
                    packet.seq_num,
                    packet.channel_id,
                    e
                );
            }
        }

        if delivered.is_empty() {
            return;
        }
        let Some(handler) = handler else {
            tracing::trace!(
                "No handler on channel {}, dropping {} payload(s)",
                info.channel_id,
                delivered.len()
            );
            return;
        };

        for payload in delivered {
            deliver(&handler, &info, payload).await;
        }
    }
}

/// Run one handler call in its own task so a panic is contained like an error.
async fn deliver(handler: &Arc<dyn MessageHandler>, info: &ChannelInfo, payload: Vec<u8>) {
    let handler = Arc::clone(handler);
    let task_info = info.clone();
    let call = tokio::spawn(async move { handler.on_message(&task_info, payload).await });

    match call.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(
            "Message handler for channel {} of {} failed: {}",
            info.channel_id,
            info.peer_id,
            e
        ),
        Err(e) => tracing::warn!(
            "Message handler for channel {} of {} panicked: {}",
            info.channel_id,
            info.peer_id,
            e
        ),
    }
}

/// Report an undeliverable packet, containing a panic the same way.
async fn report_failure(handler: &Arc<dyn MessageHandler>, info: &ChannelInfo, seq_num: u32) {
    let handler = Arc::clone(handler);
    let task_info = info.clone();
    let call = tokio::spawn(async move { handler.on_delivery_failed(&task_info, seq_num).await });

    if let Err(e) = call.await {
        tracing::warn!(
            "Delivery failure handler for channel {} of {} panicked: {}",
            info.channel_id,
            info.peer_id,
            e
        );
    }
}

async fn receive_loop(connection: Weak<ConnectionInner>) {
    let Some(inner) = connection.upgrade() else {
        return;
    };
    let transport = Arc::clone(&inner.transport);
    let peer = inner.peer_addr;
    let poll_interval = inner.config.recv_poll_interval;
    let error_backoff = inner.config.error_backoff;
    let limit = inner.config.recv_buffer_size;
    // One spare byte tells a datagram that fits exactly from a truncated one
    let mut buf = vec![0u8; limit + 1];
    drop(inner);

    loop {
        match connection.upgrade() {
            Some(inner) if inner.is_running() => {}
            _ => break,
        }

        let received = transport.recv_timeout(&mut buf, poll_interval).await;

        let Some(inner) = connection.upgrade() else {
            break;
        };
        if !inner.is_running() {
            break;
        }

        match received {
            Ok(Some((len, from))) if len > limit => {
                tracing::debug!("Discarding oversized datagram from {} (over {} bytes)", from, limit);
            }
            Ok(Some((len, from))) => inner.handle_datagram(&buf[..len], from).await,
            Ok(None) => {}
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::warn!("Receive error on connection to {}: {}", peer, e);
                drop(inner);
                tokio::time::sleep(error_backoff).await;
            }
        }
    }

    tracing::debug!("Receive loop for {} stopped", peer);
}

async fn retransmit_loop(connection: Weak<ConnectionInner>, channel_id: u16, tick: std::time::Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(inner) = connection.upgrade() else {
            break;
        };
        if !inner.is_running() {
            break;
        }

        let (plan, info, handler) = {
            let mut state = inner.state.lock().await;
            let Some(entry) = state.channels.get_mut(&channel_id) else {
                break;
            };
            let ChannelState::Reliable(channel) = &mut entry.state else {
                break;
            };
            if channel.is_closed() {
                break;
            }
            let plan = channel.poll_retransmits(Instant::now());
            (plan, entry.info.clone(), entry.handler.clone())
        };

        for bytes in &plan.resend {
            if let Err(e) = inner.transport.send_to(bytes, inner.peer_addr).await {
                tracing::debug!("Retransmission on channel {} failed: {}", channel_id, e);
            }
        }
        if !plan.resend.is_empty() {
            tracing::trace!(
                "Retransmitted {} packet(s) on channel {}",
                plan.resend.len(),
                channel_id
            );
        }

        for seq_num in plan.dropped {
            tracing::warn!(
                "Reliable seq {} on channel {} to {} dropped after {} retransmissions",
                seq_num,
                channel_id,
                info.peer_id,
                inner.config.reliable.max_retransmits
            );
            if let Some(handler) = &handler {
                report_failure(handler, &info, seq_num).await;
            }
        }
    }
}

async fn keepalive_loop(connection: Weak<ConnectionInner>, tick: Duration) {
    let nonce: u64 = rand::random();
    let mut sent: u32 = 0;
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(inner) = connection.upgrade() else {
            break;
        };
        if !inner.is_running() {
            break;
        }

        if let Some(timeout) = inner.config.peer_timeout {
            let silence = inner.silence();
            if silence >= timeout {
                tracing::warn!(
                    "Nothing from {} ({}) for {:?}, closing",
                    inner.peer_id,
                    inner.peer_addr,
                    silence
                );
                inner.shutdown(CloseReason::PeerTimeout).await;
                break;
            }
        }

        if inner.config.keepalive_interval.is_some() {
            let probe = Probe::new(nonce, sent).encode();
            sent = sent.wrapping_add(1);
            match inner.transport.send_to(&probe, inner.peer_addr).await {
                Ok(_) => {}
                Err(TransportError::Closed) => break,
                Err(e) => tracing::trace!("Keepalive to {} failed: {}", inner.peer_addr, e),
            }
        }
    }
}
