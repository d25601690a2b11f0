//! Channel state machines.
//!
//! Channels own sequencing, acknowledgment and reassembly state but never
//! touch a socket: sending produces encoded datagrams for the connection to
//! transmit, receiving consumes parsed packets and yields payloads ready for
//! the application. The connection drives them from its receive loop and
//! retransmit timers.
//!
//! Sequence numbers wrap modulo 2^32 and are compared with serial-number
//! arithmetic (RFC 1982), so ordering holds across the wrap as long as the
//! two numbers are less than 2^31 apart.

use crate::config::ReliableConfig;
use crate::error::ChannelError;
use crate::packet::{self, Packet, PacketFlags};
use std::collections::{BTreeMap, VecDeque};
use tokio::time::Instant;

/// Channel variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Best effort, freshest sample wins
    Unreliable,
    /// Acknowledged, retransmitted, delivered in order
    Reliable,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreliable => write!(f, "unreliable"),
            Self::Reliable => write!(f, "reliable"),
        }
    }
}

/// `a` precedes `b` in serial-number order
#[inline]
#[must_use]
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Unreliable channel state.
///
/// `next_seq_in` is a high-water mark: a packet is accepted only if its
/// sequence number is at or beyond the mark, and accepting it moves the mark
/// past it. Gaps are fine, stale or duplicate packets are dropped.
#[derive(Debug, Clone)]
pub struct UnreliableChannel {
    channel_id: u16,
    next_seq_out: u32,
    next_seq_in: u32,
    closed: bool,
}

impl UnreliableChannel {
    /// Create channel state for `channel_id`
    #[must_use]
    pub fn new(channel_id: u16) -> Self {
        Self {
            channel_id,
            next_seq_out: 0,
            next_seq_in: 0,
            closed: false,
        }
    }

    /// Channel id
    #[must_use]
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Sequence number the next send will use
    #[must_use]
    pub fn next_seq_out(&self) -> u32 {
        self.next_seq_out
    }

    /// Lowest sequence number that will still be accepted
    #[must_use]
    pub fn next_seq_in(&self) -> u32 {
        self.next_seq_in
    }

    /// Whether the channel has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Allocate the next sequence number and encode `data` under it.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Closed` if the channel is closed.
    pub fn prepare_send(&mut self, data: &[u8]) -> Result<(u32, Vec<u8>), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.channel_id));
        }
        let seq = self.next_seq_out;
        self.next_seq_out = seq.wrapping_add(1);
        Ok((seq, packet::encode(self.channel_id, seq, data, PacketFlags::new())))
    }

    /// Apply an inbound packet, returning `true` if its payload should be delivered.
    pub fn on_receive(&mut self, packet: &Packet<'_>) -> bool {
        if self.closed || packet.is_ack() {
            return false;
        }
        if seq_before(packet.seq_num, self.next_seq_in) {
            return false;
        }
        self.next_seq_in = packet.seq_num.wrapping_add(1);
        true
    }

    /// Close the channel
    pub fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug, Clone)]
struct PendingPacket {
    seq_num: u32,
    bytes: Vec<u8>,
    sent_at: Instant,
    retransmit_count: u32,
}

/// Result of feeding one inbound packet to a [`ReliableChannel`]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReliableReceive {
    /// ACK datagram to send back (data packets only)
    pub ack: Option<Vec<u8>>,
    /// Payloads now deliverable, in sequence order
    pub delivered: Vec<Vec<u8>>,
}

/// Work produced by one retransmit timer tick
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetransmitPlan {
    /// Datagrams to send again, oldest sequence number first
    pub resend: Vec<Vec<u8>>,
    /// Sequence numbers that ran out of retransmissions
    pub dropped: Vec<u32>,
}

impl RetransmitPlan {
    /// Nothing to do
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resend.is_empty() && self.dropped.is_empty()
    }
}

/// Reliable channel state.
///
/// Outbound packets stay pending until acknowledged or until their
/// retransmit budget runs out. Inbound data within the reorder window is
/// acknowledged, buffered when it arrives early and released strictly in
/// sequence order.
#[derive(Debug, Clone)]
pub struct ReliableChannel {
    channel_id: u16,
    next_seq_out: u32,
    next_seq_in: u32,
    closed: bool,
    config: ReliableConfig,
    // Kept in send order, which is sequence order.
    pending: VecDeque<PendingPacket>,
    received: BTreeMap<u32, Vec<u8>>,
}

impl ReliableChannel {
    /// Create channel state for `channel_id`
    #[must_use]
    pub fn new(channel_id: u16, config: ReliableConfig) -> Self {
        Self {
            channel_id,
            next_seq_out: 0,
            next_seq_in: 0,
            closed: false,
            config,
            pending: VecDeque::new(),
            received: BTreeMap::new(),
        }
    }

    /// Channel id
    #[must_use]
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Retransmission settings
    #[must_use]
    pub fn config(&self) -> &ReliableConfig {
        &self.config
    }

    /// Sequence number the next send will use
    #[must_use]
    pub fn next_seq_out(&self) -> u32 {
        self.next_seq_out
    }

    /// Next sequence number to be delivered
    #[must_use]
    pub fn next_seq_in(&self) -> u32 {
        self.next_seq_in
    }

    /// Whether the channel has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of unacknowledged outbound packets
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether `seq_num` is still awaiting an ACK
    #[must_use]
    pub fn is_pending(&self, seq_num: u32) -> bool {
        self.pending.iter().any(|p| p.seq_num == seq_num)
    }

    /// Number of early arrivals waiting for a gap to fill
    #[must_use]
    pub fn buffered_count(&self) -> usize {
        self.received.len()
    }

    /// Allocate the next sequence number, record `data` as pending and
    /// return the datagram to transmit now.
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Closed` if the channel is closed.
    pub fn prepare_send(
        &mut self,
        data: &[u8],
        now: Instant,
    ) -> Result<(u32, Vec<u8>), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed(self.channel_id));
        }
        let seq = self.next_seq_out;
        self.next_seq_out = seq.wrapping_add(1);

        let bytes = packet::encode(self.channel_id, seq, data, PacketFlags::new());
        self.pending.push_back(PendingPacket {
            seq_num: seq,
            bytes: bytes.clone(),
            sent_at: now,
            retransmit_count: 0,
        });
        Ok((seq, bytes))
    }

    /// Apply an inbound packet.
    ///
    /// An ACK retires the matching pending packet if there is one. A data
    /// packet produces an ACK unless it lies `reorder_window` or more ahead
    /// of `next_seq_in`, in which case it is ignored. Its payload is buffered
    /// unless it was already delivered, and every payload that is now
    /// contiguous with `next_seq_in` is released.
    pub fn on_receive(&mut self, packet: &Packet<'_>) -> ReliableReceive {
        if self.closed {
            return ReliableReceive::default();
        }

        if packet.is_ack() {
            self.on_ack(packet.seq_num);
            return ReliableReceive::default();
        }

        let ack = Some(packet::encode_ack(self.channel_id, packet.seq_num));
        if seq_before(packet.seq_num, self.next_seq_in) {
            return ReliableReceive {
                ack,
                delivered: Vec::new(),
            };
        }

        // Too far ahead to buffer; the sender retransmits it once the gap closes
        if packet.seq_num.wrapping_sub(self.next_seq_in) >= self.config.reorder_window {
            return ReliableReceive::default();
        }

        self.received
            .entry(packet.seq_num)
            .or_insert_with(|| packet.payload.to_vec());

        let mut delivered = Vec::new();
        while let Some(payload) = self.received.remove(&self.next_seq_in) {
            delivered.push(payload);
            self.next_seq_in = self.next_seq_in.wrapping_add(1);
        }

        ReliableReceive { ack, delivered }
    }

    /// Retire `seq_num`, returning whether it was pending.
    pub fn on_ack(&mut self, seq_num: u32) -> bool {
        match self.pending.iter().position(|p| p.seq_num == seq_num) {
            Some(index) => {
                self.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Check pending packets against `now`.
    ///
    /// Every packet older than `ack_timeout` is either queued for
    /// retransmission with its original bytes (and its age reset) or, once it
    /// has been retransmitted `max_retransmits` times, removed and reported
    /// as dropped.
    pub fn poll_retransmits(&mut self, now: Instant) -> RetransmitPlan {
        let mut plan = RetransmitPlan::default();
        let ack_timeout = self.config.ack_timeout;
        let max_retransmits = self.config.max_retransmits;

        self.pending.retain_mut(|pending| {
            if now.saturating_duration_since(pending.sent_at) <= ack_timeout {
                return true;
            }
            if pending.retransmit_count < max_retransmits {
                pending.retransmit_count += 1;
                pending.sent_at = now;
                plan.resend.push(pending.bytes.clone());
                true
            } else {
                plan.dropped.push(pending.seq_num);
                false
            }
        });

        plan
    }

    /// Close the channel, abandoning pending and buffered packets
    pub fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        self.received.clear();
    }
}
