//! Packet encoding and decoding for the channel wire format.
//!
//! ```text
//!  0        1        2        3        4        5        6        7...
//! +--------+--------+--------+--------+--------+--------+--------+-------
//! | flags  |   channel_id    |              seq_num             | payload
//! +--------+--------+--------+--------+--------+--------+--------+-------
//! ```
//!
//! All multi-byte fields are big-endian. Bit 0 of `flags` marks an ACK,
//! which carries an empty payload; the remaining bits are reserved and
//! sent as zero.

use crate::HEADER_SIZE;
use crate::error::PacketError;

/// Packet flags bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Acknowledgment of `seq_num` on `channel_id`
    pub const ACK: u8 = 0b0000_0001;

    /// Create new empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Add ACK flag
    #[must_use]
    pub fn with_ack(mut self) -> Self {
        self.0 |= Self::ACK;
        self
    }

    /// Check if ACK is set
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// Get raw byte value
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl From<u8> for PacketFlags {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

/// Zero-copy packet view into a datagram buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    /// Header flags
    pub flags: PacketFlags,
    /// Destination channel
    pub channel_id: u16,
    /// Per-channel sequence number
    pub seq_num: u32,
    /// Application payload (empty for ACKs)
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Parse a packet from raw bytes.
    ///
    /// Everything after the header is payload.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::TooShort` if `data` is shorter than the header.
    pub fn parse(data: &'a [u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        Ok(Self {
            flags: PacketFlags(data[0]),
            channel_id: u16::from_be_bytes([data[1], data[2]]),
            seq_num: u32::from_be_bytes([data[3], data[4], data[5], data[6]]),
            payload: &data[HEADER_SIZE..],
        })
    }

    /// Parse, discarding the failure reason
    #[must_use]
    pub fn decode(data: &'a [u8]) -> Option<Self> {
        Self::parse(data).ok()
    }

    /// Whether this packet acknowledges `seq_num`
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.flags.is_ack()
    }

    /// Serialize header and payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        encode(self.channel_id, self.seq_num, self.payload, self.flags)
    }
}

/// Encode a packet: 7-byte header followed by `payload`.
#[must_use]
pub fn encode(channel_id: u16, seq_num: u32, payload: &[u8], flags: PacketFlags) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(flags.as_u8());
    buf.extend_from_slice(&channel_id.to_be_bytes());
    buf.extend_from_slice(&seq_num.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encode an ACK for `seq_num` on `channel_id`.
#[must_use]
pub fn encode_ack(channel_id: u16, seq_num: u32) -> Vec<u8> {
    encode(channel_id, seq_num, &[], PacketFlags::new().with_ack())
}
