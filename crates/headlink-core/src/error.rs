//! Error types for the headlink data path.

use headlink_transport::TransportError;
use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum Error {
    /// Packet parsing error
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// Channel error
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Packet-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Packet too short to parse
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },
}

/// Channel and connection errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel was closed
    #[error("channel {0} is closed")]
    Closed(u16),

    /// The owning connection was closed or dropped
    #[error("connection is closed")]
    ConnectionClosed,

    /// Payload plus header would not fit the peer's receive buffer
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Payload size
        len: usize,
        /// Largest payload accepted
        max: usize,
    },

    /// Every channel id is in use
    #[error("no free channel id")]
    ChannelIdsExhausted,

    /// Sending the datagram failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}
