//! # headlink Core
//!
//! The data path that runs once hole punching has produced a working
//! socket/peer pair.
//!
//! This crate provides:
//! - Packet encoding and decoding (7-byte header, zero-copy parsing)
//! - Unreliable (freshest-wins) and reliable (in-order, retransmitted) channels
//! - [`Connection`]: one socket bound to one peer, demultiplexing datagrams to channels
//!   and keeping the path alive with periodic probes
//! - The [`MessageHandler`] hook through which payloads reach the application
//!
//! ## Example
//!
//! ```rust,no_run
//! use headlink_core::{ChannelKind, Connection, ConnectionConfig};
//! use headlink_transport::UdpTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(UdpTransport::bind(([0, 0, 0, 0], 0)).await?);
//! let peer = "203.0.113.5:40000".parse()?;
//! let connection = Connection::new(transport, peer, "head-1", ConnectionConfig::default());
//! connection.start().await;
//!
//! let commands = connection.open_channel(ChannelKind::Reliable).await?;
//! let telemetry = connection.open_channel(ChannelKind::Unreliable).await?;
//! commands.send(b"arm").await?;
//! telemetry.send(&[0x10, 0x20]).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod packet;

pub use channel::{ChannelKind, ReliableChannel, UnreliableChannel};
pub use config::{ConnectionConfig, ReliableConfig};
pub use connection::{Channel, ChannelSnapshot, CloseReason, Connection};
pub use error::{ChannelError, Error, PacketError};
pub use handler::{ChannelEvent, ChannelInfo, HandlerError, MessageHandler};
pub use packet::{Packet, PacketFlags};

/// Packet header size in bytes
pub const HEADER_SIZE: usize = 7;
