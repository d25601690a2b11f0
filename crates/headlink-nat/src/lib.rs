//! # headlink NAT traversal
//!
//! Everything needed to turn a freshly bound UDP socket into a validated path
//! to a peer:
//! - [`stun`]: RFC 5389 Binding request/response subset and a caching client
//! - [`gather`]: host and server-reflexive candidate gathering
//! - [`hole_punch`]: probe exchange that opens NAT bindings in both directions
//!
//! The socket lives inside a [`headlink_transport::UdpTransport`] from the
//! moment it is gathered until either a connection takes it over or the
//! handshake fails and it is dropped.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod gather;
pub mod hole_punch;
pub mod stun;

pub use gather::{Candidate, CandidateGatherer, CandidateType, GatherError};
pub use hole_punch::{HolePuncher, PunchConfig};
pub use stun::{StunClient, StunConfig, StunError};
