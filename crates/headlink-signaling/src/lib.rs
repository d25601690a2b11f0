//! # headlink Signaling
//!
//! Turns offer/answer messages from an external signaling channel into
//! connections.
//!
//! The crate never owns the signaling channel itself: inbound JSON is fed to
//! [`Session::handle_text`] (or [`Session::handle_message`]) and outbound
//! messages leave through a [`SignalingSink`]. Routing by `to_uid` /
//! `from_uid` stays with whoever carries the messages.
//!
//! ```text
//! initiator                         responder
//!   INITIATE ─► gather, answer probes
//!   OFFER ───────────────────────────► gather, punch offered candidates
//!                                      connect
//!   ◄──────────────────────────────── ANSWER, UDP_CONNECTION_RESULT
//!   punch answered candidates, connect
//!   UDP_CONNECTION_RESULT ──────────►
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod message;
pub mod registry;
pub mod session;

pub use error::SignalingError;
pub use message::SignalMessage;
pub use registry::{HandshakeRegistry, PendingHandshake, Role};
pub use session::{HandshakeStatus, Session, SessionConfig, SessionEvent, SignalingSink};
