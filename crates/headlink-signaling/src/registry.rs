//! Pending handshake registry.
//!
//! One entry per peer with a handshake in flight, holding the gathered
//! socket until it either becomes a connection or is released. The registry
//! is an ordinary value owned by a [`crate::Session`]; every insertion has a
//! matching removal on completion, failure, timeout or explicit teardown.

use headlink_nat::Candidate;
use headlink_transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Side of the handshake this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the OFFER, waits for an ANSWER
    Initiator,
    /// Received the OFFER
    Responder,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initiator => write!(f, "initiator"),
            Self::Responder => write!(f, "responder"),
        }
    }
}

/// State of one in-flight handshake
pub struct PendingHandshake {
    id: u64,
    transport: Arc<dyn Transport>,
    role: Role,
    local_candidates: Vec<Candidate>,
    probe_task: Option<JoinHandle<()>>,
}

impl PendingHandshake {
    /// Create a record for a freshly gathered socket.
    ///
    /// `id` distinguishes this attempt from later ones for the same peer.
    pub fn new(
        id: u64,
        transport: Arc<dyn Transport>,
        role: Role,
        local_candidates: Vec<Candidate>,
    ) -> Self {
        Self {
            id,
            transport,
            role,
            local_candidates,
            probe_task: None,
        }
    }

    /// Attach the task answering probes while this side waits
    #[must_use]
    pub fn with_probe_task(mut self, task: JoinHandle<()>) -> Self {
        self.probe_task = Some(task);
        self
    }

    /// Attempt id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Gathered socket
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Candidates gathered on this side
    #[must_use]
    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    /// Stop answering probes and hand the socket over to the caller
    #[must_use]
    pub fn into_transport(mut self) -> Arc<dyn Transport> {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        Arc::clone(&self.transport)
    }

    /// Let the probe task run on after this record is gone.
    ///
    /// Used from within the probe task itself, which must not abort itself
    /// while it is still cleaning up.
    pub(crate) fn detach_probe_task(&mut self) {
        self.probe_task = None;
    }

    /// Abandon the handshake and close its socket
    pub async fn release(self) {
        let transport = self.into_transport();
        if let Err(e) = transport.close().await {
            tracing::debug!("Error closing handshake socket: {}", e);
        }
    }
}

impl Drop for PendingHandshake {
    fn drop(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PendingHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandshake")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("local_addr", &self.transport.local_addr().ok())
            .field("local_candidates", &self.local_candidates)
            .finish()
    }
}

/// Pending handshakes keyed by peer id
#[derive(Debug, Default)]
pub struct HandshakeRegistry {
    entries: HashMap<String, PendingHandshake>,
}

impl HandshakeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handshakes in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handshake is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `peer_id` has a handshake in flight
    #[must_use]
    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.contains_key(peer_id)
    }

    /// Role of the handshake with `peer_id`
    #[must_use]
    pub fn role(&self, peer_id: &str) -> Option<Role> {
        self.entries.get(peer_id).map(PendingHandshake::role)
    }

    /// Peers with a handshake in flight
    #[must_use]
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.entries.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Register a handshake, returning the one it replaces.
    ///
    /// The caller is responsible for releasing the replaced entry.
    pub fn insert(
        &mut self,
        peer_id: impl Into<String>,
        handshake: PendingHandshake,
    ) -> Option<PendingHandshake> {
        self.entries.insert(peer_id.into(), handshake)
    }

    /// Remove and return the handshake with `peer_id`
    pub fn take(&mut self, peer_id: &str) -> Option<PendingHandshake> {
        self.entries.remove(peer_id)
    }

    /// Remove the handshake with `peer_id` only if it is attempt `id`.
    ///
    /// Used by timers and punch tasks, which must not remove a newer
    /// attempt that replaced theirs.
    pub fn take_if(&mut self, peer_id: &str, id: u64) -> Option<PendingHandshake> {
        if self.entries.get(peer_id).map(PendingHandshake::id) == Some(id) {
            self.entries.remove(peer_id)
        } else {
            None
        }
    }

    /// Remove every handshake
    pub fn drain(&mut self) -> Vec<(String, PendingHandshake)> {
        self.entries.drain().collect()
    }
}
