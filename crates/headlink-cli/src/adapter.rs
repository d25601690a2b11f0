//! Stdio signaling adapter.
//!
//! Signaling messages travel as newline-delimited JSON: inbound on stdin,
//! outbound on stdout. Logs go to stderr so stdout stays machine-readable.
//! A line of the form `send <text>` is not signaling: it sends `<text>` on
//! the reliable channel of the current connection.

use async_trait::async_trait;
use headlink_core::{Channel, ChannelEvent, ChannelKind};
use headlink_signaling::{
    HandshakeStatus, Session, SessionConfig, SessionEvent, SignalMessage, SignalingError,
    SignalingSink,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Writes signaling messages to stdout, one JSON object per line
pub struct StdoutSink {
    stdout: Mutex<tokio::io::Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalingSink for StdoutSink {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        let mut line = message.to_json()?;
        line.push('\n');

        let mut stdout = self.stdout.lock().await;
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SignalingError::Sink(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| SignalingError::Sink(e.to_string()))
    }
}

/// One line read from stdin
#[derive(Debug, PartialEq, Eq)]
pub enum InputLine<'a> {
    /// Payload for the reliable channel
    Send(&'a str),
    /// Stop the session
    Quit,
    /// Blank line
    Empty,
    /// Anything else is handed to the session as signaling JSON
    Signal(&'a str),
}

impl<'a> InputLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        if line == "quit" {
            return Self::Quit;
        }
        match line.strip_prefix("send ") {
            Some(text) => Self::Send(text),
            None => Self::Signal(line),
        }
    }
}

/// Periodic sample streamed on the unreliable channel
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySample {
    /// Sample counter
    pub sample: u64,
    /// Milliseconds since the stream started
    pub elapsed_ms: u64,
}

/// Send a telemetry sample every `period` until the channel closes
pub async fn stream_telemetry(channel: Channel, period: Duration) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    for sample in 0u64.. {
        ticker.tick().await;
        let payload = TelemetrySample {
            sample,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode telemetry: {}", e);
                continue;
            }
        };
        if let Err(e) = channel.send(&bytes).await {
            tracing::debug!("Telemetry stream stopped: {}", e);
            break;
        }
    }
}

/// Active link to the peer
struct Link {
    peer_id: String,
    channels: Vec<Channel>,
    telemetry: Option<JoinHandle<()>>,
}

impl Link {
    fn channel(&self, kind: ChannelKind) -> Option<&Channel> {
        self.channels.iter().find(|c| c.kind() == kind)
    }

    fn stop(&mut self) {
        if let Some(task) = self.telemetry.take() {
            task.abort();
        }
    }
}

/// Run a signaling session over stdio until `quit` or Ctrl+C
pub async fn run_session(
    config: SessionConfig,
    initiate: Option<String>,
    telemetry: Option<Duration>,
) -> anyhow::Result<()> {
    let (deliveries, mut delivered) = mpsc::unbounded_channel::<ChannelEvent>();
    let (session, mut events) =
        Session::new(config, Arc::new(StdoutSink::new()), Some(Arc::new(deliveries)));
    tracing::info!("Session {} ready on stdio", session.local_uid());

    if let Some(peer) = initiate {
        report_status(&peer, session.initiate(&peer).await?);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut link: Option<Link> = None;

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match InputLine::parse(&line) {
                    InputLine::Quit => break,
                    InputLine::Empty => {}
                    InputLine::Send(text) => send_command(link.as_ref(), text).await,
                    InputLine::Signal(text) => match session.handle_text(text).await {
                        Ok(HandshakeStatus::Ignored) => {}
                        Ok(status) => tracing::debug!("Signaling status: {:?}", status),
                        Err(e) => tracing::warn!("Bad signaling input: {}", e),
                    },
                },
                None => {
                    tracing::info!("stdin closed, signaling input stopped");
                    stdin_open = false;
                }
            },
            Some(event) = events.recv() => match event {
                SessionEvent::Connected { peer_id, connection, channels } => {
                    tracing::info!("Link to {} up via {}", peer_id, connection.peer_addr());
                    if let Some(mut old) = link.take() {
                        old.stop();
                    }
                    let stream = channels.iter().find(|c| c.kind() == ChannelKind::Unreliable);
                    let telemetry_task = match (telemetry, stream) {
                        (Some(period), Some(channel)) => {
                            Some(tokio::spawn(stream_telemetry(channel.clone(), period)))
                        }
                        _ => None,
                    };
                    link = Some(Link { peer_id, channels, telemetry: telemetry_task });
                }
                SessionEvent::Failed { peer_id, reason } => {
                    tracing::warn!("Handshake with {} failed: {}", peer_id, reason);
                }
                SessionEvent::Closed { peer_id } => {
                    if link.as_ref().is_some_and(|l| l.peer_id == peer_id) {
                        if let Some(mut old) = link.take() {
                            old.stop();
                        }
                    }
                }
            },
            Some(event) = delivered.recv() => match event {
                ChannelEvent::Message { channel, payload } => {
                    tracing::info!(
                        "{} [{} {}] {}",
                        channel.peer_id,
                        channel.kind,
                        channel.channel_id,
                        String::from_utf8_lossy(&payload)
                    );
                }
                ChannelEvent::DeliveryFailed { channel, seq_num } => {
                    tracing::warn!(
                        "Delivery of seq {} to {} on channel {} failed",
                        seq_num,
                        channel.peer_id,
                        channel.channel_id
                    );
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    if let Some(mut link) = link.take() {
        link.stop();
    }
    session.shutdown().await;
    Ok(())
}

async fn send_command(link: Option<&Link>, text: &str) {
    let Some(channel) = link.and_then(|l| l.channel(ChannelKind::Reliable)) else {
        tracing::warn!("No reliable channel to send on");
        return;
    };
    match channel.send(text.as_bytes()).await {
        Ok(seq) => tracing::debug!("Sent seq {} ({} bytes)", seq, text.len()),
        Err(e) => tracing::warn!("Send failed: {}", e),
    }
}

fn report_status(peer: &str, status: HandshakeStatus) {
    match status {
        HandshakeStatus::Failed(reason) => tracing::warn!("Handshake with {} failed: {}", peer, reason),
        status => tracing::debug!("Handshake with {}: {:?}", peer, status),
    }
}
