//! Application hook for delivered payloads.

use crate::channel::ChannelKind;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Error returned by a [`MessageHandler`]; logged by the connection, never propagated
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Identifies the channel a callback is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Peer the connection talks to
    pub peer_id: String,
    /// Channel id within the connection
    pub channel_id: u16,
    /// Channel variant
    pub kind: ChannelKind,
}

/// Receives payloads delivered by a channel.
///
/// Calls for one connection are made one at a time from its receive loop,
/// in the channel's delivery order. A slow handler delays every channel of
/// that connection, so long work belongs in a spawned task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// A payload was delivered.
    ///
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored; channel state is unaffected.
    async fn on_message(&self, channel: &ChannelInfo, payload: Vec<u8>) -> Result<(), HandlerError>;

    /// A reliable send was dropped after exhausting its retransmissions.
    async fn on_delivery_failed(&self, channel: &ChannelInfo, seq_num: u32) {
        let _ = (channel, seq_num);
    }
}

/// Event form of the handler callbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Payload delivered
    Message {
        /// Source channel
        channel: ChannelInfo,
        /// Delivered bytes
        payload: Vec<u8>,
    },
    /// Reliable send dropped
    DeliveryFailed {
        /// Source channel
        channel: ChannelInfo,
        /// Sequence number that was given up on
        seq_num: u32,
    },
}

#[async_trait]
impl MessageHandler for mpsc::UnboundedSender<ChannelEvent> {
    async fn on_message(&self, channel: &ChannelInfo, payload: Vec<u8>) -> Result<(), HandlerError> {
        self.send(ChannelEvent::Message {
            channel: channel.clone(),
            payload,
        })
        .map_err(|_| "channel event receiver dropped".into())
    }

    async fn on_delivery_failed(&self, channel: &ChannelInfo, seq_num: u32) {
        let _ = self.send(ChannelEvent::DeliveryFailed {
            channel: channel.clone(),
            seq_num,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ChannelInfo {
        ChannelInfo {
            peer_id: "head".to_string(),
            channel_id: 1,
            kind: ChannelKind::Reliable,
        }
    }

    #[tokio::test]
    async fn test_sender_handler_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.on_message(&info(), b"hi".to_vec()).await.unwrap();
        tx.on_delivery_failed(&info(), 7).await;

        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::Message {
                channel: info(),
                payload: b"hi".to_vec(),
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ChannelEvent::DeliveryFailed {
                channel: info(),
                seq_num: 7,
            })
        );
    }

    #[tokio::test]
    async fn test_sender_handler_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(tx.on_message(&info(), vec![]).await.is_err());
    }
}
