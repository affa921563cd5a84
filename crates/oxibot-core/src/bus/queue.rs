//! Async message bus — the central nervous system of Oxibot.
//!
//! Bounded FIFO message bus with timeout-based consume.
//! Uses tokio::sync::mpsc bounded channels.

use super::types::{InboundMessage, OutboundMessage};
use std::time::Duration;
use tokio::sync::mpsc;

/// Error returned by the bus's timeout-bounded consume operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// No message arrived within the given timeout. Expected at every poll;
    /// callers loop and recheck their running flag.
    #[error("timed out waiting for a message")]
    Timeout,
    /// All senders were dropped; the bus is permanently empty.
    #[error("bus closed")]
    Closed,
}

/// The message bus connecting channels ↔ agent loop.
///
/// - Channels publish to `inbound` (user messages arriving)
/// - Agent loop consumes from `inbound`, processes, publishes to `outbound`
/// - Channel manager consumes from `outbound` and routes to correct channel
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl MessageBus {
    /// Create a new message bus with the given buffer capacity.
    pub fn new(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer_size);

        MessageBus {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        }
    }

    /// Publish a message from a channel to the agent (inbound).
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), mpsc::error::SendError<InboundMessage>> {
        self.inbound_tx.send(msg).await
    }

    /// Consume the next inbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await
    }

    /// Consume the next inbound message, bounded by `timeout`.
    ///
    /// Used by the agent loop's poll-and-recheck-running-flag pattern
    /// (default timeout 1s) so `stop()` is noticed promptly.
    pub async fn consume_inbound_timeout(&self, timeout: Duration) -> Result<InboundMessage, BusError> {
        let mut rx = self.inbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// Publish a response from the agent to a channel (outbound).
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.outbound_tx.send(msg).await
    }

    /// Consume the next outbound message (blocks until available).
    /// Returns None if all senders are dropped.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        let mut rx = self.outbound_rx.lock().await;
        rx.recv().await
    }

    /// Consume the next outbound message, bounded by `timeout`.
    pub async fn consume_outbound_timeout(&self, timeout: Duration) -> Result<OutboundMessage, BusError> {
        let mut rx = self.outbound_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// Get a clone of the inbound sender (for channels to use).
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Get a clone of the outbound sender (for the agent loop to use).
    pub fn outbound_sender(&self) -> mpsc::Sender<OutboundMessage> {
        self.outbound_tx.clone()
    }
}
