//! Bus event types — messages flowing between channels and the agent loop.
//!
//! Inbound/outbound message envelope types.

use crate::types::MediaAttachment;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// An inbound message from a channel to the agent.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    /// Channel name (e.g. "telegram", "discord", "cli").
    pub channel: String,
    /// Sender identifier within the channel.
    pub sender_id: String,
    /// Chat/conversation identifier.
    pub chat_id: String,
    /// Text content of the message.
    pub content: String,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Attached media (photos, voice, documents).
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata (e.g. message_id, username).
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    /// Create a new inbound message with minimal required fields.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        InboundMessage {
            channel: channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Session key combining channel and chat_id (e.g. "telegram:123456").
    ///
    /// Used as the key for session persistence and history lookup.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// An outbound message from the agent to a channel.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target channel name.
    pub channel: String,
    /// Target chat/conversation identifier.
    pub chat_id: String,
    /// Text content to send.
    pub content: String,
    /// Optional message ID to reply to.
    pub reply_to: Option<String>,
    /// Attached media to send.
    pub media: Vec<MediaAttachment>,
    /// Channel-specific metadata.
    pub metadata: HashMap<String, String>,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        OutboundMessage {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            reply_to: None,
            media: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}
