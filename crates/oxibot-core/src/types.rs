//! Core types for Oxibot — typed chat-completion message model.
//!
//! These types model the OpenAI chat completions API format used by all LLM providers.
//! Rather than untyped `list[dict]` payloads, messages here use
//! Rust enums to catch format errors at compile time instead of runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─────────────────────────────────────────────
// Messages (OpenAI chat completions format)
// ─────────────────────────────────────────────

/// A chat message in the OpenAI format.
///
/// list[dict[str, Any]]-equivalent implementation.
/// Each variant maps to a `role` field value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { content: String },

    #[serde(rename = "user")]
    User { content: MessageContent },

    #[serde(rename = "assistant")]
    Assistant {
        /// Always present in the wire payload (even as explicit `null`) —
        /// some providers reject tool-call messages that omit the key.
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
        /// Reasoning/thinking content from models like DeepSeek-R1 or Kimi.
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
        /// Names of tools invoked while producing this turn, in call order.
        /// Not part of the wire format sent back to providers — used only
        /// for session history rendering during memory consolidation.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        tools_used: Option<Vec<String>>,
    },

    #[serde(rename = "tool")]
    Tool {
        content: String,
        tool_call_id: String,
    },
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    /// Create a user message with text content.
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: MessageContent::Text(content.into()),
        }
    }

    /// Create a user message with multipart content (text + images).
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Message::User {
            content: MessageContent::Parts(parts),
        }
    }

    /// Create an assistant message with text content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: None,
            reasoning_content: None,
            tools_used: None,
        }
    }

    /// Create an assistant message with text content and a record of which
    /// tools were used to produce it (for session history / consolidation).
    pub fn assistant_with_tools(content: impl Into<String>, tools_used: Vec<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: None,
            reasoning_content: None,
            tools_used: if tools_used.is_empty() { None } else { Some(tools_used) },
        }
    }

    /// Create an assistant message with tool calls (no text content).
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Message::Assistant {
            content: None,
            tool_calls: Some(tool_calls),
            reasoning_content: None,
            tools_used: None,
        }
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
        }
    }
}

// ─────────────────────────────────────────────
// Message Content (text or multipart/vision)
// ─────────────────────────────────────────────

/// User message content — either plain text or multipart (for vision/images).
///
/// When serialized: text becomes a plain string, parts become an array of objects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content (most common case).
    Text(String),
    /// Multipart content with text and/or images (for vision models).
    Parts(Vec<ContentPart>),
}

/// A single part of a multipart message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ContentPart {
    /// Text part.
    #[serde(rename = "text")]
    Text { text: String },
    /// Image URL part (can be a URL or base64 data URI).
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

/// Image URL payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

// ─────────────────────────────────────────────
// Tool Calls (function calling)
// ─────────────────────────────────────────────

/// A tool call from the assistant, requesting execution of a function.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique ID for this tool call (used to match results).
    pub id: String,
    /// Always "function" in current OpenAI API.
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

impl ToolCall {
    /// Create a new tool call.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        ToolCall {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// The function name and arguments within a tool call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    /// Name of the function/tool to call.
    pub name: String,
    /// JSON-encoded arguments string.
    pub arguments: String,
}

// ─────────────────────────────────────────────
// Tool Definitions (for LLM requests)
// ─────────────────────────────────────────────

/// Definition of a tool, sent to the LLM so it knows what tools are available.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    /// Always "function".
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function schema.
    pub function: FunctionDefinition,
}

/// Schema of a function tool.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

// ─────────────────────────────────────────────
// LLM Response
// ─────────────────────────────────────────────

/// Response from an LLM provider after a chat completion call.
///
/// LLMResponse-equivalent implementation.
#[derive(Clone, Debug, Default)]
pub struct LlmResponse {
    /// Text content from the assistant (None if only tool calls).
    pub content: Option<String>,
    /// Tool calls requested by the assistant.
    pub tool_calls: Vec<ToolCall>,
    /// Why the model stopped generating.
    pub finish_reason: Option<String>,
    /// Token usage statistics.
    pub usage: Option<UsageInfo>,
    /// Reasoning/thinking content (DeepSeek-R1, Kimi).
    pub reasoning_content: Option<String>,
}

impl LlmResponse {
    /// Create an error response (error message as content, no tool calls).
    pub fn error(msg: impl Into<String>) -> Self {
        LlmResponse {
            content: Some(msg.into()),
            ..Default::default()
        }
    }

    /// Whether the response contains tool calls.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Token usage statistics from the LLM.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UsageInfo {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ─────────────────────────────────────────────
// Media attachments
// ─────────────────────────────────────────────

/// A media attachment (photo, voice, document) from a channel message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MediaAttachment {
    /// MIME type (e.g. "image/jpeg", "audio/ogg").
    pub mime_type: String,
    /// Local file path or URL to the media.
    pub path: String,
    /// Optional filename.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// File size in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

// ─────────────────────────────────────────────
// Provider-related types
// ─────────────────────────────────────────────

/// Raw chat completion response from an OpenAI-compatible API.
/// Used internally for deserialization.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: Option<String>,
    pub choices: Vec<ChatChoice>,
    pub usage: Option<UsageInfo>,
}

/// A single choice in a chat completion response.
#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

/// The assistant message within a chat completion choice.
#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl From<ChatCompletionResponse> for LlmResponse {
    fn from(resp: ChatCompletionResponse) -> Self {
        let choice = resp.choices.into_iter().next();
        match choice {
            Some(c) => LlmResponse {
                content: c.message.content,
                tool_calls: c.message.tool_calls.unwrap_or_default(),
                finish_reason: c.finish_reason,
                usage: resp.usage,
                reasoning_content: c.message.reasoning_content,
            },
            None => LlmResponse::error("No choices in response"),
        }
    }
}

// ─────────────────────────────────────────────
// Chat completion request (for building API calls)
// ─────────────────────────────────────────────

/// Request body for an OpenAI-compatible chat completion API.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

// ─────────────────────────────────────────────
// Session types
// ─────────────────────────────────────────────

/// A conversation session with message history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    pub messages: Vec<Message>,
    /// Per-message send/receive timestamps, parallel to `messages`.
    /// Not part of the wire format sent to providers (timestamps aren't an
    /// OpenAI chat-completions field), so they live alongside the message
    /// log rather than on `Message` itself. Invariant:
    /// `message_timestamps.len() == messages.len()` at all times.
    #[serde(default)]
    pub message_timestamps: Vec<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Index into `messages` past which entries have already been folded
    /// into long-term memory by the consolidator. Invariant:
    /// `last_consolidated_index <= messages.len()` at all times.
    #[serde(default)]
    pub last_consolidated_index: usize,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Session {
    /// Create a new empty session.
    pub fn new(key: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Session {
            key: key.into(),
            messages: Vec::new(),
            message_timestamps: Vec::new(),
            created_at: now,
            updated_at: now,
            last_consolidated_index: 0,
            metadata: HashMap::new(),
        }
    }

    /// Append a message with the current timestamp, keeping
    /// `message_timestamps` in lockstep with `messages`.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.message_timestamps.push(chrono::Utc::now());
    }

    /// Timestamp for `messages[index]`, if the parallel array is in sync.
    /// Sessions loaded from a pre-timestamp on-disk file fall back to
    /// `created_at` for every entry rather than panicking.
    pub fn timestamp_for(&self, index: usize) -> chrono::DateTime<chrono::Utc> {
        self.message_timestamps.get(index).copied().unwrap_or(self.created_at)
    }

    /// Whether this session is flagged isolated (created via `isolated:<uuid>`
    /// keys, excluded from the normal memory_window consolidation trigger).
    pub fn is_isolated(&self) -> bool {
        self.metadata.get("isolated").map(|v| v == "true").unwrap_or(false)
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
