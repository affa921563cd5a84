//! Oxibot Core — message bus, session store, shared types, and configuration.
//!
//! This crate has no dependency on any concrete LLM provider or channel
//! transport; it is the substrate the rest of the workspace builds on.

pub mod bus;
pub mod config;
pub mod heartbeat;
pub mod session;
pub mod types;
pub mod utils;

pub use bus::{InboundMessage, MessageBus, OutboundMessage};
pub use config::Config;
pub use session::SessionManager;
pub use types::{Message, Session, ToolCall, ToolDefinition};
