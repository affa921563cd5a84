//! Message bus — in-process inbound/outbound queues connecting channels to
//! the agent loop.
//!
//! Message bus: queue primitives and the message envelope types.

pub mod queue;
pub mod types;

pub use queue::MessageBus;
pub use types::{InboundMessage, OutboundMessage};
