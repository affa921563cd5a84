//! Tool modules for Oxibot agent.

pub mod base;
pub mod registry;
pub mod filesystem;
pub mod shell;
pub mod web;
pub mod message;
pub mod spawn;
pub mod browser;
pub mod cron;
pub mod image_generate;
pub mod session;

pub use base::{Tool, require_string, optional_string, optional_i64, optional_bool};
pub use browser::BrowserTool;
pub use cron::CronTool;
pub use image_generate::ImageGenerateTool;
pub use registry::ToolRegistry;
pub use session::SessionTool;
