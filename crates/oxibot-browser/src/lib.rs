//! Browser automation for Oxibot — drives a Chromium-family browser over the
//! Chrome DevTools Protocol (CDP) and exposes a ref-based element model
//! (accessibility tree first, DOM-walk fallback) to a tool-calling agent.

pub mod cdp;
pub mod controller;
pub mod error;
pub mod manager;
pub mod snapshot;

pub use controller::BrowserController;
pub use error::BrowserError;
pub use manager::{BrowserBrand, BrowserManager, LaunchOptions};
pub use snapshot::{RefEntry, RefMap};
