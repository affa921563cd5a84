//! Error taxonomy for browser automation.
//!
//! Every public `BrowserController` method that can fail returns
//! `Result<T, BrowserError>`. At the tool boundary these are always
//! converted to a `[FAILED]`/`[ERROR]` string — they never propagate
//! past the agent loop as a hard error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser is not running (call `start` first)")]
    NotRunning,

    #[error("failed to connect to browser debug endpoint at {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("CDP method `{method}` failed: {message}")]
    Cdp { method: String, message: String },

    #[error("ref `{0}` not found in the current snapshot")]
    RefNotFound(String),

    #[error("no element matched ref `{0}` after trying all locator strategies")]
    AllStrategiesFailed(String),

    #[error("browser executable not found for `{0:?}` on this platform")]
    ExecutableNotFound(BrowserBrandName),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Separate from `manager::BrowserBrand` to avoid a dependency cycle in
/// the error module; kept in sync manually (enum is tiny and stable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserBrandName {
    Chrome,
    Brave,
    Edge,
    Chromium,
}

impl std::fmt::Display for BrowserBrandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BrowserBrandName::Chrome => "chrome",
            BrowserBrandName::Brave => "brave",
            BrowserBrandName::Edge => "edge",
            BrowserBrandName::Chromium => "chromium",
        };
        write!(f, "{name}")
    }
}

impl BrowserError {
    /// Render as the `[FAILED]`/`[ERROR]` prefixed string the agent loop's
    /// result-verification heuristic expects.
    pub fn to_tool_result(&self) -> String {
        match self {
            BrowserError::NotRunning | BrowserError::Timeout(_) => format!("[FAILED] {self}"),
            _ => format!("[ERROR] {self}"),
        }
    }
}
