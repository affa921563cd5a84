//! Browser process lifecycle: locate an executable, launch it with a
//! remote-debugging port and a dedicated profile directory, check whether
//! it is already running, and tear it down.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info};

use crate::cdp;
use crate::error::{BrowserBrandName, BrowserError};

pub const DEFAULT_CDP_PORT: u16 = 18800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserBrand {
    Chrome,
    Brave,
    Edge,
    Chromium,
}

impl BrowserBrand {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserBrand::Chrome => "chrome",
            BrowserBrand::Brave => "brave",
            BrowserBrand::Edge => "edge",
            BrowserBrand::Chromium => "chromium",
        }
    }

    fn env_var(&self) -> &'static str {
        match self {
            BrowserBrand::Chrome => "OXIBOT_CHROME_PATH",
            BrowserBrand::Brave => "OXIBOT_BRAVE_PATH",
            BrowserBrand::Edge => "OXIBOT_EDGE_PATH",
            BrowserBrand::Chromium => "OXIBOT_CHROMIUM_PATH",
        }
    }

    fn brand_name(&self) -> BrowserBrandName {
        match self {
            BrowserBrand::Chrome => BrowserBrandName::Chrome,
            BrowserBrand::Brave => BrowserBrandName::Brave,
            BrowserBrand::Edge => BrowserBrandName::Edge,
            BrowserBrand::Chromium => BrowserBrandName::Chromium,
        }
    }

    /// Known executable locations per platform, checked in order.
    fn candidate_paths(&self) -> Vec<&'static str> {
        if cfg!(target_os = "macos") {
            match self {
                BrowserBrand::Chrome => vec![
                    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
                ],
                BrowserBrand::Brave => vec![
                    "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
                ],
                BrowserBrand::Edge => vec![
                    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
                ],
                BrowserBrand::Chromium => vec![
                    "/Applications/Chromium.app/Contents/MacOS/Chromium",
                ],
            }
        } else if cfg!(target_os = "windows") {
            match self {
                BrowserBrand::Chrome => vec![
                    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
                    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
                ],
                BrowserBrand::Brave => vec![
                    r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
                ],
                BrowserBrand::Edge => vec![
                    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
                ],
                BrowserBrand::Chromium => vec![
                    r"C:\Program Files\Chromium\Application\chrome.exe",
                ],
            }
        } else {
            match self {
                BrowserBrand::Chrome => vec![
                    "/usr/bin/google-chrome",
                    "/usr/bin/google-chrome-stable",
                ],
                BrowserBrand::Brave => vec!["/usr/bin/brave-browser"],
                BrowserBrand::Edge => vec!["/usr/bin/microsoft-edge"],
                BrowserBrand::Chromium => vec!["/usr/bin/chromium", "/usr/bin/chromium-browser"],
            }
        }
    }

    /// Resolve an executable path: env var override, then known paths,
    /// then `which`/`where` on PATH.
    fn resolve_path(&self) -> Option<PathBuf> {
        if let Ok(p) = std::env::var(self.env_var()) {
            let path = PathBuf::from(p);
            if path.exists() {
                return Some(path);
            }
        }
        for candidate in self.candidate_paths() {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Some(path);
            }
        }
        let which_cmd = if cfg!(target_os = "windows") { "where" } else { "which" };
        let output = std::process::Command::new(which_cmd)
            .arg(self.as_str())
            .output()
            .ok()?;
        if output.status.success() {
            let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path_str.is_empty() {
                return Some(PathBuf::from(path_str));
            }
        }
        None
    }
}

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub brand: BrowserBrand,
    pub port: u16,
    pub profile: String,
    pub headless: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            brand: BrowserBrand::Chrome,
            port: DEFAULT_CDP_PORT,
            profile: "default".to_string(),
            headless: false,
        }
    }
}

/// Manages the lifecycle of a single debuggable browser process.
pub struct BrowserManager {
    workspace: PathBuf,
}

impl BrowserManager {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    pub fn profile_dir(&self, profile: &str) -> PathBuf {
        self.workspace
            .join("browser")
            .join(format!("profile_{profile}"))
    }

    /// `GET /json/version` on the debug port; `Some(status)` if alive.
    pub async fn status(&self, port: u16) -> Option<String> {
        let resp = reqwest::get(format!("http://127.0.0.1:{port}/json/version"))
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        Some(
            body.get("Browser")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        )
    }

    /// Start the browser if not already listening on `opts.port`.
    pub async fn start(&self, opts: &LaunchOptions) -> Result<(), BrowserError> {
        if self.status(opts.port).await.is_some() {
            debug!(port = opts.port, "browser already running, reusing");
            return Ok(());
        }

        let exe = opts
            .brand
            .resolve_path()
            .ok_or(BrowserError::ExecutableNotFound(opts.brand.brand_name()))?;

        let profile_dir = self.profile_dir(&opts.profile);
        std::fs::create_dir_all(&profile_dir).map_err(|e| BrowserError::Other(e.into()))?;

        let mut cmd = std::process::Command::new(&exe);
        cmd.arg(format!("--remote-debugging-port={}", opts.port))
            .arg(format!("--user-data-dir={}", profile_dir.display()))
            .arg("--no-first-run")
            .arg("--no-default-browser-check");
        if opts.headless {
            cmd.arg("--headless").arg("--disable-gpu");
        }

        cmd.spawn().map_err(|e| BrowserError::Other(e.into()))?;

        for _ in 0..20 {
            if self.status(opts.port).await.is_some() {
                info!(port = opts.port, brand = opts.brand.as_str(), "browser started");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        Err(BrowserError::Timeout(format!(
            "browser startup on port {}",
            opts.port
        )))
    }

    /// Stop the browser: try a CDP-level close first, then kill the
    /// process holding the debug port.
    pub async fn stop(&self, port: u16) -> Result<(), BrowserError> {
        if let Ok(ws_url) = cdp::fetch_debugger_url("127.0.0.1", port).await {
            if let Ok(client) = cdp::CdpClient::connect(&ws_url).await {
                let _ = client.call("Browser.close", serde_json::json!({}), None).await;
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        if self.status(port).await.is_none() {
            return Ok(());
        }

        if cfg!(target_os = "windows") {
            let script = format!(
                "Get-NetTCPConnection -LocalPort {port} | Select -Expand OwningProcess | \
                 ForEach-Object {{ Stop-Process -Id $_ -Force }}"
            );
            let _ = std::process::Command::new("powershell")
                .args(["-Command", &script])
                .output();
        } else {
            let lsof = std::process::Command::new("lsof")
                .args(["-ti", &format!(":{port}")])
                .output();
            if let Ok(out) = lsof {
                let pids = String::from_utf8_lossy(&out.stdout);
                for pid in pids.split_whitespace() {
                    let _ = std::process::Command::new("kill").args(["-9", pid]).output();
                }
            }
        }
        Ok(())
    }
}
