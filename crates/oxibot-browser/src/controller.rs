//! High-level browser automation: owns the CDP connection and the current
//! ref map, and implements the action ladders (snapshot, click, type, …)
//! that the `browser` agent tool dispatches into.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cdp::{self, CdpClient};
use crate::error::BrowserError;
use crate::manager::{BrowserBrand, BrowserManager, LaunchOptions, DEFAULT_CDP_PORT};
use crate::snapshot::{self, RefMap};

struct Connection {
    cdp: Arc<CdpClient>,
    session_id: String,
    target_id: String,
}

/// Owns one browser connection and the ref map from the most recent
/// snapshot. Tool calls are serialized through this struct by the caller
/// holding the single `BrowserController` behind its own mutex (or, as
/// here, by each mutating method taking `&self` and locking internally).
pub struct BrowserController {
    manager: BrowserManager,
    workspace: PathBuf,
    port: u16,
    conn: Mutex<Option<Connection>>,
    ref_map: Mutex<RefMap>,
}

impl BrowserController {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            manager: BrowserManager::new(workspace.clone()),
            workspace,
            port: DEFAULT_CDP_PORT,
            conn: Mutex::new(None),
            ref_map: Mutex::new(RefMap::default()),
        }
    }

    // ── lifecycle ──

    pub async fn start(
        &self,
        brand: Option<&str>,
        port: Option<u16>,
        profile: Option<&str>,
        headless: bool,
    ) -> Result<String, BrowserError> {
        let brand = match brand.unwrap_or("chrome") {
            "brave" => BrowserBrand::Brave,
            "edge" => BrowserBrand::Edge,
            "chromium" => BrowserBrand::Chromium,
            _ => BrowserBrand::Chrome,
        };
        let opts = LaunchOptions {
            brand,
            port: port.unwrap_or(self.port),
            profile: profile.unwrap_or("default").to_string(),
            headless,
        };
        self.manager.start(&opts).await?;
        self.connect(opts.port).await?;
        Ok(format!(
            "[VERIFIED] Started {} on port {}",
            brand.as_str(),
            opts.port
        ))
    }

    async fn connect(&self, port: u16) -> Result<(), BrowserError> {
        let ws_url = cdp::fetch_debugger_url("127.0.0.1", port).await?;
        let cdp = CdpClient::connect(&ws_url).await?;

        let targets = cdp.call("Target.getTargets", json!({}), None).await?;
        let target_id = targets["targetInfos"]
            .as_array()
            .and_then(|arr| arr.iter().find(|t| t["type"] == "page"))
            .and_then(|t| t["targetId"].as_str())
            .map(str::to_string);

        let target_id = match target_id {
            Some(id) => id,
            None => {
                let created = cdp
                    .call("Target.createTarget", json!({"url": "about:blank"}), None)
                    .await?;
                created["targetId"]
                    .as_str()
                    .ok_or_else(|| BrowserError::Cdp {
                        method: "Target.createTarget".into(),
                        message: "no targetId in response".into(),
                    })?
                    .to_string()
            }
        };

        let attached = cdp
            .call(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
                None,
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| BrowserError::Cdp {
                method: "Target.attachToTarget".into(),
                message: "no sessionId in response".into(),
            })?
            .to_string();

        cdp.call("DOM.enable", json!({}), Some(&session_id)).await?;
        cdp.call("Runtime.enable", json!({}), Some(&session_id))
            .await?;
        cdp.call("Page.enable", json!({}), Some(&session_id)).await?;

        *self.conn.lock().await = Some(Connection {
            cdp,
            session_id,
            target_id,
        });
        Ok(())
    }

    pub async fn stop(&self) -> Result<String, BrowserError> {
        *self.conn.lock().await = None;
        self.manager.stop(self.port).await?;
        Ok("[VERIFIED] Browser stopped".to_string())
    }

    pub async fn status(&self) -> String {
        match self.manager.status(self.port).await {
            Some(version) => format!("[VERIFIED] Running: {version}"),
            None => "[FAILED] Browser is not running".to_string(),
        }
    }

    async fn require_conn(&self) -> Result<(), BrowserError> {
        if self.conn.lock().await.is_none() {
            // Auto-start on first use with defaults, matching the
            // reference tool's lazy-connect behavior.
            self.start(None, None, None, false).await?;
        }
        Ok(())
    }

    async fn eval(&self, expr: &str) -> Result<Value, BrowserError> {
        self.require_conn().await?;
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        let resp = conn
            .cdp
            .call(
                "Runtime.evaluate",
                json!({"expression": expr, "returnByValue": true, "awaitPromise": true}),
                Some(&conn.session_id),
            )
            .await?;
        if let Some(exc) = resp.get("exceptionDetails") {
            return Err(BrowserError::Cdp {
                method: "Runtime.evaluate".into(),
                message: exc
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or("evaluation threw")
                    .to_string(),
            });
        }
        Ok(resp["result"]["value"].clone())
    }

    // ── navigation ──

    pub async fn navigate(&self, url: &str) -> Result<String, BrowserError> {
        self.require_conn().await?;
        let url = normalize_url(url);
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        conn.cdp
            .call("Page.navigate", json!({"url": url}), Some(&conn.session_id))
            .await?;
        drop(guard);
        Ok(format!("[VERIFIED] Navigated to {url}"))
    }

    /// Site-aware search: construct a deterministic URL for known sites,
    /// otherwise fill the page's search input and press Enter twice.
    pub async fn search(&self, query: &str) -> Result<String, BrowserError> {
        self.require_conn().await?;
        let current_url = self.get_url().await.unwrap_or_default();
        let encoded = urlencoding_light(query);

        let search_url = if current_url.contains("amazon.") {
            Some(format!("/s?k={encoded}"))
        } else if current_url.contains("youtube.com") {
            Some(format!("/results?search_query={encoded}"))
        } else if current_url.contains("xiaohongshu.com") || current_url.contains("xhs") {
            Some(format!("/search_result?keyword={encoded}"))
        } else if current_url.contains("ebay.") {
            Some(format!("/sch/i.html?_nkw={encoded}"))
        } else {
            None
        };

        if let Some(path) = search_url {
            let base = site_origin(&current_url);
            return self.navigate(&format!("{base}{path}")).await;
        }

        // Generic fallback: find a search-like input, type, press Enter twice.
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('input[type=search], input[name*=q], input[name*=search], input[aria-label*=Search i]');
                if (!el) return false;
                el.focus();
                el.value = {query:?};
                el.dispatchEvent(new Event('input', {{bubbles: true}}));
                return true;
            }})()"#,
            query = query,
        );
        let found = self.eval(&script).await?;
        if found != Value::Bool(true) {
            return Ok("[FAILED] No search input found on the current page".to_string());
        }
        self.press_key("Enter").await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        self.press_key("Enter").await?;
        let text = self.get_text().await.unwrap_or_default();
        Ok(format!(
            "[VERIFIED] Searched for \"{query}\": {}",
            crate::snapshot::DomNode {
                tag: String::new(),
                role: None,
                text: text.chars().take(800).collect(),
                href: None,
            }
            .text
        ))
    }

    pub async fn get_url(&self) -> Result<String, BrowserError> {
        let v = self.eval("window.location.href").await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    pub async fn get_text(&self) -> Result<String, BrowserError> {
        let v = self.eval("document.body.innerText").await?;
        Ok(v.as_str().unwrap_or_default().to_string())
    }

    // ── snapshot ──

    pub async fn snapshot(&self, max_nodes: usize) -> Result<String, BrowserError> {
        self.require_conn().await?;

        // Accessibility-tree strategy via CDP's full AX tree.
        let aria_text = self.fetch_accessibility_tree_text().await.unwrap_or_default();
        let mut map = snapshot::build_from_aria(&aria_text);

        if map.link_button_count() < snapshot::DOM_FALLBACK_THRESHOLD {
            debug!("ARIA snapshot sparse, falling back to DOM walk");
            let raw = self.eval(snapshot::DOM_WALK_SCRIPT).await?;
            if let Some(s) = raw.as_str() {
                if let Ok(nodes) = serde_json::from_str::<Vec<snapshot::DomNode>>(s) {
                    map = snapshot::build_from_dom(nodes, max_nodes);
                }
            }
        }

        let rendered = map.render();
        *self.ref_map.lock().await = map;
        Ok(format!("[VERIFIED] Snapshot:\n{rendered}"))
    }

    async fn fetch_accessibility_tree_text(&self) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        let resp = conn
            .cdp
            .call("Accessibility.getFullAXTree", json!({}), Some(&conn.session_id))
            .await?;
        drop(guard);
        let nodes = resp["nodes"].as_array().cloned().unwrap_or_default();
        let mut lines = Vec::with_capacity(nodes.len());
        for node in nodes {
            let role = node["role"]["value"].as_str().unwrap_or("generic");
            let name = node["name"]["value"].as_str().unwrap_or("");
            lines.push(format!("  - {role} \"{name}\""));
        }
        Ok(lines.join("\n"))
    }

    // ── click / type ladders ──

    pub async fn click_by_ref(&self, a_ref: &str) -> Result<String, BrowserError> {
        let entry = {
            let map = self.ref_map.lock().await;
            map.get(a_ref)
                .cloned()
                .ok_or_else(|| BrowserError::RefNotFound(a_ref.to_string()))?
        };

        let strategies: Vec<(&str, String)> = vec![
            entry.href.as_ref().map(|h| {
                let prefix: String = h.chars().take(30).collect();
                ("href", format!("a[href*={prefix:?}]"))
            }).unwrap_or(("", String::new())),
            ("role_exact", format!("__role_exact__{}|{}|{}", entry.role, entry.name, entry.nth)),
            ("role_loose", format!("__role_loose__{}|{}|{}", entry.role, entry.name, entry.nth)),
            entry.tag.as_deref().filter(|t| *t == "section").map(|_| {
                ("section_note", format!("section.note-item:nth-of-type({})", entry.nth + 1))
            }).unwrap_or(("", String::new())),
            ("text", format!("__text__{}", entry.name)),
            ("role_only", format!("__role_only__{}|{}", entry.role, entry.nth)),
            ("text_ancestor", format!("__text_ancestor__{}", entry.name)),
        ];

        for (kind, locator) in strategies {
            if kind.is_empty() {
                continue;
            }
            if self.try_click(kind, &locator).await.unwrap_or(false) {
                let label = match kind {
                    "section_note" => "section-note-item".to_string(),
                    other => format!("strategy: {other}"),
                };
                return Ok(format!("[VERIFIED] Clicked {a_ref} ({label})"));
            }
        }
        Err(BrowserError::AllStrategiesFailed(a_ref.to_string()))
    }

    /// `click_with_retry`: highlight + retry + scroll between attempts.
    pub async fn click_with_retry(&self, a_ref: &str, max_retries: u32) -> Result<String, BrowserError> {
        let mut last_err = None;
        for attempt in 0..max_retries.max(1) {
            let _ = self.highlight(a_ref).await;
            match self.click_by_ref(a_ref).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    last_err = Some(e);
                    let _ = self.eval("window.scrollBy(0, 300)").await;
                    tokio::time::sleep(std::time::Duration::from_millis(200 * (attempt as u64 + 1))).await;
                }
            }
        }
        Err(last_err.unwrap_or(BrowserError::AllStrategiesFailed(a_ref.to_string())))
    }

    async fn try_click(&self, kind: &str, locator: &str) -> Result<bool, BrowserError> {
        let find_expr = match kind {
            "href" => format!(
                "document.querySelector({locator:?})",
            ),
            "section_note" => format!("document.querySelector({locator:?})"),
            _ if locator.starts_with("__role_exact__") || locator.starts_with("__role_loose__") => {
                let parts: Vec<&str> = locator
                    .trim_start_matches("__role_exact__")
                    .trim_start_matches("__role_loose__")
                    .splitn(3, '|')
                    .collect();
                let (role, name, nth) = (parts[0], parts.get(1).copied().unwrap_or(""), parts.get(2).copied().unwrap_or("0"));
                let exact = kind == "role_exact";
                role_name_locator_script(role, name, nth, exact)
            }
            _ if locator.starts_with("__role_only__") => {
                let parts: Vec<&str> = locator.trim_start_matches("__role_only__").splitn(2, '|').collect();
                role_name_locator_script(parts[0], "", parts.get(1).copied().unwrap_or("0"), false)
            }
            _ if locator.starts_with("__text__") => {
                let text = locator.trim_start_matches("__text__");
                text_locator_script(text, false)
            }
            _ if locator.starts_with("__text_ancestor__") => {
                let text = locator.trim_start_matches("__text_ancestor__");
                text_ancestor_script(text)
            }
            _ => format!("document.querySelector({locator:?})"),
        };

        let script = format!(
            r#"(() => {{
                const el = {find_expr};
                if (!el) return false;
                el.scrollIntoView({{block: 'center'}});
                const rect = el.getBoundingClientRect();
                el.dispatchEvent(new MouseEvent('mousedown', {{bubbles: true, clientX: rect.x + rect.width/2, clientY: rect.y + rect.height/2}}));
                el.dispatchEvent(new MouseEvent('mouseup', {{bubbles: true, clientX: rect.x + rect.width/2, clientY: rect.y + rect.height/2}}));
                el.click();
                return true;
            }})()"#
        );
        let result = self.eval(&script).await?;
        Ok(result == Value::Bool(true))
    }

    pub async fn type_by_ref(&self, a_ref: &str, text: &str) -> Result<String, BrowserError> {
        let entry = {
            let map = self.ref_map.lock().await;
            map.get(a_ref)
                .cloned()
                .ok_or_else(|| BrowserError::RefNotFound(a_ref.to_string()))?
        };

        let locators = [
            role_name_locator_script(&entry.role, &entry.name, &entry.nth.to_string(), true),
            format!("document.querySelector('[aria-label={:?}]')", entry.name),
            format!("document.querySelector('[placeholder={:?}]')", entry.name),
        ];

        for find_expr in locators {
            let script = format!(
                r#"(() => {{
                    const el = {find_expr};
                    if (!el) return false;
                    el.focus();
                    el.value = {text:?};
                    el.dispatchEvent(new Event('input', {{bubbles: true}}));
                    el.dispatchEvent(new Event('change', {{bubbles: true}}));
                    return true;
                }})()"#
            );
            if self.eval(&script).await? == Value::Bool(true) {
                return Ok(format!("[VERIFIED] Typed into {a_ref}"));
            }
        }
        Err(BrowserError::AllStrategiesFailed(a_ref.to_string()))
    }

    /// Compact `act` form: `{kind: click|fill, ref, value?}`.
    pub async fn act(&self, kind: &str, a_ref: &str, value: Option<&str>) -> Result<String, BrowserError> {
        match kind {
            "click" => self.click_by_ref(a_ref).await,
            "fill" => self.type_by_ref(a_ref, value.unwrap_or_default()).await,
            other => Err(BrowserError::Cdp {
                method: "act".into(),
                message: format!("unknown act kind `{other}`"),
            }),
        }
    }

    pub async fn hover_by_ref(&self, a_ref: &str) -> Result<String, BrowserError> {
        let entry = {
            let map = self.ref_map.lock().await;
            map.get(a_ref)
                .cloned()
                .ok_or_else(|| BrowserError::RefNotFound(a_ref.to_string()))?
        };
        let find_expr = role_name_locator_script(&entry.role, &entry.name, &entry.nth.to_string(), true);
        let script = format!(
            r#"(() => {{
                const el = {find_expr};
                if (!el) return false;
                el.scrollIntoView({{block: 'center'}});
                el.dispatchEvent(new MouseEvent('mouseover', {{bubbles: true}}));
                return true;
            }})()"#
        );
        if self.eval(&script).await? == Value::Bool(true) {
            Ok(format!("[VERIFIED] Hovered {a_ref}"))
        } else {
            Err(BrowserError::RefNotFound(a_ref.to_string()))
        }
    }

    async fn highlight(&self, a_ref: &str) -> Result<(), BrowserError> {
        let entry = {
            let map = self.ref_map.lock().await;
            match map.get(a_ref).cloned() {
                Some(e) => e,
                None => return Ok(()),
            }
        };
        let find_expr = role_name_locator_script(&entry.role, &entry.name, &entry.nth.to_string(), true);
        let script = format!(
            r#"(() => {{
                const el = {find_expr};
                if (!el) return;
                const prev = el.style.outline;
                el.style.outline = '3px solid #ff5722';
                setTimeout(() => {{ el.style.outline = prev; }}, 600);
            }})()"#
        );
        let _ = self.eval(&script).await;
        Ok(())
    }

    // ── tabs ──

    pub async fn new_tab(&self, url: Option<&str>) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        let resp = conn
            .cdp
            .call(
                "Target.createTarget",
                json!({"url": url.unwrap_or("about:blank")}),
                None,
            )
            .await?;
        let target_id = resp["targetId"].as_str().unwrap_or_default().to_string();
        drop(guard);
        self.switch_tab(&target_id).await?;
        Ok(format!("[VERIFIED] Opened new tab {target_id}"))
    }

    pub async fn switch_tab(&self, target_id: &str) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let cdp = guard.as_ref().ok_or(BrowserError::NotRunning)?.cdp.clone();
        drop(guard);
        let attached = cdp
            .call(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
                None,
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| BrowserError::Cdp {
                method: "Target.attachToTarget".into(),
                message: "no sessionId".into(),
            })?
            .to_string();
        cdp.call("DOM.enable", json!({}), Some(&session_id)).await?;
        cdp.call("Runtime.enable", json!({}), Some(&session_id)).await?;
        *self.conn.lock().await = Some(Connection {
            cdp,
            session_id,
            target_id: target_id.to_string(),
        });
        Ok(format!("[VERIFIED] Switched to tab {target_id}"))
    }

    pub async fn close_tab(&self, target_id: &str) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let cdp = guard.as_ref().ok_or(BrowserError::NotRunning)?.cdp.clone();
        drop(guard);
        cdp.call("Target.closeTarget", json!({"targetId": target_id}), None)
            .await?;
        Ok(format!("[VERIFIED] Closed tab {target_id}"))
    }

    pub async fn tabs(&self) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let cdp = guard.as_ref().ok_or(BrowserError::NotRunning)?.cdp.clone();
        drop(guard);
        let resp = cdp.call("Target.getTargets", json!({}), None).await?;
        let list: Vec<String> = resp["targetInfos"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|t| t["type"] == "page")
            .map(|t| {
                format!(
                    "{} - {}",
                    t["targetId"].as_str().unwrap_or(""),
                    t["url"].as_str().unwrap_or(""),
                )
            })
            .collect();
        Ok(format!("[VERIFIED] Tabs:\n{}", list.join("\n")))
    }

    // ── misc actions ──

    pub async fn scroll(&self, dx: i64, dy: i64) -> Result<String, BrowserError> {
        self.eval(&format!("window.scrollBy({dx}, {dy})")).await?;
        Ok("[VERIFIED] Scrolled".to_string())
    }

    pub async fn scroll_to_ref(&self, a_ref: &str) -> Result<String, BrowserError> {
        let entry = {
            let map = self.ref_map.lock().await;
            map.get(a_ref)
                .cloned()
                .ok_or_else(|| BrowserError::RefNotFound(a_ref.to_string()))?
        };
        let find_expr = role_name_locator_script(&entry.role, &entry.name, &entry.nth.to_string(), true);
        self.eval(&format!(
            "(() => {{ const el = {find_expr}; if (el) el.scrollIntoView({{block: 'center'}}); return !!el; }})()"
        ))
        .await?;
        Ok(format!("[VERIFIED] Scrolled to {a_ref}"))
    }

    pub async fn resize(&self, width: u32, height: u32) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        conn.cdp
            .call(
                "Emulation.setDeviceMetricsOverride",
                json!({"width": width, "height": height, "deviceScaleFactor": 1, "mobile": false}),
                Some(&conn.session_id),
            )
            .await?;
        Ok(format!("[VERIFIED] Resized viewport to {width}x{height}"))
    }

    pub async fn press_key(&self, key: &str) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        for event_type in ["keyDown", "keyUp"] {
            conn.cdp
                .call(
                    "Input.dispatchKeyEvent",
                    json!({"type": event_type, "key": key}),
                    Some(&conn.session_id),
                )
                .await?;
        }
        Ok(format!("[VERIFIED] Pressed {key}"))
    }

    pub async fn evaluate(&self, expr: &str) -> Result<String, BrowserError> {
        let v = self.eval(expr).await?;
        Ok(format!("[VERIFIED] {}", serde_json::to_string(&v).unwrap_or_default()))
    }

    pub async fn cookies(&self) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        let resp = conn
            .cdp
            .call("Network.getCookies", json!({}), Some(&conn.session_id))
            .await?;
        Ok(format!("[VERIFIED] {}", serde_json::to_string_pretty(&resp).unwrap_or_default()))
    }

    pub async fn storage(&self, kind: &str) -> Result<String, BrowserError> {
        let expr = match kind {
            "session" => "JSON.stringify(window.sessionStorage)",
            _ => "JSON.stringify(window.localStorage)",
        };
        let v = self.eval(expr).await?;
        Ok(format!("[VERIFIED] {}", v.as_str().unwrap_or_default()))
    }

    pub async fn wait(&self, ms: u64) -> Result<String, BrowserError> {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        Ok(format!("[VERIFIED] Waited {ms}ms"))
    }

    pub async fn wait_for_selector(&self, selector: &str, timeout_ms: u64) -> Result<String, BrowserError> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            let found = self
                .eval(&format!("!!document.querySelector({selector:?})"))
                .await?;
            if found == Value::Bool(true) {
                return Ok(format!("[VERIFIED] {selector} appeared"));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(format!("[FAILED] Timed out waiting for {selector}"));
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    pub async fn enable_console_logging(&self) -> Result<(), BrowserError> {
        let script = r#"
            (() => {
                if (window.__oxibot_console_hooked) return;
                window.__oxibot_console_hooked = true;
                window.__oxibot_console_log = [];
                window.__oxibot_errors = [];
                ['log', 'warn', 'error', 'info'].forEach((level) => {
                    const orig = console[level].bind(console);
                    console[level] = (...args) => {
                        window.__oxibot_console_log.push(`[${level}] ${args.map(String).join(' ')}`);
                        orig(...args);
                    };
                });
                window.onerror = (msg) => { window.__oxibot_errors.push(String(msg)); };
            })()
        "#;
        self.eval(script).await?;
        Ok(())
    }

    pub async fn console(&self) -> Result<String, BrowserError> {
        self.enable_console_logging().await?;
        let v = self.eval("JSON.stringify(window.__oxibot_console_log || [])").await?;
        Ok(format!("[VERIFIED] {}", v.as_str().unwrap_or("[]")))
    }

    pub async fn errors(&self) -> Result<String, BrowserError> {
        self.enable_console_logging().await?;
        let v = self.eval("JSON.stringify(window.__oxibot_errors || [])").await?;
        Ok(format!("[VERIFIED] {}", v.as_str().unwrap_or("[]")))
    }

    pub async fn trace(&self, action: &str) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        match action {
            "start" => {
                conn.cdp
                    .call("Tracing.start", json!({"transferMode": "ReturnAsStream"}), None)
                    .await?;
                Ok("[VERIFIED] Trace started".to_string())
            }
            "stop" => {
                conn.cdp.call("Tracing.end", json!({}), None).await?;
                Ok("[VERIFIED] Trace stopped".to_string())
            }
            other => Err(BrowserError::Cdp {
                method: "trace".into(),
                message: format!("unknown trace action `{other}`, expected start|stop"),
            }),
        }
    }

    pub async fn screenshot(&self, name: Option<&str>) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        let resp = conn
            .cdp
            .call(
                "Page.captureScreenshot",
                json!({"format": "png"}),
                Some(&conn.session_id),
            )
            .await?;
        drop(guard);
        let data = resp["data"].as_str().ok_or_else(|| BrowserError::Cdp {
            method: "Page.captureScreenshot".into(),
            message: "no image data in response".into(),
        })?;
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
            .map_err(|e| BrowserError::Other(anyhow::anyhow!(e)))?;

        let dir = self.workspace.join("screenshots");
        std::fs::create_dir_all(&dir).map_err(|e| BrowserError::Other(e.into()))?;
        let filename = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("screenshot_{}.png", chrono::Utc::now().timestamp_millis()));
        let path = dir.join(&filename);
        std::fs::write(&path, bytes).map_err(|e| BrowserError::Other(e.into()))?;

        info!(path = %path.display(), "captured screenshot");
        Ok(format!("[VERIFIED] Saved to: {}", path.display()))
    }

    /// `download`/`upload` are registration-contract stubs: file transfer
    /// through CDP requires `Page.setDownloadBehavior` / `DOM.setFileInputFiles`
    /// wiring that depends on the host OS's download directory conventions,
    /// out of scope per the filesystem-tool boundary this crate respects.
    pub async fn set_download_behavior(&self, download_path: &str) -> Result<String, BrowserError> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        conn.cdp
            .call(
                "Page.setDownloadBehavior",
                json!({"behavior": "allow", "downloadPath": download_path}),
                Some(&conn.session_id),
            )
            .await?;
        Ok(format!("[VERIFIED] Downloads will save to {download_path}"))
    }

    pub async fn upload_to_ref(&self, a_ref: &str, file_paths: &[String]) -> Result<String, BrowserError> {
        let entry = {
            let map = self.ref_map.lock().await;
            map.get(a_ref)
                .cloned()
                .ok_or_else(|| BrowserError::RefNotFound(a_ref.to_string()))?
        };
        let find_expr = role_name_locator_script(&entry.role, &entry.name, &entry.nth.to_string(), true);
        let node_resp = self
            .eval(&format!("(() => {{ const el = {find_expr}; return !!el; }})()"))
            .await?;
        if node_resp != Value::Bool(true) {
            return Err(BrowserError::RefNotFound(a_ref.to_string()));
        }
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(BrowserError::NotRunning)?;
        let doc = conn.cdp.call("DOM.getDocument", json!({}), Some(&conn.session_id)).await?;
        let root_id = doc["root"]["nodeId"].as_i64().unwrap_or(0);
        conn.cdp
            .call(
                "DOM.setFileInputFiles",
                json!({"files": file_paths, "nodeId": root_id}),
                Some(&conn.session_id),
            )
            .await?;
        Ok(format!("[VERIFIED] Uploaded {} file(s) to {a_ref}", file_paths.len()))
    }

    /// Semantic `find`: role/text/label/first/nth locator with an
    /// optional one-shot action.
    pub async fn find(&self, params: &HashMap<String, Value>) -> Result<String, BrowserError> {
        let role = params.get("role").and_then(Value::as_str).unwrap_or("");
        let text = params.get("text").and_then(Value::as_str).unwrap_or("");
        let nth: usize = params.get("nth").and_then(Value::as_u64).unwrap_or(0) as usize;
        let action = params.get("action").and_then(Value::as_str);
        let value = params.get("value").and_then(Value::as_str);

        let find_expr = if !role.is_empty() {
            role_name_locator_script(role, text, &nth.to_string(), !text.is_empty())
        } else {
            text_locator_script(text, false)
        };

        match action {
            Some("click") => {
                let script = format!(
                    r#"(() => {{ const el = {find_expr}; if (!el) return false; el.scrollIntoView({{block:'center'}}); el.click(); return true; }})()"#
                );
                if self.eval(&script).await? == Value::Bool(true) {
                    Ok("[VERIFIED] Clicked matched element".to_string())
                } else {
                    Err(BrowserError::AllStrategiesFailed("find".to_string()))
                }
            }
            Some("fill") => {
                let script = format!(
                    r#"(() => {{ const el = {find_expr}; if (!el) return false; el.focus(); el.value = {value:?}; el.dispatchEvent(new Event('input', {{bubbles:true}})); return true; }})()"#,
                    value = value.unwrap_or_default(),
                );
                if self.eval(&script).await? == Value::Bool(true) {
                    Ok("[VERIFIED] Filled matched element".to_string())
                } else {
                    Err(BrowserError::AllStrategiesFailed("find".to_string()))
                }
            }
            Some("hover") => {
                let script = format!(
                    r#"(() => {{ const el = {find_expr}; if (!el) return false; el.dispatchEvent(new MouseEvent('mouseover', {{bubbles:true}})); return true; }})()"#
                );
                if self.eval(&script).await? == Value::Bool(true) {
                    Ok("[VERIFIED] Hovered matched element".to_string())
                } else {
                    Err(BrowserError::AllStrategiesFailed("find".to_string()))
                }
            }
            _ => {
                let script = format!("(() => {{ const el = {find_expr}; return el ? el.innerText : null; }})()");
                let v = self.eval(&script).await?;
                Ok(format!("[VERIFIED] {}", v.as_str().unwrap_or("(no match)")))
            }
        }
    }
}

// ── locator script builders ──

fn role_name_locator_script(role: &str, name: &str, nth: &str, exact: bool) -> String {
    let role_selector = role_to_css_hint(role);
    let cmp = if exact {
        format!("(t === {name:?})")
    } else {
        format!("(t.includes({name:?}))")
    };
    format!(
        r#"(() => {{
            const cands = Array.from(document.querySelectorAll({role_selector:?}));
            const matches = cands.filter((el) => {{
                const t = (el.innerText || el.value || el.getAttribute('aria-label') || '').trim();
                return {cmp};
            }});
            return matches[{nth}] || null;
        }})()"#
    )
}

fn role_to_css_hint(role: &str) -> String {
    match role {
        "link" => "a, [role=link]".to_string(),
        "button" => "button, [role=button], input[type=button], input[type=submit]".to_string(),
        "textbox" | "searchbox" => "input, textarea, [role=textbox]".to_string(),
        "combobox" => "select, [role=combobox]".to_string(),
        "checkbox" => "input[type=checkbox], [role=checkbox]".to_string(),
        other => format!("[role={other}]"),
    }
}

fn text_locator_script(text: &str, exact: bool) -> String {
    let cmp = if exact {
        format!("(t === {text:?})")
    } else {
        format!("(t.includes({text:?}))")
    };
    format!(
        r#"(() => {{
            const all = Array.from(document.querySelectorAll('*'));
            return all.find((el) => {{
                const t = (el.innerText || '').trim();
                return {cmp} && el.children.length === 0;
            }}) || null;
        }})()"#
    )
}

fn text_ancestor_script(text: &str) -> String {
    format!(
        r#"(() => {{
            const all = Array.from(document.querySelectorAll('*'));
            const leaf = all.find((el) => (el.innerText || '').includes({text:?}) && el.children.length === 0);
            if (!leaf) return null;
            let node = leaf;
            while (node && node !== document.body) {{
                if (node.matches && (node.matches('section.note-item') || node.matches('[class*=note]'))) return node;
                node = node.parentElement;
            }}
            return leaf;
        }})()"#
    )
}

fn normalize_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    if url.contains('.') && !url.contains(' ') {
        return format!("https://www.{url}");
    }
    format!("https://www.google.com/search?q={}", urlencoding_light(url))
}

fn site_origin(url: &str) -> String {
    if let Some(idx) = url.find("://").map(|i| i + 3) {
        if let Some(end) = url[idx..].find('/') {
            return url[..idx + end].to_string();
        }
        return url.to_string();
    }
    url.to_string()
}

fn urlencoding_light(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
        } else if c == ' ' {
            out.push('+');
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).as_bytes() {
                out.push_str(&format!("%{b:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urlencoding_light_keeps_ascii_alphanumerics_and_spaces() {
        assert_eq!(urlencoding_light("hello world"), "hello+world");
        assert_eq!(urlencoding_light("abc123"), "abc123");
    }

    #[test]
    fn urlencoding_light_percent_encodes_utf8_bytes_not_code_points() {
        // "丹" is U+4E39 but its UTF-8 encoding is the 3 bytes E4 B8 B9 —
        // the previous implementation encoded the scalar value directly
        // (`%4E39`), which is not a valid percent-escape at all.
        assert_eq!(urlencoding_light("丹"), "%E4%B8%B9");
        assert_eq!(urlencoding_light("丹麦"), "%E4%B8%B9%E9%BA%A6");
    }

    #[test]
    fn urlencoding_light_escapes_reserved_ascii() {
        assert_eq!(urlencoding_light("a&b=c"), "a%26b%3Dc");
    }

    #[test]
    fn site_origin_extracts_scheme_and_host() {
        assert_eq!(site_origin("https://www.amazon.com/s?k=x"), "https://www.amazon.com");
        assert_eq!(site_origin("https://example.com"), "https://example.com");
    }
}
