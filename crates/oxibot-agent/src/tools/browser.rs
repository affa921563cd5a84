//! Browser tool — single tool with a discriminated `action` parameter,
//! backed by `oxibot_browser::BrowserController`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use oxibot_browser::BrowserController;

use super::base::{optional_bool, optional_i64, optional_string, require_string, Tool};

pub struct BrowserTool {
    controller: BrowserController,
}

impl BrowserTool {
    pub fn new(workspace: PathBuf) -> Self {
        Self {
            controller: BrowserController::new(workspace),
        }
    }
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Control a real Chromium-family browser: navigate, take an accessibility/DOM \
         snapshot of clickable elements (returns short refs like e1, e2), click/type/hover \
         by ref, manage tabs, read cookies/storage/console, capture screenshots. \
         Always `snapshot` after `open`/`navigate` before clicking by ref — refs are only \
         valid for the most recent snapshot."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": [
                        "start", "stop", "status",
                        "open", "navigate", "search", "snapshot",
                        "click", "type", "act", "hover",
                        "scroll", "resize", "press",
                        "new_tab", "switch_tab", "close_tab", "tabs",
                        "evaluate", "cookies", "storage", "wait",
                        "console", "errors",
                        "download", "upload", "trace",
                        "screenshot", "get_text", "find"
                    ],
                    "description": "Which browser operation to perform"
                },
                "url": { "type": "string", "description": "URL for open/navigate" },
                "query": { "type": "string", "description": "Query text for search" },
                "ref": { "type": "string", "description": "Element ref from the last snapshot, e.g. e3" },
                "text": { "type": "string", "description": "Text to type" },
                "kind": { "type": "string", "description": "act kind: click|fill; or storage kind: local|session" },
                "value": { "type": "string", "description": "Value for act/find fill" },
                "dx": { "type": "integer" },
                "dy": { "type": "integer" },
                "width": { "type": "integer" },
                "height": { "type": "integer" },
                "key": { "type": "string", "description": "Key name for press, e.g. Enter" },
                "targetId": { "type": "string", "description": "Tab target id for switch_tab/close_tab" },
                "expression": { "type": "string", "description": "JS expression for evaluate" },
                "ms": { "type": "integer", "description": "Milliseconds for wait" },
                "selector": { "type": "string", "description": "CSS selector to wait for" },
                "timeoutMs": { "type": "integer" },
                "name": { "type": "string", "description": "Filename for screenshot" },
                "paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Local file paths for upload"
                },
                "downloadPath": { "type": "string" },
                "browser": { "type": "string", "description": "chrome|brave|edge|chromium" },
                "port": { "type": "integer" },
                "profile": { "type": "string" },
                "headless": { "type": "boolean" },
                "maxNodes": { "type": "integer" },
                "role": { "type": "string" },
                "nth": { "type": "integer" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let action = require_string(&params, "action")?;
        let result = match action.as_str() {
            "start" => {
                self.controller
                    .start(
                        optional_string(&params, "browser").as_deref(),
                        optional_i64(&params, "port").map(|p| p as u16),
                        optional_string(&params, "profile").as_deref(),
                        optional_bool(&params, "headless"),
                    )
                    .await
            }
            "stop" => self.controller.stop().await,
            "status" => Ok(self.controller.status().await),
            "open" | "navigate" => {
                let url = require_string(&params, "url")?;
                self.controller.navigate(&url).await
            }
            "search" => {
                let query = require_string(&params, "query")?;
                self.controller.search(&query).await
            }
            "snapshot" => {
                let max_nodes = optional_i64(&params, "maxNodes").unwrap_or(50) as usize;
                self.controller.snapshot(max_nodes).await
            }
            "click" => {
                let a_ref = require_string(&params, "ref")?;
                self.controller.click_with_retry(&a_ref, 3).await
            }
            "type" => {
                let a_ref = require_string(&params, "ref")?;
                let text = optional_string(&params, "text").unwrap_or_default();
                self.controller.type_by_ref(&a_ref, &text).await
            }
            "act" => {
                let kind = require_string(&params, "kind")?;
                let a_ref = require_string(&params, "ref")?;
                let value = optional_string(&params, "value");
                self.controller.act(&kind, &a_ref, value.as_deref()).await
            }
            "hover" => {
                let a_ref = require_string(&params, "ref")?;
                self.controller.hover_by_ref(&a_ref).await
            }
            "scroll" => {
                if let Some(a_ref) = optional_string(&params, "ref") {
                    self.controller.scroll_to_ref(&a_ref).await
                } else {
                    let dx = optional_i64(&params, "dx").unwrap_or(0);
                    let dy = optional_i64(&params, "dy").unwrap_or(300);
                    self.controller.scroll(dx, dy).await
                }
            }
            "resize" => {
                let width = optional_i64(&params, "width").unwrap_or(1280) as u32;
                let height = optional_i64(&params, "height").unwrap_or(800) as u32;
                self.controller.resize(width, height).await
            }
            "press" => {
                let key = require_string(&params, "key")?;
                self.controller.press_key(&key).await
            }
            "new_tab" => self.controller.new_tab(optional_string(&params, "url").as_deref()).await,
            "switch_tab" => {
                let target_id = require_string(&params, "targetId")?;
                self.controller.switch_tab(&target_id).await
            }
            "close_tab" => {
                let target_id = require_string(&params, "targetId")?;
                self.controller.close_tab(&target_id).await
            }
            "tabs" => self.controller.tabs().await,
            "evaluate" => {
                let expr = require_string(&params, "expression")?;
                self.controller.evaluate(&expr).await
            }
            "cookies" => self.controller.cookies().await,
            "storage" => {
                let kind = optional_string(&params, "kind").unwrap_or_else(|| "local".into());
                self.controller.storage(&kind).await
            }
            "wait" => {
                if let Some(selector) = optional_string(&params, "selector") {
                    let timeout_ms = optional_i64(&params, "timeoutMs").unwrap_or(5000) as u64;
                    self.controller.wait_for_selector(&selector, timeout_ms).await
                } else {
                    let ms = optional_i64(&params, "ms").unwrap_or(1000) as u64;
                    self.controller.wait(ms).await
                }
            }
            "console" => self.controller.console().await,
            "errors" => self.controller.errors().await,
            "download" => {
                let path = require_string(&params, "downloadPath")?;
                self.controller.set_download_behavior(&path).await
            }
            "upload" => {
                let a_ref = require_string(&params, "ref")?;
                let paths: Vec<String> = params
                    .get("paths")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                self.controller.upload_to_ref(&a_ref, &paths).await
            }
            "trace" => {
                let sub_action = optional_string(&params, "kind").unwrap_or_else(|| "start".into());
                self.controller.trace(&sub_action).await
            }
            "screenshot" => self.controller.screenshot(optional_string(&params, "name").as_deref()).await,
            "get_text" => self.controller.get_text().await.map(|t| format!("[VERIFIED] {t}")),
            "find" => self.controller.find(&params).await,
            other => anyhow::bail!("Unknown browser action: {other}"),
        };

        Ok(result.unwrap_or_else(|e| e.to_tool_result()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tool() -> BrowserTool {
        let workspace = std::env::temp_dir().join("oxibot_test_browser_tool");
        let _ = std::fs::create_dir_all(&workspace);
        BrowserTool::new(workspace)
    }

    #[test]
    fn test_browser_tool_name() {
        assert_eq!(make_tool().name(), "browser");
    }

    #[test]
    fn test_browser_tool_parameters_has_action_enum() {
        let tool = make_tool();
        let params = tool.parameters();
        let actions = params["properties"]["action"]["enum"].as_array().unwrap();
        assert!(actions.iter().any(|a| a == "snapshot"));
        assert!(actions.iter().any(|a| a == "click"));
        assert!(actions.iter().any(|a| a == "search"));
    }

    #[tokio::test]
    async fn test_browser_tool_unknown_action_errors() {
        let tool = make_tool();
        let mut params = HashMap::new();
        params.insert("action".into(), json!("not_a_real_action"));
        let result = tool.execute(params).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_browser_tool_missing_action_errors() {
        let tool = make_tool();
        let result = tool.execute(HashMap::new()).await;
        assert!(result.is_err());
    }
}
