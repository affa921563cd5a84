//! Image generation tool — a thin HTTP client against a configured
//! text-to-image endpoint.
//!
//! The upstream provider's request/response shape is out of scope, so this
//! keeps only the registration contract the tool registry expects —
//! `{prompt, size?, n?}` in, a `[IMAGE_FILE:<path>]` marker out.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::base::{optional_i64, optional_string, require_string, Tool};

const DEFAULT_SIZE: &str = "1024x1024";

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default)]
    images: Vec<String>,
}

/// Generates an image via a configured HTTP endpoint and saves it under
/// `<workspace>/images/`.
pub struct ImageGenerateTool {
    endpoint: Option<String>,
    api_key: Option<String>,
    workspace: PathBuf,
    client: Client,
}

impl ImageGenerateTool {
    pub fn new(endpoint: Option<String>, api_key: Option<String>, workspace: PathBuf) -> Self {
        Self {
            endpoint,
            api_key,
            workspace,
            client: Client::new(),
        }
    }

    fn resolve_endpoint(&self) -> Option<String> {
        self.endpoint
            .clone()
            .or_else(|| std::env::var("IMAGE_GENERATE_ENDPOINT").ok())
    }

    fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("IMAGE_GENERATE_API_KEY").ok())
    }
}

#[async_trait]
impl Tool for ImageGenerateTool {
    fn name(&self) -> &str {
        "image_generate"
    }

    fn description(&self) -> &str {
        "Generate an image from a text prompt and save it to the workspace. \
         You MUST call this tool when asked to generate/create an image — do \
         not describe images textually or fabricate a path."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": { "type": "string", "description": "Text description of the image to generate" },
                "size": { "type": "string", "description": "Image size, e.g. '1024x1024' (default 1024x1024)" },
                "n": { "type": "integer", "description": "Number of images to request (default 1)" }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let prompt = require_string(&params, "prompt")?;
        let size = optional_string(&params, "size").unwrap_or_else(|| DEFAULT_SIZE.to_string());
        let n = optional_i64(&params, "n").unwrap_or(1);

        let Some(endpoint) = self.resolve_endpoint() else {
            return Ok("[ERROR] image generation endpoint not configured".to_string());
        };

        let mut request = self
            .client
            .post(&endpoint)
            .json(&json!({ "prompt": prompt, "size": size, "n": n }));
        if let Some(key) = self.resolve_api_key() {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Ok(format!(
                "[ERROR] image generation failed: HTTP {}",
                response.status()
            ));
        }

        let body: GenerateResponse = response.json().await?;
        let Some(b64) = body.image_base64.or_else(|| body.images.into_iter().next()) else {
            return Ok("[ERROR] no image returned".to_string());
        };

        let bytes = base64::engine::general_purpose::STANDARD.decode(b64.as_bytes())?;

        let images_dir = self.workspace.join("images");
        std::fs::create_dir_all(&images_dir)?;
        let path = images_dir.join(format!("generated_{}.png", Utc::now().timestamp()));
        std::fs::write(&path, bytes)?;

        Ok(format!("[IMAGE_FILE:{}]", path.display()))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_missing_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ImageGenerateTool::new(None, None, dir.path().to_path_buf());
        std::env::remove_var("IMAGE_GENERATE_ENDPOINT");

        let mut params = HashMap::new();
        params.insert("prompt".to_string(), json!("a cat"));
        let result = tool.execute(params).await.unwrap();
        assert!(result.starts_with("[ERROR]"));
    }

    #[tokio::test]
    async fn test_generate_saves_png() {
        let server = MockServer::start().await;
        let pixel = base64::engine::general_purpose::STANDARD
            .encode([0x89, 0x50, 0x4e, 0x47]); // PNG magic bytes, good enough for a fake payload

        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "image_base64": pixel
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let tool = ImageGenerateTool::new(
            Some(format!("{}/generate", server.uri())),
            None,
            dir.path().to_path_buf(),
        );

        let mut params = HashMap::new();
        params.insert("prompt".to_string(), json!("a cat wearing a hat"));
        let result = tool.execute(params).await.unwrap();

        assert!(result.starts_with("[IMAGE_FILE:"));
        let generated_path = result
            .trim_start_matches("[IMAGE_FILE:")
            .trim_end_matches(']');
        assert!(std::path::Path::new(generated_path).is_file());
    }
}
