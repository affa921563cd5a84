//! Context builder — constructs the system prompt and conversation messages.
//!
//! Assembles the system prompt and message list for each LLM call.
//! Builds the system prompt from identity, bootstrap files, memory, and skills,
//! then assembles the full message list for an LLM call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use chrono::Utc;
use oxibot_core::types::{ContentPart, ImageUrl, LlmRequestConfig, Message};
use oxibot_providers::LlmProvider;
use tracing::{debug, warn};

use crate::memory::MemoryStore;
use crate::skills::SkillsLoader;

/// Image resize/compression limits applied before base64-embedding a photo
/// in a user message. Mirrors the defaults a vision-capable chat API expects.
#[derive(Clone, Debug)]
pub struct ImageMediaConfig {
    /// Whether to resize/recompress at all. When `false`, the raw file bytes
    /// are embedded unchanged.
    pub enabled: bool,
    /// Longest edge, in pixels, after resize (aspect ratio preserved).
    pub max_size: u32,
    /// Initial JPEG quality (1-100).
    pub quality: u8,
    /// Hard cap on the encoded byte size; quality is stepped down by 10 at a
    /// time (never below 10) until the image fits, or it bottoms out.
    pub max_bytes: usize,
    /// Whether to ask a vision model to describe each image up front, so the
    /// description survives even once the raw image is pruned from history.
    pub understanding: bool,
}

impl Default for ImageMediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1568,
            quality: 85,
            max_bytes: 5 * 1024 * 1024,
            understanding: false,
        }
    }
}

const VISION_DESCRIBE_PROMPT: &str =
    "Describe this image in detail: objects, text, people, setting, and anything notable.";

// ─────────────────────────────────────────────
// Bootstrap / identity files
// ─────────────────────────────────────────────

/// Files that are automatically injected into the system prompt when present
/// in the workspace root.
const BOOTSTRAP_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "USER.md",
    "TOOLS.md",
    "IDENTITY.md",
];

// ─────────────────────────────────────────────
// Context builder
// ─────────────────────────────────────────────

/// Builds system prompts and conversation message lists for the agent loop.
pub struct ContextBuilder {
    /// Root workspace directory.
    workspace: PathBuf,
    /// Agent identity name (for the system prompt).
    agent_name: String,
    /// Memory store for long-term + daily notes.
    memory: MemoryStore,
    /// Skills loader for discovering and loading skill files.
    skills: SkillsLoader,
    /// Image resize/compression policy for multimodal user messages.
    image_config: ImageMediaConfig,
    /// Vision provider + model used to describe images up front, when
    /// `image_config.understanding` is enabled.
    vision: Option<(Arc<dyn LlmProvider>, String)>,
}

impl ContextBuilder {
    /// Create a new context builder.
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let memory = MemoryStore::new_lazy(&workspace);
        let skills = SkillsLoader::new(&workspace, None);
        Self {
            workspace,
            agent_name: agent_name.into(),
            memory,
            skills,
            image_config: ImageMediaConfig::default(),
            vision: None,
        }
    }

    /// Set the built-in skills directory (builder pattern).
    pub fn with_builtin_skills(mut self, path: PathBuf) -> Self {
        self.skills = SkillsLoader::new(&self.workspace, Some(path));
        self
    }

    /// Override the image resize/compression policy (builder pattern).
    pub fn with_image_config(mut self, image_config: ImageMediaConfig) -> Self {
        self.image_config = image_config;
        self
    }

    /// Provide the vision model used for up-front image description
    /// (builder pattern). Only consulted when `image_config.understanding`
    /// is `true`.
    pub fn with_vision(mut self, provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        self.vision = Some((provider, model.into()));
        self
    }

    /// Get a reference to the memory store.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Get a reference to the skills loader.
    pub fn skills(&self) -> &SkillsLoader {
        &self.skills
    }

    // ────────────── System prompt ──────────────

    /// Build the full system prompt.
    pub fn build_system_prompt(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        // 1) Identity
        parts.push(self.build_identity());

        // 2) Bootstrap files
        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if path.is_file() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    debug!(file = filename, "loaded bootstrap file");
                    parts.push(format!("## {filename}\n\n{content}"));
                }
            }
        }

        // 3) Memory context (via MemoryStore)
        if let Some(memory) = self.memory.get_memory_context() {
            parts.push(memory);
        }

        // 4) Always-on skills (full body injected)
        let always_skills = self.skills.get_always_skills();
        if !always_skills.is_empty() {
            let always_content = self.skills.load_skills_for_context(&always_skills);
            if !always_content.is_empty() {
                parts.push(format!("# Active Skills\n\n{always_content}"));
            }
        }

        // 5) Skills summary (XML catalogue — agent uses read_file for on-demand loading)
        let skills_summary = self.skills.build_skills_summary();
        if !skills_summary.is_empty() {
            parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. \
                 To use a skill, read its SKILL.md file using the `read_file` tool.\n\
                 Skills with available=\"false\" need dependencies installed first.\n\n\
                 {skills_summary}"
            ));
        }

        parts.join("\n\n---\n\n")
    }

    /// Core identity block.
    fn build_identity(&self) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let workspace = self.workspace.display();
        let memory_file = self.memory.memory_file().display();
        let history_file = self.memory.history_file().display();
        let today = Utc::now().format("%Y-%m-%d");

        format!(
            "# Identity\n\n\
             You are **{name}**, an AI assistant.\n\n\
             - **Date/time**: {now}\n\
             - **Runtime**: Rust on {os}/{arch}\n\
             - **Workspace**: `{workspace}`\n\n\
             You have access to tools. Use them when needed to answer questions, \
             read/write files, run commands, search the web, and more.\n\
             Always prefer using tools over guessing. \
             Be concise and helpful.\n\n\
             ## Memory\n\n\
             - Long-term memory: `{memory_file}`\n\
             - History log: `{history_file}` (grep-searchable, not loaded into every prompt)\n\
             - Daily notes: `{workspace}/memory/{today}.md`\n\n\
             When you learn something important about the user or the project, \
             persist it by writing to `{memory_file}` using the `write_file` or `edit_file` tool. \
             To recall past events, grep `{history_file}`.",
            name = self.agent_name,
        )
    }

    // ────────────── Message building ──────────────

    /// Build the full message list for an LLM call.
    ///
    /// 1. System prompt
    /// 2. Session history
    /// 3. Current user message
    pub async fn build_messages(
        &self,
        history: &[Message],
        user_text: &str,
        media: &[String],
        channel: &str,
        chat_id: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        // System prompt + session info
        let mut system = self.build_system_prompt();
        system.push_str(&format!(
            "\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
        ));
        messages.push(Message::system(system));

        // History
        messages.extend_from_slice(history);

        // Current user message
        if media.is_empty() {
            messages.push(Message::user(user_text));
        } else {
            messages.push(self.build_multimodal_user_message(user_text, media).await);
        }

        messages
    }

    /// Build a user message with base64-encoded images, resized/compressed
    /// per `image_config`.
    ///
    /// Audio files are skipped — their transcription is already in the text
    /// content (voice messages are transcribed upstream by the channel).
    ///
    /// When `image_config.understanding` is enabled and a vision model was
    /// configured, each image is also sent to that model for a short textual
    /// description; the descriptions are prepended as a `[Image Descriptions]`
    /// text block ahead of the image parts, so they survive in history even
    /// after older image parts are consolidated away.
    async fn build_multimodal_user_message(&self, text: &str, media_paths: &[String]) -> Message {
        let mut image_parts = Vec::new();
        let mut descriptions: Vec<String> = Vec::new();

        for path in media_paths {
            if is_audio_extension(path) {
                continue;
            }
            let p = Path::new(path);
            if !p.is_file() {
                continue;
            }

            let (data, mime) = if self.image_config.enabled {
                match process_image(p, &self.image_config) {
                    Ok(processed) => processed,
                    Err(e) => {
                        warn!(path = %path, error = %e, "failed to process image, skipping resize/compress");
                        match std::fs::read(p) {
                            Ok(raw) => (raw, guess_mime(path).to_string()),
                            Err(_) => continue,
                        }
                    }
                }
            } else {
                match std::fs::read(p) {
                    Ok(raw) => (raw, guess_mime(path).to_string()),
                    Err(_) => continue,
                }
            };

            let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
            let url = format!("data:{mime};base64,{b64}");

            if self.image_config.understanding {
                if let Some((provider, model)) = &self.vision {
                    match self.describe_image(provider.as_ref(), model, &url).await {
                        Ok(desc) => descriptions.push(desc),
                        Err(e) => warn!(path = %path, error = %e, "vision description failed"),
                    }
                }
            }

            image_parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl { url, detail: None },
            });
        }

        let mut parts = Vec::new();
        if !descriptions.is_empty() {
            let block = descriptions
                .iter()
                .map(|d| format!("- {d}"))
                .collect::<Vec<_>>()
                .join("\n\n");
            parts.push(ContentPart::Text {
                text: format!("[Image Descriptions]\n{block}"),
            });
        }
        parts.extend(image_parts);
        parts.push(ContentPart::Text {
            text: text.to_string(),
        });

        Message::user_parts(parts)
    }

    /// Ask the configured vision model to describe a single base64-embedded
    /// image, returning the trimmed text of its reply.
    async fn describe_image(
        &self,
        provider: &dyn LlmProvider,
        model: &str,
        image_data_url: &str,
    ) -> anyhow::Result<String> {
        let request = Message::user_parts(vec![
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_data_url.to_string(),
                    detail: None,
                },
            },
            ContentPart::Text {
                text: VISION_DESCRIBE_PROMPT.to_string(),
            },
        ]);
        let response = provider
            .chat(&[request], None, model, &LlmRequestConfig::default())
            .await;
        response
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("vision model returned no description"))
    }

    /// Add a tool result to the message list (convenience wrapper).
    pub fn add_tool_result(messages: &mut Vec<Message>, tool_call_id: &str, result: &str) {
        messages.push(Message::tool_result(tool_call_id, result));
    }

    /// Add an assistant message (with optional tool calls) to the message list.
    pub fn add_assistant_message(
        messages: &mut Vec<Message>,
        content: Option<String>,
        tool_calls: Vec<oxibot_core::types::ToolCall>,
    ) {
        Self::add_assistant_message_full(messages, content, tool_calls, None);
    }

    /// Like `add_assistant_message`, but also carries reasoning/thinking
    /// content from models that expose it (DeepSeek-R1, Kimi).
    pub fn add_assistant_message_full(
        messages: &mut Vec<Message>,
        content: Option<String>,
        tool_calls: Vec<oxibot_core::types::ToolCall>,
        reasoning_content: Option<String>,
    ) {
        if tool_calls.is_empty() {
            if let Some(text) = content {
                messages.push(Message::Assistant {
                    content: Some(text),
                    tool_calls: None,
                    reasoning_content,
                    tools_used: None,
                });
            }
        } else {
            messages.push(Message::Assistant {
                content,
                tool_calls: Some(tool_calls),
                reasoning_content,
                tools_used: None,
            });
        }
    }
}

// ─────────────────────────────────────────────
// Multimodal helpers
// ─────────────────────────────────────────────

/// Resize (preserving aspect ratio) and JPEG-compress an image file.
///
/// Resizes to fit within `max_size` on the longest edge, then encodes at
/// `quality`. If the result still exceeds `max_bytes`, quality is stepped
/// down by 10 and re-encoded, repeating until it fits or quality bottoms
/// out at 10.
///
/// Returns `(bytes, mime_type)` — always `image/jpeg` once processed.
fn process_image(path: &Path, config: &ImageMediaConfig) -> anyhow::Result<(Vec<u8>, String)> {
    let img = image::ImageReader::open(path)?
        .with_guessed_format()?
        .decode()?;

    let img = if img.width() > config.max_size || img.height() > config.max_size {
        img.thumbnail(config.max_size, config.max_size)
    } else {
        img
    };

    let mut quality = config.quality;
    let mut data = encode_jpeg(&img, quality)?;

    while data.len() > config.max_bytes && quality > 10 {
        quality = quality.saturating_sub(10).max(10);
        data = encode_jpeg(&img, quality)?;
        if quality == 10 {
            break;
        }
    }

    Ok((data, "image/jpeg".to_string()))
}

fn encode_jpeg(img: &image::DynamicImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode_image(img)?;
    Ok(buf)
}

/// Check if a file path has an audio extension.
fn is_audio_extension(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".ogg")
        || lower.ends_with(".oga")
        || lower.ends_with(".opus")
        || lower.ends_with(".mp3")
        || lower.ends_with(".m4a")
        || lower.ends_with(".wav")
        || lower.ends_with(".flac")
        || lower.ends_with(".aac")
        || lower.ends_with(".wma")
        || lower.ends_with(".webm")
}

/// Simple MIME guesser based on extension.
fn guess_mime(path: &str) -> &str {
    let lower = path.to_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".svg") {
        "image/svg+xml"
    } else {
        "image/jpeg"
    }
}
