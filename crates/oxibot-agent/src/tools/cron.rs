//! Cron tool — lets the agent schedule, inspect, and cancel scheduled jobs
//! backed by `oxibot_cron::CronService`.
//!
//! Its action surface is grounded directly on `oxibot_cron`'s job-management
//! API and follows the context-holding pattern of `SpawnTool`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use oxibot_cron::{CronJob, CronPayload, CronSchedule, CronService};

use super::base::{optional_bool, optional_i64, optional_string, require_string, Tool};

/// Schedule, list, toggle, and trigger cron jobs.
pub struct CronTool {
    service: Arc<CronService>,
    /// Default channel/chat_id used when a created job doesn't specify
    /// delivery target explicitly. Set per-conversation by the agent loop.
    context: Mutex<(String, String)>,
}

impl CronTool {
    pub fn new(service: Arc<CronService>) -> Self {
        Self {
            service,
            context: Mutex::new(("cli".into(), "direct".into())),
        }
    }

    /// Set the current context (called by the agent loop per-message).
    pub async fn set_context(&self, channel: &str, chat_id: &str) {
        let mut ctx = self.context.lock().await;
        *ctx = (channel.to_string(), chat_id.to_string());
    }

    fn format_job(job: &CronJob) -> String {
        let schedule = match job.schedule.kind {
            oxibot_cron::ScheduleKind::At => format!("at {:?}", job.schedule.at_ms),
            oxibot_cron::ScheduleKind::Every => format!("every {:?}ms", job.schedule.every_ms),
            oxibot_cron::ScheduleKind::Cron => format!("cron '{}'", job.schedule.expr.as_deref().unwrap_or("")),
        };
        format!(
            "- {} [{}] {} — enabled={} next_run_at_ms={:?}",
            job.id, job.name, schedule, job.enabled, job.state.next_run_at_ms
        )
    }
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn description(&self) -> &str {
        "Schedule, list, enable/disable, and immediately trigger recurring or \
         one-shot tasks. Actions: list, create, remove, enable, disable, run_now."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "create", "remove", "enable", "disable", "run_now"],
                    "description": "Which cron operation to perform"
                },
                "id": { "type": "string", "description": "Job ID (remove/enable/disable/run_now)" },
                "name": { "type": "string", "description": "Human-readable job name (create)" },
                "schedule_kind": {
                    "type": "string",
                    "enum": ["at", "every", "cron"],
                    "description": "Schedule variant (create)"
                },
                "at_ms": { "type": "integer", "description": "Unix epoch ms to fire once (schedule_kind=at)" },
                "every_ms": { "type": "integer", "description": "Interval in ms (schedule_kind=every)" },
                "expr": { "type": "string", "description": "5-field cron expression (schedule_kind=cron)" },
                "message": { "type": "string", "description": "Prompt sent to the agent when the job fires" },
                "deliver": { "type": "boolean", "description": "Whether to deliver the result to a channel" },
                "channel": { "type": "string", "description": "Target channel for delivery (defaults to current)" },
                "to": { "type": "string", "description": "Target chat_id for delivery (defaults to current)" }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let action = require_string(&params, "action")?;

        match action.as_str() {
            "list" => {
                let jobs = self.service.list_jobs().await;
                if jobs.is_empty() {
                    return Ok("No scheduled jobs.".to_string());
                }
                let mut lines = vec!["[CRON JOBS]".to_string()];
                lines.extend(jobs.iter().map(Self::format_job));
                Ok(lines.join("\n"))
            }
            "create" => {
                let name = require_string(&params, "name")?;
                let message = require_string(&params, "message")?;
                let kind = optional_string(&params, "schedule_kind").unwrap_or_else(|| "every".into());

                let schedule = match kind.as_str() {
                    "at" => {
                        let at_ms = optional_i64(&params, "at_ms")
                            .ok_or_else(|| anyhow::anyhow!("at_ms is required for schedule_kind=at"))?;
                        CronSchedule::at(at_ms)
                    }
                    "cron" => {
                        let expr = optional_string(&params, "expr")
                            .ok_or_else(|| anyhow::anyhow!("expr is required for schedule_kind=cron"))?;
                        CronSchedule::cron(expr)
                    }
                    _ => {
                        let every_ms = optional_i64(&params, "every_ms")
                            .ok_or_else(|| anyhow::anyhow!("every_ms is required for schedule_kind=every"))?;
                        CronSchedule::every(every_ms)
                    }
                };

                let ctx = self.context.lock().await;
                let (default_channel, default_chat) = ctx.clone();
                drop(ctx);

                let payload = CronPayload {
                    message,
                    deliver: optional_bool(&params, "deliver"),
                    channel: Some(optional_string(&params, "channel").unwrap_or(default_channel)),
                    to: Some(optional_string(&params, "to").unwrap_or(default_chat)),
                };

                let job = CronJob::new(name, schedule, payload);
                let id = self.service.add_job(job).await?;
                Ok(format!("[VERIFIED] Scheduled job {id}"))
            }
            "remove" => {
                let id = require_string(&params, "id")?;
                if self.service.remove_job(&id).await? {
                    Ok(format!("[VERIFIED] Removed job {id}"))
                } else {
                    Ok(format!("Job not found: {id}"))
                }
            }
            "enable" => {
                let id = require_string(&params, "id")?;
                if self.service.set_enabled(&id, true).await? {
                    Ok(format!("[VERIFIED] Enabled job {id}"))
                } else {
                    Ok(format!("Job not found: {id}"))
                }
            }
            "disable" => {
                let id = require_string(&params, "id")?;
                if self.service.set_enabled(&id, false).await? {
                    Ok(format!("[VERIFIED] Disabled job {id}"))
                } else {
                    Ok(format!("Job not found: {id}"))
                }
            }
            "run_now" => {
                let id = require_string(&params, "id")?;
                if self.service.get_job(&id).await.is_none() {
                    return Ok(format!("Job not found: {id}"));
                }
                self.service.execute_job(&id).await;
                Ok(format!("[VERIFIED] Triggered job {id}"))
            }
            other => Ok(format!(
                "Unknown action: {other}. Use: list, create, remove, enable, disable, run_now"
            )),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use oxibot_core::bus::queue::MessageBus;

    fn make_tool() -> CronTool {
        let bus = Arc::new(MessageBus::new(8));
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(CronService::new(bus, Some(dir.path().join("cron.json"))));
        CronTool::new(service)
    }

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn test_list_empty() {
        let tool = make_tool();
        let result = tool.execute(params(&[("action", json!("list"))])).await.unwrap();
        assert_eq!(result, "No scheduled jobs.");
    }

    #[tokio::test]
    async fn test_create_and_list_and_remove() {
        let tool = make_tool();
        let created = tool
            .execute(params(&[
                ("action", json!("create")),
                ("name", json!("daily digest")),
                ("message", json!("summarize today")),
                ("schedule_kind", json!("every")),
                ("every_ms", json!(60_000)),
            ]))
            .await
            .unwrap();
        assert!(created.starts_with("[VERIFIED] Scheduled job"));
        let id = created.rsplit(' ').next().unwrap().to_string();

        let list = tool.execute(params(&[("action", json!("list"))])).await.unwrap();
        assert!(list.contains(&id));
        assert!(list.contains("daily digest"));

        let disabled = tool
            .execute(params(&[("action", json!("disable")), ("id", json!(id.clone()))]))
            .await
            .unwrap();
        assert!(disabled.contains("Disabled job"));

        let removed = tool
            .execute(params(&[("action", json!("remove")), ("id", json!(id.clone()))]))
            .await
            .unwrap();
        assert!(removed.contains("Removed job"));

        let removed_again = tool
            .execute(params(&[("action", json!("remove")), ("id", json!(id))]))
            .await
            .unwrap();
        assert!(removed_again.contains("not found"));
    }

    #[tokio::test]
    async fn test_create_requires_schedule_fields() {
        let tool = make_tool();
        let result = tool
            .execute(params(&[
                ("action", json!("create")),
                ("name", json!("bad")),
                ("message", json!("x")),
                ("schedule_kind", json!("at")),
            ]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_now_missing_job() {
        let tool = make_tool();
        let result = tool
            .execute(params(&[("action", json!("run_now")), ("id", json!("nope"))]))
            .await
            .unwrap();
        assert!(result.contains("not found"));
    }

    #[tokio::test]
    async fn test_unknown_action() {
        let tool = make_tool();
        let result = tool.execute(params(&[("action", json!("bogus"))])).await.unwrap();
        assert!(result.starts_with("Unknown action"));
    }
}
