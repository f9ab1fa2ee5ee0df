use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::expr::evaluate_condition;
use crate::monitor::HealthReport;
use crate::types::{WorkflowDefinition, WorkflowExecution};

/// One alert rule: a condition over the finished execution plus a message
/// template rendered when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub condition: String,
    pub channels: Vec<String>,
    pub template: String,
}

/// Delivery settings for the named channels. Anything unset makes that
/// channel a logged no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// JSONL file the `file` channel appends to
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// URL the `webhook` channel posts to
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub email: Option<EmailSettings>,
}

/// The `email` channel posts to an HTTP email API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    pub api_url: String,
    pub to: String,
    pub from: String,
}

/// The rules that ship enabled out of the box.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "workflow-failure".to_string(),
            condition: "execution.status == 'failed'".to_string(),
            channels: vec!["console".to_string()],
            template: "Workflow ${workflow.name} failed: ${error.message}".to_string(),
        },
        AlertRule {
            name: "high-failure-rate".to_string(),
            condition: "metrics.total_runs >= 5 && metrics.success_rate < 80".to_string(),
            channels: vec!["console".to_string()],
            template: "Workflow ${workflow.name} success rate dropped to ${metrics.success_rate}%"
                .to_string(),
        },
        AlertRule {
            name: "long-duration".to_string(),
            condition: "workflow.expected_duration != null \
                        && execution.duration_ms > workflow.expected_duration * 1.5"
                .to_string(),
            channels: vec!["console".to_string()],
            template: "Workflow ${workflow.name} took ${execution.duration_ms}ms, \
                       expected ${workflow.expected_duration}ms"
                .to_string(),
        },
    ]
}

/// Evaluates alert rules after every run and fans matching alerts out to
/// their channels. Channel failures are logged and isolated; alerting never
/// feeds back into the execution path.
pub struct AlertManager {
    rules: Vec<AlertRule>,
    channels: ChannelSettings,
    client: reqwest::Client,
}

impl AlertManager {
    pub fn new(rules: Vec<AlertRule>, channels: ChannelSettings) -> Self {
        Self {
            rules,
            channels,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(channels: ChannelSettings) -> Self {
        Self::new(default_rules(), channels)
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    pub async fn check_alerts(
        &self,
        execution: &WorkflowExecution,
        workflow: &WorkflowDefinition,
        metrics: &HealthReport,
    ) {
        let ctx = alert_context(execution, workflow, metrics);
        for rule in &self.rules {
            if !evaluate_condition(&rule.condition, &ctx) {
                continue;
            }
            let message = render_template(&rule.template, &ctx);
            warn!(alert = %rule.name, workflow = %workflow.name, "alert fired");
            for channel in &rule.channels {
                if let Err(err) = self.dispatch(channel, rule, &message, execution).await {
                    warn!(alert = %rule.name, channel, error = %err, "alert channel delivery failed");
                }
            }
        }
    }

    async fn dispatch(
        &self,
        channel: &str,
        rule: &AlertRule,
        message: &str,
        execution: &WorkflowExecution,
    ) -> anyhow::Result<()> {
        match channel {
            "console" => {
                warn!(alert = %rule.name, execution = %execution.id, "{message}");
            }
            "file" => {
                let Some(path) = &self.channels.file else {
                    debug!(alert = %rule.name, "file channel not configured");
                    return Ok(());
                };
                let line = json!({
                    "time": chrono::Utc::now(),
                    "alert": rule.name,
                    "execution": execution.id,
                    "message": message,
                });
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(format!("{line}\n").as_bytes()).await?;
                file.flush().await?;
            }
            "webhook" => {
                let Some(url) = &self.channels.webhook_url else {
                    debug!(alert = %rule.name, "webhook channel not configured");
                    return Ok(());
                };
                self.client
                    .post(url)
                    .json(&json!({
                        "alert": rule.name,
                        "message": message,
                        "workflow": execution.workflow,
                        "execution": execution.id,
                        "status": execution.status,
                    }))
                    .send()
                    .await?
                    .error_for_status()?;
            }
            "email" => {
                let Some(email) = &self.channels.email else {
                    debug!(alert = %rule.name, "email channel not configured");
                    return Ok(());
                };
                self.client
                    .post(&email.api_url)
                    .json(&json!({
                        "to": email.to,
                        "from": email.from,
                        "subject": format!("[cascade] {}", rule.name),
                        "text": message,
                    }))
                    .send()
                    .await?
                    .error_for_status()?;
            }
            other => {
                warn!(alert = %rule.name, channel = other, "unknown alert channel");
            }
        }
        Ok(())
    }
}

fn alert_context(
    execution: &WorkflowExecution,
    workflow: &WorkflowDefinition,
    metrics: &HealthReport,
) -> Value {
    json!({
        "execution": execution,
        "workflow": workflow,
        "metrics": metrics,
        "error": {
            "message": execution.error.clone().unwrap_or_default(),
        },
    })
}

/// Replace `${dotted.path}` references with values from the alert context.
/// Unresolvable references are left as written.
fn render_template(template: &str, ctx: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let path = after[..end].trim();
                match lookup(ctx, path) {
                    Some(value) => out.push_str(&display(&value)),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(ctx: &Value, path: &str) -> Option<Value> {
    let mut current = ctx;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionStatus;
    use std::collections::HashMap;

    fn workflow() -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "ci",
            "version": "1.0.0",
            "trigger": { "type": "manual" },
            "expected_duration": 100,
            "tasks": [
                { "id": "a", "name": "a", "type": "shell", "command": "true" }
            ]
        }))
        .unwrap()
    }

    fn failed_execution() -> WorkflowExecution {
        let mut execution = WorkflowExecution::started("ci");
        execution.error = Some("task a failed: exit 1".to_string());
        execution.finish(ExecutionStatus::Failed);
        execution
    }

    fn healthy_metrics() -> HealthReport {
        HealthReport {
            success_rate: 100.0,
            total_runs: 1,
            successful_runs: 1,
            failed_runs: 0,
            average_duration_ms: 10.0,
            task_failure_rates: HashMap::new(),
        }
    }

    #[test]
    fn test_failure_rule_matches_failed_execution() {
        let rules = default_rules();
        let failure_rule = rules.iter().find(|r| r.name == "workflow-failure").unwrap();
        let ctx = alert_context(&failed_execution(), &workflow(), &healthy_metrics());
        assert!(evaluate_condition(&failure_rule.condition, &ctx));

        let mut ok = failed_execution();
        ok.status = ExecutionStatus::Completed;
        let ctx = alert_context(&ok, &workflow(), &healthy_metrics());
        assert!(!evaluate_condition(&failure_rule.condition, &ctx));
    }

    #[test]
    fn test_long_duration_rule_uses_expected_duration() {
        let rules = default_rules();
        let rule = rules.iter().find(|r| r.name == "long-duration").unwrap();

        let mut slow = failed_execution();
        slow.status = ExecutionStatus::Completed;
        slow.duration_ms = Some(500);
        let ctx = alert_context(&slow, &workflow(), &healthy_metrics());
        assert!(evaluate_condition(&rule.condition, &ctx));

        // no baseline means the rule never fires
        let mut wf = workflow();
        wf.expected_duration_ms = None;
        let ctx = alert_context(&slow, &wf, &healthy_metrics());
        assert!(!evaluate_condition(&rule.condition, &ctx));
    }

    #[test]
    fn test_template_rendering() {
        let ctx = alert_context(&failed_execution(), &workflow(), &healthy_metrics());
        let message =
            render_template("Workflow ${workflow.name} failed: ${error.message}", &ctx);
        assert_eq!(message, "Workflow ci failed: task a failed: exit 1");

        let message = render_template("keep ${not.a.path} literal", &ctx);
        assert_eq!(message, "keep ${not.a.path} literal");
    }

    #[tokio::test]
    async fn test_file_channel_appends_jsonl() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let manager = AlertManager::new(
            vec![AlertRule {
                name: "workflow-failure".to_string(),
                condition: "execution.status == 'failed'".to_string(),
                channels: vec!["file".to_string()],
                template: "failed: ${workflow.name}".to_string(),
            }],
            ChannelSettings {
                file: Some(path.clone()),
                ..ChannelSettings::default()
            },
        );

        manager
            .check_alerts(&failed_execution(), &workflow(), &healthy_metrics())
            .await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let line: Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(line["alert"], json!("workflow-failure"));
        assert_eq!(line["message"], json!("failed: ci"));
    }

    #[tokio::test]
    async fn test_unconfigured_channels_are_noops() {
        let manager = AlertManager::with_defaults(ChannelSettings::default());
        // nothing configured, nothing panics, nothing propagates
        manager
            .check_alerts(&failed_execution(), &workflow(), &healthy_metrics())
            .await;
    }
}
