use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::types::{TriggerType, WorkflowDefinition};

/// Parse a cron expression, accepting the common five-field form by
/// prepending a seconds field.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized).with_context(|| format!("invalid cron expression: {expr}"))
}

struct ScheduleEntry {
    workflow: WorkflowDefinition,
    expression: String,
    enabled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Runs schedule-triggered workflows on their cron expressions. Each
/// registered workflow gets its own timer task; disabling keeps the timer
/// alive but skips firings.
pub struct CronScheduler {
    engine: Arc<Engine>,
    entries: Mutex<HashMap<String, ScheduleEntry>>,
}

impl CronScheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a schedule-triggered workflow and start its timer.
    pub fn register(&self, workflow: WorkflowDefinition) -> Result<()> {
        if workflow.trigger.trigger_type != TriggerType::Schedule {
            return Err(anyhow!(
                "workflow {} does not have a schedule trigger",
                workflow.name
            ));
        }
        let expression = workflow
            .trigger
            .config
            .schedule
            .clone()
            .ok_or_else(|| anyhow!("workflow {} has no cron expression", workflow.name))?;
        let schedule = parse_schedule(&expression)?;

        let enabled = Arc::new(AtomicBool::new(true));
        let handle = self.spawn_timer(workflow.clone(), schedule, enabled.clone());

        let mut entries = self.entries.lock().unwrap();
        if let Some(previous) = entries.insert(
            workflow.name.clone(),
            ScheduleEntry {
                workflow: workflow.clone(),
                expression: expression.clone(),
                enabled,
                handle,
            },
        ) {
            previous.handle.abort();
        }
        info!(workflow = %workflow.name, schedule = %expression, "registered scheduled workflow");
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let entry = self
            .entries
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| anyhow!("workflow {name} is not scheduled"))?;
        entry.handle.abort();
        info!(workflow = name, "unregistered scheduled workflow");
        Ok(())
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    pub fn scheduled_workflows(&self) -> Vec<(String, String, bool)> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|e| {
                (
                    e.workflow.name.clone(),
                    e.expression.clone(),
                    e.enabled.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Abort every timer. Used on shutdown.
    pub fn stop(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(name)
            .ok_or_else(|| anyhow!("workflow {name} is not scheduled"))?;
        entry.enabled.store(enabled, Ordering::Relaxed);
        info!(workflow = name, enabled, "scheduled workflow toggled");
        Ok(())
    }

    fn spawn_timer(
        &self,
        workflow: WorkflowDefinition,
        schedule: Schedule,
        enabled: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!(workflow = %workflow.name, "schedule has no upcoming firings");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                if !enabled.load(Ordering::Relaxed) {
                    continue;
                }
                info!(workflow = %workflow.name, "schedule fired");
                if let Err(err) = engine.run_workflow(&workflow, HashMap::new()).await {
                    error!(workflow = %workflow.name, error = %err, "scheduled run failed to start");
                }
            }
        })
    }
}

impl Drop for CronScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertManager, ChannelSettings};
    use crate::monitor::WorkflowMonitor;
    use crate::store::MemoryExecutionStore;
    use serde_json::json;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(MemoryExecutionStore::new()),
            Arc::new(WorkflowMonitor::new()),
            AlertManager::with_defaults(ChannelSettings::default()),
        ))
    }

    fn scheduled_workflow(expr: &str) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "nightly",
            "version": "1.0.0",
            "trigger": { "type": "schedule", "config": { "schedule": expr } },
            "tasks": [
                { "id": "a", "name": "a", "type": "shell", "command": "true" }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_schedule_accepts_five_fields() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 0 * * * *").is_ok());
        assert!(parse_schedule("definitely not cron").is_err());
    }

    #[tokio::test]
    async fn test_register_and_toggle() {
        let scheduler = CronScheduler::new(engine());
        scheduler.register(scheduled_workflow("0 0 * * *")).unwrap();

        let scheduled = scheduler.scheduled_workflows();
        assert_eq!(scheduled.len(), 1);
        assert!(scheduled[0].2);

        scheduler.disable("nightly").unwrap();
        assert!(!scheduler.scheduled_workflows()[0].2);
        scheduler.enable("nightly").unwrap();
        assert!(scheduler.scheduled_workflows()[0].2);

        scheduler.unregister("nightly").unwrap();
        assert!(scheduler.scheduled_workflows().is_empty());
        assert!(scheduler.disable("nightly").is_err());
    }

    #[tokio::test]
    async fn test_register_rejects_non_schedule_trigger() {
        let scheduler = CronScheduler::new(engine());
        let mut wf = scheduled_workflow("0 0 * * *");
        wf.trigger.trigger_type = TriggerType::Manual;
        assert!(scheduler.register(wf).is_err());
    }
}
