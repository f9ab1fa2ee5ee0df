use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::types::{TriggerType, WorkflowDefinition};

/// Environment variable carrying the path that triggered a run.
pub const CHANGED_FILE_VAR: &str = "CASCADE_CHANGED_FILE";
/// Environment variable carrying the kind of filesystem event.
pub const FILE_EVENT_VAR: &str = "CASCADE_FILE_EVENT";

/// Watches the paths of a file_change-triggered workflow and runs it
/// through the engine after a debounce window. A burst of events produces
/// one run carrying the last changed path.
pub struct FileChangeWatcher {
    // dropping the watcher stops event delivery
    _watcher: RecommendedWatcher,
    handle: JoinHandle<()>,
}

impl FileChangeWatcher {
    pub fn start(
        engine: Arc<Engine>,
        workflow: WorkflowDefinition,
        debounce: Duration,
    ) -> Result<Self> {
        if workflow.trigger.trigger_type != TriggerType::FileChange {
            return Err(anyhow!(
                "workflow {} does not have a file_change trigger",
                workflow.name
            ));
        }
        let paths: Vec<PathBuf> = workflow
            .trigger
            .config
            .files
            .iter()
            .map(PathBuf::from)
            .collect();
        if paths.is_empty() {
            return Err(anyhow!("workflow {} watches no paths", workflow.name));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) => {
                    // unbounded send never blocks the notify thread
                    let _ = tx.send(event);
                }
                Err(err) => warn!(error = %err, "filesystem watch error"),
            }
        })
        .context("failed to create filesystem watcher")?;

        for path in &paths {
            let mode = if path.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            watcher
                .watch(path, mode)
                .with_context(|| format!("failed to watch {}", path.display()))?;
        }
        info!(
            workflow = %workflow.name,
            paths = paths.len(),
            debounce_ms = debounce.as_millis() as u64,
            "file watcher started"
        );

        let handle = tokio::spawn(debounce_loop(engine, workflow, rx, debounce));
        Ok(Self {
            _watcher: watcher,
            handle,
        })
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

async fn debounce_loop(
    engine: Arc<Engine>,
    workflow: WorkflowDefinition,
    mut rx: mpsc::UnboundedReceiver<Event>,
    debounce: Duration,
) {
    while let Some(event) = rx.recv().await {
        let mut last = event;
        // absorb the rest of the burst
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(next)) => last = next,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        let changed = last
            .paths
            .first()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let kind = format!("{:?}", last.kind);
        debug!(workflow = %workflow.name, path = %changed, kind = %kind, "file change fired");

        let overrides = HashMap::from([
            (CHANGED_FILE_VAR.to_string(), changed),
            (FILE_EVENT_VAR.to_string(), kind),
        ]);
        if let Err(err) = engine.run_workflow(&workflow, overrides).await {
            error!(workflow = %workflow.name, error = %err, "file-triggered run failed to start");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{AlertManager, ChannelSettings};
    use crate::monitor::WorkflowMonitor;
    use crate::store::{ExecutionStore, MemoryExecutionStore};
    use serde_json::json;

    fn engine() -> (Arc<Engine>, Arc<MemoryExecutionStore>) {
        let store = Arc::new(MemoryExecutionStore::new());
        let engine = Arc::new(Engine::new(
            store.clone(),
            Arc::new(WorkflowMonitor::new()),
            AlertManager::with_defaults(ChannelSettings::default()),
        ));
        (engine, store)
    }

    fn watched_workflow(dir: &std::path::Path) -> WorkflowDefinition {
        serde_json::from_value(json!({
            "name": "on-change",
            "version": "1.0.0",
            "trigger": {
                "type": "file_change",
                "config": { "files": [dir.display().to_string()] }
            },
            "tasks": [
                { "id": "a", "name": "a", "type": "shell", "command": "echo $CASCADE_CHANGED_FILE" }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_wrong_trigger_type() {
        let (engine, _) = engine();
        let dir = tempfile::TempDir::new().unwrap();
        let mut wf = watched_workflow(dir.path());
        wf.trigger.trigger_type = TriggerType::Manual;
        assert!(FileChangeWatcher::start(engine, wf, Duration::from_millis(10)).is_err());
    }

    #[tokio::test]
    async fn test_debounced_change_runs_workflow_once() {
        let (engine, store) = engine();
        let dir = tempfile::TempDir::new().unwrap();
        let watcher = FileChangeWatcher::start(
            engine,
            watched_workflow(dir.path()),
            Duration::from_millis(100),
        )
        .unwrap();

        // a burst of writes collapses into one run
        for i in 0..3 {
            std::fs::write(dir.path().join("f.txt"), format!("v{i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut executed = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            executed = store.all_executions().await.unwrap();
            if !executed.is_empty() {
                break;
            }
        }
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].workflow, "on-change");
        watcher.stop();
    }
}
