use anyhow::{bail, Context, Result};
use cascade_core::alert::{AlertManager, AlertRule, ChannelSettings};
use cascade_core::engine::Engine;
use cascade_core::monitor::WorkflowMonitor;
use cascade_core::scheduler::CronScheduler;
use cascade_core::store::{ExecutionStore, MemoryExecutionStore, RedbExecutionStore};
use cascade_core::types::{TriggerType, WorkflowDefinition};
use cascade_core::watcher::FileChangeWatcher;
use cascade_core::workflow::load_workflow_file;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Workflows to load at startup, keyed by registration name
    #[serde(default)]
    pub workflows: Vec<WorkflowEntry>,

    #[serde(default)]
    pub alerts: AlertConfig,

    /// Debounce window for file_change triggers
    #[serde(default = "default_watch_debounce_ms")]
    pub watch_debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "redb" for the durable store, "memory" for ephemeral history
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_store_file")]
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEntry {
    pub name: String,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Extra rules on top of the built-in set
    #[serde(default)]
    pub rules: Vec<AlertRule>,

    #[serde(default)]
    pub channels: ChannelSettings,
}

fn default_backend() -> String {
    "redb".to_string()
}

fn default_store_file() -> String {
    "cascade.redb".to_string()
}

fn default_watch_debounce_ms() -> u64 {
    500
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            file: default_store_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                workflows: Vec::new(),
                alerts: Default::default(),
                watch_debounce_ms: default_watch_debounce_ms(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub scheduler: Arc<CronScheduler>,
    pub workflows: Arc<HashMap<String, WorkflowDefinition>>,
    // dropping these stops the file triggers
    _watchers: Arc<Vec<FileChangeWatcher>>,
}

impl AppState {
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        let store: Arc<dyn ExecutionStore> = match config.storage.backend.as_str() {
            "memory" => Arc::new(MemoryExecutionStore::new()),
            "redb" => Arc::new(
                RedbExecutionStore::open(config.store_path())
                    .context("Failed to open execution store")?,
            ),
            other => bail!("unknown storage backend: {other}"),
        };

        let monitor = Arc::new(WorkflowMonitor::new());
        monitor
            .load_from_history(store.as_ref())
            .await
            .context("Failed to load execution history")?;

        let mut rules = cascade_core::alert::default_rules();
        rules.extend(config.alerts.rules.clone());
        let alerts = AlertManager::new(rules, config.alerts.channels.clone());

        let engine = Arc::new(Engine::new(store, monitor, alerts));
        let scheduler = Arc::new(CronScheduler::new(engine.clone()));

        let mut workflows = HashMap::new();
        let mut watchers = Vec::new();
        for entry in &config.workflows {
            let workflow = load_workflow_file(&entry.file)
                .with_context(|| format!("Failed to load workflow {}", entry.file.display()))?;
            tracing::info!(
                name = %entry.name,
                workflow = %workflow.name,
                trigger = ?workflow.trigger.trigger_type,
                "loaded workflow"
            );

            match workflow.trigger.trigger_type {
                TriggerType::Schedule => scheduler.register(workflow.clone())?,
                TriggerType::FileChange => watchers.push(FileChangeWatcher::start(
                    engine.clone(),
                    workflow.clone(),
                    Duration::from_millis(config.watch_debounce_ms),
                )?),
                TriggerType::Manual | TriggerType::Webhook => {}
            }
            workflows.insert(entry.name.clone(), workflow);
        }

        Ok(Self {
            engine,
            scheduler,
            workflows: Arc::new(workflows),
            _watchers: Arc::new(watchers),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parses_with_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.storage.backend, "redb");
        assert_eq!(config.storage.file, "cascade.redb");
        assert!(config.workflows.is_empty());
        assert_eq!(config.watch_debounce_ms, 500);
    }

    #[test]
    fn test_config_parses_workflows_and_channels() {
        let config: ServerConfig = toml::from_str(
            r#"
            [storage]
            backend = "memory"

            [[workflows]]
            name = "deploy"
            file = "workflows/deploy.json"

            [alerts.channels]
            file = "alerts.jsonl"
            webhook_url = "https://hooks.example.com/cascade"
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.workflows.len(), 1);
        assert_eq!(config.workflows[0].name, "deploy");
        assert!(config.alerts.channels.file.is_some());
        assert!(config.alerts.channels.webhook_url.is_some());
    }

    #[tokio::test]
    async fn test_app_state_with_memory_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config: ServerConfig = toml::from_str("[storage]\nbackend = \"memory\"").unwrap();
        config.data_dir = dir.path().to_path_buf();

        let state = AppState::new(&config).await.unwrap();
        assert!(state.workflows.is_empty());
        assert_eq!(state.engine.monitor().health_report().total_runs, 0);
    }

    #[tokio::test]
    async fn test_app_state_rejects_unknown_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config: ServerConfig = toml::from_str("[storage]\nbackend = \"postgres\"").unwrap();
        config.data_dir = dir.path().to_path_buf();
        assert!(AppState::new(&config).await.is_err());
    }
}
