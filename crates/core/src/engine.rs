use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::alert::AlertManager;
use crate::error::WorkflowError;
use crate::monitor::WorkflowMonitor;
use crate::store::ExecutionStore;
use crate::types::{WorkflowDefinition, WorkflowExecution};
use crate::workflow::Orchestrator;

/// The full pipeline every trigger goes through: execute, persist, record
/// metrics, check alerts. Triggers and the server hold an `Arc<Engine>` and
/// never touch the pieces directly.
pub struct Engine {
    orchestrator: Orchestrator,
    store: Arc<dyn ExecutionStore>,
    monitor: Arc<WorkflowMonitor>,
    alerts: AlertManager,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        monitor: Arc<WorkflowMonitor>,
        alerts: AlertManager,
    ) -> Self {
        Self {
            orchestrator: Orchestrator::new(),
            store,
            monitor,
            alerts,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn monitor(&self) -> &Arc<WorkflowMonitor> {
        &self.monitor
    }

    /// Run a workflow and fan the outcome through persistence, metrics and
    /// alerting. The execution is returned whether or not it succeeded;
    /// only definition and infrastructure problems surface as `Err`.
    pub async fn run_workflow(
        &self,
        workflow: &WorkflowDefinition,
        overrides: HashMap<String, String>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        let execution = self.orchestrator.execute(workflow, overrides).await?;

        self.store.save_execution(&execution).await?;
        self.monitor.record_execution(&execution);
        let metrics = self.monitor.health_report();
        self.alerts.check_alerts(&execution, workflow, &metrics).await;

        info!(
            workflow = %workflow.name,
            execution = %execution.id,
            status = ?execution.status,
            "workflow pipeline complete"
        );
        Ok(execution)
    }
}
