use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::store::ExecutionStore;
use crate::types::{ExecutionStatus, TaskStatus, WorkflowExecution};

/// Tracks running health aggregates across everything the engine executes.
/// Aggregates are incremental; `load_from_history` rebuilds them from a
/// store after restart.
#[derive(Default)]
pub struct WorkflowMonitor {
    inner: Mutex<Aggregates>,
}

#[derive(Debug, Clone, Default)]
struct Aggregates {
    total_runs: u64,
    successful_runs: u64,
    failed_runs: u64,
    average_duration_ms: f64,
    tasks: HashMap<String, TaskMetrics>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskMetrics {
    pub runs: u64,
    pub failures: u64,
    pub average_duration_ms: f64,
}

/// Snapshot of overall engine health. `success_rate` is a percentage and is
/// always finite; an engine with no runs yet reports 100.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub success_rate: f64,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub average_duration_ms: f64,
    pub task_failure_rates: HashMap<String, f64>,
}

/// Per-workflow aggregates computed from stored history.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetrics {
    pub workflow: String,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

impl WorkflowMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&self, execution: &WorkflowExecution) {
        let mut agg = match self.inner.lock() {
            Ok(agg) => agg,
            Err(poisoned) => poisoned.into_inner(),
        };

        agg.total_runs += 1;
        match execution.status {
            ExecutionStatus::Failed => agg.failed_runs += 1,
            _ => agg.successful_runs += 1,
        }
        let duration = execution.duration_ms.unwrap_or(0) as f64;
        let n = agg.total_runs as f64;
        agg.average_duration_ms += (duration - agg.average_duration_ms) / n;

        for task in execution.tasks.values() {
            if !matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
                continue;
            }
            let metrics = agg.tasks.entry(task.id.clone()).or_default();
            metrics.runs += 1;
            if task.status == TaskStatus::Failed {
                metrics.failures += 1;
            }
            let duration = task.duration_ms.unwrap_or(0) as f64;
            let runs = metrics.runs as f64;
            metrics.average_duration_ms += (duration - metrics.average_duration_ms) / runs;
        }
        debug!(
            execution = %execution.id,
            total_runs = agg.total_runs,
            "recorded execution in monitor"
        );
    }

    pub fn health_report(&self) -> HealthReport {
        let agg = match self.inner.lock() {
            Ok(agg) => agg,
            Err(poisoned) => poisoned.into_inner(),
        };

        let success_rate = if agg.total_runs == 0 {
            100.0
        } else {
            agg.successful_runs as f64 / agg.total_runs as f64 * 100.0
        };
        let task_failure_rates = agg
            .tasks
            .iter()
            .map(|(id, m)| {
                let rate = if m.runs == 0 {
                    0.0
                } else {
                    m.failures as f64 / m.runs as f64 * 100.0
                };
                (id.clone(), rate)
            })
            .collect();

        HealthReport {
            success_rate,
            total_runs: agg.total_runs,
            successful_runs: agg.successful_runs,
            failed_runs: agg.failed_runs,
            average_duration_ms: agg.average_duration_ms,
            task_failure_rates,
        }
    }

    /// Rebuild aggregates from stored history, replacing current state.
    pub async fn load_from_history(&self, store: &dyn ExecutionStore) -> Result<()> {
        let history = store.all_executions().await?;
        {
            let mut agg = match self.inner.lock() {
                Ok(agg) => agg,
                Err(poisoned) => poisoned.into_inner(),
            };
            *agg = Aggregates::default();
        }
        for execution in &history {
            self.record_execution(execution);
        }
        debug!(executions = history.len(), "monitor loaded history");
        Ok(())
    }

    pub async fn workflow_metrics(
        &self,
        store: &dyn ExecutionStore,
        workflow: &str,
    ) -> Result<WorkflowMetrics> {
        let executions = store.executions_for_workflow(workflow).await?;
        let total_runs = executions.len() as u64;
        let failed_runs = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Failed)
            .count() as u64;
        let successful_runs = total_runs - failed_runs;
        let success_rate = if total_runs == 0 {
            100.0
        } else {
            successful_runs as f64 / total_runs as f64 * 100.0
        };
        let average_duration_ms = if executions.is_empty() {
            0.0
        } else {
            executions
                .iter()
                .map(|e| e.duration_ms.unwrap_or(0) as f64)
                .sum::<f64>()
                / executions.len() as f64
        };

        Ok(WorkflowMetrics {
            workflow: workflow.to_string(),
            total_runs,
            successful_runs,
            failed_runs,
            success_rate,
            average_duration_ms,
        })
    }
}
