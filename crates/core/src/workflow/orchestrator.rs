use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::WorkflowError;
use crate::types::{
    ExecutionStatus, TaskExecution, TaskStatus, WorkflowDefinition, WorkflowExecution,
};

use super::executor::TaskExecutor;
use super::graph::DependencyGraph;
use super::validate::validate;

/// Load a workflow definition from a JSON file and validate it.
pub fn load_workflow_file(path: impl AsRef<Path>) -> Result<WorkflowDefinition, WorkflowError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_workflow_json(&text)
}

/// Parse a workflow definition from JSON text and validate it.
pub fn load_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let workflow: WorkflowDefinition = serde_json::from_str(json)?;
    validate(&workflow)?;
    Ok(workflow)
}

/// Drives one workflow run: starts every task whose dependencies are
/// terminal, skips downstream of failures, and assembles the execution
/// envelope.
#[derive(Default)]
pub struct Orchestrator;

impl Orchestrator {
    pub fn new() -> Self {
        Self
    }

    /// Execute a workflow to completion. Task failures are recorded in the
    /// returned execution; `Err` is reserved for invalid definitions and
    /// runtime-level faults.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        overrides: HashMap<String, String>,
    ) -> Result<WorkflowExecution, WorkflowError> {
        validate(workflow)?;

        let mut execution = WorkflowExecution::started(&workflow.name);
        info!(workflow = %workflow.name, execution = %execution.id, "starting workflow execution");

        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.extend(workflow.environment.clone());
        env.extend(overrides);
        let env = Arc::new(env);

        let graph = DependencyGraph::new(&workflow.tasks);
        let by_id: HashMap<&str, &crate::types::WorkflowTask> =
            workflow.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let callbacks_by_id: Arc<HashMap<String, crate::types::WorkflowTask>> = Arc::new(
            workflow
                .tasks
                .iter()
                .map(|t| (t.id.clone(), t.clone()))
                .collect(),
        );

        // tasks named in on_success/on_failure run only when fired, never
        // through the DAG
        let callback_targets: HashSet<String> = workflow
            .tasks
            .iter()
            .flat_map(|t| t.on_success.iter().chain(t.on_failure.iter()).cloned())
            .collect();

        // satisfied: completed or skipped by own condition; those unblock
        // dependents. blocked: skipped because something upstream failed.
        let executor = TaskExecutor::new();
        let mut satisfied: HashSet<String> = HashSet::new();
        let mut failed: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut started: HashSet<String> = callback_targets.clone();
        let mut records: HashMap<String, TaskExecution> = HashMap::new();
        let mut in_flight = 0usize;
        let mut join_set: JoinSet<(String, TaskExecution, Vec<TaskExecution>)> = JoinSet::new();

        loop {
            // start everything that became ready, to a fixpoint: blocking
            // one task can make its dependents' dependency sets terminal
            loop {
                let mut terminal = satisfied.clone();
                terminal.extend(failed.iter().cloned());
                terminal.extend(blocked.iter().cloned());
                let ready = graph.ready_tasks(&started, &terminal);
                if ready.is_empty() {
                    break;
                }

                let mut progressed = false;
                for id in ready {
                    let Some(task) = by_id.get(id.as_str()) else {
                        continue;
                    };
                    let bad_dep = task
                        .depends_on
                        .iter()
                        .find(|dep| failed.contains(*dep) || blocked.contains(*dep));

                    if let Some(dep) = bad_dep {
                        warn!(task = %id, dependency = %dep, "skipping task, upstream did not complete");
                        let mut record = TaskExecution::started(&task.id, &task.name);
                        record.error = Some(format!("dependency {dep} did not complete"));
                        record.finish(TaskStatus::Skipped);
                        records.insert(id.clone(), record);
                        started.insert(id.clone());
                        blocked.insert(id.clone());
                        progressed = true;
                        continue;
                    }

                    if let Some(cap) = workflow.concurrency {
                        if in_flight >= cap {
                            continue;
                        }
                    }

                    let executor = executor.clone();
                    let task = (*task).clone();
                    let env = env.clone();
                    let callbacks_by_id = callbacks_by_id.clone();
                    started.insert(id.clone());
                    in_flight += 1;
                    progressed = true;
                    join_set.spawn(async move {
                        let record = executor.execute_task(&task, &env).await;
                        let fired =
                            run_callbacks(&executor, &task, &record, &callbacks_by_id, &env).await;
                        (task.id, record, fired)
                    });
                }

                if !progressed {
                    break;
                }
            }

            if in_flight == 0 {
                break;
            }

            let (id, record, fired) = join_set
                .join_next()
                .await
                .context("join set drained while tasks were in flight")?
                .context("task execution panicked")?;
            in_flight -= 1;

            match record.status {
                TaskStatus::Completed | TaskStatus::Skipped => {
                    satisfied.insert(id.clone());
                }
                TaskStatus::Failed => {
                    failed.insert(id.clone());
                }
                other => {
                    warn!(task = %id, status = ?other, "task finished in a non-terminal state");
                    failed.insert(id.clone());
                }
            }
            records.insert(id, record);
            // callback outcomes are recorded but never gate scheduling or
            // the run's status
            for outcome in fired {
                records.insert(outcome.id.clone(), outcome);
            }
        }

        // first DAG failure by task start time becomes the envelope error;
        // failed callbacks are excluded
        let first_error = records
            .values()
            .filter(|r| r.status == TaskStatus::Failed && failed.contains(&r.id))
            .min_by_key(|r| r.started_at)
            .map(|r| {
                format!(
                    "task {} failed: {}",
                    r.id,
                    r.error.as_deref().unwrap_or("unknown failure")
                )
            });

        let status = if failed.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };

        execution.tasks = records;
        execution.error = first_error;
        execution.finish(status);
        info!(
            workflow = %workflow.name,
            execution = %execution.id,
            status = ?execution.status,
            duration_ms = execution.duration_ms,
            "workflow execution finished"
        );
        Ok(execution)
    }
}

/// Run the settled task's on_success/on_failure callbacks in declaration
/// order. Callback failures are logged, never raised; an unknown id is a
/// warning only.
async fn run_callbacks(
    executor: &TaskExecutor,
    task: &crate::types::WorkflowTask,
    record: &TaskExecution,
    tasks_by_id: &HashMap<String, crate::types::WorkflowTask>,
    env: &HashMap<String, String>,
) -> Vec<TaskExecution> {
    let ids = match record.status {
        TaskStatus::Completed => &task.on_success,
        TaskStatus::Failed => &task.on_failure,
        _ => return Vec::new(),
    };

    let mut fired = Vec::with_capacity(ids.len());
    for id in ids {
        let Some(callback) = tasks_by_id.get(id) else {
            warn!(task = %task.id, callback = %id, "callback task not found");
            continue;
        };
        info!(task = %task.id, callback = %id, "running callback task");
        let outcome = executor.execute_task(callback, env).await;
        if outcome.status == TaskStatus::Failed {
            warn!(
                task = %task.id,
                callback = %id,
                error = outcome.error.as_deref().unwrap_or("unknown failure"),
                "callback task failed"
            );
        }
        fired.push(outcome);
    }
    fired
}
