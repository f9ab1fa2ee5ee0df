use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::RunnerError;
use crate::expr::evaluate_condition;
use crate::runner;
use crate::types::{
    InlineTask, TaskExecution, TaskKind, TaskOutput, TaskStatus, WaitFor, WorkflowTask,
};

use super::retry::backoff_delay;

/// Executes individual tasks through their full lifecycle: condition gate,
/// type dispatch, per-attempt timeout, and the retry policy. One executor is
/// created per workflow run and owns that run's output map; outputs never
/// leak across runs.
#[derive(Clone)]
pub struct TaskExecutor {
    client: reqwest::Client,
    outputs: Arc<RwLock<HashMap<String, TaskOutput>>>,
}

impl TaskExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            outputs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Run one task to a terminal state. Failures are recorded on the
    /// returned execution, never raised.
    pub fn execute_task<'a>(
        &'a self,
        task: &'a WorkflowTask,
        env: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, TaskExecution> {
        Box::pin(async move {
            let mut execution = TaskExecution::started(&task.id, &task.name);

            // conditional tasks consume the condition as their branch selector
            let is_branching = matches!(task.kind, TaskKind::Conditional { .. });
            if let Some(condition) = task.condition.as_deref() {
                if !is_branching && !evaluate_condition(condition, &self.context(env).await) {
                    info!(task = %task.id, condition, "condition is false, skipping task");
                    execution.finish(TaskStatus::Skipped);
                    return execution;
                }
            }

            let attempts = task.retry.as_ref().map(|r| r.attempts.max(1)).unwrap_or(1);
            let mut attempt = 1;
            loop {
                debug!(task = %task.id, attempt, "starting task attempt");
                let outcome = match task.timeout_ms {
                    Some(ms) => {
                        match tokio::time::timeout(
                            Duration::from_millis(ms),
                            self.dispatch(task, env),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(RunnerError::Timeout(ms)),
                        }
                    }
                    None => self.dispatch(task, env).await,
                };

                match outcome {
                    Ok(output) => {
                        execution.result = Some(output.result.clone());
                        execution.stdout = output.stdout.clone();
                        execution.stderr = output.stderr.clone();
                        execution.exit_code = output.exit_code;
                        self.outputs.write().await.insert(task.id.clone(), output);
                        execution.finish(TaskStatus::Completed);
                        return execution;
                    }
                    Err(err) if attempt < attempts && task.retry.is_some() => {
                        let delay = task
                            .retry
                            .as_ref()
                            .map(|policy| backoff_delay(policy, attempt))
                            .unwrap_or_default();
                        warn!(
                            task = %task.id,
                            attempt,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "task attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => {
                        warn!(task = %task.id, attempt, error = %err, "task failed");
                        execution.stdout = err.stdout().map(str::to_string);
                        execution.stderr = err.stderr().map(str::to_string);
                        execution.exit_code = err.exit_code();
                        execution.error = Some(err.to_string());
                        execution.finish(TaskStatus::Failed);
                        return execution;
                    }
                }
            }
        })
    }

    /// Snapshot of everything conditions can reference for this run.
    pub async fn context(&self, env: &HashMap<String, String>) -> serde_json::Value {
        let outputs = self.outputs.read().await;
        let tasks: serde_json::Map<String, serde_json::Value> = outputs
            .iter()
            .map(|(id, output)| (id.clone(), output.to_json()))
            .collect();
        json!({ "env": env, "tasks": tasks })
    }

    async fn dispatch(
        &self,
        task: &WorkflowTask,
        env: &HashMap<String, String>,
    ) -> Result<TaskOutput, RunnerError> {
        match &task.kind {
            TaskKind::Shell {
                command,
                cwd,
                environment,
            } => {
                let mut merged = env.clone();
                merged.extend(environment.clone());
                runner::run_shell(command, cwd.as_deref(), &merged).await
            }
            TaskKind::Http {
                url,
                method,
                headers,
                body,
            } => runner::run_http(&self.client, url, method, headers, body.as_ref(), env).await,
            TaskKind::Javascript { script } => runner::run_javascript(script, env).await,
            TaskKind::Python { script } => runner::run_python(script, env).await,
            TaskKind::Docker { image, command } => {
                runner::run_docker(image, command.as_deref(), env).await
            }
            TaskKind::Conditional { then, otherwise } => {
                self.run_conditional(task, then.as_deref(), otherwise.as_deref(), env)
                    .await
            }
            TaskKind::Parallel { tasks, wait_for } => {
                self.run_parallel(task, tasks, *wait_for, env).await
            }
            TaskKind::Loop {
                items,
                item,
                then,
                command,
                stop_on_failure,
            } => {
                self.run_loop(
                    task,
                    items,
                    item,
                    then.as_deref(),
                    command.as_deref(),
                    *stop_on_failure,
                    env,
                )
                .await
            }
        }
    }

    async fn run_conditional(
        &self,
        task: &WorkflowTask,
        then: Option<&InlineTask>,
        otherwise: Option<&InlineTask>,
        env: &HashMap<String, String>,
    ) -> Result<TaskOutput, RunnerError> {
        let condition = task.condition.as_deref().unwrap_or("");
        let take_then = evaluate_condition(condition, &self.context(env).await);
        let (branch, body) = if take_then {
            ("then", then)
        } else {
            ("else", otherwise)
        };
        debug!(task = %task.id, condition, branch, "conditional branch selected");

        let Some(body) = body else {
            return Ok(TaskOutput {
                result: json!({ "condition": condition, "branch": branch, "executed": false }),
                ..TaskOutput::default()
            });
        };

        let child = inline_to_task(body, task, &format!("{}-{branch}", task.id));
        let child_execution = self.execute_task(&child, env).await;
        match child_execution.status {
            TaskStatus::Failed => Err(RunnerError::ChildFailed {
                id: child.id,
                message: child_execution
                    .error
                    .unwrap_or_else(|| "unknown failure".to_string()),
            }),
            _ => Ok(TaskOutput {
                result: json!({
                    "condition": condition,
                    "branch": branch,
                    "executed": child_execution.status == TaskStatus::Completed,
                    "result": child_execution.result,
                }),
                exit_code: child_execution.exit_code,
                stdout: child_execution.stdout,
                stderr: child_execution.stderr,
            }),
        }
    }

    async fn run_parallel(
        &self,
        task: &WorkflowTask,
        children: &[WorkflowTask],
        wait_for: WaitFor,
        env: &HashMap<String, String>,
    ) -> Result<TaskOutput, RunnerError> {
        debug!(task = %task.id, children = children.len(), ?wait_for, "running parallel group");
        match wait_for {
            WaitFor::All => self.run_parallel_all(children, env).await,
            WaitFor::Any | WaitFor::First => self.run_parallel_race(task, children, env).await,
        }
    }

    /// `wait_for: all` drains every child; results keep declaration order.
    async fn run_parallel_all(
        &self,
        children: &[WorkflowTask],
        env: &HashMap<String, String>,
    ) -> Result<TaskOutput, RunnerError> {
        let mut pending: FuturesUnordered<_> = children
            .iter()
            .enumerate()
            .map(|(index, child)| async move { (index, self.execute_task(child, env).await) })
            .collect();

        let mut settled: Vec<Option<TaskExecution>> = (0..children.len()).map(|_| None).collect();
        while let Some((index, execution)) = pending.next().await {
            settled[index] = Some(execution);
        }

        let executions: Vec<TaskExecution> = settled.into_iter().flatten().collect();
        if let Some(failed) = executions.iter().find(|e| e.status == TaskStatus::Failed) {
            return Err(failed_child(failed));
        }

        let results: Vec<serde_json::Value> = executions.iter().map(child_summary).collect();
        Ok(TaskOutput {
            result: json!(results),
            ..TaskOutput::default()
        })
    }

    /// `wait_for: any`/`first` settles with the first child to finish and
    /// returns only that child's outcome. Siblings are not cancelled: they
    /// keep running detached and still record into the run's output map.
    async fn run_parallel_race(
        &self,
        task: &WorkflowTask,
        children: &[WorkflowTask],
        env: &HashMap<String, String>,
    ) -> Result<TaskOutput, RunnerError> {
        let mut pending: FuturesUnordered<_> = children
            .iter()
            .map(|child| {
                let executor = self.clone();
                let child = child.clone();
                let env = env.clone();
                tokio::spawn(async move { executor.execute_task(&child, &env).await })
            })
            .collect();

        let winner = match pending.next().await {
            Some(Ok(execution)) => execution,
            Some(Err(join_err)) => {
                return Err(RunnerError::ChildFailed {
                    id: task.id.clone(),
                    message: format!("child task panicked: {join_err}"),
                })
            }
            None => {
                return Ok(TaskOutput {
                    result: json!(null),
                    ..TaskOutput::default()
                })
            }
        };
        // dropping the remaining handles detaches the siblings
        drop(pending);

        if winner.status == TaskStatus::Failed {
            return Err(failed_child(&winner));
        }
        Ok(TaskOutput {
            result: child_summary(&winner),
            exit_code: winner.exit_code,
            stdout: winner.stdout,
            stderr: winner.stderr,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        task: &WorkflowTask,
        items: &[serde_json::Value],
        item_var: &str,
        body: Option<&InlineTask>,
        command: Option<&str>,
        stop_on_failure: bool,
        env: &HashMap<String, String>,
    ) -> Result<TaskOutput, RunnerError> {
        debug!(task = %task.id, items = items.len(), "running loop");
        let mut results = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            // items bind as JSON text, so string items keep their quotes
            let encoded = item.to_string();
            let mut iteration_env = env.clone();
            iteration_env.insert(item_var.to_string(), encoded.clone());

            let child = match (body, command) {
                (Some(inline), _) => inline_to_task(inline, task, &format!("{}-{index}", task.id)),
                (None, Some(template)) => {
                    let mut vars = iteration_env.clone();
                    vars.insert("item".to_string(), encoded.clone());
                    shell_task(
                        &format!("{}-{index}", task.id),
                        &runner::substitute_vars(template, &vars),
                        task,
                    )
                }
                (None, None) => break,
            };

            let execution = self.execute_task(&child, &iteration_env).await;
            let failed = execution.status == TaskStatus::Failed;
            results.push(json!({
                "index": index,
                "item": item,
                "status": execution.status,
                "result": execution.result,
                "error": execution.error,
            }));

            if failed && stop_on_failure {
                return Err(RunnerError::ChildFailed {
                    id: child.id,
                    message: format!(
                        "iteration {index} failed: {}",
                        execution.error.unwrap_or_else(|| "unknown failure".to_string())
                    ),
                });
            }
        }

        Ok(TaskOutput {
            result: json!(results),
            ..TaskOutput::default()
        })
    }
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn failed_child(execution: &TaskExecution) -> RunnerError {
    RunnerError::ChildFailed {
        id: execution.id.clone(),
        message: execution
            .error
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string()),
    }
}

fn child_summary(execution: &TaskExecution) -> serde_json::Value {
    json!({
        "id": execution.id,
        "status": execution.status,
        "result": execution.result,
        "error": execution.error,
    })
}

/// Materialize an inline branch/loop body as a full task. Identity,
/// timeout and retry fall back to the parent's.
fn inline_to_task(inline: &InlineTask, parent: &WorkflowTask, default_id: &str) -> WorkflowTask {
    WorkflowTask {
        id: inline.id.clone().unwrap_or_else(|| default_id.to_string()),
        name: inline
            .name
            .clone()
            .or_else(|| inline.id.clone())
            .unwrap_or_else(|| default_id.to_string()),
        depends_on: Vec::new(),
        condition: inline.condition.clone(),
        timeout_ms: inline.timeout_ms.or(parent.timeout_ms),
        retry: inline.retry.clone().or_else(|| parent.retry.clone()),
        on_success: Vec::new(),
        on_failure: Vec::new(),
        kind: inline.kind.clone(),
    }
}

fn shell_task(id: &str, command: &str, parent: &WorkflowTask) -> WorkflowTask {
    WorkflowTask {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: Vec::new(),
        condition: None,
        timeout_ms: parent.timeout_ms,
        retry: None,
        on_success: Vec::new(),
        on_failure: Vec::new(),
        kind: TaskKind::Shell {
            command: command.to_string(),
            cwd: None,
            environment: HashMap::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackoffStrategy, RetryPolicy};
    use serde_json::json;
    use std::time::Instant;

    fn shell(id: &str, command: &str) -> WorkflowTask {
        serde_json::from_value(json!({
            "id": id, "name": id, "type": "shell", "command": command
        }))
        .unwrap()
    }

    fn env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_shell_task_completes() {
        let executor = TaskExecutor::new();
        let execution = executor.execute_task(&shell("a", "echo hi"), &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
        assert!(execution.stdout.as_deref().unwrap().contains("hi"));
        assert_eq!(execution.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_false_condition_skips() {
        let executor = TaskExecutor::new();
        let mut task = shell("a", "echo never");
        task.condition = Some("1 == 2".to_string());
        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Skipped);
        assert!(execution.result.is_none());
    }

    #[tokio::test]
    async fn test_condition_sees_prior_task_output() {
        let executor = TaskExecutor::new();
        executor.execute_task(&shell("first", "echo ok"), &env()).await;

        let mut second = shell("second", "echo ran");
        second.condition = Some("tasks.first.exit_code == 0".to_string());
        let execution = executor.execute_task(&second, &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_exponential_retry_timing() {
        let executor = TaskExecutor::new();
        let mut task = shell("flaky", "exit 1");
        task.retry = Some(RetryPolicy {
            attempts: 3,
            delay_ms: 100,
            strategy: BackoffStrategy::Exponential,
            backoff_factor: 2.0,
            max_delay_ms: None,
            jitter_ms: None,
        });

        let start = Instant::now();
        let execution = executor.execute_task(&task, &env()).await;
        let elapsed = start.elapsed();

        assert_eq!(execution.status, TaskStatus::Failed);
        // waits of ~100ms and ~200ms between the three attempts
        assert!(elapsed >= Duration::from_millis(300), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2000), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn test_fixed_retry_exhausts_and_fails() {
        let executor = TaskExecutor::new();
        let mut task = shell("flaky", "exit 1");
        task.retry = Some(RetryPolicy {
            attempts: 2,
            delay_ms: 10,
            strategy: BackoffStrategy::Fixed,
            backoff_factor: 2.0,
            max_delay_ms: None,
            jitter_ms: None,
        });

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Failed);
        assert_eq!(execution.exit_code, Some(1));
        assert!(execution.error.is_some());
    }

    #[tokio::test]
    async fn test_timeout_bounds_one_attempt() {
        let executor = TaskExecutor::new();
        let mut task = shell("slow", "sleep 5");
        task.timeout_ms = Some(100);
        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_conditional_takes_else_branch() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "gate", "name": "gate", "type": "conditional",
            "condition": "1 == 2",
            "then": { "type": "shell", "command": "echo yes" },
            "else": { "type": "shell", "command": "echo no" }
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
        let result = execution.result.unwrap();
        assert_eq!(result["branch"], json!("else"));
        assert_eq!(result["executed"], json!(true));
    }

    #[tokio::test]
    async fn test_conditional_missing_branch_reports_not_executed() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "gate", "name": "gate", "type": "conditional",
            "condition": "1 == 2",
            "then": { "type": "shell", "command": "echo yes" }
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
        assert_eq!(execution.result.unwrap()["executed"], json!(false));
    }

    #[tokio::test]
    async fn test_parallel_all_records_both_children() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "par", "name": "par", "type": "parallel",
            "tasks": [
                { "id": "x", "name": "x", "type": "shell", "command": "echo x" },
                { "id": "y", "name": "y", "type": "shell", "command": "echo y" }
            ]
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
        let results = execution.result.unwrap();
        let results = results.as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["id"], json!("x"));
        assert_eq!(results[1]["id"], json!("y"));
    }

    #[tokio::test]
    async fn test_parallel_all_fails_on_any_failure() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "par", "name": "par", "type": "parallel",
            "tasks": [
                { "id": "ok", "name": "ok", "type": "shell", "command": "echo fine" },
                { "id": "bad", "name": "bad", "type": "shell", "command": "exit 1" }
            ]
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn test_parallel_any_settles_with_first_child() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "race", "name": "race", "type": "parallel", "wait_for": "any",
            "tasks": [
                { "id": "fast", "name": "fast", "type": "shell", "command": "echo fast" },
                { "id": "slow", "name": "slow", "type": "shell", "command": "sleep 2" }
            ]
        }))
        .unwrap();

        let start = Instant::now();
        let execution = executor.execute_task(&task, &env()).await;
        // the group must not block on the slow sibling
        assert!(start.elapsed() < Duration::from_millis(1500));
        assert_eq!(execution.status, TaskStatus::Completed);

        // only the winning child's outcome comes back
        let result = execution.result.unwrap();
        assert_eq!(result["id"], json!("fast"));
        assert_eq!(result["status"], json!("completed"));
        assert!(result.is_object());
    }

    #[tokio::test]
    async fn test_parallel_any_siblings_keep_running() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "race", "name": "race", "type": "parallel", "wait_for": "first",
            "tasks": [
                { "id": "win", "name": "win", "type": "shell", "command": "echo done" },
                { "id": "late", "name": "late", "type": "shell",
                  "command": "sleep 0.3 && echo late" }
            ]
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.result.unwrap()["id"], json!("win"));

        // the slow sibling was not cancelled; its output lands in the run map
        tokio::time::sleep(Duration::from_millis(800)).await;
        let context = executor.context(&env()).await;
        assert!(context["tasks"]["late"].is_object());
    }

    #[tokio::test]
    async fn test_parallel_any_fails_when_first_settled_fails() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "race", "name": "race", "type": "parallel", "wait_for": "any",
            "tasks": [
                { "id": "bad", "name": "bad", "type": "shell", "command": "exit 1" },
                { "id": "slow", "name": "slow", "type": "shell", "command": "sleep 1" }
            ]
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("bad"));
    }

    #[tokio::test]
    async fn test_loop_continues_past_failures() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "each", "name": "each", "type": "loop",
            "items": ["a", "b", "c"],
            "command": "if [ \"$item\" = '\"b\"' ]; then exit 1; fi; echo $item",
            "stop_on_failure": false
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
        let results = execution.result.unwrap();
        let results = results.as_array().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[1]["status"], json!("failed"));
        assert!(results[1]["error"].is_string());
        assert_eq!(results[0]["status"], json!("completed"));
        assert_eq!(results[2]["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_loop_stop_on_failure_aborts() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "each", "name": "each", "type": "loop",
            "items": [1, 2, 3],
            "command": "exit 1",
            "stop_on_failure": true
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Failed);
        assert!(execution.error.as_deref().unwrap().contains("iteration 0"));
    }

    #[tokio::test]
    async fn test_loop_substitutes_item_in_command() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "each", "name": "each", "type": "loop",
            "items": ["alpha"],
            "command": "echo ${item}"
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
        let results = execution.result.unwrap();
        assert_eq!(results[0]["result"], json!("alpha"));
    }

    #[tokio::test]
    async fn test_loop_binds_items_as_json_text() {
        let executor = TaskExecutor::new();
        let task: WorkflowTask = serde_json::from_value(json!({
            "id": "each", "name": "each", "type": "loop",
            "items": ["a", 1],
            "command": "printf '<%s>' \"$item\""
        }))
        .unwrap();

        let execution = executor.execute_task(&task, &env()).await;
        assert_eq!(execution.status, TaskStatus::Completed);
        let results = execution.result.unwrap();
        // string items arrive quoted, numbers bare
        assert_eq!(results[0]["result"], json!("<\"a\">"));
        assert_eq!(results[1]["result"], json!("<1>"));
    }
}
