use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a workflow is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
    FileChange,
}

/// Trigger declaration on a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub config: TriggerConfig,
}

/// Type-specific trigger settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Cron expression for schedule triggers
    #[serde(default)]
    pub schedule: Option<String>,
    /// File patterns for file-change triggers
    #[serde(default)]
    pub files: Vec<String>,
    /// Endpoint path for webhook triggers
    #[serde(default)]
    pub webhook: Option<String>,
}

/// A declarative workflow: a DAG of typed tasks plus a trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger: WorkflowTrigger,
    /// Workflow-level environment, merged over the process environment
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Optional cap on concurrently running tasks; absent means the DAG is
    /// the only bound
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Baseline duration used by alert conditions
    #[serde(default, rename = "expected_duration")]
    pub expected_duration_ms: Option<u64>,
    pub tasks: Vec<WorkflowTask>,
}

/// One task in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Gate expression; `false` skips the task. Conditional tasks use it to
    /// select the branch instead.
    #[serde(default)]
    pub condition: Option<String>,
    /// Per-attempt timeout in milliseconds
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Ids of tasks to run after this task completes. Callback tasks are not
    /// scheduled by the DAG; they only run when fired here.
    #[serde(default)]
    pub on_success: Vec<String>,
    /// Ids of tasks to run after this task fails
    #[serde(default)]
    pub on_failure: Vec<String>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

/// Type-specific task payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Run a shell command
    Shell {
        command: String,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        environment: HashMap<String, String>,
    },
    /// Issue an HTTP request
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    /// Run a JavaScript file or inline snippet via node
    Javascript { script: String },
    /// Run a Python file or inline snippet via python3
    Python { script: String },
    /// Run an image through docker, removing the container afterwards
    Docker {
        image: String,
        #[serde(default)]
        command: Option<String>,
    },
    /// Branch on the task's `condition` field
    Conditional {
        #[serde(default)]
        then: Option<Box<InlineTask>>,
        #[serde(default, rename = "else")]
        otherwise: Option<Box<InlineTask>>,
    },
    /// Run child tasks concurrently
    Parallel {
        tasks: Vec<WorkflowTask>,
        #[serde(default)]
        wait_for: WaitFor,
    },
    /// Run a templated body once per item
    Loop {
        items: Vec<serde_json::Value>,
        /// Environment variable the current element is bound to
        #[serde(default = "default_loop_var")]
        item: String,
        #[serde(default)]
        then: Option<Box<InlineTask>>,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        stop_on_failure: bool,
    },
}

impl TaskKind {
    /// Schema name of the task type, as written in workflow documents
    pub fn type_name(&self) -> &'static str {
        match self {
            TaskKind::Shell { .. } => "shell",
            TaskKind::Http { .. } => "http",
            TaskKind::Javascript { .. } => "javascript",
            TaskKind::Python { .. } => "python",
            TaskKind::Docker { .. } => "docker",
            TaskKind::Conditional { .. } => "conditional",
            TaskKind::Parallel { .. } => "parallel",
            TaskKind::Loop { .. } => "loop",
        }
    }
}

fn default_http_method() -> String {
    "GET".to_string()
}

fn default_loop_var() -> String {
    "item".to_string()
}

/// Inline task payload used by conditional branches and loop bodies.
/// Identity, timeout and retry default to the enclosing task's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, rename = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(flatten)]
    pub kind: TaskKind,
}

/// Resolution policy for parallel tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitFor {
    #[default]
    All,
    Any,
    First,
}

/// Backoff strategy between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Fixed,
    Exponential,
}

/// Whole-task retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    #[serde(rename = "delay")]
    pub delay_ms: u64,
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default, rename = "max_delay")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, rename = "jitter")]
    pub jitter_ms: Option<u64>,
}

fn default_backoff_factor() -> f64 {
    2.0
}

/// Status of a single task within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// Execution record for one task; immutable once terminal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub name: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl TaskExecution {
    pub fn started(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: TaskStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            result: None,
            stdout: None,
            stderr: None,
            exit_code: None,
            error: None,
        }
    }

    /// Stamp the end time and duration
    pub fn finish(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.ended_at = Some(now);
    }
}

/// One run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: ExecutionId,
    pub workflow: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub tasks: HashMap<String, TaskExecution>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub fn started(workflow: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            workflow: workflow.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            tasks: HashMap::new(),
            error: None,
        }
    }

    pub fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.ended_at = Some(now);
    }
}

/// Structured output of a completed task, keyed by task id so later
/// conditions and templates can reference it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: serde_json::Value,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl TaskOutput {
    /// Flatten into the JSON shape conditions see under `tasks.<id>`
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "result": self.result,
            "exit_code": self.exit_code,
            "stdout": self.stdout,
            "stderr": self.stderr,
        })
    }
}
