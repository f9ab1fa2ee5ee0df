use thiserror::Error;

/// A single structural problem found while validating a workflow
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("workflow name must not be empty")]
    EmptyName,
    #[error("workflow version must not be empty")]
    EmptyVersion,
    #[error("workflow must contain at least one task")]
    NoTasks,
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),
    #[error("task {task}: id must not be empty")]
    EmptyTaskId { task: usize },
    #[error("task {task}: unknown dependency: {dependency}")]
    UnknownDependency { task: String, dependency: String },
    #[error("task {task}: depends on itself")]
    SelfDependency { task: String },
    #[error("circular dependency detected involving task {0}")]
    CircularDependency(String),
    #[error("task {task}: {field} is required for {task_type} tasks")]
    MissingField {
        task: String,
        task_type: &'static str,
        field: &'static str,
    },
    #[error("task {task}: retry attempts must be at least 1")]
    InvalidRetryAttempts { task: String },
    #[error("task {task}: timeout must be greater than zero")]
    InvalidTimeout { task: String },
    #[error("task {task}: loop requires either a body task or a command")]
    EmptyLoopBody { task: String },
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,
    #[error("task {task}: unknown callback task: {callback}")]
    UnknownCallback { task: String, callback: String },
    #[error("task {task}: depends on callback task {dependency}")]
    CallbackDependency { task: String, dependency: String },
    #[error("schedule trigger requires a cron expression")]
    MissingSchedule,
    #[error("invalid cron expression: {0}")]
    InvalidSchedule(String),
    #[error("file_change trigger requires at least one file pattern")]
    MissingWatchFiles,
}

/// Every problem found in one validation pass
#[derive(Debug, Error)]
#[error("workflow {workflow} failed validation with {} error(s)", errors.len())]
pub struct ValidationFailure {
    pub workflow: String,
    pub errors: Vec<ValidationError>,
}

impl ValidationFailure {
    pub fn report(&self) -> String {
        let mut out = format!("workflow {} failed validation:\n", self.workflow);
        for err in &self.errors {
            out.push_str("  - ");
            out.push_str(&err.to_string());
            out.push('\n');
        }
        out
    }
}

/// Failure of a single runner attempt
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("command exited with code {code}")]
    NonZeroExit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("command terminated by signal")]
    Signalled { stdout: String, stderr: String },
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("task timed out after {0}ms")]
    Timeout(u64),
    #[error("child task {id} failed: {message}")]
    ChildFailed { id: String, message: String },
}

impl RunnerError {
    /// Captured stdout of the failed attempt, if the process ran
    pub fn stdout(&self) -> Option<&str> {
        match self {
            RunnerError::NonZeroExit { stdout, .. } | RunnerError::Signalled { stdout, .. } => {
                Some(stdout)
            }
            _ => None,
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            RunnerError::NonZeroExit { stderr, .. } | RunnerError::Signalled { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunnerError::NonZeroExit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Top-level engine errors
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read workflow file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse workflow: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error("workflow {0} is not registered")]
    UnknownWorkflow(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failure_report_lists_every_error() {
        let failure = ValidationFailure {
            workflow: "ci".to_string(),
            errors: vec![
                ValidationError::DuplicateTaskId("build".to_string()),
                ValidationError::UnknownDependency {
                    task: "test".to_string(),
                    dependency: "missing".to_string(),
                },
            ],
        };

        let report = failure.report();
        assert!(report.contains("duplicate task id: build"));
        assert!(report.contains("unknown dependency: missing"));
        assert!(failure.to_string().contains("2 error(s)"));
    }

    #[test]
    fn test_cycle_error_names_the_task() {
        let err = ValidationError::CircularDependency("deploy".to_string());
        assert_eq!(
            err.to_string(),
            "circular dependency detected involving task deploy"
        );
    }

    #[test]
    fn test_runner_error_accessors() {
        let err = RunnerError::NonZeroExit {
            code: 2,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(err.exit_code(), Some(2));
        assert_eq!(err.stdout(), Some("out"));
        assert_eq!(err.stderr(), Some("err"));
        assert!(RunnerError::Timeout(500).exit_code().is_none());
    }
}
