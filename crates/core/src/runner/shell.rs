use std::collections::HashMap;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::RunnerError;
use crate::types::TaskOutput;

use super::stdout_result;

/// Run a shell command, capturing stdout, stderr and the exit code.
/// Non-zero exit is a runner failure carrying the captured output.
pub async fn run_shell(
    command: &str,
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<TaskOutput, RunnerError> {
    debug!(command, "running shell command");

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).envs(env).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    capture(cmd).await
}

/// Spawn a prepared command and convert its output to the runner contract.
pub(crate) async fn capture(mut cmd: Command) -> Result<TaskOutput, RunnerError> {
    let output = cmd.output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    match output.status.code() {
        Some(0) => Ok(TaskOutput {
            result: stdout_result(&stdout),
            exit_code: Some(0),
            stdout: Some(stdout),
            stderr: Some(stderr),
        }),
        Some(code) => Err(RunnerError::NonZeroExit {
            code,
            stdout,
            stderr,
        }),
        None => Err(RunnerError::Signalled { stdout, stderr }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_captures_stdout() {
        let out = run_shell("echo hi", None, &HashMap::new()).await.unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert!(out.stdout.as_deref().unwrap().contains("hi"));
        assert_eq!(out.result, serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn test_shell_env_is_visible() {
        let mut env = HashMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        let out = run_shell("echo $GREETING", None, &env).await.unwrap();
        assert!(out.stdout.as_deref().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_shell_nonzero_exit_is_error() {
        let err = run_shell("exit 3", None, &HashMap::new())
            .await
            .unwrap_err();
        match err {
            RunnerError::NonZeroExit { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_shell_json_stdout_becomes_result() {
        let out = run_shell("echo '{\"n\": 1}'", None, &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.result, serde_json::json!({"n": 1}));
    }
}
