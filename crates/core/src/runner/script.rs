use std::collections::HashMap;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::RunnerError;
use crate::types::TaskOutput;

use super::shell::capture;

/// Run a JavaScript task via node. A `script` ending in `.js`/`.mjs` that
/// exists on disk runs as a file; anything else runs inline with `-e`.
pub async fn run_javascript(
    script: &str,
    env: &HashMap<String, String>,
) -> Result<TaskOutput, RunnerError> {
    debug!("running javascript task");
    let mut cmd = Command::new("node");
    if is_script_file(script, &[".js", ".mjs"]) {
        cmd.arg(script);
    } else {
        cmd.arg("-e").arg(script);
    }
    cmd.envs(env).kill_on_drop(true);
    capture(cmd).await
}

/// Run a Python task via python3, with the same file-or-inline split.
pub async fn run_python(
    script: &str,
    env: &HashMap<String, String>,
) -> Result<TaskOutput, RunnerError> {
    debug!("running python task");
    let mut cmd = Command::new("python3");
    if is_script_file(script, &[".py"]) {
        cmd.arg(script);
    } else {
        cmd.arg("-c").arg(script);
    }
    cmd.envs(env).kill_on_drop(true);
    capture(cmd).await
}

fn is_script_file(script: &str, extensions: &[&str]) -> bool {
    extensions.iter().any(|ext| script.ends_with(ext)) && Path::new(script).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_python_inline_json_result() {
        let out = run_python("import json; print(json.dumps({'n': 2}))", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out.result, serde_json::json!({"n": 2}));
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_python_sees_environment() {
        let mut env = HashMap::new();
        env.insert("WHO".to_string(), "cascade".to_string());
        let out = run_python("import os; print(os.environ['WHO'])", &env)
            .await
            .unwrap();
        assert!(out.stdout.as_deref().unwrap().contains("cascade"));
    }

    #[tokio::test]
    async fn test_python_failure_is_runner_error() {
        let err = run_python("import sys; sys.exit(2)", &HashMap::new())
            .await
            .unwrap_err();
        match err {
            RunnerError::NonZeroExit { code, .. } => assert_eq!(code, 2),
            other => panic!("unexpected error: {other}"),
        }
    }
}
