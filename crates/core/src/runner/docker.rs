use std::collections::HashMap;

use tracing::debug;

use crate::error::RunnerError;
use crate::types::TaskOutput;

use super::run_shell;

/// Run an image through the docker CLI. `--rm` removes the container on
/// every outcome, including failures and timeouts that kill the client.
pub async fn run_docker(
    image: &str,
    command: Option<&str>,
    env: &HashMap<String, String>,
) -> Result<TaskOutput, RunnerError> {
    debug!(image, "running docker task");
    let mut shell_command = format!("docker run --rm {image}");
    if let Some(cmd) = command {
        shell_command.push(' ');
        shell_command.push_str(cmd);
    }
    run_shell(&shell_command, None, env).await
}
