use std::collections::HashMap;

use reqwest::Method;
use tracing::debug;

use crate::error::RunnerError;
use crate::types::TaskOutput;

use super::substitute_vars;

/// Issue an HTTP request. Any response status is a runner success with the
/// status surfaced in the result; only transport-level failures error.
pub async fn run_http(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    headers: &HashMap<String, String>,
    body: Option<&serde_json::Value>,
    env: &HashMap<String, String>,
) -> Result<TaskOutput, RunnerError> {
    let url = substitute_vars(url, env);
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .unwrap_or(Method::GET);
    debug!(%method, %url, "running http request");

    let mut request = client.request(method, &url);
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let text = response.text().await?;
    let body: serde_json::Value =
        serde_json::from_str(&text).unwrap_or_else(|_| serde_json::Value::String(text.clone()));

    Ok(TaskOutput {
        result: serde_json::json!({ "status": status, "body": body }),
        exit_code: None,
        stdout: Some(text),
        stderr: None,
    })
}
