//! Leaf task runners. Each runner is a stateless async function that takes
//! the task payload plus the run's environment and returns a structured
//! output or a `RunnerError`. Retry and timeout policy live a level up in
//! the task executor.

mod docker;
mod http;
mod script;
mod shell;

pub use docker::run_docker;
pub use http::run_http;
pub use script::{run_javascript, run_python};
pub use shell::run_shell;

use std::collections::HashMap;

/// Replace `${NAME}` and `${env.NAME}` references with values from the
/// environment map. Unknown references are left as written.
pub fn substitute_vars(template: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = after[..end].trim();
                let key = key.strip_prefix("env.").unwrap_or(key);
                match env.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse process stdout into a JSON result where possible, falling back to
/// the trimmed text.
pub(crate) fn stdout_result(stdout: &str) -> serde_json::Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()))
}
