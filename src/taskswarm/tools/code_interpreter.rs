//! Sandbox code interpreter tool for non-native models.
//!
//! Roles granted the provider-native `code_interpreter` capability fall back
//! to this tool when their model cannot enable it server-side. Code is
//! shipped to an external execution sandbox over HTTP and the run outcome
//! comes back as `{stdout, stderr, return_code, execution_time}`.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use crate::taskswarm::clients::common::get_shared_http_client;
use crate::taskswarm::tool_registry::{ToolRegistry, ToolRegistryError, ToolSpec};

/// Registry name of the code interpreter tool.
pub const SANDBOX_CODE_INTERPRETER_TOOL: &str = "sandbox_code_interpreter";

/// Environment variable overriding the sandbox executor endpoint.
pub const SANDBOX_ENDPOINT_ENV: &str = "SANDBOX_EXECUTOR_URL";

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8194";

/// HTTP client for the external execution sandbox.
pub struct SandboxCodeInterpreter {
    http: reqwest::Client,
    endpoint: String,
}

impl Default for SandboxCodeInterpreter {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxCodeInterpreter {
    /// Create an interpreter pointing at the configured or default endpoint.
    pub fn new() -> Self {
        let endpoint = std::env::var(SANDBOX_ENDPOINT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Self {
            http: get_shared_http_client().clone(),
            endpoint,
        }
    }

    /// Point the interpreter at a specific sandbox endpoint (builder pattern).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Execute a snippet in the sandbox.
    pub async fn execute(
        &self,
        code: &str,
        language: &str,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/execute", self.endpoint.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "code": code, "language": language }))
            .timeout(Duration::from_secs(55))
            .send()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;
        if !status.is_success() {
            return Err(format!("sandbox execution failed: HTTP {} — {}", status, text).into());
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })?;

        Ok(serde_json::json!({
            "stdout": parsed.get("stdout").and_then(|v| v.as_str()).unwrap_or(""),
            "stderr": parsed.get("stderr").and_then(|v| v.as_str()).unwrap_or(""),
            "return_code": parsed.get("return_code").and_then(|v| v.as_i64()).unwrap_or(-1),
            "execution_time": parsed.get("execution_time").and_then(|v| v.as_f64()).unwrap_or(0.0),
        }))
    }
}

/// Register the interpreter under [`SANDBOX_CODE_INTERPRETER_TOOL`].
pub fn register_sandbox_code_interpreter(
    registry: &mut ToolRegistry,
    interpreter: Arc<SandboxCodeInterpreter>,
) -> Result<(), ToolRegistryError> {
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "code": {
                "type": "string",
                "description": "Source code to execute"
            },
            "language": {
                "type": "string",
                "description": "Language of the snippet (default python)",
                "default": "python"
            }
        },
        "required": ["code"]
    });

    let spec = ToolSpec::new(
        SANDBOX_CODE_INTERPRETER_TOOL,
        "Execute code in an isolated sandbox and return stdout, stderr, the \
         process return code, and the execution time. Use for calculations, \
         data processing, and verifying generated code.",
        schema,
        Arc::new(move |args| {
            let interpreter = interpreter.clone();
            Box::pin(async move {
                let code = args.get("code").and_then(|c| c.as_str()).unwrap_or("");
                if code.trim().is_empty() {
                    return Err("'code' argument must be a non-empty string".into());
                }
                let language = args
                    .get("language")
                    .and_then(|l| l.as_str())
                    .unwrap_or("python");
                interpreter.execute(code, language).await
            })
        }),
    )
    .with_timeout(Duration::from_secs(60));

    registry.register(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_code_is_rejected_through_the_registry() {
        let mut registry = ToolRegistry::new();
        register_sandbox_code_interpreter(
            &mut registry,
            Arc::new(SandboxCodeInterpreter::new()),
        )
        .unwrap();

        let record = registry
            .invoke_tool(
                SANDBOX_CODE_INTERPRETER_TOOL,
                serde_json::json!({"code": "   "}),
                "agent-1",
            )
            .await;
        assert!(!record.success);
        assert!(record.error.as_deref().unwrap().contains("non-empty"));
    }
}
