//! The runtime adapter contract.
//!
//! An adapter wraps one ephemeral child-process runtime (`claude_code`,
//! `codex`, `opencode`). The spawner treats it as opaque: prompt and
//! snapshot in, terminal result with usage out.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{RuntimeError, RuntimeResult};

/// One invocation request.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Fully composed system prompt.
    pub system_prompt: String,
    /// The user-facing prompt.
    pub prompt: String,
    /// Model name.
    pub model: String,
    /// The credential snapshot: the only environment the child sees.
    pub env: BTreeMap<String, String>,
}

/// A tool call the runtime made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool name.
    pub tool: String,
    /// Arguments as the runtime reported them.
    pub args: serde_json::Value,
}

/// Token usage of one invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SpawnUsage {
    /// Input tokens.
    pub input_tokens: i64,
    /// Output tokens.
    pub output_tokens: i64,
}

/// Terminal result of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedResult {
    /// Whether the runtime exited cleanly with a result.
    pub success: bool,
    /// Final text output.
    pub result: Option<String>,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// Tool calls made during the invocation.
    pub tool_calls: Vec<ToolCallRecord>,
    /// Token usage.
    pub usage: SpawnUsage,
}

/// An ephemeral LLM child-process runtime.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// The adapter's name (`claude_code`, `codex`, ...).
    fn name(&self) -> &'static str;

    /// Run one invocation to completion.
    async fn invoke(&self, request: SpawnRequest) -> RuntimeResult<SpawnedResult>;
}

/// Adapter for the `claude_code` CLI runtime.
///
/// Invokes the binary in non-interactive mode with JSON output and a
/// scrubbed environment: only the credential snapshot is passed, so
/// undeclared variables never reach the child.
#[derive(Debug, Clone)]
pub struct ClaudeCodeAdapter {
    /// Binary to execute.
    binary: String,
}

impl ClaudeCodeAdapter {
    /// Create an adapter invoking `binary`.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ClaudeCodeAdapter {
    fn default() -> Self {
        Self::new("claude")
    }
}

/// The JSON document the `claude_code` runtime prints on exit.
#[derive(Debug, Deserialize)]
struct CliOutput {
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    usage: CliUsage,
    #[serde(default)]
    num_turns: i64,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

#[async_trait]
impl RuntimeAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &'static str {
        "claude_code"
    }

    async fn invoke(&self, request: SpawnRequest) -> RuntimeResult<SpawnedResult> {
        let mut child = Command::new(&self.binary)
            .arg("-p")
            .arg("--output-format")
            .arg("json")
            .arg("--model")
            .arg(&request.model)
            .arg("--system-prompt")
            .arg(&request.system_prompt)
            .env_clear()
            .envs(&request.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Adapter(format!("spawn {}: {e}", self.binary)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| RuntimeError::Adapter(format!("write prompt: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RuntimeError::Adapter(format!("wait: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: CliOutput = serde_json::from_str(stdout.trim())
            .map_err(|e| RuntimeError::BadOutput(format!("{e}: {}", truncate(&stdout, 400))))?;

        if parsed.is_error || !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(SpawnedResult {
                success: false,
                result: None,
                error: Some(
                    parsed
                        .result
                        .unwrap_or_else(|| truncate(&stderr, 400)),
                ),
                tool_calls: Vec::new(),
                usage: SpawnUsage {
                    input_tokens: parsed.usage.input_tokens,
                    output_tokens: parsed.usage.output_tokens,
                },
            });
        }

        Ok(SpawnedResult {
            success: true,
            result: parsed.result,
            error: None,
            // The CLI reports turn counts, not individual calls; each
            // turn beyond the first implies at least one tool call.
            tool_calls: vec![
                ToolCallRecord {
                    tool: "turn".to_owned(),
                    args: serde_json::Value::Null,
                };
                usize::try_from(parsed.num_turns.saturating_sub(1).max(0)).unwrap_or(0)
            ],
            usage: SpawnUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_output_parses_minimal_document() {
        let doc = r#"{"is_error": false, "result": "done", "usage": {"input_tokens": 10, "output_tokens": 4}, "num_turns": 3}"#;
        let parsed: CliOutput = serde_json::from_str(doc).unwrap();
        assert!(!parsed.is_error);
        assert_eq!(parsed.result.as_deref(), Some("done"));
        assert_eq!(parsed.usage.input_tokens, 10);
        assert_eq!(parsed.num_turns, 3);
    }

    #[test]
    fn cli_output_tolerates_missing_fields() {
        let parsed: CliOutput = serde_json::from_str("{}").unwrap();
        assert!(!parsed.is_error);
        assert!(parsed.result.is_none());
        assert_eq!(parsed.usage.output_tokens, 0);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
    }
}
