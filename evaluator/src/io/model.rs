//! Language-model provider boundary.
//!
//! The [`ModelClient`] trait decouples the tool loop from the actual provider.
//! One call is one generation round: the client sees the whole transcript and
//! returns either tool calls, a final answer, or both (the answer wins).
//! Tests use scripted clients that return predetermined turns.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: String,
    },
    /// Free text the model emitted alongside tool calls.
    Assistant {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

/// Tool advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// Everything the provider needs for one generation round.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest<'a> {
    pub model_id: &'a str,
    pub instructions: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
    pub output_schema: &'a Value,
    /// 1-based round number.
    pub step: u32,
    pub max_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// Provider response for one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Raw structured answer, validated by the output contract.
    #[serde(default)]
    pub answer: Option<String>,
}

pub trait ModelClient {
    /// Run one generation round. Errors are provider failures and end the
    /// evaluation.
    fn next_turn(&self, request: &GenerationRequest<'_>) -> Result<ModelTurn>;
}

/// Model client that delegates each round to an external bridge process.
///
/// The bridge receives the [`GenerationRequest`] as JSON on stdin and must
/// print a single [`ModelTurn`] JSON object on stdout. Credentials and
/// provider selection are the bridge's concern.
#[derive(Debug, Clone)]
pub struct CommandModelClient {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandModelClient {
    pub fn new(command: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            command,
            timeout,
            output_limit_bytes,
        }
    }
}

impl ModelClient for CommandModelClient {
    #[instrument(skip_all, fields(step = request.step, model_id = request.model_id))]
    fn next_turn(&self, request: &GenerationRequest<'_>) -> Result<ModelTurn> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("model bridge command is empty"))?;
        let payload = serde_json::to_vec(request).context("serialize generation request")?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(
            cmd,
            Some(&payload),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run model bridge {program}"))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "model bridge timed out");
            return Err(anyhow!("model bridge timed out after {:?}", self.timeout));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "model bridge failed with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "model bridge response exceeded {} bytes",
                self.output_limit_bytes
            ));
        }

        let turn: ModelTurn =
            serde_json::from_slice(&output.stdout).context("parse model bridge response")?;
        debug!(
            tool_calls = turn.tool_calls.len(),
            has_answer = turn.answer.is_some(),
            "model turn received"
        );
        Ok(turn)
    }
}
