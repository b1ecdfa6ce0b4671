pub mod client;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::automation::client::ToolClient;

/// One tool call the agent made while executing, kept for evidence: step
/// outcomes, screenshot names and failure details are reconstructed from this
/// trace.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    pub ok: bool,
    pub detail: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub final_text: String,
    pub invocations: Vec<ToolInvocation>,
}

/// A model-backed agent: given a prompt and a live tool handle it issues
/// browser tool calls autonomously and returns its final free-text answer.
#[async_trait]
pub trait ModelAgent: Send + Sync {
    async fn run(
        &self,
        prompt: &str,
        tools: &ToolClient,
        timeout: Duration,
    ) -> Result<AgentOutcome>;
}

/// Stand-in for code paths that never execute a cell (dry runs). Calling it
/// is a bug and reports the missing credentials it would otherwise hide.
pub struct NullAgent;

#[async_trait]
impl ModelAgent for NullAgent {
    async fn run(
        &self,
        _prompt: &str,
        _tools: &ToolClient,
        _timeout: Duration,
    ) -> Result<AgentOutcome> {
        Err(crate::errors::AgentError::MissingCredentials {
            var: client::MODEL_API_KEY_VAR.to_string(),
        }
        .into())
    }
}
