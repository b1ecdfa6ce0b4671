use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_with::skip_serializing_none;
use tokio::time::Instant;

use crate::automation::client::ToolClient;
use crate::automation::protocol::ToolDescriptor;
use crate::errors::{AgentError, ToolError};

use super::{AgentOutcome, ModelAgent, ToolInvocation};

pub const MODEL_API_KEY_VAR: &str = "TESTGPT_MODEL_API_KEY";
pub const MODEL_BASE_URL_VAR: &str = "TESTGPT_MODEL_BASE_URL";
pub const MODEL_NAME_VAR: &str = "TESTGPT_MODEL";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const MAX_TURNS: usize = 32;

/// Chat-completions client with an autonomous tool loop: the model keeps
/// receiving tool results until it produces a final text answer. Credentials
/// come from the environment and are never logged or persisted.
pub struct HttpModelAgent {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    max_turns: usize,
}

impl HttpModelAgent {
    pub fn from_env() -> Result<Self> {
        let api_key =
            std::env::var(MODEL_API_KEY_VAR).map_err(|_| AgentError::MissingCredentials {
                var: MODEL_API_KEY_VAR.to_string(),
            })?;
        let base_url = std::env::var(MODEL_BASE_URL_VAR)
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let model = std::env::var(MODEL_NAME_VAR).unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        Ok(Self {
            client: Client::builder()
                .pool_idle_timeout(Some(Duration::from_secs(20)))
                .build()
                .expect("default reqwest client"),
            base_url,
            model,
            api_key,
            max_turns: MAX_TURNS,
        })
    }

    async fn complete(&self, request: &ChatCompletionRequest) -> Result<AssistantMessage> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|error| AgentError::RequestFailed { error })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::ApiFailure {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|error| AgentError::DeserializationFailure { error })?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| {
                AgentError::ApiFailure {
                    status: status.as_u16(),
                    body: "completion carried no choices".to_string(),
                }
                .into()
            })
    }
}

#[async_trait]
impl ModelAgent for HttpModelAgent {
    async fn run(
        &self,
        prompt: &str,
        tools: &ToolClient,
        timeout: Duration,
    ) -> Result<AgentOutcome> {
        let deadline = Instant::now() + timeout;
        let tool_specs: Vec<ToolSpec> = tools
            .list_tools()
            .await
            .map_err(anyhow::Error::from)?
            .iter()
            .map(ToolSpec::from)
            .collect();

        let mut messages = vec![ChatMessage::user(prompt)];
        let mut invocations: Vec<ToolInvocation> = Vec::new();

        for turn in 0..self.max_turns {
            if Instant::now() >= deadline {
                return Err(AgentError::Timeout { timeout }.into());
            }

            let request = ChatCompletionRequest {
                model: self.model.clone(),
                messages: messages.clone(),
                tools: tool_specs.clone(),
            };
            let assistant = self.complete(&request).await?;

            let tool_calls = assistant.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() {
                debug!("agent finished after {turn} tool turn(s)");
                return Ok(AgentOutcome {
                    final_text: assistant.content.unwrap_or_default(),
                    invocations,
                });
            }

            messages.push(ChatMessage::assistant(&assistant));
            for call in tool_calls {
                let arguments: Value = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| json!({}));
                let started = Instant::now();
                let (ok, detail) = match tools
                    .call_tool(&call.function.name, arguments.clone())
                    .await
                {
                    Ok(text) => (true, text),
                    // A failing tool is evidence the agent should see and may
                    // recover from. A broken subprocess is not.
                    Err(ToolError::ToolFailed { message, .. }) => (false, message),
                    Err(fatal) => {
                        warn!("tool call {} failed fatally: {fatal}", call.function.name);
                        return Err(fatal.into());
                    }
                };
                invocations.push(ToolInvocation {
                    tool: call.function.name.clone(),
                    arguments,
                    ok,
                    detail: detail.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                messages.push(ChatMessage::tool(&call.id, &detail));
            }
        }

        Err(AgentError::TurnBudgetExhausted {
            max_turns: self.max_turns,
        }
        .into())
    }
}

#[derive(Serialize, Debug, Clone)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    tools: Vec<ToolSpec>,
}

#[skip_serializing_none]
#[derive(Serialize, Debug, Clone)]
struct ChatMessage {
    role: String,
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallMessage>>,
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn assistant(message: &AssistantMessage) -> Self {
        Self {
            role: "assistant".to_string(),
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: None,
        }
    }

    fn tool(call_id: &str, content: &str) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: Some(call_id.to_string()),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
struct ToolSpec {
    #[serde(rename = "type")]
    spec_type: String,
    function: FunctionSpec,
}

#[derive(Serialize, Debug, Clone)]
struct FunctionSpec {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolDescriptor> for ToolSpec {
    fn from(descriptor: &ToolDescriptor) -> Self {
        Self {
            spec_type: "function".to_string(),
            function: FunctionSpec {
                name: descriptor.name.clone(),
                description: descriptor.description.clone(),
                parameters: descriptor
                    .input_schema
                    .clone()
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            },
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
struct ToolCallMessage {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: FunctionCall,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
struct FunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Debug)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Deserialize, Debug)]
struct AssistantMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallMessage>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_descriptors_become_function_specs() {
        let descriptor = ToolDescriptor {
            name: "navigate".to_string(),
            description: "Open a URL".to_string(),
            input_schema: Some(json!({
                "type": "object",
                "properties": {"url": {"type": "string"}}
            })),
        };
        let spec = ToolSpec::from(&descriptor);
        assert_eq!(spec.spec_type, "function");
        assert_eq!(spec.function.name, "navigate");
        assert_eq!(spec.function.parameters["properties"]["url"]["type"], "string");
    }

    #[test]
    fn missing_schema_defaults_to_an_open_object() {
        let descriptor = ToolDescriptor {
            name: "close".to_string(),
            description: String::new(),
            input_schema: None,
        };
        let spec = ToolSpec::from(&descriptor);
        assert_eq!(spec.function.parameters["type"], "object");
    }

    #[test]
    fn parses_a_tool_call_completion() {
        let body = r#"{
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "navigate", "arguments": "{\"url\":\"https://example.com\"}"}
                    }]
                }
            }]
        }"#;
        let completion: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        let calls = completion.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "navigate");
    }

    #[test]
    fn parses_a_final_text_completion() {
        let body = r#"{"choices":[{"message":{"content":"Test Status: PASSED"}}]}"#;
        let completion: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            completion.choices[0].message.content.as_deref(),
            Some("Test Status: PASSED")
        );
    }
}
