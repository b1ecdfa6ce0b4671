//! Wire types for the stdio tool protocol spoken by automation subprocesses.
//!
//! Framing is newline-delimited JSON-RPC 2.0: one request or response object
//! per line. Tool failures travel inside a successful `tools/call` response
//! (`is_error`), protocol failures travel as JSON-RPC error objects; the two
//! must stay distinguishable for failure classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_LIST_TOOLS: &str = "tools/list";
pub const METHOD_CALL_TOOL: &str = "tools/call";

pub const TOOL_NAVIGATE: &str = "navigate";
pub const TOOL_CLICK: &str = "click";
pub const TOOL_FILL: &str = "fill";
pub const TOOL_WAIT_FOR_SELECTOR: &str = "wait_for_selector";
pub const TOOL_ASSERT_VISIBLE: &str = "assert_visible";
pub const TOOL_SCREENSHOT: &str = "screenshot";
pub const TOOL_CONSOLE_MESSAGES: &str = "console_messages";
pub const TOOL_CLOSE: &str = "close";

#[derive(Serialize, Debug)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// Anything the subprocess may print on stdout. Notifications are tolerated
/// and dropped; responses are routed to their pending caller by id.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum Incoming {
    Response {
        id: i64,
        result: Value,
    },
    Error {
        id: i64,
        error: JsonRpcErrorObject,
    },
    Notification {
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ToolContent {
    Text { text: String },
    Image { name: String },
}

#[derive(Deserialize, Debug, Default)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                ToolContent::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_responses_errors_and_notifications() {
        let response: Incoming =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#).unwrap();
        assert!(matches!(response, Incoming::Response { id: 3, .. }));

        let error: Incoming = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        match error {
            Incoming::Error { id, error } => {
                assert_eq!(id, 4);
                assert_eq!(error.code, -32601);
            }
            _ => panic!("expected an error frame"),
        }

        let notification: Incoming =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"log","params":{"line":"x"}}"#)
                .unwrap();
        assert!(matches!(notification, Incoming::Notification { .. }));
    }

    #[test]
    fn tool_errors_stay_distinguishable_from_protocol_errors() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"selector not found"}],"is_error":true}"#,
        )
        .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(result.text(), "selector not found");
    }
}
