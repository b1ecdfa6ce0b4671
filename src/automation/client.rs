use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::ToolError;

use super::protocol::{
    CallToolResult, Incoming, JsonRpcErrorObject, JsonRpcRequest, ListToolsResult, ToolDescriptor,
    JSONRPC_VERSION, METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_LIST_TOOLS, TOOL_CLOSE,
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_DEADLINE: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, JsonRpcErrorObject>>>>>;

/// One live automation subprocess and the request/response plumbing over its
/// stdio. Requests are multiplexed by id; a background task routes stdout
/// frames back to their callers.
pub struct ToolClient {
    next_request_id: AtomicI64,
    process: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<ChildStdin>,
    pending: PendingMap,
    reader: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

impl ToolClient {
    pub fn spawn(mut command: Command) -> std::io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut process = command.spawn()?;
        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("subprocess has no stdin"))?;
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("subprocess has no stdout"))?;
        if let Some(stderr) = process.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("subprocess stderr: {line}");
                }
            });
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(route_incoming(
            BufReader::new(stdout),
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        Ok(Self {
            next_request_id: AtomicI64::new(0),
            process: tokio::sync::Mutex::new(process),
            stdin: tokio::sync::Mutex::new(stdin),
            pending,
            reader,
            alive,
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub async fn initialize(&self) -> Result<(), ToolError> {
        self.request(
            METHOD_INITIALIZE,
            Some(json!({
                "client_info": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })),
            DEFAULT_CALL_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        let value = self
            .request(METHOD_LIST_TOOLS, None, DEFAULT_CALL_TIMEOUT)
            .await?;
        let result: ListToolsResult =
            serde_json::from_value(value).map_err(|error| ToolError::Protocol {
                message: format!("malformed tools/list result: {error}"),
            })?;
        Ok(result.tools)
    }

    /// Invokes one tool. A tool-level failure (`is_error`) is returned as
    /// `ToolFailed`; protocol-level failures keep their own kinds so callers
    /// can tell a broken page from a broken subprocess.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<String, ToolError> {
        let value = self
            .request(
                METHOD_CALL_TOOL,
                Some(json!({ "name": name, "arguments": arguments })),
                DEFAULT_CALL_TIMEOUT,
            )
            .await
            .map_err(|error| match error {
                ToolError::CallTimeout { timeout, .. } => ToolError::CallTimeout {
                    tool: name.to_string(),
                    timeout,
                },
                other => other,
            })?;
        let result: CallToolResult =
            serde_json::from_value(value).map_err(|error| ToolError::Protocol {
                message: format!("malformed tools/call result: {error}"),
            })?;
        if result.is_error.unwrap_or(false) {
            return Err(ToolError::ToolFailed {
                tool: name.to_string(),
                message: result.text(),
            });
        }
        Ok(result.text())
    }

    /// Graceful teardown: a `close` call stands in for SIGTERM, then the
    /// process is killed once the deadline passes. Never fails; cleanup
    /// problems are logged and swallowed.
    pub async fn shutdown(&self) {
        if self.is_healthy() {
            if let Err(error) = tokio::time::timeout(
                CLOSE_TIMEOUT,
                self.call_tool(TOOL_CLOSE, Value::Object(Default::default())),
            )
            .await
            .unwrap_or(Err(ToolError::Disconnected))
            {
                debug!("close call during shutdown failed: {error}");
            }
        }

        let mut process = self.process.lock().await;
        if let Err(error) = process.start_kill() {
            debug!("kill during shutdown failed: {error}");
        }
        match tokio::time::timeout(KILL_DEADLINE, process.wait()).await {
            Ok(Ok(status)) => debug!("subprocess exited with {status}"),
            Ok(Err(error)) => warn!("failed to reap subprocess: {error}"),
            Err(_) => warn!("subprocess did not exit within {KILL_DEADLINE:?}"),
        }
        self.reader.abort();
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        if !self.is_healthy() {
            return Err(ToolError::Disconnected);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending map poisoned").insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_string(&request).map_err(|error| ToolError::Protocol {
            message: format!("unserializable request: {error}"),
        })?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(error) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().expect("pending map poisoned").remove(&id);
                debug!("stdin write failed: {error}");
                return Err(ToolError::Disconnected);
            }
            if stdin.flush().await.is_err() {
                self.pending.lock().expect("pending map poisoned").remove(&id);
                return Err(ToolError::Disconnected);
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.lock().expect("pending map poisoned").remove(&id);
                Err(ToolError::CallTimeout {
                    tool: method.to_string(),
                    timeout,
                })
            }
            Ok(Err(_closed)) => Err(ToolError::Disconnected),
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(ToolError::Protocol {
                message: format!("{} (code {})", error.message, error.code),
            }),
        }
    }
}

async fn route_incoming(
    stdout: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
) {
    let mut lines = stdout.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Incoming>(line) {
                    Ok(Incoming::Response { id, result }) => {
                        if let Some(tx) = pending.lock().expect("pending map poisoned").remove(&id)
                        {
                            _ = tx.send(Ok(result));
                        } else {
                            debug!("response for unknown request id {id}");
                        }
                    }
                    Ok(Incoming::Error { id, error }) => {
                        if let Some(tx) = pending.lock().expect("pending map poisoned").remove(&id)
                        {
                            _ = tx.send(Err(error));
                        }
                    }
                    Ok(Incoming::Notification { method, .. }) => {
                        debug!("subprocess notification: {method}");
                    }
                    Err(error) => {
                        debug!("unparseable frame from subprocess: {error}");
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every in-flight caller with Disconnected.
    pending.lock().expect("pending map poisoned").clear();
}
