use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::aidev;
use crate::args::ToolCall;
use crate::config::Config;
use crate::supervisor::Supervisor;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "gopherbot-mcp";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    /// Kept as raw text so the reply echoes the id byte-for-byte.
    /// Absent and literal `null` both land as `None`.
    #[serde(default)]
    id: Option<Box<RawValue>>,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Option<Box<RawValue>>,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Box<RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

pub struct ServerState {
    supervisor: Supervisor,
    config: Config,
}

impl ServerState {
    pub fn new(root: PathBuf, config: Config) -> Self {
        Self {
            supervisor: Supervisor::new(root, &config),
            config,
        }
    }

    /// One decoded stdin message in, at most one response out.
    /// Notifications (no id, or a null id) never produce a response.
    fn handle_message(&self, raw: &RawValue) -> Option<RpcResponse> {
        if !raw.get().starts_with('{') {
            eprintln!("[gopherbot-mcp] WARN: ignoring non-object message");
            return None;
        }
        let req = match serde_json::from_str::<RpcRequest>(raw.get()) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("[gopherbot-mcp] WARN: malformed request: {e}");
                // Still answer if an id can be salvaged.
                let id = serde_json::from_str::<HashMap<String, Box<RawValue>>>(raw.get())
                    .ok()
                    .and_then(|mut fields| fields.remove("id"))
                    .filter(|id| id.get() != "null");
                return id.map(|id| RpcResponse::failure(id, RpcError::new(INVALID_REQUEST, "invalid request")));
            }
        };

        let version = req.jsonrpc.as_deref().unwrap_or("2.0");
        if version != "2.0" {
            eprintln!("[gopherbot-mcp] WARN: unexpected jsonrpc version {version:?}; answering as 2.0");
        }

        let Some(id) = req.id else {
            debug_log!("[gopherbot-mcp] notification {}", req.method);
            return None;
        };

        debug_log!("[gopherbot-mcp] request {} id={}", req.method, id.get());
        Some(match self.handle_request(&req.method, req.params.as_deref()) {
            Ok(result) => RpcResponse::success(id, result),
            Err(err) => RpcResponse::failure(id, err),
        })
    }

    fn handle_request(&self, method: &str, params: Option<&RawValue>) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION }
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tool_list()),
            "tools/call" => self.tool_call(params),
            _ => Err(RpcError::new(METHOD_NOT_FOUND, "method not found")),
        }
    }

    fn tool_list(&self) -> Value {
        let default_binary = self.supervisor.default_binary().display().to_string();
        json!({
            "tools": [
                {
                    "name": "start_robot",
                    "description": format!(
                        "Start a Gopherbot robot in AIDev mode from its working directory. Launches `<gopherbot_binary> --aidev <auth_token> <extra_args...> run` with stdout/stderr appended to <robot_dir>/robot.log, and records pid and token in <robot_dir>/.gopherbot-mcp-state.json. The auth token is auto-generated when omitted. The binary defaults to {default_binary} (<root>/gopherbot)."
                    ),
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "robot_dir": { "type": "string", "description": "Robot working directory; relative paths resolve against the server root" },
                            "gopherbot_binary": { "type": "string", "description": format!("Path to the gopherbot binary (default {default_binary})") },
                            "auth_token": { "type": "string", "description": "AIDev bearer token; auto-generated (48 hex chars) when omitted" },
                            "extra_args": { "type": "array", "items": { "type": "string" }, "description": "Extra CLI args inserted before the trailing `run`" },
                            "env": { "type": "object", "additionalProperties": { "type": "string" }, "description": "Environment overrides layered over the server's environment" }
                        },
                        "required": ["robot_dir"]
                    }
                },
                {
                    "name": "stop_robot",
                    "description": "Stop the robot recorded in <robot_dir>: SIGTERM, wait up to 8s, then SIGKILL. Removes the state file.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "robot_dir": { "type": "string", "description": "Robot working directory" }
                        },
                        "required": ["robot_dir"]
                    }
                },
                {
                    "name": "robot_status",
                    "description": "Report whether the recorded robot is alive, plus its state record and AIDev port (from <robot_dir>/.aiport).",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "robot_dir": { "type": "string", "description": "Robot working directory" }
                        },
                        "required": ["robot_dir"]
                    }
                },
                {
                    "name": "send_message",
                    "description": "Inject a chat message into a running robot as the given user via its AIDev endpoint.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "robot_dir": { "type": "string", "description": "Robot working directory" },
                            "as_user": { "type": "string", "description": "User name to send as" },
                            "text": { "type": "string", "description": "Message text" },
                            "protocol": { "type": "string", "description": "Connector protocol (default: robot's primary)" },
                            "channel": { "type": "string", "description": "Channel name" },
                            "thread_id": { "type": "string", "description": "Thread to reply in" },
                            "hidden": { "type": "boolean", "description": "Send as a hidden message (default false)" },
                            "direct": { "type": "boolean", "description": "Send as a direct message (default false)" }
                        },
                        "required": ["robot_dir", "as_user", "text"]
                    }
                },
                {
                    "name": "get_messages",
                    "description": "Fetch chat messages seen by a running robot after a cursor, long-polling up to timeout_ms.",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "robot_dir": { "type": "string", "description": "Robot working directory" },
                            "viewer": { "type": "string", "description": "User whose view of the conversation to return" },
                            "protocol": { "type": "string", "description": "Connector protocol (default: robot's primary)" },
                            "all": { "type": "boolean", "description": "Return all messages, not only those visible to viewer (default false)" },
                            "after_cursor": { "type": "integer", "minimum": 0, "description": "Only return messages after this cursor (default 0)" },
                            "timeout_ms": { "type": "integer", "description": "Long-poll wait in milliseconds; negative is treated as 0" },
                            "limit": { "type": "integer", "description": "Max messages to return; 0 or negative means no limit" }
                        },
                        "required": ["robot_dir"]
                    }
                }
            ]
        })
    }

    fn tool_call(&self, params: Option<&RawValue>) -> Result<Value, RpcError> {
        let Some(params) = params else {
            return Err(RpcError::new(INVALID_PARAMS, "invalid params: missing params"));
        };
        let params: ToolCallParams = serde_json::from_str(params.get())
            .map_err(|e| RpcError::new(INVALID_PARAMS, format!("invalid params: {e}")))?;
        let arguments = params.arguments.unwrap_or_default();

        debug_log!("[gopherbot-mcp] tools/call {}", params.name);
        let outcome = ToolCall::parse(&params.name, &arguments).and_then(|call| self.run_tool(call));
        if let Err(e) = &outcome {
            eprintln!("[gopherbot-mcp] WARN: tool {} failed: {e:#}", params.name);
        }
        Ok(tool_result(outcome))
    }

    fn run_tool(&self, call: ToolCall) -> Result<Value> {
        let default_protocol = self.config.default_protocol.as_str();
        match call {
            ToolCall::StartRobot(args) => self.supervisor.start_robot(&args),
            ToolCall::StopRobot(args) => self.supervisor.stop_robot(&args),
            ToolCall::RobotStatus(args) => self.supervisor.robot_status(&args),
            ToolCall::SendMessage(args) => aidev::send_message(&self.supervisor, &args, default_protocol),
            ToolCall::GetMessages(args) => aidev::get_messages(&self.supervisor, &args, default_protocol),
        }
    }
}

impl RpcResponse {
    fn success(id: Box<RawValue>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Box<RawValue>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Wrap a tool outcome in MCP's content-block shape. The text is always
/// pretty JSON: the result object, or `{"error": ...}` with `isError: true`.
pub fn tool_result(outcome: Result<Value>) -> Value {
    match outcome {
        Ok(value) => json!({
            "content": [{ "type": "text", "text": pretty(&value) }]
        }),
        Err(e) => json!({
            "content": [{ "type": "text", "text": pretty(&json!({ "error": format!("{e:#}") })) }],
            "isError": true
        }),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Serve JSON-RPC messages from `input` until EOF. Messages may be separated
/// by newlines or simply concatenated. A syntax error ends the session.
pub fn serve<R: Read, W: Write>(state: &ServerState, input: R, mut output: W) -> Result<()> {
    let messages = serde_json::Deserializer::from_reader(input).into_iter::<Box<RawValue>>();
    for message in messages {
        let raw = message.context("decode JSON-RPC message")?;
        let Some(reply) = state.handle_message(&raw) else {
            continue;
        };
        serde_json::to_writer(&mut output, &reply).context("write response")?;
        output.write_all(b"\n").context("write response")?;
        output.flush().context("flush response")?;
    }
    Ok(())
}

pub fn run_stdio_server(root: PathBuf, config: Config) -> Result<()> {
    let state = ServerState::new(root, config);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    serve(&state, stdin.lock(), stdout.lock())?;

    eprintln!("[gopherbot-mcp] INFO: stdin closed, exiting");
    Ok(())
}
