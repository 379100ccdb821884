//! Line-delimited JSON-RPC 2.0 over stdio exposing the `prompt_engine` tool.
//!
//! One request per line, one response per line on stdout. Notifications
//! (no `id`) are processed without a reply. Diagnostics go to stderr via
//! `tracing`; stdout carries nothing but responses.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::pipeline::{PromptEngine, PromptEngineRequest};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const TOOL_NAME: &str = "prompt_engine";

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

pub struct Server {
    engine: PromptEngine,
}

impl Server {
    pub fn new(engine: PromptEngine) -> Self {
        Self { engine }
    }

    /// Serve until `input` reaches EOF.
    pub fn run(&self, input: impl BufRead, mut output: impl Write) -> Result<()> {
        info!("prompt engine server started");
        for line in input.lines() {
            let line = line.context("read request line")?;
            if line.trim().is_empty() {
                continue;
            }
            let Some(response) = self.handle_line(&line) else {
                continue;
            };
            let payload = serde_json::to_string(&response).context("serialize response")?;
            writeln!(output, "{payload}").context("write response")?;
            output.flush().context("flush response")?;
        }
        info!("prompt engine server stopped");
        Ok(())
    }

    /// Handle one raw line; `None` for notifications.
    pub fn handle_line(&self, line: &str) -> Option<RpcResponse> {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed request line");
                return Some(RpcResponse::failure(
                    Value::Null,
                    PARSE_ERROR,
                    format!("Parse error: {err}"),
                ));
            }
        };
        let id = request.id.clone();
        let response = self.dispatch(request);
        id.map(|id| match response {
            Ok(result) => RpcResponse::success(id, result),
            Err((code, message)) => RpcResponse::failure(id, code, message),
        })
    }

    #[instrument(skip_all, fields(method = %request.method))]
    fn dispatch(&self, request: RpcRequest) -> Result<Value, (i32, String)> {
        debug!("dispatching request");
        match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": "prompt-engine", "version": env!("CARGO_PKG_VERSION") },
            })),
            "notifications/initialized" | "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": [tool_descriptor()] })),
            "tools/call" => {
                let params: ToolCallParams = serde_json::from_value(request.params)
                    .map_err(|err| (INVALID_PARAMS, format!("Invalid params: {err}")))?;
                if params.name != TOOL_NAME {
                    return Err((INVALID_PARAMS, format!("Unknown tool: {}", params.name)));
                }
                let arguments = if params.arguments.is_null() {
                    json!({})
                } else {
                    params.arguments
                };
                let call: PromptEngineRequest = serde_json::from_value(arguments)
                    .map_err(|err| (INVALID_PARAMS, format!("Invalid arguments: {err}")))?;
                let response = self.engine.execute(call);
                serde_json::to_value(response)
                    .map_err(|err| (INTERNAL_ERROR, format!("Serialization error: {err}")))
            }
            other => Err((METHOD_NOT_FOUND, format!("Method not found: {other}"))),
        }
    }
}

/// `tools/list` entry for the single `prompt_engine` tool.
pub fn tool_descriptor() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Execute prompts and multi-step chains with gates, methodology frameworks and shell verification. Start with `command` (e.g. `>>analyze topic=\"x\" --> >>summarize`); continue a chain with `chain_id` plus `user_response`.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Symbolic command, e.g. `>>prompt --> >>next :: 'criteria'`." },
                "chain_id": { "type": "string", "description": "Chain or session id returned by a previous call." },
                "user_response": { "type": "string", "description": "Your output for the current step." },
                "gate_verdict": { "type": "string", "description": "`GATE_REVIEW: PASS - reason` or `GATE_REVIEW: FAIL - reason`." },
                "gate_action": { "type": "string", "enum": ["retry", "skip", "abort"] },
                "force_restart": { "type": "boolean" },
                "gates": { "type": "array", "items": { "type": "string" } },
                "api_validation": { "type": "boolean" },
                "quality_gates": { "type": "array", "items": { "type": "string" } },
                "custom_checks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "description": { "type": "string" }
                        },
                        "required": ["name", "description"]
                    }
                },
                "temporary_gates": { "type": "array", "items": { "type": "object" } },
                "gate_scope": { "type": "string", "enum": ["execution", "chain"] },
                "options": { "type": "object" }
            }
        }
    })
}
