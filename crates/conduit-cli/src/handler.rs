//! Built-in tools served when the binary runs standalone.

use async_trait::async_trait;
use conduit_core::protocol::methods;
use conduit_core::{ConduitResult, Content, ErrorObject, Message, Response, ToolCallResult, ToolDef};
use conduit_mcp::{Handler, RequestContext};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Serves a single `echo` tool.
pub struct BuiltinHandler {
    tools: Vec<ToolDef>,
}

impl BuiltinHandler {
    pub fn new() -> Self {
        Self {
            tools: vec![ToolDef {
                name: "echo".into(),
                description: "Returns the given text unchanged".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            }],
        }
    }

    fn call(&self, name: &str, arguments: Option<&Value>) -> ToolCallResult {
        match name {
            "echo" => {
                let text = arguments
                    .and_then(|a| a.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                text_result(text, false)
            }
            other => text_result(&format!("Unknown tool: {other}"), true),
        }
    }
}

impl Default for BuiltinHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn text_result(text: &str, is_error: bool) -> ToolCallResult {
    ToolCallResult {
        content: vec![Content {
            content_type: "text".into(),
            text: text.to_string(),
        }],
        is_error,
    }
}

#[async_trait]
impl Handler for BuiltinHandler {
    async fn handle(
        &self,
        message: Message,
        ctx: &RequestContext,
    ) -> ConduitResult<Option<Response>> {
        let request = match message {
            Message::Request(request) => request,
            Message::Notification(n) => {
                debug!(session_id = %ctx.session_id(), method = %n.method, "Notification");
                return Ok(None);
            }
            Message::Response(_) => return Ok(None),
        };

        let response = match request.method.as_str() {
            methods::TOOLS_LIST => {
                Response::success(request.id, json!({ "tools": self.tools }))
            }
            methods::TOOLS_CALL => {
                let params = request.params.as_ref();
                match params.and_then(|p| p.get("name")).and_then(Value::as_str) {
                    Some(name) => {
                        info!(session_id = %ctx.session_id(), tool = %name, "Tool call");
                        let result = self.call(name, params.and_then(|p| p.get("arguments")));
                        Response::success(request.id, serde_json::to_value(result)?)
                    }
                    None => Response::error(
                        request.id,
                        ErrorObject::invalid_params("missing tool name"),
                    ),
                }
            }
            other => Response::error(request.id, ErrorObject::method_not_found(other)),
        };
        Ok(Some(response))
    }
}
