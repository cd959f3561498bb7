use serde::{Deserialize, Serialize};

/// The only protocol version accepted during `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Older value still accepted in the HTTP protocol-version header.
pub const LEGACY_PROTOCOL_VERSION: &str = "2025-03-26";

/// Method names the engine itself interprets.
pub mod methods {
    /// Opens the handshake.
    pub const INITIALIZE: &str = "initialize";
    /// Acknowledges the initialize result and completes the handshake.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Lists the tools exposed by a server.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Invokes a tool.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Peer-side cancellation of an in-flight request.
    pub const CANCELLED: &str = "notifications/cancelled";
}

/// Name and version of either side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    #[serde(default)]
    pub version: String,
}

impl Implementation {
    /// Creates an implementation descriptor.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Version requested by the client.
    pub protocol_version: String,
    /// Client capability set, kept opaque.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Client identity.
    #[serde(default)]
    pub client_info: Option<Implementation>,
}

impl InitializeParams {
    /// Parameters for a client speaking [`PROTOCOL_VERSION`].
    pub fn for_client(name: &str, version: &str) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: Some(Implementation::new(name, version)),
        }
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// The negotiated version.
    pub protocol_version: String,
    /// Server capability set.
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Server identity.
    pub server_info: Implementation,
    /// Optional usage instructions for the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// What a server advertises about itself during the handshake.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    /// Server identity.
    pub info: Implementation,
    /// Capability set returned verbatim in the initialize result.
    pub capabilities: serde_json::Value,
    /// Optional instructions.
    pub instructions: Option<String>,
}

impl ServerDescriptor {
    /// A descriptor advertising the `tools` capability.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: Implementation::new(name, version),
            capabilities: serde_json::json!({ "tools": { "listChanged": false } }),
            instructions: None,
        }
    }

    /// Builds the initialize result for this server.
    pub fn initialize_result(&self) -> InitializeResult {
        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities.clone(),
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        }
    }
}

/// MCP tool definition from the `tools/list` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolDef {
    /// Tool name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments.
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// MCP tool call result from the `tools/call` response.
///
/// Business-logic failures are reported here with `is_error`, not as a
/// protocol error.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCallResult {
    /// Content blocks.
    #[serde(default)]
    pub content: Vec<Content>,
    /// Whether the tool itself failed.
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

/// MCP content block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Content {
    /// Block type, e.g. `text`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Text payload.
    #[serde(default)]
    pub text: String,
}
