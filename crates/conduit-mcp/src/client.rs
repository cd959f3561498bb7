//! MCP client: talks to a server subprocess over its stdio pipes.

use crate::stdio::{StdioSender, StdioTransport};
use conduit_core::protocol::methods;
use conduit_core::{
    ConduitError, ConduitResult, ErrorObject, Implementation, InitializeParams, InitializeResult,
    Message, Notification, Request, RequestId, Response, ResponsePayload, ToolCallResult, ToolDef,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Response>>>>;

/// How to launch and talk to a server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Executable to spawn.
    pub command: String,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Deadline for every request.
    pub request_timeout: Duration,
    /// Identity sent in `initialize`.
    pub client_info: Implementation,
}

impl ClientConfig {
    /// Defaults for spawning `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            request_timeout: Duration::from_secs(30),
            client_info: Implementation::new("conduit-client", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Sets the arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the request deadline.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A connected, initialized MCP client.
pub struct McpClient {
    sender: StdioSender,
    pending: Pending,
    next_id: AtomicI64,
    timeout: Duration,
    server: Option<InitializeResult>,
    child: Option<Child>,
    reader: JoinHandle<()>,
}

impl McpClient {
    /// Spawns the server subprocess and performs the handshake.
    pub async fn connect(config: ClientConfig) -> ConduitResult<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);
        for (key, val) in &config.env {
            cmd.env(key, val);
        }

        let mut child = cmd.spawn().map_err(|e| {
            ConduitError::Transport(format!("Failed to spawn MCP server '{}': {e}", config.command))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConduitError::Transport("MCP server stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConduitError::Transport("MCP server stdout not available".into()))?;

        let mut client = Self::from_streams(stdout, stdin, config.request_timeout);
        client.child = Some(child);
        client.initialize(&config.client_info).await?;
        Ok(client)
    }

    /// Wraps an already-open stream pair without performing the handshake.
    pub fn from_streams<R, W>(reader: R, writer: W, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let transport = StdioTransport::new(reader, writer);
        let sender = transport.sender();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(transport, sender.clone(), pending.clone()));
        Self {
            sender,
            pending,
            next_id: AtomicI64::new(1),
            timeout,
            server: None,
            child: None,
            reader,
        }
    }

    /// Runs `initialize` followed by `notifications/initialized`.
    pub async fn initialize(
        &mut self,
        client_info: &Implementation,
    ) -> ConduitResult<&InitializeResult> {
        let params = InitializeParams::for_client(&client_info.name, &client_info.version);
        let value = self
            .request(methods::INITIALIZE, as_params(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;
        info!(
            server = %result.server_info.name,
            version = %result.protocol_version,
            "MCP server initialized"
        );
        self.notify(methods::INITIALIZED, None).await?;
        Ok(&*self.server.insert(result))
    }

    /// The server's handshake answer, once initialized.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    /// Sends a request and waits for its result.
    ///
    /// A JSON-RPC error answer becomes [`ConduitError::Remote`].
    pub async fn request(
        &self,
        method: &str,
        params: Option<Map<String, Value>>,
    ) -> ConduitResult<Value> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let request = Message::from(Request::new(id.clone(), method, params));
        if let Err(e) = self.sender.send(&request).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(ConduitError::Transport(format!(
                    "Connection closed before '{method}' was answered"
                )))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                return Err(ConduitError::Timeout(format!("MCP request '{method}' timed out")));
            }
        };

        match response.payload {
            ResponsePayload::Result(value) => Ok(value),
            ResponsePayload::Error(error) => Err(ConduitError::Remote(error)),
        }
    }

    /// Sends a notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Map<String, Value>>,
    ) -> ConduitResult<()> {
        self.sender
            .send(&Message::from(Notification::new(method, params)))
            .await
    }

    /// Round-trips a `ping`.
    pub async fn ping(&self) -> ConduitResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Lists the server's tools.
    pub async fn list_tools(&self) -> ConduitResult<Vec<ToolDef>> {
        let result = self.request(methods::TOOLS_LIST, None).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(tools)?)
    }

    /// Invokes a tool.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ConduitResult<ToolCallResult> {
        let mut params = Map::new();
        params.insert("name".into(), Value::String(name.to_string()));
        params.insert("arguments".into(), arguments);
        let result = self.request(methods::TOOLS_CALL, Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Number of requests awaiting an answer.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Closes the server's input and waits briefly for it to exit.
    pub async fn shutdown(mut self) -> ConduitResult<()> {
        if let Err(e) = self.sender.shutdown().await {
            debug!(error = %e, "MCP server stdin already closed");
        }
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "MCP server exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for MCP server"),
                Err(_) => {
                    warn!("MCP server did not exit, killing it");
                    child.kill().await?;
                }
            }
        }
        self.reader.abort();
        Ok(())
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn as_params(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

async fn read_loop<R>(mut transport: StdioTransport<R>, sender: StdioSender, pending: Pending)
where
    R: AsyncRead + Unpin + Send,
{
    while let Some(next) = transport.recv().await {
        match next {
            Ok(Message::Response(response)) => {
                let waiter = pending.lock().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = %response.id, "Response for unknown request"),
                }
            }
            Ok(Message::Request(request)) => {
                let reply = if request.method == methods::PING {
                    Response::success(request.id, serde_json::json!({}))
                } else {
                    Response::error(request.id, ErrorObject::method_not_found(&request.method))
                };
                if let Err(e) = sender.send(&Message::Response(reply)).await {
                    warn!(error = %e, "Failed to answer server request");
                }
            }
            Ok(Message::Notification(n)) => {
                debug!(method = %n.method, "Server notification");
            }
            Err(failure) => {
                debug!(error = %failure, "Unparseable line from MCP server");
            }
        }
    }
    debug!("MCP server stdout closed");
    // Dropping the waiters fails every outstanding request.
    pending.lock().clear();
}
