use conduit_core::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the HTTP transport (the `[http]` table of `conduit.toml`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// The single endpoint path.
    #[serde(default = "default_path")]
    pub path: String,
    /// Exact origins, or `"*"` for any.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Skip the registry and treat every request as an always-ready session.
    #[serde(default)]
    pub stateless: bool,
    /// Idle seconds before a session expires.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Seconds between expiry sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Interval between keep-alive comments on event streams; 0 disables them.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Events kept per session for replay after a reconnect.
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    /// Largest accepted request body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Version assumed when a request has no `mcp-protocol-version` header.
    #[serde(default)]
    pub fallback_protocol_version: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}
fn default_path() -> String {
    "/mcp".into()
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost".into(), "http://127.0.0.1".into()]
}
fn default_session_ttl_secs() -> u64 {
    1800
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_keep_alive_secs() -> u64 {
    15
}
fn default_replay_capacity() -> usize {
    100
}
fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            allowed_origins: default_allowed_origins(),
            stateless: false,
            session_ttl_secs: default_session_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            keep_alive_secs: default_keep_alive_secs(),
            replay_capacity: default_replay_capacity(),
            max_body_bytes: default_max_body_bytes(),
            fallback_protocol_version: None,
        }
    }
}

impl HttpConfig {
    /// Session idle time-to-live.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Period of the background sweep.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Keep-alive period; zero means disabled.
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rejects settings the transport cannot run with.
    pub fn validate(&self) -> ConduitResult<()> {
        if !self.path.starts_with('/') {
            return Err(ConduitError::Config(format!(
                "http.path must start with '/': {}",
                self.path
            )));
        }
        if self.replay_capacity == 0 {
            return Err(ConduitError::Config("http.replay_capacity must be > 0".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConduitError::Config("http.sweep_interval_secs must be > 0".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(ConduitError::Config("http.max_body_bytes must be > 0".into()));
        }
        Ok(())
    }
}
