use conduit_core::ServerDescriptor;
use conduit_gateway::HttpConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level `conduit.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Identity advertised in the initialize result.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Replaces the default `tools` capability when set.
    #[serde(default)]
    pub capabilities: Option<serde_json::Value>,
}

fn default_name() -> String {
    "conduit".into()
}
fn default_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            version: default_version(),
            instructions: None,
            capabilities: None,
        }
    }
}

impl ServerSection {
    pub fn descriptor(&self) -> ServerDescriptor {
        let mut descriptor = ServerDescriptor::new(&self.name, &self.version);
        descriptor.instructions.clone_from(&self.instructions);
        if let Some(capabilities) = &self.capabilities {
            descriptor.capabilities = capabilities.clone();
        }
        descriptor
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_filter(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    /// Grace period for in-flight requests.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_drain_timeout_secs() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Where the loaded configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    File,
    Defaults,
}

impl ConduitConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).map_err(|e| anyhow::anyhow!("Invalid config: {e}"))
    }

    /// Reads `path`. A missing file yields the defaults; anything else that
    /// goes wrong is an error.
    pub async fn load(path: &Path) -> anyhow::Result<(Self, ConfigSource)> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok((Self::parse(&text)?, ConfigSource::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok((Self::default(), ConfigSource::Defaults))
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config {}: {e}",
                path.display()
            )),
        }
    }
}
