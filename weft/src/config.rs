//! Frozen runtime configuration: server specs, pool, cache, agent and LLM settings.
//!
//! The config is loaded once (YAML file via [`WeftConfig::load`], or built
//! programmatically), validated, and handed to the runtime at startup. Nothing
//! in the core mutates it afterwards. Secrets are never stored here: the LLM
//! key is named by `api_key_env` and read from the environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default connect timeout for stdio servers. Generous because cold-starting
/// an `npx`/`uvx` server may fetch packages first.
pub const STDIO_CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
/// Default connect timeout for network (SSE / streamable HTTP) servers.
pub const NETWORK_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
/// Default idle timeout for an SSE event stream.
pub const SSE_READ_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Wire transport of an MCP server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One MCP server as configured at startup. Immutable for the process lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub transport: TransportKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,

    // stdio
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    // sse / http
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Connect timeout in seconds; per-transport default when unset.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// SSE event-stream idle timeout in seconds; default 120.
    #[serde(default)]
    pub read_timeout: Option<f64>,
}

fn default_enabled() -> bool {
    true
}

impl ServerSpec {
    /// Shorthand for a stdio server (used heavily in tests and examples).
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            enabled: true,
            description: String::new(),
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            url: None,
            headers: HashMap::new(),
            timeout: None,
            read_timeout: None,
        }
    }

    /// Shorthand for a streamable-HTTP server.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Http,
            enabled: true,
            description: String::new(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some(url.into()),
            headers: HashMap::new(),
            timeout: None,
            read_timeout: None,
        }
    }

    /// Shorthand for an SSE server.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Sse,
            ..Self::http(name, url)
        }
    }

    /// Connect timeout: configured value, else the per-transport default.
    pub fn connect_timeout(&self) -> Duration {
        match self.timeout {
            Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
            _ => match self.transport {
                TransportKind::Stdio => STDIO_CONNECT_TIMEOUT,
                TransportKind::Sse | TransportKind::Http => NETWORK_CONNECT_TIMEOUT,
            },
        }
    }

    /// Event-stream idle timeout (SSE only).
    pub fn event_read_timeout(&self) -> Duration {
        match self.read_timeout {
            Some(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
            _ => SSE_READ_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("server name must not be empty".into()));
        }
        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "stdio server '{}' requires a command",
                        self.name
                    )));
                }
            }
            TransportKind::Sse | TransportKind::Http => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "{} server '{}' requires a url",
                        self.transport, self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Connection pool settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections_per_server: usize,
    /// Seconds to wait for the per-server lock plus connect before giving up.
    pub connection_timeout: f64,
    pub retry_attempts: u32,
    /// Seconds between connect retries.
    pub retry_delay: f64,
    /// Seconds a pooled connection may sit unused before the cleaner closes it.
    pub idle_timeout: f64,
    /// Seconds between cleaner / health-prober passes.
    pub health_check_interval: f64,
    /// Connections at or above this error count are deactivated.
    pub max_error_count: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections_per_server: 3,
            connection_timeout: 30.0,
            retry_attempts: 3,
            retry_delay: 1.0,
            idle_timeout: 300.0,
            health_check_interval: 60.0,
            max_error_count: 5,
        }
    }
}

impl PoolSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }
}

/// Tool cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Seconds a server's cached tool list stays valid.
    pub cache_duration: f64,
    /// Maximum tools stored per server; overflow is truncated (warned once).
    pub max_cache_size: usize,
    pub persist_cache: bool,
    pub cache_file: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_duration: 300.0,
            max_cache_size: 100,
            persist_cache: false,
            cache_file: None,
        }
    }
}

impl CacheSettings {
    pub fn cache_duration(&self) -> Duration {
        Duration::from_secs_f64(self.cache_duration.max(0.0))
    }
}

/// Reasoning loop and memory settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
    /// Seconds allowed per tool invocation.
    pub action_timeout: f64,
    pub memory_max_context_turns: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            confidence_threshold: 0.8,
            action_timeout: 60.0,
            memory_max_context_turns: 20,
        }
    }
}

impl AgentSettings {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.action_timeout)
    }
}

/// LLM endpoint settings. The key itself lives in the environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub api_key_env: String,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "deepseek/deepseek-chat-v3-0324".into(),
            api_key_env: "OPENROUTER_API_KEY".into(),
            base_url: Some("https://openrouter.ai/api/v1".into()),
            max_tokens: 2000,
            temperature: 0.7,
        }
    }
}

/// Complete runtime configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub agent: AgentSettings,
    pub llm: LlmSettings,
    pub pool: PoolSettings,
    pub cache: CacheSettings,
    pub servers: Vec<ServerSpec>,
}

impl WeftConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Validates every server spec and rejects duplicate server names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for spec in &self.servers {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name '{}'",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerSpec> {
        self.servers.iter().filter(|s| s.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let pool = PoolSettings::default();
        assert_eq!(pool.max_connections_per_server, 3);
        assert_eq!(pool.idle_timeout, 300.0);
        assert_eq!(pool.max_error_count, 5);

        let agent = AgentSettings::default();
        assert_eq!(agent.max_iterations, 10);
        assert!((agent.confidence_threshold - 0.8).abs() < f64::EPSILON);
        assert_eq!(agent.memory_max_context_turns, 20);

        let cache = CacheSettings::default();
        assert_eq!(cache.cache_duration, 300.0);
        assert_eq!(cache.max_cache_size, 100);
        assert!(!cache.persist_cache);
    }

    #[test]
    fn connect_timeout_defaults_per_transport() {
        let stdio = ServerSpec::stdio("fs", "server-bin", vec![]);
        assert_eq!(stdio.connect_timeout(), STDIO_CONNECT_TIMEOUT);

        let http = ServerSpec::http("web", "http://localhost:1234/mcp");
        assert_eq!(http.connect_timeout(), NETWORK_CONNECT_TIMEOUT);

        let mut custom = ServerSpec::http("web2", "http://localhost:1234/mcp");
        custom.timeout = Some(5.0);
        assert_eq!(custom.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parses_yaml_config() {
        let yaml = r#"
agent:
  max_iterations: 4
llm:
  model: test-model
  api_key_env: TEST_KEY
servers:
  - name: filesystem
    type: stdio
    command: mcp-fs
    args: ["--root", "/tmp"]
  - name: web
    type: http
    url: http://localhost:9000/mcp
    enabled: false
"#;
        let config = WeftConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.agent.max_iterations, 4);
        assert_eq!(config.llm.model, "test-model");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].transport, TransportKind::Stdio);
        assert_eq!(config.enabled_servers().count(), 1);
    }

    #[test]
    fn stdio_without_command_is_invalid() {
        let yaml = "servers:\n  - name: broken\n    type: stdio\n";
        let err = WeftConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn sse_without_url_is_invalid() {
        let yaml = "servers:\n  - name: broken\n    type: sse\n";
        assert!(matches!(
            WeftConfig::from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn duplicate_server_names_rejected() {
        let yaml = r#"
servers:
  - name: fs
    type: stdio
    command: a
  - name: fs
    type: stdio
    command: b
"#;
        assert!(matches!(
            WeftConfig::from_yaml_str(yaml),
            Err(ConfigError::Invalid(msg)) if msg.contains("duplicate")
        ));
    }
}
