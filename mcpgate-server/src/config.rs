// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::{Context, Result};
use axum::http::HeaderValue;
use mcpgate_core::{RetryPolicy, DEFAULT_STALE_CLIENT_MARKERS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Mcpgate Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpServerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    /// HTTP listen address (e.g., "127.0.0.1:47300")
    #[serde(default = "default_http_addr")]
    pub listen_addr: String,

    /// Enable CORS
    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,

    /// Allowed CORS origins (empty or "*" = allow all)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_http_addr(),
            enable_cors: default_enable_cors(),
            cors_origins: vec![],
            log_format: default_log_format(),
        }
    }
}

impl HttpServerConfig {
    /// Parsed `cors_origins`; `None` means any origin is allowed.
    pub fn allowed_origins(&self) -> Result<Option<Vec<HeaderValue>>> {
        if self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o.trim() == "*") {
            return Ok(None);
        }
        self.cors_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin.trim())
                    .with_context(|| format!("Invalid CORS origin {:?}", origin))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

/// Timeouts and retry ceiling for remote MCP sessions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Liveness probe (`GET /info`) timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Time allowed for the SSE stream to deliver a client ID
    #[serde(default = "default_acquisition_timeout")]
    pub acquisition_timeout_secs: u64,

    /// Total acquisition attempts (1 initial + retries)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_initial_delay")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Tool execution (`POST /messages`) timeout
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: u64,

    /// Re-probe interval for connected sessions (0 = disabled)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// TCP connect timeout for the HTTP client
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Error strings that mean the remote no longer accepts our client ID
    #[serde(default = "default_stale_client_markers")]
    pub stale_client_markers: Vec<String>,

    /// Command channel buffer size (backpressure control)
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: default_probe_timeout(),
            acquisition_timeout_secs: default_acquisition_timeout(),
            max_attempts: default_max_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            retry_multiplier: default_retry_multiplier(),
            execution_timeout_secs: default_execution_timeout(),
            health_check_interval_secs: default_health_check_interval(),
            connect_timeout_secs: default_connect_timeout(),
            stale_client_markers: default_stale_client_markers(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
            ..RetryPolicy::acquisition()
        }
    }
}

/// Control-plane WebSocket keepalive
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
        }
    }
}

#[derive(Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Enable authentication (default: false for local use)
    #[serde(default)]
    pub enabled: bool,

    /// JWT secret for token validation
    pub jwt_secret: Option<String>,

    /// Static API keys (format: "key:user_id")
    #[serde(default)]
    pub api_keys: Vec<String>,
}

// Credentials never reach the logs.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.enabled)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("api_keys", &format_args!("[{} redacted]", self.api_keys.len()))
            .finish()
    }
}

// Default values
fn default_http_addr() -> String {
    "127.0.0.1:47300".to_string()
}

fn default_enable_cors() -> bool {
    true
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_acquisition_timeout() -> u64 {
    8
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    4000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_execution_timeout() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    3
}

fn default_stale_client_markers() -> Vec<String> {
    DEFAULT_STALE_CLIENT_MARKERS
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_ping_interval() -> u64 {
    30
}

fn default_pong_timeout() -> u64 {
    60
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - MCPGATE_HTTP_ADDR: HTTP listen address (default: 127.0.0.1:47300)
    /// - MCPGATE_LOG_FORMAT: "pretty" or "json"
    /// - MCPGATE_AUTH_ENABLED: Enable authentication (default: false)
    /// - MCPGATE_JWT_SECRET: JWT secret for token validation
    /// - MCPGATE_API_KEYS: Comma-separated API keys (format: key:user_id)
    /// - MCPGATE_HEALTH_CHECK_INTERVAL: Re-probe interval in seconds (0 disables)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MCPGATE_HTTP_ADDR") {
            config.server.listen_addr = addr;
        }

        if let Ok(format) = std::env::var("MCPGATE_LOG_FORMAT") {
            config.server.log_format = format;
        }

        if let Ok(enabled) = std::env::var("MCPGATE_AUTH_ENABLED") {
            config.auth.enabled = enabled.parse().unwrap_or(false);
        }

        if let Ok(secret) = std::env::var("MCPGATE_JWT_SECRET") {
            config.auth.jwt_secret = Some(secret);
        }

        if let Ok(keys) = std::env::var("MCPGATE_API_KEYS") {
            config.auth.api_keys = keys
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
        }

        if let Ok(interval) = std::env::var("MCPGATE_HEALTH_CHECK_INTERVAL") {
            if let Ok(val) = interval.parse() {
                config.gateway.health_check_interval_secs = val;
            }
        }

        config
    }

    /// Load configuration with priority: file > env > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        config = Self::merge_with_env(config);

        Ok(config)
    }

    /// Merge config with environment variables (only explicitly set ones)
    fn merge_with_env(mut config: Self) -> Self {
        let env_config = Self::from_env();

        if std::env::var("MCPGATE_HTTP_ADDR").is_ok() {
            config.server.listen_addr = env_config.server.listen_addr;
        }
        if std::env::var("MCPGATE_LOG_FORMAT").is_ok() {
            config.server.log_format = env_config.server.log_format;
        }
        if std::env::var("MCPGATE_AUTH_ENABLED").is_ok() {
            config.auth.enabled = env_config.auth.enabled;
        }
        if std::env::var("MCPGATE_JWT_SECRET").is_ok() {
            config.auth.jwt_secret = env_config.auth.jwt_secret;
        }
        if std::env::var("MCPGATE_API_KEYS").is_ok() {
            config.auth.api_keys = env_config.auth.api_keys;
        }
        if std::env::var("MCPGATE_HEALTH_CHECK_INTERVAL").is_ok() {
            config.gateway.health_check_interval_secs =
                env_config.gateway.health_check_interval_secs;
        }

        config
    }

    /// Parse listen address as SocketAddr
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        let gateway = &self.gateway;
        if gateway.max_attempts == 0 {
            anyhow::bail!("gateway.max_attempts must be at least 1");
        }
        if gateway.probe_timeout_secs == 0
            || gateway.acquisition_timeout_secs == 0
            || gateway.execution_timeout_secs == 0
        {
            anyhow::bail!("Gateway timeouts must be greater than zero");
        }
        if gateway.channel_capacity == 0 {
            anyhow::bail!("gateway.channel_capacity must be greater than zero");
        }

        let log_format = self.server.log_format.as_str();
        if !log_format.eq_ignore_ascii_case("pretty") && !log_format.eq_ignore_ascii_case("json") {
            anyhow::bail!(
                "Unknown log format '{}' (expected \"pretty\" or \"json\")",
                self.server.log_format
            );
        }

        self.server.allowed_origins()?;

        if self.auth.enabled && self.auth.jwt_secret.is_none() && self.auth.api_keys.is_empty() {
            anyhow::bail!("Authentication enabled but no JWT secret or API keys configured");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:47300");
        assert!(!config.auth.enabled);
        assert_eq!(config.gateway.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.gateway.acquisition_timeout(), Duration::from_secs(8));
        assert_eq!(config.gateway.execution_timeout(), Duration::from_secs(10));
        assert_eq!(config.gateway.retry_policy().max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen_addr = "0.0.0.0:9000"

[gateway]
acquisition_timeout_secs = 5
health_check_interval_secs = 0
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.gateway.acquisition_timeout_secs, 5);
        assert_eq!(config.gateway.probe_timeout_secs, 3);
        assert_eq!(config.gateway.health_check_interval(), None);
        assert_eq!(
            config.gateway.stale_client_markers,
            vec!["Missing clientId".to_string(), "Invalid clientId".to_string()]
        );
        assert_eq!(config.heartbeat.pong_timeout_secs, 60);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.gateway.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.server.listen_addr = "not-an-address".to_string();
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.auth.enabled = true;
        assert!(config.validate().is_err());

        config.auth.api_keys = vec!["k1:alice".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_format_is_case_insensitive() {
        let mut config = ServerConfig::default();
        config.server.log_format = "JSON".to_string();
        assert!(config.validate().is_ok());

        config.server.log_format = "Pretty".to_string();
        assert!(config.validate().is_ok());

        config.server.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cors_origins() {
        let mut config = ServerConfig::default();
        assert!(config.server.allowed_origins().unwrap().is_none());

        config.server.cors_origins = vec!["*".to_string()];
        assert!(config.server.allowed_origins().unwrap().is_none());

        config.server.cors_origins = vec![
            "http://localhost:3000".to_string(),
            " https://app.example.com ".to_string(),
        ];
        let origins = config.server.allowed_origins().unwrap().unwrap();
        assert_eq!(origins, vec!["http://localhost:3000", "https://app.example.com"]);
        assert!(config.validate().is_ok());

        config.server.cors_origins = vec!["http://bad\norigin".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_output_redacts_credentials() {
        let mut config = ServerConfig::default();
        config.auth.jwt_secret = Some("hunter2-signing-secret".to_string());
        config.auth.api_keys = vec!["sk-live-123:alice".to_string()];

        let rendered = format!("{:#?}", config);
        assert!(!rendered.contains("hunter2-signing-secret"), "{}", rendered);
        assert!(!rendered.contains("sk-live-123"), "{}", rendered);
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("[1 redacted]"));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("MCPGATE_HTTP_ADDR", "0.0.0.0:8080");
        std::env::set_var("MCPGATE_API_KEYS", "k1:alice, k2:bob");

        let config = ServerConfig::from_env();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.auth.api_keys, vec!["k1:alice", "k2:bob"]);

        std::env::remove_var("MCPGATE_HTTP_ADDR");
        std::env::remove_var("MCPGATE_API_KEYS");
    }
}
