/// Configuration management for Singularity Edge
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Main edge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Proxy behavior
    pub proxy: ProxyConfig,
    /// On-disk store location
    pub store: StoreConfig,
    /// Cluster membership
    pub cluster: ClusterConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Plain HTTP listener port
    pub http_port: u16,
    /// TLS listener port; disabled when absent
    pub https_port: Option<u16>,
    /// Admin REST API port
    pub admin_port: u16,
    /// Base domain for subdomain routing
    pub base_domain: String,
    /// Pool used when routing cannot otherwise resolve
    pub default_pool: String,
    /// Whether to start listeners at all (PHX_SERVER)
    pub start_listeners: bool,
    /// Cookie-signing secret for the admin surface
    pub secret_key_base: Option<String>,
}

/// Proxy behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Per-request deadline unless a pool overrides it
    pub request_timeout_ms: u64,
    /// One raw TCP listener per passthrough pool
    #[serde(default)]
    pub passthrough: Vec<PassthroughBinding>,
}

/// Admin-assigned port for one passthrough pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassthroughBinding {
    pub port: u16,
    pub pool: String,
}

/// On-disk store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory holding one subdirectory per table
    pub dir: PathBuf,
}

/// Cluster membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// This node's name; must be unique in the cluster
    pub node_name: String,
    /// Replication listener port, shared by all nodes
    pub port: u16,
    /// DNS name polled for peer discovery
    pub discovery_query: Option<String>,
    /// Shared cluster secret
    pub release_cookie: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Log to stdout
    pub stdout: bool,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                http_port: 8080,
                https_port: None,
                admin_port: 9090,
                base_domain: "localhost".to_string(),
                default_pool: "default".to_string(),
                start_listeners: true,
                secret_key_base: None,
            },
            proxy: ProxyConfig {
                request_timeout_ms: 60_000,
                passthrough: Vec::new(),
            },
            store: StoreConfig {
                dir: PathBuf::from("data/store"),
            },
            cluster: ClusterConfig {
                enabled: false,
                node_name: "edge-1".to_string(),
                port: 4369,
                discovery_query: None,
                release_cookie: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
                stdout: true,
                file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file, apply environment overrides,
    /// and validate
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Apply deployment environment overrides
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.server.http_port = port;
        }
        if let Some(host) = get("PHX_HOST") {
            self.server.base_domain = host;
        }
        if let Some(value) = get("PHX_SERVER") {
            self.server.start_listeners = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Some(secret) = get("SECRET_KEY_BASE") {
            self.server.secret_key_base = Some(secret);
        }
        if let Some(dir) = get("STORE_DIR") {
            self.store.dir = PathBuf::from(dir);
        }
        if let Some(cookie) = get("RELEASE_COOKIE") {
            self.cluster.release_cookie = Some(cookie);
        }
        if let Some(app) = get("FLY_APP_NAME") {
            self.cluster.discovery_query = Some(format!("{app}.internal"));
            self.cluster.enabled = true;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.base_domain.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "base_domain cannot be empty".to_string(),
            ));
        }

        if self.server.default_pool.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "default_pool cannot be empty".to_string(),
            ));
        }

        if self.proxy.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let mut ports = HashSet::new();
        ports.insert(self.server.http_port);
        ports.insert(self.server.admin_port);
        if let Some(https) = self.server.https_port {
            if !ports.insert(https) {
                return Err(ConfigError::ValidationError(
                    "https_port collides with another listener".to_string(),
                ));
            }
        }
        for binding in &self.proxy.passthrough {
            if binding.pool.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "passthrough binding needs a pool name".to_string(),
                ));
            }
            if !ports.insert(binding.port) {
                return Err(ConfigError::ValidationError(format!(
                    "passthrough port {} collides with another listener",
                    binding.port
                )));
            }
        }

        if self.cluster.enabled {
            if self.cluster.node_name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "cluster node_name cannot be empty".to_string(),
                ));
            }
            // Unauthenticated replication is never acceptable
            match &self.cluster.release_cookie {
                Some(cookie) if !cookie.trim().is_empty() => {}
                _ => {
                    return Err(ConfigError::ValidationError(
                        "clustering requires release_cookie (or RELEASE_COOKIE)".to_string(),
                    ))
                }
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            server: ServerConfig {
                http_port: 8080,
                https_port: Some(443),
                admin_port: 9090,
                base_domain: "edge.example.com".to_string(),
                default_pool: "default".to_string(),
                start_listeners: true,
                secret_key_base: None,
            },
            proxy: ProxyConfig {
                request_timeout_ms: 60_000,
                passthrough: vec![PassthroughBinding {
                    port: 5432,
                    pool: "postgres".to_string(),
                }],
            },
            cluster: ClusterConfig {
                enabled: true,
                node_name: "edge-1".to_string(),
                port: 4369,
                discovery_query: Some("edge.internal".to_string()),
                release_cookie: Some("change-me".to_string()),
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
