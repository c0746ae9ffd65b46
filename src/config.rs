//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - tablestore.toml (default configuration)
//! - tablestore.local.toml (git-ignored local overrides)
//! - Environment variables (TABLESTORE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # tablestore.toml
//! [http]
//! host = "0.0.0.0"
//! port = 10002
//!
//! [storage]
//! max_page_size = 1000
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! TABLESTORE_HTTP__PORT=10102
//! TABLESTORE_LOGGING__FORMAT=json
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP server bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Scheme used in OData links (`odata.metadata`, `odata.id`, `Location`)
    #[serde(default = "default_http_scheme")]
    pub scheme: String,

    /// Allowed CORS origins (empty = same-origin only, unless cors_allow_all is true)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Explicitly allow all CORS origins (dev mode opt-in)
    #[serde(default)]
    pub cors_allow_all: bool,

    /// Largest accepted request body, batches included
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum concurrent requests. 0 = unlimited.
    #[serde(default)]
    pub max_connections: usize,
}

/// Table store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Page size when `$top` is absent, and the cap applied to `$top`
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Maximum number of tables across all accounts. 0 = unlimited.
    #[serde(default)]
    pub max_tables: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    crate::protocol::DEFAULT_PORT
}
fn default_http_scheme() -> String {
    "http".to_string()
}
fn default_max_body_bytes() -> usize {
    4 * 1024 * 1024
}
fn default_max_page_size() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. tablestore.toml (base configuration)
    /// 2. tablestore.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (TABLESTORE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("tablestore.toml"))
            .merge(Toml::file("tablestore.local.toml"))
            .merge(Env::prefixed("TABLESTORE_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TABLESTORE_").split("__"))
            .extract()
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            host: default_http_host(),
            port: default_http_port(),
            scheme: default_http_scheme(),
            cors_origins: Vec::new(),
            cors_allow_all: false,
            max_body_bytes: default_max_body_bytes(),
            max_connections: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            max_page_size: default_max_page_size(),
            max_tables: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
