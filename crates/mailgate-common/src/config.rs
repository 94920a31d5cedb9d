//! Configuration for Mailgate

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Prefix of environment variables that override file settings,
/// e.g. `MAILGATE__SPF__TIMEOUT_MS=5000`.
const ENV_PREFIX: &str = "MAILGATE";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// SPF checking
    pub spf: SpfConfig,

    /// DNS resolver configuration
    pub dns: DnsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname, used as the receiver in trace headers
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// SPF hook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfConfig {
    /// Run SPF checks at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overall deadline for one check in milliseconds
    #[serde(default = "default_spf_timeout")]
    pub timeout_ms: u64,

    /// Also evaluate the HELO identity
    #[serde(default = "default_true")]
    pub check_helo: bool,

    /// Reject on `Fail`
    #[serde(default = "default_true")]
    pub reject_fail: bool,

    /// Reject on `SoftFail`
    #[serde(default)]
    pub reject_softfail: bool,

    /// Answer 4xx on `TempError`
    #[serde(default = "default_true")]
    pub defer_temperror: bool,

    /// Reject on `PermError`
    #[serde(default)]
    pub reject_permerror: bool,

    /// Emit a `Received-SPF` header for accepted mail
    #[serde(default = "default_true")]
    pub add_header: bool,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_spf_timeout(),
            check_helo: true,
            reject_fail: true,
            reject_softfail: false,
            defer_temperror: true,
            reject_permerror: false,
            add_header: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_spf_timeout() -> u64 {
    30_000
}

/// DNS resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Use /etc/resolv.conf (or the platform equivalent)
    #[serde(default = "default_true")]
    pub use_system_conf: bool,

    /// Explicit nameservers (`ip` or `ip:port`), used when
    /// `use_system_conf` is off
    #[serde(default)]
    pub nameservers: Vec<String>,

    /// Per-query timeout in milliseconds
    #[serde(default = "default_dns_timeout")]
    pub timeout_ms: u64,

    /// Attempts per query
    #[serde(default = "default_dns_attempts")]
    pub attempts: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            use_system_conf: true,
            nameservers: Vec::new(),
            timeout_ms: default_dns_timeout(),
            attempts: default_dns_attempts(),
        }
    }
}

fn default_dns_timeout() -> u64 {
    5_000
}

fn default_dns_attempts() -> usize {
    2
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from an optional file, layered with
    /// `MAILGATE__*` environment variables
    ///
    /// Without an explicit path the default locations are searched; when
    /// none exists, defaults plus environment are used.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let path = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(crate::Error::Config(format!(
                        "Config file not found: {}",
                        p.display()
                    )));
                }
                Some(p.to_path_buf())
            }
            None => default_paths().into_iter().find(|p| p.exists()),
        };

        load_layered(path.as_deref(), None)
    }
}

fn default_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("./mailgate.toml"),
        PathBuf::from("./config.toml"),
        PathBuf::from("/etc/mailgate/config.toml"),
    ]
}

/// `env` replaces the process environment when given.
fn load_layered(path: Option<&Path>, env: Option<HashMap<String, String>>) -> crate::Result<Config> {
    let mut builder = ::config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(::config::File::from(path).required(true));
    }
    builder = builder.add_source(
        ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .source(env),
    );

    Ok(builder.build()?.try_deserialize()?)
}
