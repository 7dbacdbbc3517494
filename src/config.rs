//! Configuration management for Ratewall.
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `RATEWALL__SECTION__FIELD` environment variables, then the flat variable
//! names older deployments use (`IP_REQUESTS_PER_SECOND`, `REDIS_ADDR`, ...).
//! Both environment layers also see entries from an optional `.env` file,
//! which process variables override.
//! The result is validated once and never changes while the process runs.

use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RatewallError, Result};
use crate::ratelimit::LimitPolicies;

/// Optional dotenv file read from the working directory.
const DOTENV_FILE: &str = ".env";

/// Flat environment variables and the setting each one overrides.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("REDIS_ADDR", "store.redis.addr"),
    ("REDIS_PASSWORD", "store.redis.password"),
    ("REDIS_DB", "store.redis.db"),
    ("IP_REQUESTS_PER_SECOND", "limits.ip.requests_per_second"),
    ("IP_BLOCK_DURATION_SECONDS", "limits.ip.block_duration_secs"),
    ("TOKEN_REQUESTS_PER_SECOND", "limits.token.requests_per_second"),
    ("TOKEN_BLOCK_DURATION_SECONDS", "limits.token.block_duration_secs"),
];

/// Main configuration for the Ratewall service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreSettings,

    /// Per-class rate limit policies
    #[serde(default)]
    pub limits: LimitPolicies,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Deadline for one rate limit check against the store
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store_timeout_ms: default_store_timeout(),
        }
    }
}

impl ServerSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_store_timeout() -> u64 {
    1000
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server
    #[default]
    Redis,
    /// In-process map, for single-instance deployments
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub redis: RedisSettings,

    /// How often the in-process store drops expired records
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis: RedisSettings::default(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

impl StoreSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_sweep_interval() -> u64 {
    1000
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// `host:port` of the server
    #[serde(default = "default_redis_addr")]
    pub addr: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: default_redis_addr(),
            password: None,
            db: 0,
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl RedisSettings {
    /// Connection URL in `redis://[:password@]addr/db` form.
    pub fn url(&self) -> String {
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}/{}", password, self.addr, self.db),
            None => format!("redis://{}/{}", self.addr, self.db),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_redis_addr() -> String {
    "localhost:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    5000
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from an optional YAML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let yaml = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration file");
                Some(std::fs::read_to_string(path)?)
            }
            None => None,
        };

        let mut env = match std::fs::File::open(DOTENV_FILE) {
            Ok(file) => {
                info!(path = DOTENV_FILE, "Loading environment file");
                parse_dotenv(file)?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        env.extend(std::env::vars());

        Self::from_sources(yaml.as_deref(), env)
    }

    /// Build settings from YAML text and an explicit environment.
    pub fn from_sources(yaml: Option<&str>, env: HashMap<String, String>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(yaml) = yaml {
            builder = builder.add_source(File::from_str(yaml, FileFormat::Yaml));
        }

        builder = builder.add_source(
            Environment::with_prefix("RATEWALL")
                .separator("__")
                .try_parsing(true)
                .source(Some(env.clone().into_iter().collect())),
        );

        for (var, path) in LEGACY_ENV {
            let value = env.get(*var).filter(|v| !v.is_empty()).cloned();
            builder = builder.set_override_option(*path, value).map_err(config_error)?;
        }

        let mut settings: Settings = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        if let Some(port) = env.get("SERVER_PORT").filter(|v| !v.is_empty()) {
            let port: u16 = port
                .parse()
                .map_err(|_| RatewallError::Config(format!("Invalid SERVER_PORT: {port}")))?;
            settings.server.listen_addr.set_port(port);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;

        if self.server.store_timeout_ms == 0 {
            return Err(RatewallError::Config(
                "server.store_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.store.redis.connect_timeout_ms == 0 {
            return Err(RatewallError::Config(
                "store.redis.connect_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.store.sweep_interval_ms == 0 {
            return Err(RatewallError::Config(
                "store.sweep_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse `KEY=value` lines in dotenv syntax.
pub fn parse_dotenv<R: Read>(reader: R) -> Result<HashMap<String, String>> {
    dotenvy::from_read_iter(reader)
        .map(|item| item.map_err(|e| RatewallError::Config(format!("Invalid {DOTENV_FILE}: {e}"))))
        .collect()
}

fn config_error(err: ::config::ConfigError) -> RatewallError {
    RatewallError::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ClassPolicy;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_sources(None, HashMap::new()).unwrap();

        assert_eq!(settings.server.listen_addr, default_listen_addr());
        assert_eq!(settings.server.store_timeout(), Duration::from_secs(1));
        assert_eq!(settings.store.backend, StoreBackend::Redis);
        assert_eq!(settings.store.redis.url(), "redis://localhost:6379/0");
        assert_eq!(settings.limits, LimitPolicies::default());
        assert_eq!(settings.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_yaml_file() {
        let yaml = r#"
server:
  listen_addr: "127.0.0.1:9000"
store:
  backend: memory
limits:
  ip:
    requests_per_second: 2
    block_duration_secs: 60
logging:
  format: json
"#;
        let settings = Settings::from_sources(Some(yaml), HashMap::new()).unwrap();

        assert_eq!(settings.server.listen_addr.port(), 9000);
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.limits.ip, ClassPolicy::new(2, 60));
        assert_eq!(settings.limits.token, LimitPolicies::default().token);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_prefixed_env_overrides_file() {
        let yaml = r#"
limits:
  token:
    requests_per_second: 50
    block_duration_secs: 60
"#;
        let settings = Settings::from_sources(
            Some(yaml),
            env(&[("RATEWALL__LIMITS__TOKEN__REQUESTS_PER_SECOND", "7")]),
        )
        .unwrap();

        assert_eq!(settings.limits.token, ClassPolicy::new(7, 60));
    }

    #[test]
    fn test_legacy_env_names() {
        let settings = Settings::from_sources(
            None,
            env(&[
                ("REDIS_ADDR", "redis.internal:6380"),
                ("REDIS_DB", "3"),
                ("IP_REQUESTS_PER_SECOND", "5"),
                ("IP_BLOCK_DURATION_SECONDS", "120"),
                ("TOKEN_REQUESTS_PER_SECOND", "20"),
                ("TOKEN_BLOCK_DURATION_SECONDS", "240"),
                ("SERVER_PORT", "8081"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.store.redis.url(), "redis://redis.internal:6380/3");
        assert_eq!(settings.limits.ip, ClassPolicy::new(5, 120));
        assert_eq!(settings.limits.token, ClassPolicy::new(20, 240));
        assert_eq!(settings.server.listen_addr.port(), 8081);
    }

    #[test]
    fn test_dotenv_entries_apply_under_process_env() {
        let dotenv = r#"
# copied from the old deployment
REDIS_ADDR=redis.old:6379
IP_REQUESTS_PER_SECOND=4
TOKEN_BLOCK_DURATION_SECONDS="90"
"#;
        let mut vars = parse_dotenv(dotenv.as_bytes()).unwrap();
        vars.extend(env(&[("REDIS_ADDR", "redis.new:6379")]));

        let settings = Settings::from_sources(None, vars).unwrap();

        assert_eq!(settings.store.redis.addr, "redis.new:6379");
        assert_eq!(settings.limits.ip.requests_per_second, 4);
        assert_eq!(settings.limits.token.block_duration_secs, 90);
    }

    #[test]
    fn test_malformed_dotenv_is_rejected() {
        let result = parse_dotenv("NOT A VALID LINE\n".as_bytes());
        assert!(matches!(result, Err(RatewallError::Config(_))));
    }

    #[test]
    fn test_redis_url_with_password() {
        let redis = RedisSettings {
            password: Some("hunter2".to_string()),
            ..RedisSettings::default()
        };
        assert_eq!(redis.url(), "redis://:hunter2@localhost:6379/0");
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let result = Settings::from_sources(None, env(&[("IP_REQUESTS_PER_SECOND", "0")]));
        assert!(matches!(result, Err(RatewallError::Config(_))));
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        let result = Settings::from_sources(None, env(&[("SERVER_PORT", "eighty")]));
        assert!(matches!(result, Err(RatewallError::Config(_))));
    }

    #[test]
    fn test_malformed_yaml_is_rejected() {
        let result = Settings::from_sources(Some("limits: [unclosed"), HashMap::new());
        assert!(matches!(result, Err(RatewallError::Config(_))));
    }
}
