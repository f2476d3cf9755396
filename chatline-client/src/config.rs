//! Configuration loading for the chatline client.
//!
//! Endpoints are required. Every other section has defaults and may be
//! omitted from the TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use chatline_cache::{CacheConfig, DEFAULT_STORAGE_KEY};
use chatline_core::ConfigError;
use chatline_stream::ReconnectConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "CHATLINE_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    /// Base of the event stream; sessions connect to `<stream_base_url>/<session_id>`.
    pub stream_base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    Memory,
    File,
    Lmdb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceConfig {
    pub backend: PersistenceBackend,
    /// Directory for the `file` and `lmdb` backends.
    pub path: Option<PathBuf>,
    pub storage_key: String,
    pub lmdb_max_size_mb: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::Memory,
            path: None,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            lmdb_max_size_mb: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,chatline_cache=debug,chatline_stream=debug".to_string(),
            json: false,
        }
    }
}

impl ClientConfig {
    /// Minimal config pointing at the given endpoints, defaults elsewhere.
    pub fn new(api_base_url: impl Into<String>, stream_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            stream_base_url: stream_base_url.into(),
            auth: AuthConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            cache: CacheConfig::default(),
            reconnect: ReconnectConfig::default(),
            persistence: PersistenceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load from `--config <path>` or `CHATLINE_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|err| ConfigError::Parse {
            reason: err.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::invalid("api_base_url", "must not be empty"));
        }
        if self.stream_base_url.trim().is_empty() {
            return Err(ConfigError::invalid("stream_base_url", "must not be empty"));
        }
        if !(self.stream_base_url.starts_with("ws://") || self.stream_base_url.starts_with("wss://")) {
            return Err(ConfigError::invalid("stream_base_url", "must use ws:// or wss://"));
        }
        if let Some(token) = &self.auth.bearer_token {
            if token.trim().is_empty() {
                return Err(ConfigError::invalid("auth.bearer_token", "must not be empty when set"));
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid("request_timeout_ms", "must be > 0"));
        }
        self.cache.validate()?;
        self.reconnect.validate()?;
        self.persistence.validate()?;
        Ok(())
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::invalid("persistence.storage_key", "must not be empty"));
        }
        match self.backend {
            PersistenceBackend::Memory => {}
            PersistenceBackend::File | PersistenceBackend::Lmdb => {
                if self.path.as_ref().map_or(true, |p| p.as_os_str().is_empty()) {
                    return Err(ConfigError::invalid(
                        "persistence.path",
                        "required for file and lmdb backends",
                    ));
                }
            }
        }
        if self.backend == PersistenceBackend::Lmdb && self.lmdb_max_size_mb == 0 {
            return Err(ConfigError::invalid("persistence.lmdb_max_size_mb", "must be > 0"));
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
api_base_url = "https://chat.example.com"
stream_base_url = "wss://chat.example.com/ws"
request_timeout_ms = 5000

[auth]
bearer_token = "secret"

[cache]
max_age_ms = 60000
stale_while_revalidate_ms = 120000
max_entries = 50

[reconnect]
base_delay_ms = 500
max_attempts = 3

[persistence]
backend = "file"
path = "/tmp/chatline"

[logging]
filter = "debug"
json = true
"#;

    #[test]
    fn test_parse_full_config() {
        let config = ClientConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.auth.bearer_token.as_deref(), Some("secret"));
        assert_eq!(config.cache.max_entries, 50);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.persistence.backend, PersistenceBackend::File);
        assert_eq!(config.persistence.storage_key, DEFAULT_STORAGE_KEY);
        assert!(config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ClientConfig::from_toml_str(
            "api_base_url = \"http://localhost:8000\"\nstream_base_url = \"ws://localhost:8000/ws\"\n",
        )
        .unwrap();
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert_eq!(config.persistence.backend, PersistenceBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let err = ClientConfig::from_toml_str(
            "api_base_url = \"a\"\nstream_base_url = \"ws://b\"\ncolour = \"red\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let err = ClientConfig::from_toml_str(
            "api_base_url = \"a\"\nstream_base_url = \"ws://b\"\n[cache]\nttl = 5\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_endpoint_rejected() {
        assert!(ClientConfig::from_toml_str("api_base_url = \"a\"\n").is_err());
    }

    #[test]
    fn test_validation_names_field() {
        let mut config = ClientConfig::new("http://localhost", "http://localhost/ws");
        assert_eq!(
            config.validate(),
            Err(ConfigError::invalid("stream_base_url", "must use ws:// or wss://"))
        );

        config.stream_base_url = "ws://localhost/ws".to_string();
        config.persistence.backend = PersistenceBackend::Lmdb;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "persistence.path", .. })
        ));

        config.persistence.backend = PersistenceBackend::Memory;
        config.cache.max_entries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "cache.max_entries", .. })
        ));
    }

    #[test]
    fn test_from_path_reports_io_error() {
        let err = ClientConfig::from_path(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_from_path_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatline.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = ClientConfig::from_path(&path).unwrap();
        assert_eq!(config.api_base_url, "https://chat.example.com");
    }
}
