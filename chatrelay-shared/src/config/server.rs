use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use thiserror::Error;

/// Errors raised while resolving the server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("unsupported configuration format for {0}; use yaml, json, or toml")]
    UnsupportedFormat(PathBuf),
    #[error("invalid value for {name}: {message}")]
    InvalidEnv { name: &'static str, message: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Deployment profile used to pick sensible defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    #[default]
    Dev,
    Test,
    Prod,
}

/// Output format of the tracing subscriber.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// How credentials submitted on a session are verified.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Trust a syntactically valid email address as the principal.
    #[default]
    Email,
    /// Verify opaque identity tokens against `auth.verify_url`.
    Token,
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "email" => Ok(Self::Email),
            "token" => Ok(Self::Token),
            other => Err(format!("unknown auth mode '{other}'")),
        }
    }
}

/// CORS settings for the HTTP surface.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct CorsConfig {
    /// Allowed origins; empty means any origin.
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_seconds: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            cors: CorsConfig {
                allowed_origins: Vec::new(),
                allow_credentials: false,
                max_age_seconds: 600,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

/// Durable history store settings. Without a URL the in-memory store is used.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub bootstrap_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            bootstrap_path: PathBuf::from("scripts/pg"),
        }
    }
}

/// Upstream chat-completions endpoint settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompletionConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.cerebras.ai/v1`.
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_completion_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub connect_timeout_secs: u64,
    /// Longest wait for a single fragment before the turn is failed. Zero disables it.
    pub idle_timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.cerebras.ai/v1".into(),
            api_key: None,
            model: "llama-3.3-70b".into(),
            max_completion_tokens: 2048,
            temperature: 0.7,
            top_p: 1.0,
            connect_timeout_secs: 10,
            idle_timeout_secs: 60,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Endpoint receiving `{ "token": ... }` in token mode.
    pub verify_url: Option<String>,
    pub allow_guests: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Email,
            verify_url: None,
            allow_guests: true,
        }
    }
}

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, concise assistant.";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// File holding the system instruction; read once at startup.
    pub system_prompt_path: Option<PathBuf>,
    pub system_prompt: String,
    pub title_max_chars: usize,
    pub max_history_messages: usize,
    /// Capacity of each connection's outbound event queue.
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            system_prompt_path: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            title_max_chars: 30,
            max_history_messages: 100,
            outbound_buffer: 64,
        }
    }
}

impl RelayConfig {
    /// Resolves the system instruction, preferring the configured file.
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] when the configured file cannot be read.
    pub fn resolve_system_prompt(&self) -> Result<String, ConfigError> {
        match &self.system_prompt_path {
            Some(path) => fs::read_to_string(path)
                .map(|content| content.trim_end().to_string())
                .map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                }),
            None => Ok(self.system_prompt.clone()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct WebConfig {
    /// Directory served as static files at the root, if any.
    pub static_dir: Option<PathBuf>,
}

/// The main configuration structure for the `ChatRelay` server.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub db: DatabaseConfig,
    pub completion: CompletionConfig,
    pub auth: AuthConfig,
    pub relay: RelayConfig,
    pub web: WebConfig,
}

impl Config {
    /// Generates the defaults for the given profile.
    #[must_use]
    pub fn default_for_profile(profile: Profile) -> Self {
        let mut config = Self {
            profile,
            ..Self::default()
        };

        match profile {
            Profile::Dev => {
                config.logging.level = "debug".into();
            }
            Profile::Test => {
                config.logging.level = "warn".into();
                config.completion.base_url = "http://127.0.0.1:9".into();
                config.completion.idle_timeout_secs = 5;
            }
            Profile::Prod => {
                config.logging.format = LogFormat::Json;
            }
        }

        config
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// # Arguments
    /// * `config_path` - Optional path to a yaml, json, or toml file.
    /// * `port_override` - Optional port number taking precedence over everything else.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] when the file cannot be read or parsed, an
    /// environment override is malformed, or the resolved values fail validation.
    pub fn load_config(
        config_path: Option<PathBuf>,
        port_override: Option<u16>,
    ) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) => Self::from_file(path)?,
            None => Self::default_for_profile(Profile::Dev),
        };

        config.apply_env_overrides()?;

        if let Some(port) = port_override {
            config.server.port = port;
        }

        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }

    fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);

        let parsed = match extension.as_deref() {
            Some("yaml" | "yml") => {
                serde_yml::from_str::<Self>(&content).map_err(|err| err.to_string())
            }
            Some("json") => serde_json::from_str::<Self>(&content).map_err(|err| err.to_string()),
            Some("toml") => toml::from_str::<Self>(&content).map_err(|err| err.to_string()),
            _ => return Err(ConfigError::UnsupportedFormat(path)),
        };

        parsed.map_err(|message| ConfigError::Parse { path, message })
    }

    /// Applies `CHATRELAY_*` environment variables on top of the current values.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidEnv`] when a variable cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = env::var("CHATRELAY_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "CHATRELAY_PORT",
                message: "must be a number between 1 and 65535".into(),
            })?;
        }
        if let Ok(level) = env::var("CHATRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("CHATRELAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(ConfigError::InvalidEnv {
                        name: "CHATRELAY_LOG_FORMAT",
                        message: format!("unknown format '{other}'"),
                    });
                }
            };
        }
        if let Ok(url) = env::var("CHATRELAY_DATABASE_URL") {
            self.db.url = Some(url).filter(|value| !value.is_empty());
        }
        if let Ok(url) = env::var("CHATRELAY_COMPLETION_URL") {
            self.completion.base_url = url;
        }
        if let Ok(key) = env::var("CHATRELAY_COMPLETION_API_KEY") {
            self.completion.api_key = Some(key).filter(|value| !value.is_empty());
        }
        if let Ok(model) = env::var("CHATRELAY_COMPLETION_MODEL") {
            self.completion.model = model;
        }
        if let Ok(mode) = env::var("CHATRELAY_AUTH_MODE") {
            self.auth.mode = mode.parse().map_err(|message| ConfigError::InvalidEnv {
                name: "CHATRELAY_AUTH_MODE",
                message,
            })?;
        }
        if let Ok(url) = env::var("CHATRELAY_AUTH_VERIFY_URL") {
            self.auth.verify_url = Some(url).filter(|value| !value.is_empty());
        }
        if let Ok(path) = env::var("CHATRELAY_SYSTEM_PROMPT_PATH") {
            self.relay.system_prompt_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Validates the complete configuration, collecting every problem found.
    ///
    /// # Errors
    /// Returns the list of validation messages when any check fails.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Invalid server port. Must be greater than 0.".to_string());
        }
        if self.completion.base_url.trim().is_empty() {
            errors.push("completion.base_url must not be empty".to_string());
        }
        if self.completion.model.trim().is_empty() {
            errors.push("completion.model must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.completion.temperature) {
            errors.push(format!(
                "completion.temperature must be within [0, 2], got {}",
                self.completion.temperature
            ));
        }
        if !(self.completion.top_p > 0.0 && self.completion.top_p <= 1.0) {
            errors.push(format!(
                "completion.top_p must be within (0, 1], got {}",
                self.completion.top_p
            ));
        }
        if self.auth.mode == AuthMode::Token && self.auth.verify_url.is_none() {
            errors.push("auth.verify_url is required when auth.mode is 'token'".to_string());
        }
        if self.relay.title_max_chars == 0 {
            errors.push("relay.title_max_chars must be greater than 0".to_string());
        }
        if self.relay.outbound_buffer == 0 {
            errors.push("relay.outbound_buffer must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
