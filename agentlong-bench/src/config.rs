//! Configuration management for the benchmark harness
//!
//! Service endpoints and runner defaults come from a TOML file, with
//! services also discovered from `{NAME}_API_KEY` / `{NAME}_BASE_URL` /
//! `{NAME}_MODEL_NAME` environment variables. The result is built once at
//! startup and passed around by reference.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
    #[serde(default)]
    pub runner: RunnerSettings,
    #[serde(default)]
    pub offline: OfflineSettings,
}

/// Wire protocol spoken by a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStyle {
    #[default]
    OpenAI,
    Anthropic,
}

/// One named inference endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default)]
    pub api_style: ApiStyle,
    pub base_url: String,
    pub model_name: String,
    /// Literal key; prefer `api_key_env` in shared files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Requests per minute; 0 disables the limit
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    /// Tokens per minute; 0 disables the limit
    #[serde(default = "default_tpm")]
    pub tpm: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn new(base_url: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            api_style: ApiStyle::OpenAI,
            base_url: base_url.into(),
            model_name: model_name.into(),
            api_key: None,
            api_key_env: None,
            rpm: default_rpm(),
            tpm: default_tpm(),
            timeout_ms: None,
            extra_headers: BTreeMap::new(),
        }
    }

    /// The key from `api_key`, else `api_key_env`, else `{NAME}_API_KEY`
    pub fn resolve_api_key(&self, service: &str) -> Result<String, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }
        let var = self
            .api_key_env
            .clone()
            .unwrap_or_else(|| format!("{}_API_KEY", service.to_ascii_uppercase()));
        std::env::var(&var).map_err(|_| ConfigError::MissingApiKey {
            service: service.to_string(),
            var,
        })
    }
}

/// Defaults for online runs; CLI flags override them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    /// Service used when `--service` is not given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Merged into every request body
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_params: Map<String, Value>,
}

/// Local engine launch settings for `run-offline`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OfflineSettings {
    #[serde(default = "default_engine_command")]
    pub command: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_max_model_len")]
    pub max_model_len: Option<u32>,
    #[serde(default = "default_max_num_batched_tokens")]
    pub max_num_batched_tokens: Option<u32>,
    #[serde(default = "default_true")]
    pub enable_chunked_prefill: bool,
    #[serde(default = "default_true")]
    pub enforce_eager: bool,
    /// Appended verbatim to the engine command line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

// Default value functions
fn default_true() -> bool { true }
fn default_rpm() -> u32 { 60 }
fn default_tpm() -> u32 { 1_000_000 }
fn default_temperature() -> f32 { 0.7 }
fn default_workers() -> usize { 1 }
fn default_retry_count() -> u32 { 3 }
fn default_retry_delay_ms() -> u64 { 1000 }
fn default_max_retry_delay_ms() -> u64 { 60_000 }
fn default_timeout_ms() -> u64 { 1_200_000 }
fn default_engine_command() -> String { "vllm".to_string() }
fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8000 }
fn default_startup_timeout_ms() -> u64 { 900_000 }
fn default_max_model_len() -> Option<u32> { Some(1_300_000) }
fn default_max_num_batched_tokens() -> Option<u32> { Some(131_072) }

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            service: None,
            temperature: default_temperature(),
            top_p: None,
            max_tokens: None,
            stream: true,
            workers: default_workers(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            timeout_ms: default_timeout_ms(),
            extra_params: Map::new(),
        }
    }
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            host: default_host(),
            port: default_port(),
            startup_timeout_ms: default_startup_timeout_ms(),
            max_model_len: default_max_model_len(),
            max_num_batched_tokens: default_max_num_batched_tokens(),
            enable_chunked_prefill: true,
            enforce_eager: true,
            extra_args: Vec::new(),
        }
    }
}

const CONFIG_PATHS: [&str; 3] = [
    "config/models.toml",
    "../config/models.toml",
    "agentlong-bench/config/models.toml",
];

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `path`, else the first config file found on the search path, else defaults
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            let config = Self::from_file(path)?;
            tracing::info!("Loaded configuration from {}", path.display());
            return Ok(config);
        }

        for candidate in CONFIG_PATHS {
            if Path::new(candidate).is_file() {
                let config = Self::from_file(candidate)?;
                tracing::info!("Loaded configuration from {}", candidate);
                return Ok(config);
            }
        }

        tracing::info!("Using default configuration");
        Ok(Self::default())
    }

    /// Save configuration to a TOML file
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;
        Ok(())
    }

    /// Add services described by `{NAME}_API_KEY`, `{NAME}_BASE_URL` and `{NAME}_MODEL_NAME`
    ///
    /// Services already present in the file are left untouched.
    pub fn with_env_services<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();

        for (var, key) in &vars {
            let Some(name) = var.strip_suffix("_API_KEY") else {
                continue;
            };
            if name.is_empty() || self.find_service(name).is_some() {
                continue;
            }
            let (Some(base_url), Some(model_name)) = (
                vars.get(&format!("{}_BASE_URL", name)),
                vars.get(&format!("{}_MODEL_NAME", name)),
            ) else {
                tracing::debug!("Ignoring {}: no matching base URL and model name", var);
                continue;
            };

            let mut service = ServiceConfig::new(base_url, model_name);
            service.api_key = Some(key.clone());
            tracing::debug!("Discovered service {} from environment", name);
            self.services.insert(name.to_string(), service);
        }

        self
    }

    /// Look up a service by name; exact match first, then case-insensitive
    pub fn service(&self, name: &str) -> Result<(&str, &ServiceConfig), ConfigError> {
        self.find_service(name)
            .ok_or_else(|| ConfigError::UnknownService {
                name: name.to_string(),
                available: self.service_names().join(", "),
            })
    }

    fn find_service(&self, name: &str) -> Option<(&str, &ServiceConfig)> {
        self.services
            .get_key_value(name)
            .or_else(|| {
                self.services
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
            })
            .map(|(key, service)| (key.as_str(), service))
    }

    /// The named service, else `[runner].service`, else the first known service
    pub fn select_service(&self, requested: Option<&str>) -> Result<(&str, &ServiceConfig), ConfigError> {
        match requested.or(self.runner.service.as_deref()) {
            Some(name) => self.service(name),
            None => self
                .services
                .iter()
                .next()
                .map(|(key, service)| (key.as_str(), service))
                .ok_or(ConfigError::NoServices),
        }
    }

    pub fn service_names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    /// Starter file written by `init-config`
    pub fn sample() -> Self {
        let mut services = BTreeMap::new();

        let mut openai = ServiceConfig::new("https://api.openai.com/v1", "gpt-4o");
        openai.api_key_env = Some("OPENAI_API_KEY".to_string());
        openai.rpm = 500;
        services.insert("openai".to_string(), openai);

        let mut local = ServiceConfig::new("http://127.0.0.1:8000/v1", "Qwen/Qwen2.5-7B-Instruct");
        local.api_key = Some("EMPTY".to_string());
        local.rpm = 0;
        local.tpm = 0;
        services.insert("local".to_string(), local);

        Self {
            services,
            runner: RunnerSettings {
                service: Some("openai".to_string()),
                ..RunnerSettings::default()
            },
            offline: OfflineSettings::default(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown service '{name}' (known: {available})")]
    UnknownService { name: String, available: String },

    #[error("No services configured; add [services.<name>] to the config or set <NAME>_API_KEY, <NAME>_BASE_URL and <NAME>_MODEL_NAME")]
    NoServices,

    #[error("No API key for service '{service}': set {var}")]
    MissingApiKey { service: String, var: String },
}
