//! Configuration parsing and validation for routelane.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::path::Path;

use crate::model::{ApiService, ContentType, Route, Rule, Vendor};

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    pub failover: FailoverConfig,
    pub budget: BudgetConfig,
    pub classifier: ClassifierConfig,
    pub logging: LoggingConfig,
    pub vendors: Vec<Vendor>,
    pub services: Vec<ApiService>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:3456")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:3456".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./routelane.db".to_string()
}

/// Failover behaviour on upstream errors.
#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    /// Try the next candidate rule after an upstream failure.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Token budget settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BudgetConfig {
    /// Seconds between background reset sweeps. Zero keeps resets lazy.
    #[serde(default)]
    pub sweep_interval_secs: u64,
}

/// Request classification settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// Caller models matching this regex are routed as background work.
    #[serde(default = "default_background_pattern")]
    pub background_model_pattern: String,
    /// Estimated prompt tokens above which a request is long-context.
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: u64,
}

fn default_background_pattern() -> String {
    "(?i)haiku".to_string()
}

fn default_long_context_threshold() -> u64 {
    60_000
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            background_model_pattern: default_background_pattern(),
            long_context_threshold: default_long_context_threshold(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to write dispatch attempts to the database
    #[serde(default = "default_true")]
    pub log_attempts: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_attempts: true,
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub fn filter_directives(&self) -> String {
        format!("routelane={level},tower_http={level}", level = self.level)
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a service's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in config
    Literal,
    /// Contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Auto-discovered from convention env var (holds var name)
    Convention(String),
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for service '{service}': {message}")]
    EnvVar {
        var: String,
        service: String,
        message: String,
    },
}

/// Raw service config deserialized directly from TOML.
/// api_key may still contain `${VAR}` references.
#[derive(Deserialize)]
pub struct RawServiceConfig {
    id: String,
    vendor_id: String,
    #[serde(default = "default_source_type")]
    source_type: String,
    api_url: String,
    api_key: Option<String>,
    #[serde(default)]
    supported_models: Vec<String>,
}

fn default_source_type() -> String {
    "claude".to_string()
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    failover: FailoverConfig,
    #[serde(default)]
    budget: BudgetConfig,
    #[serde(default)]
    classifier: ClassifierConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    vendors: Vec<Vendor>,
    #[serde(default)]
    services: Vec<RawServiceConfig>,
    #[serde(default)]
    routes: Vec<Route>,
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, service_id: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            service: service_id.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                service: service_id.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            service: service_id.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in service '{}')",
                var_name, service_id
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn expand_env_vars(input: &str, service_id: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, service_id, |name| std::env::var(name).ok())
}

/// Derive the convention-based env var name for a service.
///
/// - "anthropic" -> "ROUTELANE_ANTHROPIC_API_KEY"
/// - "openai-backup" -> "ROUTELANE_OPENAI_BACKUP_API_KEY"
pub fn convention_env_var_name(service_id: &str) -> String {
    let upper_snake = service_id.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("ROUTELANE_{}_API_KEY", upper_snake)
}

fn convention_key_lookup(service_id: &str) -> Option<(String, String)> {
    let var_name = convention_env_var_name(service_id);
    std::env::var(&var_name).ok().map(|value| (var_name, value))
}

impl Config {
    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-service key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;

        Ok((config, key_sources))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, _) = Self::from_raw(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Convert raw (deserialized) config to final config with env var expansion.
    ///
    /// For each service:
    /// - `api_key` containing `${VAR}` is expanded from the environment
    /// - a literal `api_key` is wrapped directly
    /// - an absent `api_key` falls back to `ROUTELANE_<ID>_API_KEY`
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut services = Vec::with_capacity(raw.services.len());
        let mut key_sources = Vec::with_capacity(raw.services.len());

        for rs in raw.services {
            let (api_key, source) = match rs.api_key {
                Some(ref raw_key) if raw_key.contains("${") => {
                    let expanded = expand_env_vars(raw_key, &rs.id)?;
                    (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
                }
                Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
                None => match convention_key_lookup(&rs.id) {
                    Some((var_name, value)) => {
                        (Some(ApiKey::from(value)), KeySource::Convention(var_name))
                    }
                    None => (None, KeySource::None),
                },
            };

            key_sources.push((rs.id.clone(), source));

            services.push(ApiService {
                id: rs.id,
                vendor_id: rs.vendor_id,
                source_type: rs.source_type,
                api_url: rs.api_url,
                api_key,
                supported_models: rs.supported_models,
            });
        }

        let config = Config {
            server: raw.server,
            database: raw.database,
            failover: raw.failover,
            budget: raw.budget,
            classifier: raw.classifier,
            logging: raw.logging,
            vendors: raw.vendors,
            services,
            routes: raw.routes,
            rules: raw.rules,
        };

        Ok((config, key_sources))
    }

    /// Validate cross references and uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rules.is_empty() {
            tracing::warn!("No rules configured - every request will be rejected");
        }

        if let Err(e) = regex::Regex::new(&self.classifier.background_model_pattern) {
            return Err(ConfigError::Validation(format!(
                "Invalid background_model_pattern: {}",
                e
            )));
        }

        check_unique("vendor", self.vendors.iter().map(|v| v.id.as_str()))?;
        check_unique("service", self.services.iter().map(|s| s.id.as_str()))?;
        check_unique("route", self.routes.iter().map(|r| r.id.as_str()))?;
        check_unique("rule", self.rules.iter().map(|r| r.id.as_str()))?;

        for service in &self.services {
            if service.api_url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Service '{}' has empty api_url",
                    service.id
                )));
            }
            if !self.vendors.is_empty() && !self.vendors.iter().any(|v| v.id == service.vendor_id)
            {
                return Err(ConfigError::Validation(format!(
                    "Service '{}' references unknown vendor '{}'",
                    service.id, service.vendor_id
                )));
            }
        }

        let mut active_targets = HashSet::new();
        for route in self.routes.iter().filter(|r| r.is_active) {
            if !active_targets.insert(route.target_type) {
                return Err(ConfigError::Validation(format!(
                    "More than one active route for target type '{}'",
                    route.target_type
                )));
            }
        }

        for rule in &self.rules {
            if !self.routes.iter().any(|r| r.id == rule.route_id) {
                return Err(ConfigError::Validation(format!(
                    "Rule '{}' references unknown route '{}'",
                    rule.id, rule.route_id
                )));
            }
            if !self.services.iter().any(|s| s.id == rule.target_service_id) {
                return Err(ConfigError::Validation(format!(
                    "Rule '{}' references unknown service '{}'",
                    rule.id, rule.target_service_id
                )));
            }
            if rule.content_type == ContentType::ModelMapping
                && rule.replaced_model.as_deref().unwrap_or("").is_empty()
            {
                return Err(ConfigError::Validation(format!(
                    "Model-mapping rule '{}' needs a replaced_model",
                    rule.id
                )));
            }
        }

        Ok(())
    }
}

fn check_unique<'a>(
    kind: &str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ConfigError::Validation(format!(
                "Duplicate {} id '{}'",
                kind, id
            )));
        }
    }
    Ok(())
}
