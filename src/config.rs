use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::providers::ProviderFamily;

/// Env var naming the config file when `--config` is not given.
pub const CONFIG_ENV: &str = "LLM_GATEWAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "llm-gateway.toml";

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub accounting: AccountingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Settings replaced by environment variables, as `section.key`.
    #[serde(skip)]
    pub env_overrides: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Empty means any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "default_admin_name")]
    pub default_admin_name: String,
    #[serde(default = "default_identity_cache_ttl")]
    pub identity_cache_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            default_admin_name: default_admin_name(),
            identity_cache_ttl_secs: default_identity_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Outbound HTTP behavior.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Whole-response limit for buffered calls; the longest silence allowed
    /// between reads of a stream.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Extra attempts after a transport failure (non-streaming only).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_flush_attempts")]
    pub max_flush_attempts: u32,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            max_flush_attempts: default_max_flush_attempts(),
        }
    }
}

/// One upstream endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    pub family: ProviderFamily,
    pub base_url: String,
    /// Env var holding the upstream credential. Unset means the provider
    /// needs none; set but empty in the environment disables its models.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Higher wins when two providers publish the same model name.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub app_url: Option<String>,
}

/// One public model id.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub name: String,
    pub provider: String,
    /// Defaults to `name`.
    #[serde(default)]
    pub upstream_model: Option<String>,
    #[serde(default)]
    pub known_as: Vec<String>,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    /// USD per million input tokens.
    #[serde(default)]
    pub input_price: f64,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_price: f64,
    #[serde(default)]
    pub trim_history: bool,
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8400
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_db_path() -> PathBuf {
    PathBuf::from("llm-gateway.db")
}
fn default_admin_name() -> String {
    "admin".to_string()
}
const fn default_identity_cache_ttl() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}
const fn default_timeout() -> u64 {
    600
}
const fn default_connect_timeout() -> u64 {
    10
}
const fn default_max_retries() -> u32 {
    2
}
const fn default_retry_backoff() -> u64 {
    250
}
const fn default_max_backoff() -> u64 {
    2000
}
const fn default_batch_size() -> usize {
    100
}
const fn default_flush_interval() -> u64 {
    1000
}
const fn default_max_flush_attempts() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Loading and validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply `LLM_GATEWAY_*`
    /// environment overrides. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Read and validate the file only.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&content)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path from the CLI value, then `LLM_GATEWAY_CONFIG`.
    pub fn resolve_path(cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Check provider/model cross references and values.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                anyhow::bail!("provider '{}' is defined twice", provider.name);
            }
            url::Url::parse(&provider.base_url).map_err(|e| {
                anyhow::anyhow!("provider '{}' has invalid base_url: {e}", provider.name)
            })?;
        }
        for model in &self.models {
            if !names.contains(model.provider.as_str()) {
                anyhow::bail!(
                    "model '{}' references unknown provider '{}'",
                    model.name,
                    model.provider
                );
            }
            if model.input_price < 0.0 || model.output_price < 0.0 {
                anyhow::bail!("model '{}' has a negative price", model.name);
            }
            if !model.input_price.is_finite() || !model.output_price.is_finite() {
                anyhow::bail!("model '{}' has a non-finite price", model.name);
            }
        }
        Ok(())
    }

    /// Apply overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let mut overridden = Vec::new();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    $field = val;
                    overridden.push($key.to_string());
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    match val.parse() {
                        Ok(parsed) => {
                            $field = parsed;
                            overridden.push($key.to_string());
                        }
                        Err(_) => tracing::warn!(var = $env, value = %val, "ignoring unparsable override"),
                    }
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    overridden.push($key.to_string());
                }
            };
        }

        env_str!("server.host", "LLM_GATEWAY_HOST", self.server.host);
        env_parse!("server.port", "LLM_GATEWAY_PORT", self.server.port);
        if let Some(val) = lookup("LLM_GATEWAY_DB_PATH") {
            self.database.path = PathBuf::from(val);
            overridden.push("database.path".to_string());
        }
        env_str!("logging.level", "LLM_GATEWAY_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "LLM_GATEWAY_LOG_JSON", self.logging.json);

        self.env_overrides = overridden;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[server]
host = "0.0.0.0"
port = 9000

[upstream]
max_retries = 1

[[providers]]
name = "openai"
family = "openai"
base_url = "https://api.openai.com/v1"
api_key_env = "OPENAI_API_KEY"

[[providers]]
name = "router"
family = "aggregator"
base_url = "https://openrouter.ai/api/v1"
api_key_env = "OPENROUTER_API_KEY"
priority = -1
app_name = "gateway"

[[models]]
name = "gpt-4.1"
provider = "openai"
input_price = 2.0
output_price = 8.0
known_as = ["gpt-4.1-latest"]
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:8400");
        assert_eq!(config.database.path, PathBuf::from("llm-gateway.db"));
        assert_eq!(config.upstream.max_retries, 2);
        assert_eq!(config.accounting.batch_size, 100);
        assert_eq!(config.accounting.max_flush_attempts, 3);
        assert_eq!(config.auth.identity_cache_ttl_secs, 60);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_file(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8400);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.upstream.max_retries, 1);
        assert_eq!(config.upstream.timeout_secs, 600);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].family, ProviderFamily::Aggregator);
        assert_eq!(config.providers[1].priority, -1);
        assert_eq!(config.models[0].known_as, vec!["gpt-4.1-latest"]);
        assert_eq!(config.models[0].upstream_model, None);
    }

    #[test]
    fn test_unknown_provider_reference_names_model() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.models[0].provider = "missing".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("gpt-4.1"));
        assert!(err.contains("missing"));
    }

    #[test]
    fn test_negative_price_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.models[0].output_price = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_base_url_rejected() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.providers[0].base_url = "not a url".into();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("openai"));
    }

    #[test]
    fn test_unknown_family_fails_to_parse() {
        let doc = r#"
[[providers]]
name = "x"
family = "carrier-pigeon"
base_url = "https://x"
"#;
        assert!(toml::from_str::<Config>(doc).is_err());
    }

    #[test]
    fn test_env_overrides_apply_and_track() {
        let vars: HashMap<&str, &str> = [
            ("LLM_GATEWAY_PORT", "9999"),
            ("LLM_GATEWAY_LOG_JSON", "yes"),
            ("LLM_GATEWAY_DB_PATH", "/tmp/gw.db"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9999);
        assert!(config.logging.json);
        assert_eq!(config.database.path, PathBuf::from("/tmp/gw.db"));
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.env_overrides.contains(&"server.port".to_string()));
        assert!(!config.env_overrides.contains(&"server.host".to_string()));
    }

    #[test]
    fn test_unparsable_port_override_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides(|name| (name == "LLM_GATEWAY_PORT").then(|| "abc".to_string()));
        assert_eq!(config.server.port, 8400);
        assert!(config.env_overrides.is_empty());
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        let path = Config::resolve_path(Some(PathBuf::from("/etc/gw.toml")));
        assert_eq!(path, PathBuf::from("/etc/gw.toml"));
    }
}
