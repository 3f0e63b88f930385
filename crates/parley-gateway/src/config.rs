use anyhow::{Context, Result};
use parley_core::{ModelCatalog, ModelSpec, Pricing, UserId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Config {
    pub admin: AdminConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Replaces the built-in price table when non-empty.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    /// Price corrections applied on top of the model table.
    #[serde(default)]
    pub pricing: Vec<PriceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AdminConfig {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TelegramConfig {
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_telegram_token_env")]
    pub token_env: String,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_telegram_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
            token_env: default_telegram_token_env(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CompletionConfig {
    #[serde(default = "default_completion_api_base")]
    pub api_base: String,
    #[serde(default = "default_completion_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_base: default_completion_api_base(),
            api_key_env: default_completion_key_env(),
            transcription_model: default_transcription_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SpeechConfig {
    #[serde(default = "default_speech_api_base")]
    pub api_base: String,
    #[serde(default = "default_speech_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_speech_model_id")]
    pub model_id: String,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_base: default_speech_api_base(),
            api_key_env: default_speech_key_env(),
            voice_id: default_voice_id(),
            model_id: default_speech_model_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LimitsConfig {
    /// Total cost after which non-admin users are blocked.
    #[serde(default = "default_usage_ceiling")]
    pub usage_ceiling: f64,
    /// Number of trailing messages sent to the summarizer.
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,
    #[serde(default = "default_service_timeout_secs")]
    pub service_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            usage_ceiling: default_usage_ceiling(),
            summary_window: default_summary_window(),
            service_timeout_secs: default_service_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StorageConfig {
    #[serde(default = "default_users_path")]
    pub users_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            users_path: default_users_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ModelConfig {
    pub name: String,
    pub context_window: u32,
    /// Price per 1000 prompt tokens.
    pub prompt_price: f64,
    /// Price per 1000 completion tokens.
    pub completion_price: f64,
    #[serde(default)]
    pub restricted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PriceConfig {
    pub model: String,
    pub prompt_price: f64,
    pub completion_price: f64,
}

fn default_telegram_api_base() -> String {
    parley_channels::telegram::DEFAULT_API_BASE.to_owned()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_telegram_token_env() -> String {
    "PARLEY_TELEGRAM_TOKEN".to_owned()
}

fn default_completion_api_base() -> String {
    parley_agent::openai::DEFAULT_API_BASE.to_owned()
}

fn default_completion_key_env() -> String {
    "OPENAI_API_KEY".to_owned()
}

fn default_transcription_model() -> String {
    parley_agent::openai::DEFAULT_TRANSCRIPTION_MODEL.to_owned()
}

fn default_speech_api_base() -> String {
    parley_agent::elevenlabs::DEFAULT_API_BASE.to_owned()
}

fn default_speech_key_env() -> String {
    "ELEVENLABS_API_KEY".to_owned()
}

fn default_voice_id() -> String {
    parley_agent::elevenlabs::DEFAULT_VOICE_ID.to_owned()
}

fn default_speech_model_id() -> String {
    parley_agent::elevenlabs::DEFAULT_MODEL_ID.to_owned()
}

fn default_usage_ceiling() -> f64 {
    1.0
}

fn default_summary_window() -> usize {
    10
}

fn default_service_timeout_secs() -> u64 {
    120
}

fn default_users_path() -> String {
    "~/.parley/users.json".to_owned()
}

impl Config {
    /// Load config from a TOML file.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub(crate) fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub(crate) fn admin(&self) -> UserId {
        UserId(self.admin.id)
    }

    /// The price table: the configured models (or the built-in ones) with
    /// any `[[pricing]]` corrections applied. Corrections naming an unknown
    /// model are skipped.
    pub(crate) fn catalog(&self) -> ModelCatalog {
        let mut catalog = if self.models.is_empty() {
            ModelCatalog::default()
        } else {
            ModelCatalog::new(
                self.models
                    .iter()
                    .map(|m| {
                        ModelSpec::new(
                            &m.name,
                            m.context_window,
                            m.prompt_price,
                            m.completion_price,
                            m.restricted,
                        )
                    })
                    .collect(),
            )
        };

        for price in &self.pricing {
            let pricing = Pricing {
                prompt: price.prompt_price,
                completion: price.completion_price,
            };
            if !catalog.set_pricing(&price.model, pricing) {
                warn!(model = %price.model, "price correction for unknown model ignored");
            }
        }
        catalog
    }

    pub(crate) fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.service_timeout_secs)
    }

    /// Users file with a leading `~/` expanded to `$HOME`.
    pub(crate) fn users_path(&self) -> PathBuf {
        let raw = &self.storage.users_path;
        if let Some(rest) = raw.strip_prefix("~/")
            && let Ok(home) = std::env::var("HOME")
        {
            return PathBuf::from(home).join(rest);
        }
        PathBuf::from(raw)
    }

    /// Resolve config path: check arg, then default locations.
    pub(crate) fn find_config_path(explicit: Option<&str>) -> PathBuf {
        if let Some(p) = explicit {
            return PathBuf::from(p);
        }

        // Check current directory
        let local = PathBuf::from("parley.toml");
        if local.exists() {
            return local;
        }

        // Check XDG config
        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            let xdg = PathBuf::from(config_dir).join("parley/parley.toml");
            if xdg.exists() {
                return xdg;
            }
        }

        // Check ~/.config/parley
        if let Ok(home) = std::env::var("HOME") {
            let home_config = PathBuf::from(home).join(".config/parley/parley.toml");
            if home_config.exists() {
                return home_config;
            }
        }

        // Default to local
        local
    }
}

/// Read a secret from the environment. Secrets are never stored in the file.
pub(crate) fn env_secret(var: &str) -> Result<String> {
    let value = std::env::var(var).with_context(|| format!("{var} environment variable not set"))?;
    anyhow::ensure!(!value.trim().is_empty(), "{var} environment variable is empty");
    debug!(var, "loaded secret from environment");
    Ok(value)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = Config::parse("[admin]\nid = 1234\n").unwrap();
        assert_eq!(config.admin(), UserId(1234));
        assert_eq!(config.telegram.token_env, "PARLEY_TELEGRAM_TOKEN");
        assert_eq!(config.telegram.poll_timeout_secs, 30);
        assert_eq!(config.completion.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.completion.transcription_model, "whisper-1");
        assert_eq!(config.speech.api_key_env, "ELEVENLABS_API_KEY");
        assert!((config.limits.usage_ceiling - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.limits.summary_window, 10);
        assert_eq!(config.service_timeout(), Duration::from_secs(120));
        assert_eq!(config.storage.users_path, "~/.parley/users.json");
        assert_eq!(config.catalog(), ModelCatalog::default());
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
[admin]
id = 7

[telegram]
api_base = "http://localhost:8081"
poll_timeout_secs = 5
token_env = "MY_BOT_TOKEN"

[completion]
api_base = "http://localhost:8000"
api_key_env = "LOCAL_KEY"
transcription_model = "whisper-large"

[speech]
voice_id = "abc"
model_id = "turbo"

[limits]
usage_ceiling = 2.5
summary_window = 4
service_timeout_secs = 15

[storage]
users_path = "/var/lib/parley/users.json"

[[models]]
name = "local-small"
context_window = 4096
prompt_price = 0.0
completion_price = 0.0

[[models]]
name = "local-large"
context_window = 32768
prompt_price = 0.002
completion_price = 0.004
restricted = true
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.telegram.api_base, "http://localhost:8081");
        assert_eq!(config.telegram.token_env, "MY_BOT_TOKEN");
        assert_eq!(config.completion.transcription_model, "whisper-large");
        assert_eq!(config.speech.voice_id, "abc");
        assert_eq!(config.speech.api_base, "https://api.elevenlabs.io");
        assert_eq!(config.limits.summary_window, 4);
        assert_eq!(config.service_timeout(), Duration::from_secs(15));
        assert_eq!(
            config.users_path(),
            PathBuf::from("/var/lib/parley/users.json")
        );

        let catalog = config.catalog();
        assert_eq!(catalog.models().len(), 2);
        assert!(catalog.resolve("local-large", false).is_err());
        assert!(catalog.resolve("local-large", true).is_ok());
        assert!(catalog.lookup("gpt-4").is_none());
    }

    #[test]
    fn pricing_corrects_builtin_models() {
        let toml = r#"
[admin]
id = 1

[[pricing]]
model = "gpt-3.5-turbo"
prompt_price = 0.0005
completion_price = 0.0015

[[pricing]]
model = "retired-model"
prompt_price = 1.0
completion_price = 1.0
"#;
        let catalog = Config::parse(toml).unwrap().catalog();
        let usage = parley_core::TokenUsage::new(2000, 1000);

        let cost = catalog.cost("gpt-3.5-turbo", usage);
        assert!((cost.prompt - 0.001).abs() < 1e-9);
        assert!((cost.completion - 0.0015).abs() < 1e-9);
        // Untouched models keep the built-in price; unknown names add nothing.
        assert!((catalog.cost("gpt-4", usage).total() - 0.12).abs() < 1e-9);
        assert_eq!(catalog.models().len(), ModelCatalog::default().models().len());
    }

    #[test]
    fn missing_admin_is_an_error() {
        let err = Config::parse("[limits]\nusage_ceiling = 3.0\n").unwrap_err();
        assert!(format!("{err:#}").contains("admin"), "unexpected error: {err:#}");
    }

    #[test]
    fn load_reports_path_on_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.toml");
        std::fs::write(&path, "admin = ").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn explicit_config_path_wins() {
        assert_eq!(
            Config::find_config_path(Some("/etc/parley.toml")),
            PathBuf::from("/etc/parley.toml")
        );
    }

    #[test]
    fn missing_secret_is_an_error() {
        let err = env_secret("PARLEY_TEST_SECRET_THAT_IS_NEVER_SET").unwrap_err();
        assert!(err.to_string().contains("environment variable not set"));
    }
}
