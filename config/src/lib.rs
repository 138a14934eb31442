//! Relay configuration.
//!
//! Settings come from `~/.relay/config.toml` (optional) and are then
//! overridden by environment variables, so a container deployment can run on
//! environment alone:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `TELEGRAM_APITOKEN` | `telegram.token` |
//! | `OPENAI_API_KEY` | `openai.api_key` |
//! | `MODEL_TEMPERATURE` | `openai.temperature` |
//! | `ALLOWED_TELEGRAM_ID` | `telegram.allowed_user_ids` (comma separated) |
//! | `CONVERSATION_IDLE_TIMEOUT_SECONDS` | `conversation.idle_timeout_secs` |
//! | `NOTIFY_USER_ON_CONVERSATION_IDLE_TIMEOUT` | `conversation.notify_on_idle_timeout` |
//!
//! String values in the file may reference the environment as `${VAR}`.
//!
//! ```toml
//! [telegram]
//! token = "${TELEGRAM_APITOKEN}"
//! allowed_user_ids = [12345678]
//!
//! [openai]
//! api_key = "${OPENAI_API_KEY}"
//! model = "gpt-3.5-turbo"
//! temperature = 1.0
//!
//! [conversation]
//! idle_timeout_secs = 900
//! token_budget = 3500
//! trim_strategy = "post_call"
//!
//! [delivery]
//! edit_interval_ms = 1500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use relay_context::{DEFAULT_TOKEN_BUDGET, TrimStrategy};
use relay_types::{ApiKey, ModelName, UserId};

pub const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_APITOKEN";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_MODEL_TEMPERATURE: &str = "MODEL_TEMPERATURE";
pub const ENV_ALLOWED_IDS: &str = "ALLOWED_TELEGRAM_ID";
pub const ENV_IDLE_TIMEOUT: &str = "CONVERSATION_IDLE_TIMEOUT_SECONDS";
pub const ENV_NOTIFY_ON_IDLE: &str = "NOTIFY_USER_ON_CONVERSATION_IDLE_TIMEOUT";

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TEMPERATURE: f32 = 1.0;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 900;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
const DEFAULT_EDIT_INTERVAL_MS: u64 = 1500;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

// ============================================================================
// File layout
// ============================================================================

/// Raw contents of `config.toml`. Every section and key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub telegram: TelegramSection,
    #[serde(default)]
    pub openai: OpenAiSection,
    #[serde(default)]
    pub conversation: ConversationSection,
    #[serde(default)]
    pub delivery: DeliverySection,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelegramSection {
    pub token: Option<String>,
    #[serde(default)]
    pub allowed_user_ids: Vec<i64>,
    pub api_url: Option<String>,
    pub poll_timeout_secs: Option<u64>,
}

// Manual Debug impl to prevent leaking the bot token in logs.
impl std::fmt::Debug for TelegramSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSection")
            .field("token", &mask(self.token.as_ref()))
            .field("allowed_user_ids", &self.allowed_user_ids)
            .field("api_url", &self.api_url)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .finish()
    }
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAiSection {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
}

impl std::fmt::Debug for OpenAiSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiSection")
            .field("api_key", &mask(self.api_key.as_ref()))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

fn mask(opt: Option<&String>) -> &'static str {
    if opt.is_some() { "[REDACTED]" } else { "None" }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConversationSection {
    pub idle_timeout_secs: Option<u64>,
    pub notify_on_idle_timeout: Option<bool>,
    pub sweep_interval_secs: Option<u64>,
    pub token_budget: Option<u32>,
    pub trim_strategy: Option<String>,
    pub estimator: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliverySection {
    pub edit_interval_ms: Option<u64>,
}

impl ConfigFile {
    /// Loads the default config file. `Ok(None)` when it does not exist.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }
}

/// `~/.relay/config.toml`
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".relay").join("config.toml"))
}

/// Replaces `${VAR}` with the value of `VAR`, or nothing when unset.
///
/// An unclosed `${` is kept verbatim.
pub fn expand_env_vars(value: &str) -> String {
    expand_with(value, |name| std::env::var(name).ok())
}

fn expand_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let name = &after[..end];
        if !name.is_empty()
            && let Some(replacement) = lookup(name)
        {
            out.push_str(&replacement);
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

// ============================================================================
// Resolved settings
// ============================================================================

/// Which token estimator the relay uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EstimatorKind {
    #[default]
    Tiktoken,
    Heuristic,
}

impl EstimatorKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tiktoken" => Some(Self::Tiktoken),
            "heuristic" => Some(Self::Heuristic),
            _ => None,
        }
    }
}

/// Fully resolved, validated relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub telegram_token: ApiKey,
    pub telegram_api_url: Option<String>,
    pub poll_timeout: Duration,
    /// Empty means everyone may use the bot.
    pub allowed_users: Vec<UserId>,
    pub openai_api_key: ApiKey,
    pub openai_base_url: String,
    pub model: ModelName,
    pub temperature: f32,
    pub idle_timeout: Duration,
    pub notify_on_idle_timeout: bool,
    pub sweep_interval: Duration,
    pub token_budget: u32,
    pub trim_strategy: TrimStrategy,
    pub estimator: EstimatorKind,
    pub edit_interval: Duration,
}

impl RelayConfig {
    /// Default file plus the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = ConfigFile::load()?.unwrap_or_default();
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    /// `path` plus the process environment.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let file = ConfigFile::load_from(path)?.unwrap_or_default();
        Self::resolve(file, |name| std::env::var(name).ok())
    }

    /// Applies `env` overrides to `file` and validates the result.
    pub fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = |name: &str| env(name).filter(|value| !value.trim().is_empty());
        let expand = |value: String| expand_with(&value, &env);

        let telegram_token = env(ENV_TELEGRAM_TOKEN)
            .or_else(|| file.telegram.token.map(expand))
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_TELEGRAM_TOKEN))?;

        let openai_api_key = env(ENV_OPENAI_API_KEY)
            .or_else(|| file.openai.api_key.map(expand))
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing(ENV_OPENAI_API_KEY))?;

        let allowed_users = match env(ENV_ALLOWED_IDS) {
            Some(raw) => parse_id_list(&raw)?,
            None => file.telegram.allowed_user_ids,
        }
        .into_iter()
        .map(UserId::new)
        .collect();

        let temperature = match env(ENV_MODEL_TEMPERATURE) {
            Some(raw) => raw
                .trim()
                .parse::<f32>()
                .map_err(|e| ConfigError::invalid(ENV_MODEL_TEMPERATURE, e.to_string()))?,
            None => file.openai.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        };
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::invalid(
                "temperature",
                format!("{temperature} is outside 0.0..=2.0"),
            ));
        }

        let idle_timeout_secs = match env(ENV_IDLE_TIMEOUT) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|e| ConfigError::invalid(ENV_IDLE_TIMEOUT, e.to_string()))?,
            None => file
                .conversation
                .idle_timeout_secs
                .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
        };

        let notify_on_idle_timeout = match env(ENV_NOTIFY_ON_IDLE) {
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| ConfigError::invalid(ENV_NOTIFY_ON_IDLE, format!("{raw:?}")))?,
            None => file.conversation.notify_on_idle_timeout.unwrap_or(false),
        };

        let model = match file.openai.model {
            Some(raw) => {
                ModelName::parse(&raw).map_err(|e| ConfigError::invalid("model", e.to_string()))?
            }
            None => ModelName::default(),
        };

        let token_budget = file
            .conversation
            .token_budget
            .unwrap_or(DEFAULT_TOKEN_BUDGET);
        if token_budget == 0 {
            return Err(ConfigError::invalid("token_budget", "must be positive"));
        }

        let trim_strategy = match file.conversation.trim_strategy {
            Some(raw) => TrimStrategy::parse(&raw).ok_or_else(|| {
                ConfigError::invalid(
                    "trim_strategy",
                    format!("{raw:?} (expected pre_call or post_call)"),
                )
            })?,
            None => TrimStrategy::default(),
        };

        let estimator = match file.conversation.estimator {
            Some(raw) => EstimatorKind::parse(&raw).ok_or_else(|| {
                ConfigError::invalid(
                    "estimator",
                    format!("{raw:?} (expected tiktoken or heuristic)"),
                )
            })?,
            None => EstimatorKind::default(),
        };

        let edit_interval_ms = file
            .delivery
            .edit_interval_ms
            .unwrap_or(DEFAULT_EDIT_INTERVAL_MS);
        if edit_interval_ms == 0 {
            return Err(ConfigError::invalid("edit_interval_ms", "must be positive"));
        }

        let sweep_interval_secs = file
            .conversation
            .sweep_interval_secs
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);
        if sweep_interval_secs == 0 {
            return Err(ConfigError::invalid("sweep_interval_secs", "must be positive"));
        }

        Ok(Self {
            telegram_token: ApiKey::new(telegram_token),
            telegram_api_url: file.telegram.api_url,
            poll_timeout: Duration::from_secs(file.telegram.poll_timeout_secs.unwrap_or(60)),
            allowed_users,
            openai_api_key: ApiKey::new(openai_api_key),
            openai_base_url: file
                .openai
                .base_url
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            model,
            temperature,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            notify_on_idle_timeout,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            token_budget,
            trim_strategy,
            estimator,
            edit_interval: Duration::from_millis(edit_interval_ms),
        })
    }
}

fn parse_id_list(raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map_err(|e| ConfigError::invalid(ENV_ALLOWED_IDS, format!("{part:?}: {e}")))
        })
        .collect()
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
