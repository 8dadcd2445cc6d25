//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_CURSOR_THROTTLE_MS: u64 = 100;
pub const DEFAULT_PRESENCE_TTL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MIN_MS: u64 = 500;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 15_000;

pub const DEFAULT_AI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_AI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AI_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_AI_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_AI_MAX_TOKENS: u32 = 1_024;
pub const DEFAULT_AI_MAX_RESPONSE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_AI_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_SNAPSHOT_MAX_SHAPES: usize = 100;
pub const DEFAULT_COMMANDS_PER_MINUTE: u32 = 20;

/// Top-level shapeshare configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Timing for heartbeats, cursor throttling, staleness and reconnects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_throttle_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_ttl_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_min_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_max_ms: Option<u64>,
}

/// Inference gateway and command translator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_bytes: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_max_shapes: Option<usize>,

    /// Per-user command quota over a sliding minute (0 = unlimited).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands_per_minute: Option<u32>,
}

impl AiConfig {
    /// Resolve the API key: `api_key` first, then the `api_key_env` variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Known callers allowed to issue AI commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<UserCredential>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCredential {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl UserCredential {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "shapeshare_sync=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static env-var pattern is valid");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::ShapeshareError::Io)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::ShapeshareError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(
            self.sync
                .as_ref()
                .and_then(|s| s.heartbeat_interval_ms)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS),
        )
    }

    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(
            self.sync
                .as_ref()
                .and_then(|s| s.cursor_throttle_ms)
                .unwrap_or(DEFAULT_CURSOR_THROTTLE_MS),
        )
    }

    pub fn presence_ttl_ms(&self) -> i64 {
        self.sync
            .as_ref()
            .and_then(|s| s.presence_ttl_ms)
            .unwrap_or(DEFAULT_PRESENCE_TTL_MS) as i64
    }

    /// Reconnect backoff bounds (min, max).
    pub fn reconnect_backoff(&self) -> (Duration, Duration) {
        let sync = self.sync.as_ref();
        let min = sync
            .and_then(|s| s.reconnect_min_ms)
            .unwrap_or(DEFAULT_RECONNECT_MIN_MS);
        let max = sync
            .and_then(|s| s.reconnect_max_ms)
            .unwrap_or(DEFAULT_RECONNECT_MAX_MS);
        (Duration::from_millis(min), Duration::from_millis(max.max(min)))
    }

    pub fn ai_base_url(&self) -> String {
        self.ai
            .as_ref()
            .and_then(|a| a.base_url.clone())
            .unwrap_or_else(|| DEFAULT_AI_BASE_URL.to_string())
    }

    pub fn ai_model(&self) -> String {
        self.ai
            .as_ref()
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| DEFAULT_AI_MODEL.to_string())
    }

    pub fn ai_api_key(&self) -> Option<String> {
        self.ai.as_ref().and_then(|a| a.resolve_api_key())
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(
            self.ai
                .as_ref()
                .and_then(|a| a.timeout_secs)
                .unwrap_or(DEFAULT_AI_TIMEOUT_SECS),
        )
    }

    pub fn ai_temperature(&self) -> f64 {
        self.ai
            .as_ref()
            .and_then(|a| a.temperature)
            .unwrap_or(DEFAULT_AI_TEMPERATURE)
    }

    pub fn ai_max_tokens(&self) -> u32 {
        self.ai
            .as_ref()
            .and_then(|a| a.max_tokens)
            .unwrap_or(DEFAULT_AI_MAX_TOKENS)
    }

    pub fn ai_max_response_bytes(&self) -> usize {
        self.ai
            .as_ref()
            .and_then(|a| a.max_response_bytes)
            .unwrap_or(DEFAULT_AI_MAX_RESPONSE_BYTES)
    }

    pub fn ai_max_concurrent(&self) -> usize {
        self.ai
            .as_ref()
            .and_then(|a| a.max_concurrent)
            .unwrap_or(DEFAULT_AI_MAX_CONCURRENT)
    }

    pub fn snapshot_max_shapes(&self) -> usize {
        self.ai
            .as_ref()
            .and_then(|a| a.snapshot_max_shapes)
            .unwrap_or(DEFAULT_SNAPSHOT_MAX_SHAPES)
    }

    pub fn commands_per_minute(&self) -> u32 {
        self.ai
            .as_ref()
            .and_then(|a| a.commands_per_minute)
            .unwrap_or(DEFAULT_COMMANDS_PER_MINUTE)
    }

    /// Find a configured user by id.
    pub fn user(&self, user_id: &str) -> Option<&UserCredential> {
        self.auth
            .as_ref()
            .and_then(|a| a.users.iter().find(|u| u.user_id == user_id))
    }

    /// Get a config value by dotted path (e.g. "sync.presence_ttl_ms").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.ai_api_key().is_none() {
            warnings.push("AI has no API key configured; commands will fail".to_string());
        }

        let temperature = self.ai_temperature();
        if !(0.0..=2.0).contains(&temperature) {
            errors.push(format!("AI temperature must be within 0.0..=2.0, got {temperature}"));
        }

        if self.ai_max_concurrent() == 0 {
            errors.push("AI max_concurrent cannot be 0".to_string());
        }

        if self.heartbeat_interval().is_zero() {
            errors.push("Heartbeat interval cannot be 0".to_string());
        }

        if self.presence_ttl_ms() <= self.heartbeat_interval().as_millis() as i64 {
            warnings.push(
                "Presence TTL is not longer than the heartbeat interval; collaborators will flicker"
                    .to_string(),
            );
        }

        if let Some(auth) = &self.auth {
            for user in &auth.users {
                if user.resolve_token().is_none() {
                    warnings.push(format!("User '{}' has no token configured", user.user_id));
                }
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for shapeshare data: `~/.shapeshare/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shapeshare")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SS_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_SS_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_SS_KEY") };
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(2_000));
        assert_eq!(config.cursor_throttle(), Duration::from_millis(100));
        assert_eq!(config.presence_ttl_ms(), 30_000);
        assert_eq!(config.ai_timeout(), Duration::from_secs(30));
        assert_eq!(config.ai_temperature(), 0.7);
        assert_eq!(config.ai_max_concurrent(), 5);
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                sync: { presence_ttl_ms: 10000 },
                ai: { model: "gpt-4o", max_concurrent: 2 },
                logging: { format: "json" },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.presence_ttl_ms(), 10_000);
        assert_eq!(config.ai_model(), "gpt-4o");
        assert_eq!(config.ai_max_concurrent(), 2);
        assert_eq!(config.logging.unwrap().format, "json");
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/shapeshare/config.json")).unwrap();
        assert!(config.ai.is_none());
    }

    #[test]
    fn test_reconnect_backoff_max_not_below_min() {
        let config = Config {
            sync: Some(SyncConfig {
                reconnect_min_ms: Some(1_000),
                reconnect_max_ms: Some(10),
                ..SyncConfig::default()
            }),
            ..Config::default()
        };
        let (min, max) = config.reconnect_backoff();
        assert_eq!(min, Duration::from_millis(1_000));
        assert_eq!(max, Duration::from_millis(1_000));
    }

    #[test]
    fn test_user_token_resolution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_SS_USER_TOKEN", "from-env") };
        let user = UserCredential {
            user_id: "alice".into(),
            display_name: None,
            token: None,
            token_env: Some("TEST_SS_USER_TOKEN".into()),
        };
        assert_eq!(user.resolve_token(), Some("from-env".into()));
        unsafe { std::env::remove_var("TEST_SS_USER_TOKEN") };
    }

    #[test]
    fn test_validate_flags_bad_temperature() {
        let config = Config {
            ai: Some(AiConfig {
                temperature: Some(3.5),
                api_key: Some("sk".into()),
                ..AiConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("temperature")), "{errors:?}");
    }

    #[test]
    fn test_validate_warns_missing_api_key() {
        let (warnings, errors) = Config::default().validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("API key")), "{warnings:?}");
    }

    #[test]
    fn test_get_path() {
        let config = Config {
            ai: Some(AiConfig {
                model: Some("m1".into()),
                ..AiConfig::default()
            }),
            ..Config::default()
        };
        assert_eq!(config.get_path("ai.model"), Some(serde_json::json!("m1")));
        assert!(config.get_path("sync.heartbeat_interval_ms").is_none());
    }
}
