//! Configuration loading and validation.
//!
//! Loads `config.toml` from `$HEARTH_CONFIG` or `~/.hearth/config.toml`.
//! Every field has a default, so an empty file is a valid config.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WhatsApp bridge settings.
    pub whatsapp: WhatsAppConfig,

    /// Pairing (self-service whitelist enrollment) settings.
    pub pairing: PairingConfig,

    /// Connection watchdog and reconnect timing.
    pub connection: ConnectionConfig,

    /// Outbox retry policy.
    pub outbox: OutboxConfig,

    /// Heartbeat task runner settings.
    pub heartbeat: HeartbeatConfig,

    /// LLM backend settings.
    pub assistant: AssistantConfig,

    /// Filesystem locations.
    pub paths: PathsConfig,
}

/// WhatsApp bridge configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Base URL of the bridge sidecar HTTP API.
    pub bridge_url: String,

    /// Docker image used by `hearth link` to run the sidecar.
    pub sidecar_image: String,

    /// Phone numbers whitelisted at startup without pairing.
    pub allowed_users: Vec<String>,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            sidecar_image: "ghcr.io/pycckuu/hearth-whatsapp:latest".to_owned(),
            allowed_users: Vec::new(),
        }
    }
}

/// Pairing guard configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Pairing token. `None` (and no env override) disables pairing.
    pub token: Option<String>,

    /// Failed attempts inside one window before the sender is locked out.
    pub max_failures: u32,

    /// Length of the failure-counting window in seconds.
    pub window_secs: u64,

    /// Lockout duration in seconds.
    pub block_secs: u64,
}

impl std::fmt::Debug for PairingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingConfig")
            .field("token", &self.token.as_ref().map(|_| "__REDACTED__"))
            .field("max_failures", &self.max_failures)
            .field("window_secs", &self.window_secs)
            .field("block_secs", &self.block_secs)
            .finish()
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            token: None,
            max_failures: 5,
            window_secs: 15 * 60,
            block_secs: 15 * 60,
        }
    }
}

/// Connection Manager timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long a connection may sit in `Connecting` before it is torn down.
    pub connecting_timeout_ms: u64,

    /// Delay before reconnecting after a recoverable close.
    pub reconnect_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connecting_timeout_ms: 20_000,
            reconnect_delay_ms: 3_000,
        }
    }
}

impl ConnectionConfig {
    /// Watchdog timeout as a [`Duration`].
    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_millis(self.connecting_timeout_ms)
    }

    /// Reconnect delay as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Outbox retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// First retry delay; doubles on every further failure.
    pub base_delay_ms: u64,

    /// Attempts before a message is dropped.
    pub max_retries: u32,

    /// How often the poller looks for due messages.
    pub poll_interval_secs: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 60_000,
            max_retries: 5,
            poll_interval_secs: 30,
        }
    }
}

/// Heartbeat scheduler settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Whether `hearth start` runs the heartbeat.
    pub enabled: bool,

    /// Minutes between ticks.
    pub interval_minutes: u64,

    /// Consecutive failures that trigger one proactive notification.
    pub notify_after_failures: u32,

    /// Accepted for compatibility; tick cadence does not back off.
    pub base_delay_ms: u64,

    /// Accepted for compatibility; tick cadence does not back off.
    pub max_delay_ms: u64,

    /// Task descriptions handed to the task runner on every tick.
    pub tasks: Vec<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: 30,
            notify_after_failures: 3,
            base_delay_ms: 60_000,
            max_delay_ms: 30 * 60_000,
            tasks: Vec::new(),
        }
    }
}

impl HeartbeatConfig {
    /// Tick period. Clamped to at least one minute.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes.max(1).saturating_mul(60))
    }
}

/// OpenAI-compatible LLM backend settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// API base URL (without `/v1/chat/completions`).
    pub base_url: String,

    /// Model identifier.
    pub model: String,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Conversation turns kept per user.
    pub max_history: usize,

    /// Extra system prompt text.
    pub system_prompt: Option<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            api_key_env: "OPENAI_API_KEY".to_owned(),
            max_history: 20,
            system_prompt: None,
        }
    }
}

/// Filesystem locations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Data directory. Defaults to `~/.hearth`.
    pub data_dir: Option<PathBuf>,
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:3001".to_owned()
}

impl Config {
    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver so tests do not have to mutate the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("HEARTH_BRIDGE_URL") {
            self.whatsapp.bridge_url = v;
        }
        if let Some(v) = env("HEARTH_PAIR_TOKEN") {
            self.pairing.token = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = env("HEARTH_DATA_DIR") {
            self.paths.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("HEARTH_HEARTBEAT_INTERVAL_MINUTES") {
            match v.parse() {
                Ok(n) => self.heartbeat.interval_minutes = n,
                Err(_) => tracing::warn!(
                    var = "HEARTH_HEARTBEAT_INTERVAL_MINUTES",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.whatsapp.bridge_url)
            .with_context(|| format!("invalid whatsapp.bridge_url {:?}", self.whatsapp.bridge_url))?;
        url::Url::parse(&self.assistant.base_url)
            .with_context(|| format!("invalid assistant.base_url {:?}", self.assistant.base_url))?;
        if self.pairing.max_failures == 0 {
            anyhow::bail!("pairing.max_failures must be at least 1");
        }
        if self.outbox.max_retries == 0 {
            anyhow::bail!("outbox.max_retries must be at least 1");
        }
        if self.outbox.poll_interval_secs == 0 {
            anyhow::bail!("outbox.poll_interval_secs must be at least 1");
        }
        if self.heartbeat.notify_after_failures == 0 {
            anyhow::bail!("heartbeat.notify_after_failures must be at least 1");
        }
        Ok(())
    }

    /// Resolved data directory (configured path or `~/.hearth`).
    ///
    /// # Errors
    ///
    /// Returns an error if no path is configured and the home directory is unknown.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match self.paths.data_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => config_dir(),
        }
    }
}

/// Load config from `path`, falling back to defaults when the file is missing,
/// then apply process environment overrides.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            tracing::debug!(path = %path.display(), "loading config from file");
            toml::from_str(&contents)
                .with_context(|| format!("failed to parse config at {}", path.display()))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            ))
        }
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Resolve the config file path: `$HEARTH_CONFIG` or `~/.hearth/config.toml`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_path() -> anyhow::Result<PathBuf> {
    config_path_with(|key| std::env::var(key).ok())
}

fn config_path_with(env: impl Fn(&str) -> Option<String>) -> anyhow::Result<PathBuf> {
    if let Some(p) = env("HEARTH_CONFIG") {
        return Ok(PathBuf::from(p));
    }
    Ok(config_dir()?.join("config.toml"))
}

/// Resolve the default config directory (`~/.hearth/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".hearth"))
}
