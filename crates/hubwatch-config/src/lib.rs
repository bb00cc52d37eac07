//! Shared configuration for the hubwatch CLI.
//!
//! TOML profiles, access token resolution (env + keyring + plaintext),
//! engine tuning with human-readable durations, and translation to
//! `hubwatch_core::HubConfig`. The CLI layers its global flags on top.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use hubwatch_core::{
    ClientConfig, EvictionPolicy, ExecutorConfig, HubConfig, ReconnectConfig, SupervisorConfig,
    TrackerConfig,
};

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "HUBWATCH_CONFIG";

const KEYRING_SERVICE: &str = "hubwatch";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no access token configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("profile '{profile}' not found in config")]
    UnknownProfile { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named on the command line.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    /// Engine tuning shared by every profile.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Named hub profiles.
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            engine: EngineSettings::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, falling back to `default_profile`.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default");
        self.profiles
            .get(name)
            .map(|profile| (name, profile))
            .ok_or_else(|| ConfigError::UnknownProfile {
                profile: name.into(),
            })
    }
}

/// Output preferences applied when `--output` / `--color` are not given.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_color() -> String {
    "auto".into()
}

/// A named hub profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// WebSocket endpoint (e.g., "ws://homeassistant.local:8123/api/websocket").
    pub url: String,

    /// Access token (plaintext; prefer keyring or env var).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Environment variable name containing the access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

/// Engine tuning. Durations accept `"500ms"`, `"30s"`, `"5m"` or a
/// plain number of seconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Verification deadline for commands that don't set one.
    #[serde(with = "duration")]
    pub operation_timeout: Duration,
    #[serde(with = "duration")]
    pub command_timeout: Duration,
    #[serde(with = "duration")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration")]
    pub health_check_interval: Duration,
    #[serde(with = "duration")]
    pub ping_timeout: Duration,
    #[serde(with = "duration")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration")]
    pub backoff_min: Duration,
    #[serde(with = "duration")]
    pub backoff_max: Duration,
    /// How long finished operations stay queryable.
    #[serde(with = "duration")]
    pub retention: Duration,
    pub max_operations: usize,
    pub bulk_concurrency: usize,
    pub eviction: EvictionPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let client = ClientConfig::default();
        let tracker = TrackerConfig::default();
        let supervisor = SupervisorConfig::default();
        let executor = ExecutorConfig::default();
        Self {
            operation_timeout: executor.default_operation_timeout,
            command_timeout: executor.command_timeout,
            handshake_timeout: client.handshake_timeout,
            health_check_interval: supervisor.health_check_interval,
            ping_timeout: supervisor.ping_timeout,
            cleanup_interval: supervisor.cleanup_interval,
            backoff_min: supervisor.reconnect.initial_delay,
            backoff_max: supervisor.reconnect.max_delay,
            retention: tracker.retention,
            max_operations: tracker.max_operations,
            bulk_concurrency: executor.bulk_concurrency,
            eviction: tracker.eviction,
        }
    }
}

impl EngineSettings {
    /// Overwrite every tuning knob of `config` with these settings.
    pub fn apply(&self, config: &mut HubConfig) {
        config.client = ClientConfig {
            handshake_timeout: self.handshake_timeout,
            request_timeout: self.command_timeout,
        };
        config.tracker = TrackerConfig {
            max_operations: self.max_operations,
            retention: self.retention,
            eviction: self.eviction,
        };
        config.supervisor = SupervisorConfig {
            health_check_interval: self.health_check_interval,
            ping_timeout: self.ping_timeout,
            cleanup_interval: self.cleanup_interval,
            reconnect: ReconnectConfig {
                initial_delay: self.backoff_min,
                max_delay: self.backoff_max,
            },
        };
        config.executor = ExecutorConfig {
            command_timeout: self.command_timeout,
            default_operation_timeout: self.operation_timeout,
            bulk_concurrency: self.bulk_concurrency,
        };
    }
}

/// `humantime` strings in TOML, with bare integers read as seconds.
mod duration {
    use std::fmt;
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        deserializer.deserialize_any(DurationVisitor)
    }

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a duration such as \"30s\" or a number of seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            humantime::parse_duration(v).map_err(|e| E::custom(format!("'{v}': {e}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must not be negative"))
        }
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path: `HUBWATCH_CONFIG`, then platform
/// conventions.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    ProjectDirs::from("dev", "hubwatch", "hubwatch").map_or_else(
        || dirs_fallback().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("hubwatch");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` merged with `HUBWATCH_*` variables.
///
/// Nested keys use a double underscore: `HUBWATCH_ENGINE__MAX_OPERATIONS`.
/// Variables consumed directly by the CLI flags are ignored here.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(
            Env::prefixed("HUBWATCH_")
                .ignore(&["config", "url", "token", "profile", "output"])
                .split("__"),
        );

    let config: Config = figment.extract()?;
    Ok(config)
}


// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Token resolution (without CLI flags) ────────────────────────────

fn keyring_entry(profile_name: &str) -> Result<keyring::Entry, ConfigError> {
    Ok(keyring::Entry::new(KEYRING_SERVICE, &format!("{profile_name}/token"))?)
}

/// Resolve the access token from the credential chain (no CLI flag step).
pub fn resolve_token(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    // 1. Profile's token_env → env var lookup
    if let Some(ref env_name) = profile.token_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring_entry(profile_name) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    if let Some(ref token) = profile.token {
        return Ok(SecretString::from(token.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Save a profile's access token in the system keyring.
pub fn store_token(profile_name: &str, token: &str) -> Result<(), ConfigError> {
    keyring_entry(profile_name)?.set_password(token)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Parse and check a hub URL.
pub fn parse_hub_url(raw: &str) -> Result<url::Url, ConfigError> {
    let url: url::Url = raw.parse().map_err(|e| ConfigError::Validation {
        field: "url".into(),
        reason: format!("invalid URL '{raw}': {e}"),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(ConfigError::Validation {
            field: "url".into(),
            reason: format!("expected a ws:// or wss:// URL, got '{raw}'"),
        });
    }
    Ok(url)
}

/// Build a `HubConfig` from explicit parts and the engine settings.
pub fn to_hub_config(url: url::Url, token: SecretString, engine: &EngineSettings) -> HubConfig {
    let mut config = HubConfig::new(url, token);
    engine.apply(&mut config);
    config
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;

    fn write(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn profile(url: &str) -> Profile {
        Profile {
            url: url.into(),
            token: None,
            token_env: None,
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.defaults.output, "table");
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn parses_profiles_and_human_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            r#"
default_profile = "home"

[engine]
operation_timeout = "45s"
retention = "10m"
backoff_min = "250ms"
cleanup_interval = 5
max_operations = 64
eviction = "reject-new"

[profiles.home]
url = "ws://homeassistant.local:8123/api/websocket"
token_env = "HOME_HUB_TOKEN"
"#,
        );

        let config = load_config_from(&path).unwrap();
        let engine = &config.engine;
        assert_eq!(engine.operation_timeout, Duration::from_secs(45));
        assert_eq!(engine.retention, Duration::from_secs(600));
        assert_eq!(engine.backoff_min, Duration::from_millis(250));
        assert_eq!(engine.cleanup_interval, Duration::from_secs(5));
        assert_eq!(engine.max_operations, 64);
        assert_eq!(engine.eviction, EvictionPolicy::RejectNew);
        // Unset keys keep their defaults.
        assert_eq!(engine.ping_timeout, EngineSettings::default().ping_timeout);

        let (name, home) = config.profile(None).unwrap();
        assert_eq!(name, "home");
        assert_eq!(home.token_env.as_deref(), Some("HOME_HUB_TOKEN"));
    }

    #[test]
    fn bad_duration_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "[engine]\nping_timeout = \"soon\"\n");
        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("soon"), "{err}");
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let config = Config::default();
        assert!(matches!(
            config.profile(Some("garage")),
            Err(ConfigError::UnknownProfile { ref profile }) if profile == "garage"
        ));
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.engine.command_timeout = Duration::from_millis(1500);
        config
            .profiles
            .insert("default".into(), profile("wss://hub.example.com/api/websocket"));
        save_config_to(&config, &path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("command_timeout = \"1s 500ms\""), "{written}");
        assert_eq!(load_config_from(&path).unwrap(), config);
    }

    #[test]
    fn token_env_wins_over_plaintext() {
        // Any variable the test process is guaranteed to inherit will do.
        let expected = std::env::var("PATH").unwrap();
        let mut p = profile("ws://hub.local/api/websocket");
        p.token_env = Some("PATH".into());
        p.token = Some("from-file".into());

        let token = resolve_token(&p, "token-env-test").unwrap();
        assert_eq!(token.expose_secret(), expected);
    }

    #[test]
    fn plaintext_token_is_the_last_resort() {
        let mut p = profile("ws://hub.local/api/websocket");
        p.token_env = Some("HUBWATCH_TEST_TOKEN_NEVER_SET".into());
        p.token = Some("from-file".into());
        // No keyring entry exists for this profile name.
        let token = resolve_token(&p, "plaintext-test-profile-without-keyring").unwrap();
        assert_eq!(token.expose_secret(), "from-file");
    }

    #[test]
    fn missing_token_is_no_credentials() {
        let p = profile("ws://hub.local/api/websocket");
        assert!(matches!(
            resolve_token(&p, "no-token-test-profile"),
            Err(ConfigError::NoCredentials { .. })
        ));
    }

    #[test]
    fn http_urls_are_rejected() {
        let err = parse_hub_url("http://hub.local:8123").unwrap_err();
        assert!(err.to_string().contains("ws://"));
        assert!(parse_hub_url("not a url").is_err());
    }

    #[test]
    fn engine_settings_flow_into_hub_config() {
        let engine = EngineSettings {
            operation_timeout: Duration::from_secs(7),
            bulk_concurrency: 3,
            backoff_max: Duration::from_secs(20),
            ..EngineSettings::default()
        };
        let url = parse_hub_url("ws://hub.local/api/websocket").unwrap();
        let config = to_hub_config(url, SecretString::from("t".to_owned()), &engine);

        assert_eq!(config.executor.default_operation_timeout, Duration::from_secs(7));
        assert_eq!(config.executor.bulk_concurrency, 3);
        assert_eq!(config.supervisor.reconnect.max_delay, Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }
}
