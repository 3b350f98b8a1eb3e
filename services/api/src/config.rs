use lingua_core::SessionSettings;
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where live session state is kept.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreBackend {
    Redis(String),
    /// Single-process store, selected with `REDIS_URL=memory://`.
    Memory,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub gemini_api_key: SecretString,
    pub gemini_model: String,
    pub gemini_voice: String,
    pub store: StoreBackend,
    pub supabase_url: String,
    pub supabase_key: SecretString,
    pub scoring_api_key: Option<SecretString>,
    pub scoring_model: String,
    pub scoring_base_url: String,
    pub session_ttl: Duration,
    pub lock_lease: Duration,
    pub max_restarts: u32,
    pub restart_cooldown: Duration,
    pub replay_capacity: usize,
    pub replay_chunk_delay: Duration,
    pub send_sample_rate: u32,
    pub receive_sample_rate: u32,
    pub prompts_dir: PathBuf,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables, reading a `.env` file
    /// first when one is present.
    ///
    /// *   `GEMINI_API_KEY`, `SUPABASE_URL`, `SUPABASE_SERVICE_ROLE_KEY`: required.
    /// *   `SCORING_API_KEY`: optional. Without it user turns are stored unscored.
    /// *   Everything else has a default; see `.env.example`.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingVar(name.to_string()))
        };

        let redis_url = var("REDIS_URL", "redis://127.0.0.1:6379/0");
        let store = if redis_url.starts_with("memory://") {
            StoreBackend::Memory
        } else {
            StoreBackend::Redis(redis_url)
        };

        let log_level_str = var("RUST_LOG", "INFO");
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address: parse(&lookup, "BIND_ADDRESS", "0.0.0.0:8765")?,
            gemini_api_key: SecretString::from(required("GEMINI_API_KEY")?),
            gemini_model: var(
                "GEMINI_MODEL",
                "models/gemini-2.5-flash-native-audio-preview-09-2025",
            ),
            gemini_voice: var("GEMINI_VOICE", "Zephyr"),
            store,
            supabase_url: required("SUPABASE_URL")?,
            supabase_key: SecretString::from(required("SUPABASE_SERVICE_ROLE_KEY")?),
            scoring_api_key: lookup("SCORING_API_KEY")
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            scoring_model: var("SCORING_MODEL", "gpt-4o-mini"),
            scoring_base_url: var("SCORING_BASE_URL", "https://api.openai.com/v1"),
            session_ttl: Duration::from_secs(parse(&lookup, "SESSION_TIMEOUT_SECONDS", "3600")?),
            lock_lease: Duration::from_millis(parse(&lookup, "SESSION_LOCK_LEASE_MS", "10000")?),
            max_restarts: parse(&lookup, "MAX_RESTARTS", "3")?,
            restart_cooldown: Duration::from_millis(parse(&lookup, "RESTART_COOLDOWN_MS", "1000")?),
            replay_capacity: parse(&lookup, "REPLAY_CAPACITY", "10")?,
            replay_chunk_delay: Duration::from_millis(parse(
                &lookup,
                "REPLAY_CHUNK_DELAY_MS",
                "10",
            )?),
            send_sample_rate: parse(&lookup, "SEND_SAMPLE_RATE", "16000")?,
            receive_sample_rate: parse(&lookup, "RECEIVE_SAMPLE_RATE", "24000")?,
            prompts_dir: PathBuf::from(var("PROMPTS_DIR", "prompts")),
            log_level,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            session_ttl: self.session_ttl,
            lock_lease: self.lock_lease,
            max_restarts: self.max_restarts,
            restart_cooldown: self.restart_cooldown,
            replay_capacity: self.replay_capacity,
            replay_chunk_delay: self.replay_chunk_delay,
            receive_sample_rate: self.receive_sample_rate,
        }
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(name).unwrap_or_else(|| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("GEMINI_API_KEY", "g-key"),
        ("SUPABASE_URL", "https://db.example.com"),
        ("SUPABASE_SERVICE_ROLE_KEY", "s-key"),
    ];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let config = Config::from_lookup(env(REQUIRED)).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:8765".parse::<SocketAddr>().unwrap());
        assert_eq!(config.gemini_voice, "Zephyr");
        assert_eq!(
            config.store,
            StoreBackend::Redis("redis://127.0.0.1:6379/0".to_string())
        );
        assert!(config.scoring_api_key.is_none());
        assert_eq!(config.gemini_api_key.expose_secret(), "g-key");

        let settings = config.session_settings();
        assert_eq!(settings.max_restarts, 3);
        assert_eq!(settings.restart_cooldown, Duration::from_secs(1));
        assert_eq!(settings.replay_capacity, 10);
        assert_eq!(settings.session_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("REDIS_URL", "memory://"),
            ("MAX_RESTARTS", "5"),
            ("RESTART_COOLDOWN_MS", "250"),
            ("SCORING_API_KEY", "sk-test"),
            ("RUST_LOG", "debug"),
        ]);
        let config = Config::from_lookup(env(&pairs)).unwrap();

        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.max_restarts, 5);
        assert_eq!(config.restart_cooldown, Duration::from_millis(250));
        assert!(config.scoring_api_key.is_some());
        assert_eq!(config.log_level, Level::DEBUG);
    }

    #[test]
    fn missing_required_var_is_reported() {
        let result = Config::from_lookup(env(&REQUIRED[1..]));
        assert!(matches!(result, Err(ConfigError::MissingVar(name)) if name == "GEMINI_API_KEY"));
    }

    #[test]
    fn malformed_number_is_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("REPLAY_CAPACITY", "ten"));
        let result = Config::from_lookup(env(&pairs));
        assert!(matches!(result, Err(ConfigError::InvalidValue(name, _)) if name == "REPLAY_CAPACITY"));
    }
}
