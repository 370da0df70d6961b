//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated, `*` for any)
    pub client_origin: String,

    /// Base URL of the web application's store API. `None` keeps records in memory.
    pub store_url: Option<String>,
    /// Service key sent with every store request
    pub store_api_key: Option<String>,

    /// HS256 secret of the web application's tokens. `None` trusts the claimed username.
    pub jwt_secret: Option<String>,

    /// Gameplay tunables
    pub game: GameConfig,
}

/// Gameplay tunables shared by every match
#[derive(Clone, Debug)]
pub struct GameConfig {
    /// Points needed to win a match
    pub winning_score: u32,
    /// Initial ball speed per axis (units/second)
    pub ball_speed: f32,
    /// Nominal tick interval
    pub tick_interval: Duration,
    /// Upper bound on a measured tick delta
    pub max_tick_delta: Duration,
    /// Minimum time between score checkpoints
    pub persist_interval: Duration,
    /// How long a launched match waits for its first connection
    pub start_timeout: Duration,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            winning_score: 15,
            ball_speed: 200.0,
            tick_interval: Duration::from_millis(16),
            max_tick_delta: Duration::from_millis(33),
            persist_interval: Duration::from_millis(1000),
            start_timeout: Duration::from_secs(60),
        }
    }
}

impl GameConfig {
    /// Load gameplay tunables, falling back to defaults for unset variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let winning_score: u32 = parse_with(&lookup, "WINNING_SCORE", defaults.winning_score)?;
        if winning_score == 0 {
            return Err(ConfigError::Invalid {
                name: "WINNING_SCORE",
                value: "0".to_string(),
            });
        }

        let ball_speed: f32 = parse_with(&lookup, "BALL_SPEED", defaults.ball_speed)?;
        if !(ball_speed.is_finite() && ball_speed > 0.0) {
            return Err(ConfigError::Invalid {
                name: "BALL_SPEED",
                value: ball_speed.to_string(),
            });
        }

        let millis = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            parse_with(&lookup, name, default).map(Duration::from_millis)
        };

        Ok(Self {
            winning_score,
            ball_speed,
            tick_interval: millis("TICK_MS", 16)?.max(Duration::from_millis(1)),
            max_tick_delta: millis("MAX_TICK_DELTA_MS", 33)?.max(Duration::from_millis(1)),
            persist_interval: millis("PERSIST_INTERVAL_MS", 1000)?,
            start_timeout: Duration::from_secs(
                parse_with(&lookup, "START_TIMEOUT_SECS", defaults.start_timeout.as_secs())?.max(1),
            ),
        })
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_else(|_| "*".to_string()),

            store_url: optional_var("STORE_URL"),
            store_api_key: optional_var("STORE_API_KEY"),

            jwt_secret: optional_var("AUTH_JWT_SECRET"),

            game: GameConfig::from_env()?,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_with<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn game_config(vars: &[(&str, &str)]) -> Result<GameConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GameConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn unset_variables_use_defaults() {
        let config = game_config(&[]).unwrap();
        assert_eq!(config.winning_score, 15);
        assert_eq!(config.ball_speed, 200.0);
        assert_eq!(config.tick_interval, Duration::from_millis(16));
        assert_eq!(config.max_tick_delta, Duration::from_millis(33));
        assert_eq!(config.persist_interval, Duration::from_secs(1));
        assert_eq!(config.start_timeout, Duration::from_secs(60));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = game_config(&[
            ("WINNING_SCORE", " 3 "),
            ("BALL_SPEED", "450.5"),
            ("TICK_MS", "10"),
            ("START_TIMEOUT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.winning_score, 3);
        assert_eq!(config.ball_speed, 450.5);
        assert_eq!(config.tick_interval, Duration::from_millis(10));
        assert_eq!(config.start_timeout, Duration::from_secs(5));
    }

    #[test]
    fn zero_winning_score_is_rejected() {
        let err = game_config(&[("WINNING_SCORE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "WINNING_SCORE", .. }));

        let err = game_config(&[("WINNING_SCORE", "-2")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "WINNING_SCORE", .. }));
    }

    #[test]
    fn non_positive_ball_speed_is_rejected() {
        for raw in ["0", "-10", "NaN", "fast"] {
            let err = game_config(&[("BALL_SPEED", raw)]).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { name: "BALL_SPEED", .. }), "{raw}");
        }
    }

    #[test]
    fn zero_durations_are_raised_to_the_minimum() {
        let config = game_config(&[
            ("TICK_MS", "0"),
            ("MAX_TICK_DELTA_MS", "0"),
            ("START_TIMEOUT_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.tick_interval, Duration::from_millis(1));
        assert_eq!(config.max_tick_delta, Duration::from_millis(1));
        assert_eq!(config.start_timeout, Duration::from_secs(1));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = game_config(&[("TICK_MS", "soon")]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid value for TICK_MS: \"soon\"");
    }
}
