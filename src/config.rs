//! Process configuration, read once from the environment at startup and
//! passed to component constructors as an immutable value.

use std::env;
use std::path::PathBuf;

/// Error raised when a required environment variable is absent.
#[derive(Debug, thiserror::Error)]
#[error("set the `{0}` environment variable")]
pub struct MissingVar(pub &'static str);

/// Everything the daemons need to know about their environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identifier of this device in the fleet.
    pub device_id: String,

    /// Base URL of the remote control service.
    pub app_url: String,

    /// Pre-shared key used to sign requests to the control service.
    pub api_key: String,

    /// Directory that downloaded tracks are cached in.
    pub download_dir: PathBuf,

    /// Logical name of the media backend to load (`rodio` or `dummy`).
    pub media_backend: String,

    /// Address of the redis instance backing the bus.
    pub redis_url: String,

    /// Pub/sub channel the scheduler listens on.
    pub scheduler_channel: String,

    /// Pub/sub channel the player listens on.
    pub player_channel: String,

    /// Whether debug logging is enabled.
    pub debug: bool,
}

impl Config {
    /// Builds the configuration from the process environment.
    pub fn from_env() -> Result<Self, MissingVar> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MissingVar> {
        let required =
            |name: &'static str| lookup(name).filter(|v| !v.is_empty()).ok_or(MissingVar(name));
        let optional = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_owned())
        };

        Ok(Self {
            device_id: required("DEVICE_ID")?,
            app_url: required("APP_URL")?,
            api_key: required("API_KEY")?,
            download_dir: PathBuf::from(required("DOWNLOAD_DIR")?),
            media_backend: optional("MEDIA_BACKEND", "rodio"),
            redis_url: optional("REDIS_URL", "redis://redis:6379"),
            scheduler_channel: optional("SCHEDULER_REDIS_CHANNEL", "SCHEDULER_REDIS_CHANNEL"),
            player_channel: optional("PLAYER_REDIS_CHANNEL", "PLAYER_REDIS_CHANNEL"),
            debug: lookup("DEBUG").is_some_and(|v| !matches!(v.as_str(), "" | "0" | "false")),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::Config;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn full() -> HashMap<String, String> {
        vars(&[
            ("DEVICE_ID", "dev-1"),
            ("APP_URL", "http://control.example"),
            ("API_KEY", "secret"),
            ("DOWNLOAD_DIR", "/tmp/tracks"),
        ])
    }

    #[test]
    fn defaults_are_applied() {
        let env = full();
        let config = Config::from_lookup(|name| env.get(name).cloned()).unwrap();

        assert_eq!(config.media_backend, "rodio");
        assert_eq!(config.redis_url, "redis://redis:6379");
        assert_eq!(config.scheduler_channel, "SCHEDULER_REDIS_CHANNEL");
        assert_eq!(config.player_channel, "PLAYER_REDIS_CHANNEL");
        assert!(!config.debug);
    }

    #[test]
    fn missing_required_variable_is_an_error() {
        let mut env = full();
        env.remove("API_KEY");

        let err = Config::from_lookup(|name| env.get(name).cloned()).unwrap_err();
        assert_eq!(err.0, "API_KEY");
    }

    #[test]
    fn debug_flag_is_parsed() {
        for (value, expected) in [("1", true), ("true", true), ("0", false), ("false", false)] {
            let mut env = full();
            env.insert("DEBUG".to_owned(), value.to_owned());
            let config = Config::from_lookup(|name| env.get(name).cloned()).unwrap();
            assert_eq!(config.debug, expected, "DEBUG={value}");
        }
    }
}
