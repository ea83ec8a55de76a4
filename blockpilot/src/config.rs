use std::env;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::reference_cache::RefreshSchedule;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:5000";

pub const ENV_SERVER_URL: &str = "BLOCKPILOT_SERVER_URL";
pub const ENV_FAILSAFE: &str = "BLOCKPILOT_FAILSAFE";
pub const ENV_IMAGE_REFRESH_SECS: &str = "BLOCKPILOT_IMAGE_REFRESH_SECS";
pub const ENV_GRAPH_DEBOUNCE_MS: &str = "BLOCKPILOT_GRAPH_DEBOUNCE_MS";

/// Runtime settings shared by the library and the command line tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server_url: String,
    /// Corner failsafe requested from the remote side before each run.
    pub failsafe: bool,
    pub image_refresh_interval: Duration,
    pub graph_refresh_debounce: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let schedule = RefreshSchedule::default();
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            failsafe: true,
            image_refresh_interval: schedule.interval,
            graph_refresh_debounce: schedule.debounce,
        }
    }
}

impl Config {
    /// Defaults overridden by any `BLOCKPILOT_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_SERVER_URL).filter(|v| !v.trim().is_empty()) {
            config.server_url = url.trim().to_string();
        }
        if let Some(value) = lookup(ENV_FAILSAFE) {
            config.failsafe = parse_bool(ENV_FAILSAFE, &value)?;
        }
        if let Some(value) = lookup(ENV_IMAGE_REFRESH_SECS) {
            config.image_refresh_interval =
                Duration::from_secs(parse_positive(ENV_IMAGE_REFRESH_SECS, &value)?);
        }
        if let Some(value) = lookup(ENV_GRAPH_DEBOUNCE_MS) {
            config.graph_refresh_debounce =
                Duration::from_millis(parse_u64(ENV_GRAPH_DEBOUNCE_MS, &value)?);
        }

        Ok(config)
    }

    pub fn refresh_schedule(&self) -> RefreshSchedule {
        RefreshSchedule {
            interval: self.image_refresh_interval,
            debounce: self.graph_refresh_debounce,
        }
    }
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value, "a boolean")),
    }
}

fn parse_u64(var: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(var, value, "a whole number"))
}

// Zero would make the refresh interval panic.
fn parse_positive(var: &str, value: &str) -> Result<u64, ConfigError> {
    match parse_u64(var, value)? {
        0 => Err(invalid(var, value, "a positive number")),
        n => Ok(n),
    }
}

fn invalid(var: &str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError {
        var: var.to_string(),
        value: value.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server_url, "http://127.0.0.1:5000");
        assert!(config.failsafe);
        assert_eq!(config.image_refresh_interval, Duration::from_secs(30));
        assert_eq!(config.graph_refresh_debounce, Duration::from_millis(100));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            (ENV_SERVER_URL, "http://10.0.0.5:5000"),
            (ENV_FAILSAFE, "off"),
            (ENV_IMAGE_REFRESH_SECS, "5"),
            (ENV_GRAPH_DEBOUNCE_MS, "250"),
        ]))
        .unwrap();
        assert_eq!(config.server_url, "http://10.0.0.5:5000");
        assert!(!config.failsafe);
        assert_eq!(
            config.refresh_schedule(),
            RefreshSchedule {
                interval: Duration::from_secs(5),
                debounce: Duration::from_millis(250),
            }
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[(ENV_FAILSAFE, "maybe")])).unwrap_err();
        assert_eq!(err.var, ENV_FAILSAFE);
        assert!(Config::from_lookup(lookup(&[(ENV_IMAGE_REFRESH_SECS, "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[(ENV_GRAPH_DEBOUNCE_MS, "-1")])).is_err());
    }
}
