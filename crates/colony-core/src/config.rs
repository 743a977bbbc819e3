//! Typed `COLONY_*` environment variable readers shared by every crate's config

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

pub fn get_env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn get_env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match get_env_string(key) {
        Some(val) => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!(
                    "invalid boolean value '{val}', expected true/false/1/0/yes/no/on/off"
                ),
            }),
        },
        None => Ok(None),
    }
}

/// Parse any `FromStr` value (integers, socket addresses, ids)
pub fn get_env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get_env_string(key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid value '{val}': {e}"),
            }),
        None => Ok(None),
    }
}

pub fn get_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    get_env_parse(key)
}

pub fn get_env_usize(key: &str) -> Result<Option<usize>, ConfigError> {
    get_env_parse(key)
}

/// Human-readable duration such as `500ms`, `2s` or `1m 30s`
pub fn get_env_duration(key: &str) -> Result<Option<Duration>, ConfigError> {
    match get_env_string(key) {
        Some(val) => humantime::parse_duration(val.trim())
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                message: format!("invalid duration '{val}': {e}"),
            }),
        None => Ok(None),
    }
}
