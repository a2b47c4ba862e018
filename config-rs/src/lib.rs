//! config-rs/lib.rs
//! Shared configuration utilities for the QCI training workspace.
//! Provides typed environment lookups with logged fallbacks, so every crate
//! reads its settings the same way.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Load a `.env` file from the working directory if one exists.
///
/// Missing files are not an error; the process environment is used as-is.
pub fn load_dotenv() {
    match dotenv::dotenv() {
        Ok(path) => log::debug!("Loaded environment from {}", path.display()),
        Err(err) if err.not_found() => log::debug!("No .env file found, using process environment"),
        Err(err) => log::warn!("Failed to read .env file: {}", err),
    }
}

/// Parse a raw configuration value, falling back to `default` when the value
/// is absent or cannot be parsed.
///
/// # Arguments
/// * `name` - The variable name, used for the warning message
/// * `raw` - The raw value, if one was set
/// * `default` - The value to use when `raw` is missing or invalid
pub fn parse_or<T>(name: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match raw {
        Some(value) => match value.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                log::warn!("Invalid value {:?} in {}, using default {}", value, name, default);
                default
            }
        },
        None => default,
    }
}

/// Interpret a raw value as a boolean flag.
///
/// Accepts "1", "true", "yes", "on" and "0", "false", "no", "off"
/// (case-insensitive). Anything else yields `default`.
pub fn parse_flag(name: &str, raw: Option<String>, default: bool) -> bool {
    let Some(value) = raw else {
        return default;
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        other => {
            log::warn!("Invalid boolean {:?} in {}, using default {}", other, name, default);
            default
        }
    }
}

/// Get a typed value from the environment with a default.
pub fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    parse_or(name, env::var(name).ok(), default)
}

/// Get a millisecond duration from the environment with a default.
pub fn env_duration_ms(name: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_or(name, default_ms))
}

/// Get an optional, non-empty string from the environment.
pub fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
