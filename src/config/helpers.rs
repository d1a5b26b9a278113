//! Typed environment variable parsing.

use std::str::FromStr;

use crate::error::ConfigError;

/// Reads an env var, returning `None` when unset or empty.
pub(crate) fn optional_env(var: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode(var.to_string())),
    }
}

/// Reads a string env var with a default.
pub(crate) fn parse_string_env(var: &str, default: &str) -> Result<String, ConfigError> {
    Ok(optional_env(var)?.unwrap_or_else(|| default.to_string()))
}

/// Reads and parses an env var with a default for unset values.
pub(crate) fn parse_optional_env<T>(var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(var)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: var.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Reads a boolean env var accepting `true/false/1/0/yes/no`.
#[allow(dead_code)]
pub(crate) fn parse_bool_env(var: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(var)? {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::Invalid {
                var: var.to_string(),
                reason: format!("expected a boolean, got '{}'", other),
            }),
        },
        None => Ok(default),
    }
}
