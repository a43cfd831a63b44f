//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_server(config)?;
    validate_extensions(config)?;
    validate_database(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_server(config: &Config) -> ConfigResult<()> {
    config
        .server
        .socket_addr()
        .map(|_| ())
        .map_err(|e| invalid("server.bind", format!("'{}' is not a socket address: {e}", config.server.bind)))
}

fn validate_extensions(config: &Config) -> ConfigResult<()> {
    let ext = &config.extensions;
    if ext.load_timeout_ms == 0 {
        return Err(invalid("extensions.load_timeout_ms", "must be greater than zero"));
    }
    if ext.handler_timeout_ms == 0 {
        return Err(invalid("extensions.handler_timeout_ms", "must be greater than zero"));
    }
    if ext.memory_limit_bytes == 0 {
        return Err(invalid("extensions.memory_limit_bytes", "must be greater than zero"));
    }
    if !ext.static_prefix.starts_with('/') {
        return Err(invalid(
            "extensions.static_prefix",
            format!("'{}' must start with '/'", ext.static_prefix),
        ));
    }
    Ok(())
}

fn validate_database(config: &Config) -> ConfigResult<()> {
    if config.database.max_connections == 0 {
        return Err(invalid("database.max_connections", "must be greater than zero"));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let level = config.logging.level.to_ascii_lowercase();
    if !matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
        return Err(invalid(
            "logging.level",
            format!("unknown level '{}'", config.logging.level),
        ));
    }
    if !matches!(
        config.logging.format.as_str(),
        "pretty" | "compact" | "text" | "json"
    ) {
        return Err(invalid(
            "logging.format",
            format!("unknown format '{}'", config.logging.format),
        ));
    }
    Ok(())
}
