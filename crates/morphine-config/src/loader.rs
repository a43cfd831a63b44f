//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `~/.morphine/config.toml` (user)
//! 3. Merge the explicit file passed on the command line
//! 4. Apply `MORPHINE_*` env vars to fields no file has set
//! 5. Deserialize merged tree → `Config`
//! 6. Validate

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Environment variables consulted as fallbacks, with the field they fill.
const ENV_FALLBACKS: &[(&str, &str)] = &[
    ("MORPHINE_BIND", "server.bind"),
    ("MORPHINE_EXTENSIONS_DIR", "extensions.dir"),
    ("MORPHINE_DATABASE_URL", "database.url"),
    ("DATABASE_URL", "database.url"),
    ("MORPHINE_LOG_LEVEL", "logging.level"),
    ("MORPHINE_LOG_FORMAT", "logging.format"),
];

/// A loaded configuration plus the files it came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final, validated configuration.
    pub config: Config,
    /// Files merged on top of the embedded defaults, in order.
    pub loaded_files: Vec<PathBuf>,
}

/// Load the layered configuration using the process environment.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed or the final
/// configuration fails validation.
pub fn load(explicit: Option<&Path>, home_override: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let env_vars: HashMap<String, String> = std::env::vars().collect();
    load_with_env(explicit, home_override, &env_vars)
}

/// Load the layered configuration against a given environment map.
///
/// `home_override` is treated as the `.morphine` directory itself.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, an explicit file
/// is missing, or the final configuration fails validation.
pub fn load_with_env(
    explicit: Option<&Path>,
    home_override: Option<&Path>,
    env_vars: &HashMap<String, String>,
) -> ConfigResult<ResolvedConfig> {
    // 1. Embedded defaults.
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut set_by_files = HashSet::new();
    let mut loaded_files = Vec::new();

    // 2. User config.
    let user_path = match home_override {
        Some(dir) => Some(dir.join("config.toml")),
        None => user_config_path(),
    };
    if let Some(path) = user_path
        && let Some(overlay) = try_load_file(&path)?
    {
        deep_merge_tracking(&mut merged, &overlay, "", &mut set_by_files);
        info!(path = %path.display(), "loaded user config");
        loaded_files.push(path);
    }

    // 3. Explicit file; unlike the user layer it must exist.
    if let Some(path) = explicit {
        let overlay = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
            path: path.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        deep_merge_tracking(&mut merged, &overlay, "", &mut set_by_files);
        info!(path = %path.display(), "loaded config file");
        loaded_files.push(path.to_path_buf());
    }

    // 4. Env fallbacks.
    let applied = apply_env_fallbacks(&mut merged, &set_by_files, env_vars);
    if applied > 0 {
        debug!(count = applied, "applied environment variable fallbacks");
    }

    // 5. Deserialize.
    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    // 6. Validate.
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        loaded_files,
    })
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let value = try_load_file(path)?.ok_or_else(|| ConfigError::ReadError {
        path: path.display().to_string(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    })?;
    let config: Config = value
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::ParseError {
            path: path.display().to_string(),
            source: e,
        })?;
    validate::validate(&config)?;
    Ok(config)
}

/// Try to load a file, returning `None` if the file doesn't exist.
///
/// Uses a single read operation; the size check happens on the content.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

fn user_config_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().join(".morphine").join("config.toml"))
}

/// Deep-merge `overlay` into `base`, recording every leaf path the overlay set.
///
/// Tables merge recursively; scalars and arrays replace.
fn deep_merge_tracking(
    base: &mut toml::Value,
    overlay: &toml::Value,
    prefix: &str,
    set_paths: &mut HashSet<String>,
) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if let Some(base_val) = base_table.get_mut(key) {
                    deep_merge_tracking(base_val, overlay_val, &path, set_paths);
                } else {
                    base_table.insert(key.clone(), overlay_val.clone());
                    record_leaves(overlay_val, &path, set_paths);
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
            set_paths.insert(prefix.to_owned());
        },
    }
}

fn record_leaves(val: &toml::Value, prefix: &str, set_paths: &mut HashSet<String>) {
    if let toml::Value::Table(table) = val {
        for (key, child) in table {
            record_leaves(child, &format!("{prefix}.{key}"), set_paths);
        }
    } else {
        set_paths.insert(prefix.to_owned());
    }
}

/// Fill fields from env vars where no file set them. Returns how many applied.
fn apply_env_fallbacks(
    merged: &mut toml::Value,
    set_by_files: &HashSet<String>,
    env_vars: &HashMap<String, String>,
) -> usize {
    let mut applied = HashSet::new();
    for (var, field) in ENV_FALLBACKS {
        if set_by_files.contains(*field) || applied.contains(*field) {
            continue;
        }
        let Some(value) = env_vars.get(*var).filter(|v| !v.is_empty()) else {
            continue;
        };
        let Some((section, key)) = field.split_once('.') else {
            continue;
        };
        if let Some(table) = merged.as_table_mut() {
            let section_table = table
                .entry(section.to_owned())
                .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
            if let Some(section_table) = section_table.as_table_mut() {
                section_table.insert(key.to_owned(), toml::Value::String(value.clone()));
                applied.insert(*field);
            }
        }
    }
    applied.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn test_defaults_deserialize_to_config() {
        let config: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_without_files() {
        let home = tempfile::tempdir().unwrap();
        let resolved = load_with_env(None, Some(home.path()), &no_env()).unwrap();
        assert!(resolved.loaded_files.is_empty());
        assert_eq!(resolved.config, Config::default());
    }

    #[test]
    fn test_explicit_file_overrides_user_file() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[server]\nbind = \"0.0.0.0:8080\"\n[extensions]\nload_timeout_ms = 500\n",
        )
        .unwrap();
        let explicit = home.path().join("explicit.toml");
        std::fs::write(&explicit, "[server]\nbind = \"0.0.0.0:9090\"\n").unwrap();

        let resolved = load_with_env(Some(&explicit), Some(home.path()), &no_env()).unwrap();
        assert_eq!(resolved.config.server.bind, "0.0.0.0:9090");
        assert_eq!(resolved.config.extensions.load_timeout_ms, 500);
        assert_eq!(resolved.loaded_files.len(), 2);
    }

    #[test]
    fn test_env_fallback_only_fills_unset_fields() {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[server]\nbind = \"0.0.0.0:8080\"\n",
        )
        .unwrap();
        let env: HashMap<String, String> = [
            ("MORPHINE_BIND".to_owned(), "0.0.0.0:1".to_owned()),
            ("MORPHINE_DATABASE_URL".to_owned(), "sqlite::memory:".to_owned()),
            ("DATABASE_URL".to_owned(), "mysql://ignored".to_owned()),
        ]
        .into_iter()
        .collect();

        let resolved = load_with_env(None, Some(home.path()), &env).unwrap();
        assert_eq!(resolved.config.server.bind, "0.0.0.0:8080");
        assert_eq!(
            resolved.config.database.url.as_deref(),
            Some("sqlite::memory:")
        );
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let home = tempfile::tempdir().unwrap();
        let result = load_with_env(
            Some(Path::new("/nonexistent/morphine.toml")),
            Some(home.path()),
            &no_env(),
        );
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_try_load_file_missing() {
        let result = try_load_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_oversized_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("huge.toml");
        let data = "x = \"".to_owned() + &"a".repeat(1_100_000) + "\"";
        std::fs::write(&file_path, data).unwrap();

        let result = try_load_file(&file_path);
        assert!(
            matches!(result, Err(ConfigError::ValidationError { .. })),
            "Expected ValidationError for oversized config, got: {result:?}"
        );
    }

    #[test]
    fn test_invalid_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("bad.toml");
        std::fs::write(&file_path, "[extensions]\nload_timeout_ms = 0\n").unwrap();
        assert!(matches!(
            load_file(&file_path),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}
