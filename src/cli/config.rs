//! Command-line interface configuration
//!
//! The updater is configured through an optional TOML file, `updater.toml` in
//! the working directory unless another path is given:
//!
//! ```toml
//! run_async = false
//!
//! [layout]
//! fs_start = 0xEB000
//! fs_end = 0xFB000
//! atomic_fs = true
//!
//! [stream]
//! timeout_ms = 60000
//! ```

use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};

use crate::{config::UpdaterConfig, error::ConfigError};

/// File read when no configuration path is given
pub const DEFAULT_CONFIG_FILE: &str = "updater.toml";

const TOP_LEVEL_KEYS: &[&str] = &["buffer_size", "fallback_buffer_size", "run_async"];
const SECTIONS: &[(&str, &[&str])] = &[
    (
        "layout",
        &["fs_start", "fs_end", "app_ceiling", "atomic_fs", "flash_map_support"],
    ),
    ("stream", &["timeout_ms", "backoff_ms"]),
];

/// Configuration of the command-line tool
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Settings handed to the updater
    pub updater: UpdaterConfig,
    /// File the configuration was read from, if any
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load the configuration from `path`, or from [DEFAULT_CONFIG_FILE] if it
    /// exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, raw_data) = match path {
            Some(path) => {
                let raw_data = read_to_string(path)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
                (Some(path.to_path_buf()), raw_data)
            }
            None => match read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(raw_data) => (Some(PathBuf::from(DEFAULT_CONFIG_FILE)), raw_data),
                Err(_) => return Ok(Config::default()),
            },
        };

        let updater = Self::parse(&raw_data)?;
        debug!("Config: {:#?}", &updater);

        Ok(Config { updater, path })
    }

    /// Parse and validate the content of a configuration file
    pub fn parse(raw_data: &str) -> Result<UpdaterConfig, ConfigError> {
        let toml_value = toml::from_str::<toml::Value>(raw_data)?;
        if let toml::Value::Table(top_level) = &toml_value {
            Self::validate_keys(top_level)?;
        }

        Ok(toml::from_str(raw_data)?)
    }

    fn validate_keys(top_level: &toml::map::Map<String, toml::Value>) -> Result<(), ConfigError> {
        let mut misplaced_keys = Vec::new();
        let mut unknown_keys = Vec::new();

        for (key, value) in top_level {
            if let Some((_, allowed)) = SECTIONS.iter().find(|(name, _)| *name == key.as_str()) {
                if let toml::Value::Table(table) = value {
                    for inner in table.keys() {
                        if !allowed.contains(&inner.as_str()) {
                            unknown_keys.push(format!("{key}.{inner}"));
                        }
                    }
                }
            } else if let Some((section, _)) =
                SECTIONS.iter().find(|(_, keys)| keys.contains(&key.as_str()))
            {
                misplaced_keys.push(format!("'{key}' should be under [{section}]!"));
            } else if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
                unknown_keys.push(key.clone());
            }
        }

        if !misplaced_keys.is_empty() {
            return Err(ConfigError::MisplacedKey(misplaced_keys.join(", ")));
        }
        if !unknown_keys.is_empty() {
            return Err(ConfigError::UnknownKey(unknown_keys.join(", ")));
        }

        Ok(())
    }
}
