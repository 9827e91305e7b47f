//! Configuration discovery for the server binary

use std::path::Path;

use crate::{Config, Result};

/// Resolve and load the configuration.
///
/// File lookup order: `STATECAST_CONFIG_PATH`, `./config.yaml`,
/// `/config/config.yaml`. Environment variables always override file values.
pub fn load_config() -> Result<Config> {
    let config_path = std::env::var("STATECAST_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| existing("config.yaml"))
        .or_else(|| existing("/config/config.yaml"));

    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)?
    } else {
        eprintln!("No config file found, using defaults and environment");
        Config::from_env()?
    };

    Ok(config)
}

fn existing(path: &str) -> Option<String> {
    Path::new(path).exists().then(|| path.to_string())
}
