//! YAML load/save for engine settings
//!
//! Loading never fails: the engine has to come up even when the settings
//! file is missing or broken, so every problem degrades to defaults with a
//! log line. Saving reports errors to the caller.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Read and parse a YAML file
fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Load settings from `path`, falling back to `T::default()`
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("[CONFIG] No settings at {}, using defaults", path.display());
        return T::default();
    }

    match read_yaml(path) {
        Ok(config) => {
            log::info!("[CONFIG] Loaded {}", path.display());
            config
        }
        Err(e) => {
            log::warn!("[CONFIG] {:#}; using defaults", e);
            T::default()
        }
    }
}

/// Write settings to `path` as YAML, creating missing directories
pub fn save_config<T: Serialize>(config: &T, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let yaml = serde_yaml::to_string(config).context("serializing settings")?;
    std::fs::write(path, yaml).with_context(|| format!("writing {}", path.display()))?;

    log::info!("[CONFIG] Saved {}", path.display());
    Ok(())
}
