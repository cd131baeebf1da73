use std::env::current_exe;
use std::path::PathBuf;
use std::str;
use directories_next::ProjectDirs;
use log::{info, warn};
use serde_json;

use crate::config::types::Config;
use crate::error::ConfigError;

// creates a path to a json file next to the executable
// this could be useful for usb sticks
fn get_portable_config_path() -> Option<PathBuf> {
    match current_exe() {
        Ok(mut path) => {
            // /opt/blerpc-driver => /opt/blerpc-driver.json
            if !path.set_extension("json") {
                warn!("current exe has no filename: {}", path.to_string_lossy());
                return None
            }

            Some(path)
        },
        Err(err) => {
            warn!("failed to get current exe path: {:?}", err);
            None
        },
    }
}

// creates a path to blerpc-driver.json in an os dependent standard directory, such as %AppData% on
// windows.
fn get_local_config_path() -> Option<PathBuf> {
    ProjectDirs::from("org", "blerpc", "blerpc-driver").map(|dirs| {
        dirs.config_dir().join("blerpc-driver.json")
    })
}

fn get_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = get_portable_config_path() {
        if let Ok(attr) = std::fs::metadata(&path) {
            if attr.is_file() {
                return Ok(path);
            }
        }
    }

    match get_local_config_path() {
        None => Err(ConfigError::NoConfigPath),
        Some(path) => Ok(path),
    }
}

#[derive(Debug, Clone)]
pub struct ConfigIO {
    path: PathBuf,
}

impl ConfigIO {
    /// Use `path` when given, otherwise the portable or per-user location.
    pub fn new(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path,
            None => get_config_path()?,
        };
        Ok(ConfigIO { path })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn read(&self) -> Result<Config, ConfigError> {
        let content = tokio::fs::read(&self.path).await?;

        if content.is_empty() {
            return Ok(Config::default());
        }

        let content = str::from_utf8(&content)?;
        Ok(serde_json::from_str(content)?)
    }

    pub async fn save(&self, config: &Config) -> Result<(), ConfigError> {
        info!("Saving config to {}", self.path.to_string_lossy());

        if let Some(directory) = self.path.parent() {
            tokio::fs::create_dir_all(directory).await?;
        }

        let content = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&self.path, content.as_bytes()).await?;
        Ok(())
    }
}
