use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runtime::SessionSettings;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub auth_token: Option<String>,
    pub tick_interval_ms: u64,
    pub flush_interval_secs: u64,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            auth_token: None,
            tick_interval_ms: 1000,
            flush_interval_secs: 30,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    /// Zero intervals fall back to the defaults; a zero-period interval panics in tokio.
    pub fn session_settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            tick_interval: match self.tick_interval_ms {
                0 => defaults.tick_interval,
                ms => Duration::from_millis(ms),
            },
            flush_interval: match self.flush_interval_secs {
                0 => defaults.flush_interval,
                secs => Duration::from_secs(secs),
            },
        }
    }
}

pub trait ConfigStore {
    fn load(&self) -> Config;
    fn save(&self, cfg: &Config) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new() -> Self {
        let path = if let Some(pd) = ProjectDirs::from("", "", "exam-session") {
            pd.config_dir().join("config.json")
        } else {
            PathBuf::from("exam_session_config.json")
        };
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Config {
        if let Ok(bytes) = fs::read(&self.path) {
            match serde_json::from_slice::<Config>(&bytes) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "ignoring unreadable config: {e}")
                }
            }
        }
        Config::default()
    }

    fn save(&self, cfg: &Config) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}
