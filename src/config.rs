use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use url::Origin;

use crate::relay::parse_origins;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3000";

/// Runtime settings. Resolved from defaults, then `config.json` in the
/// project config dir, then `HUNT_*` environment variables. CLI flags are
/// applied last by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub backend_url: String,
    /// Addresses whose tabs count as application tabs for the relay.
    pub app_origins: Vec<String>,
    pub primary_timeout_secs: u64,
    pub relay_timeout_secs: u64,
    pub webdriver_url: Option<String>,
    /// Overrides the project data dir.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            app_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            primary_timeout_secs: 10,
            relay_timeout_secs: 5,
            webdriver_url: None,
            data_dir: None,
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "hunt-relay")
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = match project_dirs() {
            Some(dirs) => Self::from_file(&dirs.config_dir().join("config.json"))?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay environment variables. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("HUNT_BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(origins) = lookup("HUNT_APP_ORIGINS") {
            self.app_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(secs) = lookup("HUNT_PRIMARY_TIMEOUT_SECS") {
            match secs.trim().parse() {
                Ok(secs) => self.primary_timeout_secs = secs,
                Err(_) => warn!(value = %secs, "ignoring bad HUNT_PRIMARY_TIMEOUT_SECS"),
            }
        }
        if let Some(secs) = lookup("HUNT_RELAY_TIMEOUT_SECS") {
            match secs.trim().parse() {
                Ok(secs) => self.relay_timeout_secs = secs,
                Err(_) => warn!(value = %secs, "ignoring bad HUNT_RELAY_TIMEOUT_SECS"),
            }
        }
        if let Some(url) = lookup("HUNT_WEBDRIVER_URL") {
            self.webdriver_url = Some(url).filter(|u| !u.trim().is_empty());
        }
    }

    pub fn origins(&self) -> Vec<Origin> {
        parse_origins(&self.app_origins)
    }

    pub fn primary_timeout(&self) -> Duration {
        Duration::from_secs(self.primary_timeout_secs.max(1))
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs.max(1))
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match project_dirs() {
            Some(dirs) => dirs.data_dir().to_path_buf(),
            // Fallback to current directory
            None => PathBuf::from("."),
        }
    }

    /// Local store backing the cache.
    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir().join("cache.db")
    }

    /// Application and resume store used by the local backend.
    pub fn backend_db_path(&self) -> PathBuf {
        self.data_dir().join("hunt-relay.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.backend_url, DEFAULT_BACKEND_URL);
        assert_eq!(config.origins().len(), 2);
        assert_eq!(config.primary_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("HUNT_BACKEND_URL", "https://api.example.com"),
            ("HUNT_APP_ORIGINS", "https://app.example.com, http://localhost:5173,"),
            ("HUNT_PRIMARY_TIMEOUT_SECS", "3"),
            ("HUNT_RELAY_TIMEOUT_SECS", "soon"),
            ("HUNT_WEBDRIVER_URL", "http://localhost:9515"),
        ]));
        assert_eq!(config.backend_url, "https://api.example.com");
        assert_eq!(
            config.app_origins,
            vec!["https://app.example.com", "http://localhost:5173"]
        );
        assert_eq!(config.primary_timeout_secs, 3);
        // Unparsable values keep the previous setting.
        assert_eq!(config.relay_timeout_secs, 5);
        assert_eq!(config.webdriver_url.as_deref(), Some("http://localhost:9515"));
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = Config {
            relay_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.relay_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"backend_url": "http://10.0.0.2:8080"}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.backend_url, "http://10.0.0.2:8080");
        assert_eq!(config.relay_timeout_secs, 5);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_data_paths_follow_override() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/hunt")),
            ..Default::default()
        };
        assert_eq!(config.cache_db_path(), PathBuf::from("/tmp/hunt/cache.db"));
        assert_eq!(config.backend_db_path(), PathBuf::from("/tmp/hunt/hunt-relay.db"));
    }
}
