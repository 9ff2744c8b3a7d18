use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::stable::DEFAULT_STABLE_THRESHOLD;

/// Configuration for the video watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// New raw videos are dropped here
    pub watch_dir: PathBuf,
    /// Raw videos are moved here while their jobs run
    pub claim_dir: PathBuf,
    /// Transcode jobs write their output here
    pub transcoded_dir: PathBuf,
    /// Claims whose jobs could not be submitted end up here
    pub failed_dir: PathBuf,
    /// Holds `transcode.json` and `upload.json`
    pub templates_dir: PathBuf,
    /// Seconds a file must stay unchanged before it is picked up
    pub stable_threshold_secs: u64,
    /// Namespace the jobs are created in
    pub namespace: String,
    /// Transcoder preset passed to the transcode job
    pub video_preset: String,
    pub plex: PlexSettings,
}

/// Media server the upload jobs talk to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlexSettings {
    pub url: String,
    pub token: String,
    /// Where library shares are mounted inside the upload job, one directory per library
    pub share_root: PathBuf,
}

impl Default for PlexSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            share_root: PathBuf::from("/plex"),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::from_volumes(Path::new("/"), Path::new("/config"))
    }
}

impl WatcherConfig {
    /// Lay the working directories out under a shared volume and read
    /// templates from `<config_volume>/templates`
    pub fn from_volumes(shared_volume: &Path, config_volume: &Path) -> Self {
        Self {
            watch_dir: shared_volume.join("watch"),
            claim_dir: shared_volume.join("claim"),
            transcoded_dir: shared_volume.join("work"),
            failed_dir: shared_volume.join("fail"),
            templates_dir: config_volume.join("templates"),
            stable_threshold_secs: DEFAULT_STABLE_THRESHOLD.as_secs(),
            namespace: "vidrelay".to_string(),
            video_preset: "tivo".to_string(),
            plex: PlexSettings::default(),
        }
    }

    pub fn stable_threshold(&self) -> Duration {
        Duration::from_secs(self.stable_threshold_secs)
    }

    /// Every directory the watcher creates on startup
    pub fn working_dirs(&self) -> [&Path; 4] {
        [&self.watch_dir, &self.failed_dir, &self.claim_dir, &self.transcoded_dir]
    }

    /// Reject configurations that would only fail later, inside a job
    pub fn validate(&self) -> Result<()> {
        if self.plex.url.is_empty() {
            return Err(RelayError::invalid_argument("a plex server url is required"));
        }
        if self.plex.token.is_empty() {
            return Err(RelayError::invalid_argument("a plex token is required"));
        }
        if self.namespace.is_empty() {
            return Err(RelayError::invalid_argument("namespace cannot be empty"));
        }
        Ok(())
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .map_err(|e| RelayError::io("read config file", config_path, e))?;

                // TOML by extension, JSON otherwise
                config = if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    toml::from_str(&content).map_err(|e| {
                        RelayError::invalid_argument(format!(
                            "failed to parse TOML config {}: {}",
                            config_path.display(),
                            e
                        ))
                    })?
                } else {
                    serde_json::from_str(&content).map_err(|e| {
                        RelayError::invalid_argument(format!(
                            "failed to parse JSON config {}: {}",
                            config_path.display(),
                            e
                        ))
                    })?
                };
            }
        }

        Ok(config)
    }
}
