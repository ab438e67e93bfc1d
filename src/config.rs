//! Process configuration.
//!
//! Loaded once at startup from `<config_dir>/klip/config.toml` when the file
//! exists; every field has a default so a missing or partial file is fine.
//! User-facing preferences that can change at runtime (retention window and
//! friends) live in the settings table instead, see [`crate::settings`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const APP_DIR_NAME: &str = "klip";
const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_MAX_TEXT_LEN: usize = 1024 * 1024;
pub const DEFAULT_OCR_MAX_CONCURRENT: usize = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub poll_interval_ms: u64,
    pub sweep_interval_secs: u64,
    pub capture_images: bool,
    pub max_text_len: usize,
    pub ocr_max_concurrent: usize,
    pub ocr_languages: Vec<String>,
    pub ocr_command: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            capture_images: false,
            max_text_len: DEFAULT_MAX_TEXT_LEN,
            ocr_max_concurrent: DEFAULT_OCR_MAX_CONCURRENT,
            ocr_languages: vec!["eng".to_string()],
            ocr_command: "tesseract".to_string(),
        }
    }
}

impl Config {
    /// Defaults rooted at `data_dir`, used by tests and embedders.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn load() -> anyhow::Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("invalid config {}", path.display()))?;
        info!(path = %path.display(), "Loaded config");
        Ok(config.sanitized())
    }

    fn sanitized(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.max(50);
        self.sweep_interval_secs = self.sweep_interval_secs.max(1);
        self.ocr_max_concurrent = self.ocr_max_concurrent.clamp(1, 8);
        if self.ocr_languages.is_empty() {
            self.ocr_languages = vec!["eng".to_string()];
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("clips.db")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "capture_images = true\npoll_interval_ms = 10\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.capture_images);
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
        assert_eq!(config.ocr_languages, vec!["eng".to_string()]);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "poll_interval_ms = \"fast\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn paths_hang_off_data_dir() {
        let config = Config::with_data_dir("/tmp/klip-test");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/klip-test/clips.db"));
        assert_eq!(config.images_dir(), PathBuf::from("/tmp/klip-test/images"));
        assert!(!config.capture_images);
    }
}
