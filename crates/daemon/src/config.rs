use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the library transcode daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Library root: one directory per media item
    pub library_root: PathBuf,
    /// Hardware acceleration driver, passed to ffmpeg only when non-blank
    pub hwaccel: String,
    /// Encoder thread count, passed to ffmpeg only when > 0
    pub threads: u32,
    /// CRF (quality factor)
    pub crf: u32,
    /// Video encoding codec
    pub codec: String,
    /// Encoder speed preset
    pub speed: String,
    /// Output pixel format
    pub pix_fmt: String,
    /// Codec used for the subtitle streams
    pub subtitle_codec: String,
    /// Container extension of finished output (without the dot)
    pub container: String,
    /// Minimum file size in bytes for a file to be worth transcoding
    pub min_bytes: u64,
    /// Sources wider than this are downscaled to it
    pub max_width: u32,
    /// Delay before re-reading the lock owner after creating the marker
    pub lock_grace_ms: u64,
    /// Stable-file check: re-stat a candidate after this many seconds (0 disables)
    pub settle_secs: u64,
    /// Interval in seconds between full library rescans (0 disables)
    pub rescan_interval_secs: u64,
    /// Remove lock markers whose owner pid is no longer alive on this host
    pub reclaim_stale_locks: bool,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl TranscodeConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            library_root: PathBuf::from("/media"),
            hwaccel: String::new(),
            threads: 0,
            crf: 20,
            codec: "hevc_amf".to_string(),
            speed: "placebo".to_string(),
            pix_fmt: "yuv420p".to_string(),
            subtitle_codec: "copy".to_string(),
            container: "mkv".to_string(),
            min_bytes: 256 * 1024 * 1024, // 256MiB
            max_width: 1920,
            lock_grace_ms: 100,
            settle_secs: 10,
            rescan_interval_secs: 600,
            reclaim_stale_locks: false,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    pub fn lock_grace(&self) -> Duration {
        Duration::from_millis(self.lock_grace_ms)
    }

    pub fn settle_delay(&self) -> Option<Duration> {
        (self.settle_secs > 0).then(|| Duration::from_secs(self.settle_secs))
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_secs > 0).then(|| Duration::from_secs(self.rescan_interval_secs))
    }
}
