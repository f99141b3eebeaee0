use std::collections::HashMap;
use std::path::Path;
use anyhow::{Context, Result};
use serde::Deserialize;
use crate::config::TranscodeConfig;
use crate::runner::CommandRunner;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeData {
    #[serde(default)]
    pub streams: Vec<ProbeStream>,
    #[serde(default)]
    pub format: ProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeFormat {
    pub format_name: Option<String>,
    /// Seconds, as ffprobe prints it
    pub duration: Option<String>,
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProbeStream {
    pub index: u32,
    pub codec_type: Option<String>,
    pub codec_name: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub coded_width: Option<u32>,
    pub pix_fmt: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl ProbeStream {
    pub fn is_kind(&self, kind: &str) -> bool {
        self.codec_type.as_deref() == Some(kind)
    }

    /// Width used for the scale decision; the coded width when reported
    pub fn source_width(&self) -> Option<u32> {
        self.coded_width.filter(|w| *w > 0).or(self.width)
    }

    fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Audio or subtitle stream tagged `eng`, or titled "English..."
    pub fn is_english_track(&self) -> bool {
        if !(self.is_kind("audio") || self.is_kind("subtitle")) {
            return false;
        }
        if self.tag("language").is_some_and(|l| l.eq_ignore_ascii_case("eng")) {
            return true;
        }
        self.tag("title")
            .is_some_and(|t| t.to_lowercase().starts_with("english"))
    }
}

impl ProbeData {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse ffprobe JSON")
    }

    /// First stream whose kind is video
    pub fn video_stream(&self) -> Option<&ProbeStream> {
        self.streams.iter().find(|s| s.is_kind("video"))
    }

    pub fn english_streams(&self) -> impl Iterator<Item = &ProbeStream> {
        self.streams.iter().filter(|s| s.is_english_track())
    }

    pub fn has_attachments(&self) -> bool {
        self.streams.iter().any(|s| s.is_kind("attachment"))
    }

    pub fn duration_secs(&self) -> Option<f64> {
        self.format.duration.as_deref().and_then(|d| d.trim().parse().ok())
    }
}

/// Run ffprobe and parse the JSON output
pub async fn probe_file<R: CommandRunner + ?Sized>(
    runner: &R,
    cfg: &TranscodeConfig,
    file_path: &Path,
) -> Result<ProbeData> {
    let args = vec![
        "-v".to_string(),
        "quiet".to_string(),
        "-print_format".to_string(),
        "json".to_string(),
        "-show_format".to_string(),
        "-show_streams".to_string(),
        file_path.to_string_lossy().to_string(),
    ];

    let output = runner.run(&cfg.ffprobe_bin, &args).await;
    if !output.success {
        anyhow::bail!(
            "ffprobe failed (exit code {:?}) for {}: {}",
            output.exit_code,
            file_path.display(),
            output.stderr_tail(5)
        );
    }

    ProbeData::parse(&output.stdout)
        .with_context(|| format!("Unusable ffprobe output for: {}", file_path.display()))
}

/// Go-style duration text, e.g. `2h3m4.5s`
pub fn format_duration(secs: f64) -> String {
    if !secs.is_finite() || secs <= 0.0 {
        return "0s".to_string();
    }
    let millis = (secs * 1000.0).round() as u64;
    let hours = millis / 3_600_000;
    let minutes = (millis / 60_000) % 60;
    let rest_ms = millis % 60_000;

    let mut seconds = format!("{}.{:03}", rest_ms / 1000, rest_ms % 1000);
    while seconds.ends_with('0') {
        seconds.pop();
    }
    if seconds.ends_with('.') {
        seconds.pop();
    }

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&seconds);
    out.push('s');
    out
}
