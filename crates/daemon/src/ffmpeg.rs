use std::path::Path;
use crate::config::TranscodeConfig;
use crate::probe::ProbeData;

/// Audio and subtitle streams carried into the output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSelection {
    /// Stream indexes detected as English
    Detected(Vec<u32>),
    /// Hand-verified item: keep every audio stream
    Verified,
}

impl StreamSelection {
    /// Detected English streams first; the verification marker only applies
    /// when detection finds nothing
    pub fn choose(meta: &ProbeData, verified_marker: bool) -> Option<Self> {
        let detected: Vec<u32> = meta.english_streams().map(|s| s.index).collect();
        if !detected.is_empty() {
            Some(StreamSelection::Detected(detected))
        } else if verified_marker {
            Some(StreamSelection::Verified)
        } else {
            None
        }
    }

    fn map_args(&self) -> Vec<String> {
        match self {
            StreamSelection::Detected(indexes) => indexes
                .iter()
                .flat_map(|i| ["-map".to_string(), format!("0:{}", i)])
                .collect(),
            StreamSelection::Verified => vec!["-map".to_string(), "0:a".to_string()],
        }
    }
}

/// Downscale filter for sources wider than `max_width`, aspect preserved
pub fn scale_directive(source_width: u32, max_width: u32) -> Option<String> {
    (source_width > max_width).then(|| format!("scale={}:-2", max_width))
}

/// Everything one encode needs besides the configuration
#[derive(Debug, Clone)]
pub struct EncodeJob<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    /// Written into the video stream title
    pub title: &'a str,
    pub meta: &'a ProbeData,
    pub streams: &'a StreamSelection,
    pub scale: Option<String>,
}

fn push(args: &mut Vec<String>, items: &[&str]) {
    args.extend(items.iter().map(|s| s.to_string()));
}

/// Build the ffmpeg arguments for one encode
pub fn build_args(cfg: &TranscodeConfig, job: &EncodeJob<'_>) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    push(&mut args, &["-nostdin", "-hide_banner", "-avioflags", "direct", "-rtbufsize", "64M"]);
    if !cfg.hwaccel.trim().is_empty() {
        push(&mut args, &["-hwaccel", cfg.hwaccel.trim()]);
    }

    let input = job.input.to_string_lossy().to_string();
    push(&mut args, &["-analyzeduration", "512M", "-probesize", "512M", "-fix_sub_duration"]);
    push(&mut args, &["-i", input.as_str()]);
    push(&mut args, &["-max_muxing_queue_size", "65536"]);
    push(&mut args, &["-map_metadata:g", "0:g", "-map_metadata:s:v", "0:s:v"]);
    if job.meta.has_attachments() {
        push(&mut args, &["-map_metadata:s:t", "0:s:t"]);
    }

    push(&mut args, &["-map", "0:v:0"]);
    args.extend(job.streams.map_args());
    push(&mut args, &["-map", "0:t?", "-c:v", cfg.codec.as_str()]);

    if let Some(scale) = &job.scale {
        push(&mut args, &["-vf", scale.as_str()]);
    }

    let crf = cfg.crf.to_string();
    push(&mut args, &["-crf", crf.as_str(), "-preset", cfg.speed.as_str(), "-pix_fmt", cfg.pix_fmt.as_str()]);
    push(&mut args, &["-tune", "fastdecode", "-movflags", "+faststart"]);

    // Audio: Opus, surround layouts kept
    push(&mut args, &["-c:a", "libopus", "-b:a", "512k", "-vbr", "on"]);
    push(&mut args, &["-af", "aformat=channel_layouts='7.1|6.1|5.1|stereo'"]);
    push(&mut args, &["-compression_level", "10", "-frame_duration", "60"]);

    push(&mut args, &["-c:s", cfg.subtitle_codec.as_str()]);

    let title = format!("title={}", job.title);
    push(&mut args, &["-metadata:s:a", "language=eng", "-metadata:s:s", "language=eng"]);
    push(&mut args, &["-metadata:s:v", "language=eng", "-metadata:s:v", title.as_str()]);
    push(&mut args, &["-metadata:s:v", "description=Encoded by transcoded"]);

    if cfg.threads > 0 {
        let threads = cfg.threads.to_string();
        push(&mut args, &["-threads", threads.as_str()]);
    }

    args.push(job.output.to_string_lossy().to_string());
    args
}
