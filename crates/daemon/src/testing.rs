//! Scripted ffprobe/ffmpeg stand-in and fixtures shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use async_trait::async_trait;
use crate::config::TranscodeConfig;
use crate::runner::{CommandOutput, CommandRunner};

pub const MIB: u64 = 1024 * 1024;

pub const ENGLISH: &str = r#"{"language": "eng"}"#;
pub const JAPANESE: &str = r#"{"language": "jpn"}"#;

type EncodeHook = Box<dyn Fn(&Path) + Send + Sync>;

/// Answers ffprobe from canned JSON keyed by file name and fakes ffmpeg
/// by creating a sparse output file.
#[derive(Default)]
pub struct ScriptedRunner {
    probes: Mutex<HashMap<String, VecDeque<Option<String>>>>,
    encode_bytes: u64,
    fail_encode: bool,
    on_encode: Option<EncodeHook>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            encode_bytes: 300 * MIB,
            ..Default::default()
        }
    }

    fn answer(self, name: &str, answer: Option<String>) -> Self {
        self.probes
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(answer);
        self
    }

    /// Queue a probe answer; the last one queued for a name repeats
    pub fn probe(self, name: &str, json: impl Into<String>) -> Self {
        self.answer(name, Some(json.into()))
    }

    /// Queue a failed probe run
    pub fn probe_failure(self, name: &str) -> Self {
        self.answer(name, None)
    }

    pub fn failing(mut self) -> Self {
        self.fail_encode = true;
        self
    }

    /// Run `hook` with the output path while each encode is "running"
    pub fn on_encode(mut self, hook: impl Fn(&Path) + Send + Sync + 'static) -> Self {
        self.on_encode = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn encodes(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(program, _)| program == "ffmpeg")
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &Path, args: &[String]) -> CommandOutput {
        let program = program.to_string_lossy().to_string();
        self.calls.lock().unwrap().push((program.clone(), args.to_vec()));
        let target = PathBuf::from(args.last().cloned().unwrap_or_default());
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if program == "ffprobe" {
            let mut probes = self.probes.lock().unwrap();
            let answer = probes.get_mut(&name).and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            });
            return match answer {
                Some(Some(json)) if target.exists() => CommandOutput {
                    success: true,
                    exit_code: Some(0),
                    stdout: json,
                    stderr: String::new(),
                },
                _ => CommandOutput {
                    success: false,
                    exit_code: Some(1),
                    stderr: format!("{}: Invalid data found when processing input", name),
                    ..Default::default()
                },
            };
        }

        if self.fail_encode {
            return CommandOutput {
                success: false,
                exit_code: Some(1),
                stderr: "Conversion failed!".to_string(),
                ..Default::default()
            };
        }
        if let Some(hook) = &self.on_encode {
            hook(&target);
        }
        sparse(&target, self.encode_bytes);
        CommandOutput {
            success: true,
            exit_code: Some(0),
            ..Default::default()
        }
    }
}

pub fn sparse(path: &Path, len: u64) {
    fs::File::create(path).unwrap().set_len(len).unwrap();
}

pub fn source_probe(width: u32, audio_tags: &str) -> String {
    format!(
        r#"{{"streams": [
            {{"index": 0, "codec_type": "video", "codec_name": "h264", "width": {width}, "coded_width": {width}, "pix_fmt": "yuv420p"}},
            {{"index": 1, "codec_type": "audio", "codec_name": "dts", "tags": {audio_tags}}}
        ], "format": {{"duration": "7384.5", "bit_rate": "40000000"}}}}"#
    )
}

pub fn output_probe() -> String {
    r#"{"streams": [{"index": 0, "codec_type": "video", "codec_name": "hevc", "width": 1920}],
        "format": {"duration": "7384.500000", "bit_rate": "8000000"}}"#
        .to_string()
}

pub fn test_config(root: &Path) -> TranscodeConfig {
    TranscodeConfig {
        library_root: root.to_path_buf(),
        settle_secs: 0,
        lock_grace_ms: 1,
        rescan_interval_secs: 0,
        ..Default::default()
    }
}

pub fn item_dir(root: &Path, item: &str) -> PathBuf {
    let dir = root.join(item);
    fs::create_dir_all(&dir).unwrap();
    dir
}
