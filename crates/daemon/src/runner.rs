use std::ffi::OsStr;
use std::path::Path;
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

/// Captured result of one external process run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// None when the process never started or died from a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn launch_failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }

    /// Last few lines of stderr, for log messages
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Runs external commands to completion. Never fails: a process that cannot
/// be launched is reported as an unsuccessful [`CommandOutput`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> CommandOutput;
}

/// Runs commands on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &Path, args: &[String]) -> CommandOutput {
        debug!("exec: {} {}", program.display(), args.join(" "));

        let output = Command::new(program)
            .args(args.iter().map(OsStr::new))
            .stdin(std::process::Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) => CommandOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            },
            Err(e) => CommandOutput::launch_failure(format!("failed to launch {}: {}", program.display(), e)),
        }
    }
}
