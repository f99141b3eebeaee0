pub mod config;
pub mod ffmpeg;
pub mod ledger;
pub mod lock;
pub mod naming;
pub mod policy;
pub mod probe;
pub mod runner;
pub mod triage;
pub mod watch;

#[cfg(test)]
mod testing;

pub use config::TranscodeConfig;
pub use ledger::{Ledger, TranscodeRecord};
pub use lock::{LockError, LockGuard, ProcessLock};
pub use probe::{ProbeData, ProbeFormat, ProbeStream};
pub use runner::{CommandOutput, CommandRunner, SystemRunner};
pub use triage::{Decision, FileOutcome, ItemReport, JobError, Triage};
