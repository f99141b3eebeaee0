//! Per-item triage and the replace-in-place protocol.
//!
//! Items are handled strictly one at a time. For each file in an item
//! directory the policy table, the size floor and the ledger decide whether
//! it needs work; a file that does is locked, probed, encoded to a
//! `transcode-` working name and swapped in with two renames:
//!
//! 1. `<source>` -> `<source>-orig`
//! 2. `transcode-<stem>.<container>` -> `<stem>.<container>`
//!
//! A crash between the renames leaves a backup and a working output with no
//! final file next to it; the next pass over the item finishes the swap
//! before anything else happens in that directory.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;
use walkdir::WalkDir;
use crate::config::TranscodeConfig;
use crate::ffmpeg::{self, EncodeJob, StreamSelection};
use crate::ledger::{Ledger, TranscodeRecord};
use crate::lock::{LockError, LockGuard, ProcessLock};
use crate::naming::{self, SwapPlan, LOCK_FILE, VERIFIED_ENGLISH_MARKER};
use crate::policy::{self, FileClass};
use crate::probe::{self, ProbeData};
use crate::runner::CommandRunner;

/// How many times the verify-English prompt is repeated
const VERIFY_PROMPT_REPEAT: usize = 10;

/// Why a file was or was not selected, before any locking or probing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Extension missing from the policy table
    UnknownType(String),
    /// Output of this or an earlier run
    WorkingOutput,
    /// Backup, lock or sidecar
    Ignored(FileClass),
    TooSmall(u64),
    UpToDate,
    NeedsProcessing,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("lock unavailable: {0}")]
    Lock(#[from] LockError),
    #[error("probe failed: {0:#}")]
    Probe(anyhow::Error),
    #[error("no video stream in {}", .0.display())]
    NoVideoStream(PathBuf),
    #[error("no English audio detected and not verified: {}", .0.display())]
    UnverifiedLanguage(PathBuf),
    #[error("refusing to overwrite existing backup {}; move it away to have the file transcoded again", .0.display())]
    BackupExists(PathBuf),
    #[error("refusing to replace {}, another file already has the output name; rename one of them", .0.display())]
    TargetExists(PathBuf),
    #[error("ffmpeg failed (exit code {:?}) for {}: {}", .exit_code, .path.display(), .stderr)]
    Engine {
        path: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("{context}: {source}")]
    Io { context: String, source: io::Error },
    #[error("bookkeeping failed: {0:#}")]
    Bookkeeping(anyhow::Error),
}

impl JobError {
    /// Ledger and disk can no longer be trusted to agree
    pub fn is_fatal(&self) -> bool {
        matches!(self, JobError::Bookkeeping(_))
    }

    /// Path whose presence blocks the swap until the operator moves it
    fn blocking_path(&self) -> Option<&Path> {
        match self {
            JobError::BackupExists(path) | JobError::TargetExists(path) => Some(path.as_path()),
            _ => None,
        }
    }

    fn io(context: impl Into<String>, source: io::Error) -> Self {
        JobError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug)]
pub enum FileOutcome {
    Skipped(Decision),
    /// Size changed during the settle delay
    StillCopying,
    Transcoded(TranscodeRecord),
    /// Already swapped by a run that died before recording it
    Adopted(TranscodeRecord),
    Failed(JobError),
}

#[derive(Debug)]
pub struct FileReport {
    pub name: String,
    pub outcome: FileOutcome,
}

/// Everything one triage pass did to one media item
#[derive(Debug, Default)]
pub struct ItemReport {
    pub item: String,
    /// Interrupted swaps finished before the files were looked at
    pub recovered: Vec<TranscodeRecord>,
    /// Set when the item was skipped because recovery could not run
    pub recovery_error: Option<JobError>,
    pub files: Vec<FileReport>,
}

impl ItemReport {
    pub fn transcoded(&self) -> impl Iterator<Item = &TranscodeRecord> {
        self.files.iter().filter_map(|f| match &f.outcome {
            FileOutcome::Transcoded(r) => Some(r),
            _ => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &JobError)> {
        self.files.iter().filter_map(|f| match &f.outcome {
            FileOutcome::Failed(e) => Some((f.name.as_str(), e)),
            _ => None,
        })
    }
}

/// Order-preserving queue that holds each item at most once
#[derive(Debug, Default)]
pub struct DispatchQueue {
    order: VecDeque<String>,
    queued: HashSet<String>,
}

impl DispatchQueue {
    /// Queue an item; false if it is already waiting
    pub fn push(&mut self, item: String) -> bool {
        if !self.queued.insert(item.clone()) {
            return false;
        }
        self.order.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<String> {
        let item = self.order.pop_front()?;
        self.queued.remove(&item);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

enum Processed {
    Transcoded(TranscodeRecord),
    Adopted(TranscodeRecord),
}

/// Triage engine for one library root
pub struct Triage<R> {
    cfg: TranscodeConfig,
    runner: R,
    ledger: Ledger,
    /// Lock owner id; the process id when unset
    owner: Option<u32>,
    /// Swap blockers already reported to the operator
    reported_blockers: HashSet<PathBuf>,
}

impl<R: CommandRunner> Triage<R> {
    pub fn new(cfg: TranscodeConfig, runner: R) -> Self {
        let ledger = Ledger::load(&cfg.library_root);
        info!("Loaded {} ledger record(s) from {}", ledger.len(), cfg.library_root.display());
        Self {
            cfg,
            runner,
            ledger,
            owner: None,
            reported_blockers: HashSet::new(),
        }
    }

    /// Identity written into lock markers (defaults to the process id)
    pub fn with_owner(mut self, owner: u32) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.cfg
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Media item names under the library root, in name order
    pub fn list_items(&self) -> Result<Vec<String>> {
        let root = &self.cfg.library_root;
        let mut items = Vec::new();
        for entry in WalkDir::new(root).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.with_context(|| format!("Failed to list library root: {}", root.display()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) => items.push(name.to_string()),
                None => warn!("Skipping non UTF-8 directory name: {}", entry.path().display()),
            }
        }
        Ok(items)
    }

    /// Triage every item in listing order. Errors are fatal bookkeeping failures only.
    pub async fn scan_library(&mut self) -> Result<Vec<ItemReport>> {
        let items = self.list_items()?;
        info!("Scanning {} item(s) in {}", items.len(), self.cfg.library_root.display());

        let mut reports = Vec::with_capacity(items.len());
        for item in items {
            reports.push(self.triage_item(&item).await?);
        }

        let transcoded: usize = reports.iter().map(|r| r.transcoded().count()).sum();
        let failed: usize = reports.iter().map(|r| r.failures().count()).sum();
        info!("Scan complete: {} transcoded, {} failed", transcoded, failed);
        Ok(reports)
    }

    /// Eligibility of one file of `item`, from its name, size and the ledger
    pub fn assess(&self, item: &str, file_name: &str, size: u64) -> Decision {
        let ext = policy::extension_of(file_name);
        let class = policy::classify(ext);
        if class == FileClass::Unknown {
            return Decision::UnknownType(ext.to_string());
        }
        if naming::is_working_name(file_name) {
            return Decision::WorkingOutput;
        }
        if !class.is_eligible() {
            return Decision::Ignored(class);
        }
        if size <= self.cfg.min_bytes {
            return Decision::TooSmall(size);
        }
        if self.ledger.is_up_to_date(item, size) {
            return Decision::UpToDate;
        }
        Decision::NeedsProcessing
    }

    /// Triage one item. Per-file problems land in the report; an `Err` means
    /// the ledger could not be kept in step with the disk and the caller must stop.
    pub async fn triage_item(&mut self, item: &str) -> Result<ItemReport> {
        let dir = self.cfg.library_root.join(item);
        let mut report = ItemReport {
            item: item.to_string(),
            ..Default::default()
        };

        if !dir.is_dir() {
            debug!("Not a media item directory: {}", dir.display());
            return Ok(report);
        }

        match self.finish_interrupted_swaps(item, &dir).await {
            Ok(recovered) => report.recovered = recovered,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Skipping {} this pass, interrupted swap not finished: {}", item, e);
                report.recovery_error = Some(e);
                return Ok(report);
            }
        }

        let files = match list_files(&dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("Cannot list {}: {}", dir.display(), e);
                return Ok(report);
            }
        };

        // Earlier swaps in this pass may have renamed or replaced later
        // entries, so each one is stat'ed again right before it is judged.
        for (name, _) in files {
            let size = match current_size(&dir, &name) {
                Ok(Some(size)) => size,
                Ok(None) => {
                    debug!("{}/{} is gone", item, name);
                    continue;
                }
                Err(e) => {
                    warn!("Cannot stat {}/{}: {}", item, name, e);
                    continue;
                }
            };

            let outcome = match self.assess(item, &name, size) {
                Decision::NeedsProcessing => self.handle_candidate(item, &dir, &name, size).await,
                Decision::UnknownType(ext) => {
                    warn!("Unknown file type {:?} in {}", ext, item);
                    FileOutcome::Skipped(Decision::UnknownType(ext))
                }
                decision => {
                    debug!("{}/{}: {:?}", item, name, decision);
                    FileOutcome::Skipped(decision)
                }
            };

            match outcome {
                FileOutcome::Failed(e) if e.is_fatal() => {
                    return Err(anyhow::Error::new(e).context(format!("Fatal error on {}/{}", item, name)));
                }
                outcome => report.files.push(FileReport { name, outcome }),
            }
        }

        Ok(report)
    }

    async fn handle_candidate(&mut self, item: &str, dir: &Path, name: &str, size: u64) -> FileOutcome {
        if let Some(delay) = self.cfg.settle_delay() {
            debug!("Checking stability for: {}/{} ({} bytes)", item, name, size);
            tokio::time::sleep(delay).await;
            match fs::metadata(dir.join(name)) {
                Ok(meta) if meta.len() == size => {}
                Ok(_) => {
                    info!("{}/{} is still being copied, retrying later", item, name);
                    return FileOutcome::StillCopying;
                }
                Err(e) => {
                    return FileOutcome::Failed(JobError::io(format!("Failed to re-stat {}/{}", item, name), e))
                }
            }
        }

        info!("Processing {}/{} ({} bytes)", item, name, size);
        match self.process(item, dir, name).await {
            Ok(Processed::Transcoded(record)) => {
                info!("Transcoded {} -> {} ({} bytes)", record.source_file, record.output_file, record.output_size);
                FileOutcome::Transcoded(record)
            }
            Ok(Processed::Adopted(record)) => {
                info!("Recorded existing transcode {} for {}", record.output_file, item);
                FileOutcome::Adopted(record)
            }
            Err(JobError::Lock(e)) => {
                warn!("{} is locked, skipping this pass: {}", item, e);
                FileOutcome::Failed(JobError::Lock(e))
            }
            Err(e) if e.blocking_path().is_some() => {
                // Stays blocked until the operator acts; say so once
                let blocker = e.blocking_path().map(Path::to_path_buf).unwrap_or_default();
                if self.reported_blockers.insert(blocker) {
                    warn!("{}/{} will not be transcoded: {}", item, name, e);
                } else {
                    debug!("{}/{} still blocked: {}", item, name, e);
                }
                FileOutcome::Failed(e)
            }
            Err(e) => {
                error!("Transcode of {}/{} failed: {}", item, name, e);
                FileOutcome::Failed(e)
            }
        }
    }

    fn lock_for(&self, dir: &Path) -> ProcessLock {
        let path = dir.join(LOCK_FILE);
        match self.owner {
            Some(owner) => ProcessLock::with_owner(path, owner),
            None => ProcessLock::new(path),
        }
        .grace(self.cfg.lock_grace())
        .reclaim_dead_owners(self.cfg.reclaim_stale_locks)
    }

    async fn process(&mut self, item: &str, dir: &Path, name: &str) -> Result<Processed, JobError> {
        let guard = self.lock_for(dir).acquire().await?;
        let plan = SwapPlan::new(dir, name, &self.cfg.container);

        if self.ledger.get(item).is_none() && plan.target == plan.source {
            if let Some(backup) = find_backup(dir, name) {
                let record = self.record_swap(item, &backup, &plan.target, None, false).await?;
                self.commit(item, record.clone(), guard)?;
                return Ok(Processed::Adopted(record));
            }
        }

        if plan.backup.exists() {
            return Err(JobError::BackupExists(plan.backup));
        }
        if plan.clobbers_target() {
            return Err(JobError::TargetExists(plan.target.clone()));
        }

        let meta = probe::probe_file(&self.runner, &self.cfg, &plan.source)
            .await
            .map_err(JobError::Probe)?;
        let video = meta
            .video_stream()
            .ok_or_else(|| JobError::NoVideoStream(plan.source.clone()))?;

        let verified = dir.join(VERIFIED_ENGLISH_MARKER).exists();
        let Some(streams) = StreamSelection::choose(&meta, verified) else {
            warn!("Did not detect any English streams in {}", plan.source.display());
            for _ in 0..VERIFY_PROMPT_REPEAT {
                warn!("Please verify English: {}", dir.display());
            }
            return Err(JobError::UnverifiedLanguage(plan.source));
        };

        let scale = ffmpeg::scale_directive(video.source_width().unwrap_or(0), self.cfg.max_width);
        if let Some(scale) = &scale {
            debug!("Downscaling {} with {}", name, scale);
        }

        let job = EncodeJob {
            input: &plan.source,
            output: &plan.working,
            title: item,
            meta: &meta,
            streams: &streams,
            scale,
        };
        let args = ffmpeg::build_args(&self.cfg, &job);

        remove_if_present(&plan.working)
            .map_err(|e| JobError::io(format!("Failed to remove stale {}", plan.working.display()), e))?;

        let output = self.runner.run(&self.cfg.ffmpeg_bin, &args).await;
        if !output.success {
            return Err(JobError::Engine {
                path: plan.source.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr_tail(5),
            });
        }

        // The target may have appeared while the engine ran
        if plan.clobbers_target() {
            return Err(JobError::TargetExists(plan.target.clone()));
        }
        fs::rename(&plan.source, &plan.backup).map_err(|e| {
            JobError::io(format!("Failed to back up {}", plan.source.display()), e)
        })?;
        fs::rename(&plan.working, &plan.target).map_err(|e| {
            JobError::io(format!("Failed to move {} into place", plan.working.display()), e)
        })?;

        let record = self.record_swap(item, &plan.backup, &plan.target, Some(&meta), true).await?;
        self.commit(item, record.clone(), guard)?;
        self.reported_blockers.remove(&plan.backup);
        self.reported_blockers.remove(&plan.target);
        Ok(Processed::Transcoded(record))
    }

    /// Finish swaps a killed run left half done. Holds the item lock while renaming.
    async fn finish_interrupted_swaps(&mut self, item: &str, dir: &Path) -> Result<Vec<TranscodeRecord>, JobError> {
        let names: Vec<String> = list_files(dir)
            .map_err(|e| JobError::io(format!("Cannot list {}", dir.display()), e))?
            .into_iter()
            .map(|(name, _)| name)
            .collect();

        let pending: Vec<(String, String, String)> = names
            .iter()
            .filter_map(|working| {
                let target = naming::final_for_working(working)?;
                if !policy::classify_name(target).is_eligible() || names.iter().any(|n| n == target) {
                    return None;
                }
                let backup = names.iter().find(|n| naming::is_backup_of(n, target))?;
                Some((working.clone(), target.to_string(), backup.clone()))
            })
            .collect();

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let guard = self.lock_for(dir).acquire().await?;
        let mut recovered = Vec::new();
        for (working, target, backup) in pending {
            warn!("Finishing interrupted swap in {}: {} -> {}", item, working, target);
            let target = dir.join(target);
            fs::rename(dir.join(&working), &target)
                .map_err(|e| JobError::io(format!("Failed to move {} into place", working), e))?;

            let record = self.record_swap(item, &dir.join(backup), &target, None, true).await?;
            self.ledger = Ledger::save(&self.cfg.library_root, item, record.clone())
                .map_err(JobError::Bookkeeping)?;
            recovered.push(record);
        }
        release(guard);
        Ok(recovered)
    }

    /// Build the record for a finished swap from the preserved original and the new file.
    /// Once this run has renamed `target` into place (`renamed`), failing to
    /// inspect it is a bookkeeping failure; otherwise it is an ordinary probe failure.
    async fn record_swap(
        &self,
        item: &str,
        backup: &Path,
        target: &Path,
        source_meta: Option<&ProbeData>,
        renamed: bool,
    ) -> Result<TranscodeRecord, JobError> {
        let output_error: fn(anyhow::Error) -> JobError = if renamed {
            JobError::Bookkeeping
        } else {
            JobError::Probe
        };

        let size = fs::metadata(target)
            .with_context(|| format!("Failed to stat transcoded output: {}", target.display()))
            .map_err(output_error)?
            .len();
        let output = probe::probe_file(&self.runner, &self.cfg, target)
            .await
            .map_err(output_error)?;

        let probed;
        let source = match source_meta {
            Some(meta) => meta,
            None => {
                probed = probe::probe_file(&self.runner, &self.cfg, backup)
                    .await
                    .map_err(JobError::Probe)?;
                &probed
            }
        };

        let source_video = source.video_stream();
        let output_video = output.video_stream().or(output.streams.first());

        Ok(TranscodeRecord {
            item: item.to_string(),
            source_file: file_name(backup),
            source_codec: source_video.and_then(|s| s.codec_name.clone()).unwrap_or_default(),
            source_width: source_video.and_then(|s| s.width).unwrap_or(0),
            source_pix_fmt: source_video.and_then(|s| s.pix_fmt.clone()).unwrap_or_default(),
            output_file: file_name(target),
            output_codec: output_video.and_then(|s| s.codec_name.clone()).unwrap_or_default(),
            output_width: output_video.and_then(|s| s.width).unwrap_or(0),
            output_size: size,
            output_bitrate: output.format.bit_rate.clone().unwrap_or_default(),
            output_duration: probe::format_duration(output.duration_secs().unwrap_or(0.0)),
            speed: self.cfg.speed.clone(),
            crf: self.cfg.crf,
            transcoded_at: Some(Utc::now()),
        })
    }

    /// Persist the record, then let go of the item lock
    fn commit(&mut self, item: &str, record: TranscodeRecord, guard: LockGuard) -> Result<(), JobError> {
        self.ledger = Ledger::save(&self.cfg.library_root, item, record).map_err(JobError::Bookkeeping)?;
        release(guard);
        Ok(())
    }
}

fn release(guard: LockGuard) {
    let path = guard.path().to_path_buf();
    if let Err(e) = guard.release() {
        warn!("Failed to release lock {}: {}", path.display(), e);
    }
}

/// Regular files of a directory with their sizes, in name order
fn list_files(dir: &Path) -> io::Result<Vec<(String, u64)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            warn!("Skipping non UTF-8 file name: {}", entry.path().display());
            continue;
        };
        let size = entry.metadata().map_err(io::Error::from)?.len();
        files.push((name.to_string(), size));
    }
    Ok(files)
}

/// Size of a regular file in `dir`, None if it is no longer there
fn current_size(dir: &Path, name: &str) -> io::Result<Option<u64>> {
    match fs::metadata(dir.join(name)) {
        Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Preserved original that was swapped into `final_name`, if one is present
fn find_backup(dir: &Path, final_name: &str) -> Option<PathBuf> {
    let files = list_files(dir).ok()?;
    files
        .into_iter()
        .find(|(name, _)| naming::is_backup_of(name, final_name))
        .map(|(name, _)| dir.join(name))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
