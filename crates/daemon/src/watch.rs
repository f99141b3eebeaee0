//! Change watching and the dispatch loop.
//!
//! Filesystem events are mapped to the media item they touch and queued;
//! items are triaged one at a time, each at most once per queue turn.

use std::path::{Component, Path, PathBuf};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use crate::naming;
use crate::policy::{self, FileClass};
use crate::runner::CommandRunner;
use crate::triage::{DispatchQueue, Triage};

/// Media item an event path belongs to, or None when the event is not worth a pass
pub fn item_for_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative.components();
    let item = match components.next()? {
        Component::Normal(name) => name.to_str()?.to_string(),
        _ => return None,
    };

    if components.next().is_none() {
        // Root level: only directories are media items
        return path.is_dir().then_some(item);
    }

    let name = path.file_name()?.to_str()?;
    if policy::classify_name(name) == FileClass::Lock || naming::is_working_name(name) {
        return None;
    }
    Some(item)
}

/// Recursive watch on the library root that yields item names
pub struct LibraryWatcher {
    _watcher: RecommendedWatcher,
    items: mpsc::Receiver<String>,
}

impl LibraryWatcher {
    pub fn start(root: &Path) -> Result<Self> {
        let (tx, items) = mpsc::channel::<String>(1024);
        let watch_root: PathBuf = root.to_path_buf();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !(event.kind.is_create() || event.kind.is_modify()) {
                        return;
                    }
                    for path in event.paths {
                        if let Some(item) = item_for_path(&watch_root, &path) {
                            debug!("Change in {}: {}", item, path.display());
                            let _ = tx.blocking_send(item);
                        }
                    }
                }
                Err(e) => warn!("Watch error: {}", e),
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch library root: {}", root.display()))?;
        info!("Watching directory: {}", root.display());

        Ok(Self {
            _watcher: watcher,
            items,
        })
    }

    /// Next item touched by a change; None once the watcher is gone
    pub async fn next_item(&mut self) -> Option<String> {
        self.items.recv().await
    }

    /// Move every already-delivered item into `queue`
    fn drain_into(&mut self, queue: &mut DispatchQueue) {
        while let Ok(item) = self.items.try_recv() {
            queue.push(item);
        }
    }
}

fn rescan_timer(period: Option<std::time::Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut timer = tokio::time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    })
}

async fn next_rescan(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Full scan, then triage items as changes arrive. Only returns on a fatal error.
pub async fn run<R: CommandRunner>(mut triage: Triage<R>) -> Result<()> {
    let root = triage.config().library_root.clone();
    // Watch before the first scan so nothing copied in meanwhile is missed
    let mut watcher = LibraryWatcher::start(&root)?;

    triage.scan_library().await.context("Initial library scan aborted")?;

    let mut queue = DispatchQueue::default();
    let mut rescan = rescan_timer(triage.config().rescan_interval());

    loop {
        watcher.drain_into(&mut queue);

        if let Some(item) = queue.pop() {
            dispatch(&mut triage, &item).await?;
            continue;
        }

        tokio::select! {
            received = watcher.next_item() => match received {
                Some(item) => {
                    queue.push(item);
                }
                None => anyhow::bail!("File watcher for {} stopped", root.display()),
            },
            _ = next_rescan(&mut rescan) => {
                info!("Periodic rescan of {}", root.display());
                match triage.list_items() {
                    Ok(items) => {
                        for item in items {
                            queue.push(item);
                        }
                    }
                    Err(e) => warn!("Rescan listing failed: {:#}", e),
                }
            }
        }
    }
}

async fn dispatch<R: CommandRunner>(triage: &mut Triage<R>, item: &str) -> Result<()> {
    let report = match triage.triage_item(item).await {
        Ok(report) => report,
        Err(e) => {
            error!("❌ Stopping: ledger and library may disagree: {:#}", e);
            return Err(e);
        }
    };

    let transcoded = report.transcoded().count();
    let failed = report.failures().count();
    if transcoded > 0 || failed > 0 || !report.recovered.is_empty() {
        info!(
            "{}: {} transcoded, {} recovered, {} failed",
            item,
            transcoded,
            report.recovered.len(),
            failed
        );
    } else {
        debug!("{}: nothing to do", item);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use crate::config::TranscodeConfig;
    use crate::ledger::ledger_path;
    use crate::testing::*;
    use crate::triage::JobError;

    #[test]
    fn test_item_for_path() {
        let root = tempfile::tempdir().unwrap();
        let root = root.path();
        fs::create_dir_all(root.join("Heat/Extras")).unwrap();
        fs::write(root.join("transcode-metadata.json"), "{}").unwrap();

        let item = |p: &str| item_for_path(root, &root.join(p));
        assert_eq!(item("Heat"), Some("Heat".to_string()));
        assert_eq!(item("Heat/Heat.mkv"), Some("Heat".to_string()));
        assert_eq!(item("Heat/Heat.avi-orig"), Some("Heat".to_string()));
        assert_eq!(item("Heat/Extras/Deleted.mkv"), Some("Heat".to_string()));
        assert_eq!(item("Heat/transcoding.lck"), None);
        assert_eq!(item("Heat/transcoding-0f3c.lck"), None);
        assert_eq!(item("Heat/transcode-Heat.mkv"), None);
        assert_eq!(item("transcode-metadata.json"), None);
        assert_eq!(item_for_path(root, root), None);
        assert_eq!(item_for_path(root, Path::new("/elsewhere/Heat/Heat.mkv")), None);
    }

    #[tokio::test]
    async fn test_new_item_directory_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let root = root.path().canonicalize().unwrap();
        let mut watcher = LibraryWatcher::start(&root).unwrap();

        fs::create_dir(root.join("Ronin")).unwrap();

        let item = tokio::time::timeout(Duration::from_secs(10), watcher.next_item())
            .await
            .unwrap();
        assert_eq!(item.as_deref(), Some("Ronin"));
    }

    #[test]
    fn test_drain_dedupes() {
        let (tx, items) = mpsc::channel(8);
        let mut watcher = LibraryWatcher {
            _watcher: RecommendedWatcher::new(|_: notify::Result<Event>| {}, Config::default()).unwrap(),
            items,
        };
        for item in ["Heat", "Ronin", "Heat"] {
            tx.try_send(item.to_string()).unwrap();
        }

        let mut queue = DispatchQueue::default();
        queue.push("Ronin".to_string());
        watcher.drain_into(&mut queue);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().as_deref(), Some("Ronin"));
        assert_eq!(queue.pop().as_deref(), Some("Heat"));
    }

    #[tokio::test]
    async fn test_rescan_retries_until_fatal_error_stops_run() {
        let root = tempfile::tempdir().unwrap();
        let root = root.path().canonicalize().unwrap();
        let dir = item_dir(&root, "Heat");
        sparse(&dir.join("Heat.avi"), 600 * MIB);
        // Ledger writes fail once something gets transcoded
        fs::create_dir(ledger_path(&root)).unwrap();

        // First probe fails, so only a rescan gets Heat transcoded
        let runner = ScriptedRunner::new()
            .probe_failure("Heat.avi")
            .probe("Heat.avi", source_probe(1920, ENGLISH))
            .probe("Heat.mkv", output_probe());
        let cfg = TranscodeConfig {
            rescan_interval_secs: 1,
            ..test_config(&root)
        };

        let started = std::time::Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(30), run(Triage::new(cfg, runner)))
            .await
            .unwrap()
            .unwrap_err();

        assert!(err.downcast_ref::<JobError>().is_some_and(JobError::is_fatal));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(dir.join("Heat.avi-orig").exists());
        assert!(dir.join("Heat.mkv").exists());
    }
}
