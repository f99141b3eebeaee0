//! Cross-process mutual exclusion built from plain files.
//!
//! No advisory locking is assumed to work on the filesystems the library
//! lives on, so a lock is a marker file holding the owner's pid. The marker
//! is published with an exclusive link of a uniquely named temp file and
//! the owner is read back after a short grace delay to catch racers on
//! filesystems where that publish is not truly exclusive.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, warn};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock is held by pid {owner}")]
    OwnerMismatch { owner: u32 },
    #[error("lock file vanished right after creation: {}", .0.display())]
    MissingAfterCreate(PathBuf),
    #[error("lock file does not contain a pid: {}", .0.display())]
    CorruptOwner(PathBuf),
    /// Only reported when reclaiming dead owners is enabled
    #[error("lock is held by pid {owner}, which is no longer running")]
    DeadOwner { owner: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Lock marker at a fixed path, acquired on behalf of one owner id
#[derive(Debug, Clone)]
pub struct ProcessLock {
    path: PathBuf,
    owner: u32,
    grace: Duration,
    reclaim_dead: bool,
}

/// Held lock; the marker is removed on [`LockGuard::release`] or drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    reentrant: bool,
    released: bool,
}

impl ProcessLock {
    /// Lock owned by the current process
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_owner(path, std::process::id())
    }

    pub fn with_owner(path: impl Into<PathBuf>, owner: u32) -> Self {
        Self {
            path: path.into(),
            owner,
            grace: Duration::from_millis(100),
            reclaim_dead: false,
        }
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Remove markers left by processes that no longer exist on this host
    pub fn reclaim_dead_owners(mut self, reclaim: bool) -> Self {
        self.reclaim_dead = reclaim;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(&self) -> Result<LockGuard, LockError> {
        match self.try_acquire().await {
            Err(LockError::DeadOwner { owner }) if self.reclaim_dead => {
                self.remove_stale(owner)?;
                self.try_acquire().await
            }
            other => other,
        }
    }

    async fn try_acquire(&self) -> Result<LockGuard, LockError> {
        let tmp = self.write_temp()?;

        if self.path.exists() {
            remove_if_present(&tmp)?;
            return self.check_existing();
        }

        match fs::hard_link(&tmp, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race to another creator
                remove_if_present(&tmp)?;
                return self.check_existing();
            }
            Err(e) => {
                // No hard links here: plain rename, verified below
                debug!("hard link unsupported for {} ({}), falling back to rename", self.path.display(), e);
                if let Err(e) = fs::rename(&tmp, &self.path) {
                    remove_if_present(&tmp)?;
                    return Err(e.into());
                }
            }
        }
        remove_if_present(&tmp)?;

        if let Err(e) = fs::metadata(&self.path) {
            return Err(if e.kind() == io::ErrorKind::NotFound {
                LockError::MissingAfterCreate(self.path.clone())
            } else {
                e.into()
            });
        }

        tokio::time::sleep(self.grace).await;

        let owner = self.read_owner()?;
        if owner != self.owner {
            return Err(LockError::OwnerMismatch { owner });
        }

        Ok(LockGuard {
            path: self.path.clone(),
            reentrant: false,
            released: false,
        })
    }

    /// Take the marker out of play, but only delete it if it still names
    /// `dead`: a racer may have reclaimed it and published its own meanwhile.
    fn remove_stale(&self, dead: u32) -> Result<(), LockError> {
        let aside = temp_path_for(&self.path);
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            // Someone else already reclaimed it
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let owner = fs::read_to_string(&aside)
            .ok()
            .and_then(|c| c.trim().parse::<u32>().ok());
        if owner == Some(dead) {
            warn!("Reclaiming stale lock {} left by dead pid {}", self.path.display(), dead);
            remove_if_present(&aside)?;
            return Ok(());
        }

        // Not the marker we judged dead: put it back unless yet another one appeared
        let restored = fs::hard_link(&aside, &self.path);
        remove_if_present(&aside)?;
        match restored {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        match owner {
            Some(owner) => Err(LockError::OwnerMismatch { owner }),
            None => Err(LockError::CorruptOwner(self.path.clone())),
        }
    }

    fn write_temp(&self) -> Result<PathBuf, LockError> {
        let tmp = temp_path_for(&self.path);
        let mut file = fs::File::create(&tmp)?;
        let written = writeln!(file, "{}", self.owner).and_then(|_| file.sync_all());
        if let Err(e) = written {
            drop(file);
            remove_if_present(&tmp)?;
            return Err(e.into());
        }
        Ok(tmp)
    }

    fn check_existing(&self) -> Result<LockGuard, LockError> {
        let owner = self.read_owner()?;
        if owner == self.owner {
            // Same owner already holds it; a missed release upstream looks identical.
            debug!("Re-entering lock {} held by pid {}", self.path.display(), owner);
            return Ok(LockGuard {
                path: self.path.clone(),
                reentrant: true,
                released: false,
            });
        }
        if self.reclaim_dead && !process_alive(owner) {
            return Err(LockError::DeadOwner { owner });
        }
        Err(LockError::OwnerMismatch { owner })
    }

    fn read_owner(&self) -> Result<u32, LockError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LockError::MissingAfterCreate(self.path.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        content
            .trim()
            .parse()
            .map_err(|_| LockError::CorruptOwner(self.path.clone()))
    }
}

impl LockGuard {
    /// True when the marker already named this owner before acquisition
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the marker. Deleting an absent marker is not an error.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        remove_if_present(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = remove_if_present(&self.path) {
                warn!("Failed to release lock {}: {}", self.path.display(), e);
            }
        }
    }
}

/// `transcoding.lck` -> `transcoding-<uuid>.lck`, same directory
fn temp_path_for(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("lock");
    let name = match path.extension().and_then(|s| s.to_str()) {
        Some(ext) => format!("{}-{}.{}", stem, Uuid::new_v4().simple(), ext),
        None => format!("{}-{}", stem, Uuid::new_v4().simple()),
    };
    path.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn process_alive(pid: u32) -> bool {
    let system = sysinfo::System::new_all();
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(path: &Path, owner: u32) -> ProcessLock {
        ProcessLock::with_owner(path, owner).grace(Duration::from_millis(5))
    }

    fn leftover_temps(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n != "transcoding.lck")
            .collect()
    }

    #[tokio::test]
    async fn test_acquire_writes_pid_and_release_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");

        let guard = quick(&path, 4242).acquire().await.unwrap();
        assert!(!guard.is_reentrant());
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242\n");
        assert!(leftover_temps(dir.path()).is_empty());

        guard.release().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");
        {
            let _guard = quick(&path, 7).acquire().await.unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_release_of_absent_marker_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");
        let guard = quick(&path, 7).acquire().await.unwrap();
        fs::remove_file(&path).unwrap();
        assert!(guard.release().is_ok());
    }

    #[tokio::test]
    async fn test_other_live_owner_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");
        let holder = std::process::id();
        fs::write(&path, format!("{}\n", holder)).unwrap();

        let err = quick(&path, holder.wrapping_add(1)).acquire().await.unwrap_err();
        assert!(matches!(err, LockError::OwnerMismatch { owner } if owner == holder));
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", holder));
        assert!(leftover_temps(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_same_owner_reenters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");

        let first = quick(&path, 99).acquire().await.unwrap();
        let second = quick(&path, 99).acquire().await.unwrap();
        assert!(second.is_reentrant());

        drop(second);
        assert!(!path.exists(), "re-entrant guard removes the shared marker");
        first.release().unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");
        fs::write(&path, "not a pid").unwrap();

        let err = quick(&path, 1).acquire().await.unwrap_err();
        assert!(matches!(err, LockError::CorruptOwner(_)));
    }

    #[tokio::test]
    async fn test_dead_owner_reclaimed_only_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");
        // Above the Linux pid_max ceiling, never a live process
        let dead = 4_194_304 + 17;
        fs::write(&path, format!("{}\n", dead)).unwrap();

        let err = quick(&path, 5).acquire().await.unwrap_err();
        assert!(matches!(err, LockError::OwnerMismatch { owner } if owner == dead));

        let guard = quick(&path, 5).reclaim_dead_owners(true).acquire().await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "5\n");
        guard.release().unwrap();
    }

    #[test]
    fn test_stale_removal_spares_a_replacement_marker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");
        let dead = 4_194_304 + 17;
        let lock = quick(&path, 5).reclaim_dead_owners(true);

        // Another process reclaimed the dead marker and now holds the lock
        fs::write(&path, "12\n").unwrap();
        let err = lock.remove_stale(dead).unwrap_err();
        assert!(matches!(err, LockError::OwnerMismatch { owner: 12 }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "12\n");
        assert!(leftover_temps(dir.path()).is_empty());

        // The marker still names the dead pid
        fs::write(&path, format!("{}\n", dead)).unwrap();
        lock.remove_stale(dead).unwrap();
        assert!(!path.exists());
        assert!(leftover_temps(dir.path()).is_empty());

        // Already reclaimed by someone else and released
        lock.remove_stale(dead).unwrap();
    }

    #[tokio::test]
    async fn test_new_uses_process_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcoding.lck");
        let guard = ProcessLock::new(&path).grace(Duration::from_millis(5)).acquire().await.unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", std::process::id()));
        guard.release().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_attempts_have_one_winner() {
        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("transcoding.lck");

            let attempts: Vec<_> = (1..=4u32)
                .map(|owner| {
                    let lock = quick(&path, owner);
                    tokio::spawn(async move { lock.acquire().await.map(|g| (owner, g)) })
                })
                .collect();

            let mut winners = Vec::new();
            let mut guards = Vec::new();
            for attempt in attempts {
                if let Ok((owner, guard)) = attempt.await.unwrap() {
                    winners.push(owner);
                    guards.push(guard);
                }
            }
            assert_eq!(winners.len(), 1, "winners: {:?}", winners);
            assert_eq!(fs::read_to_string(&path).unwrap(), format!("{}\n", winners[0]));
        }
    }
}
