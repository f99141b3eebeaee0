use std::path::{Path, PathBuf};
use crate::policy::{self, FileClass};

/// Prefix of in-flight (or failed) transcode output
pub const WORKING_PREFIX: &str = "transcode-";
/// Suffix appended to preserved originals
pub const BACKUP_SUFFIX: &str = "-orig";
/// Lock marker inside each media item directory
pub const LOCK_FILE: &str = "transcoding.lck";
/// Presence-only marker: audio of this item was checked by hand
pub const VERIFIED_ENGLISH_MARKER: &str = "verified-english";
/// Ledger document at the library root
pub const LEDGER_FILE: &str = "transcode-metadata.json";

/// File name without its extension (see [`policy::extension_of`])
pub fn stem_of(file_name: &str) -> &str {
    let ext = policy::extension_of(file_name);
    &file_name[..file_name.len() - ext.len()]
}

/// Whether a file name carries the already-transcoded marker
pub fn is_working_name(file_name: &str) -> bool {
    file_name.starts_with(WORKING_PREFIX)
}

/// Name the source takes once transcoded into `container`
pub fn final_name(source_name: &str, container: &str) -> String {
    format!("{}.{}", stem_of(source_name), container)
}

pub fn working_name(source_name: &str, container: &str) -> String {
    format!("{}{}", WORKING_PREFIX, final_name(source_name, container))
}

pub fn backup_name(source_name: &str) -> String {
    format!("{}{}", source_name, BACKUP_SUFFIX)
}

/// Final name a working output is swapped onto, if `file_name` is one
pub fn final_for_working(file_name: &str) -> Option<&str> {
    file_name.strip_prefix(WORKING_PREFIX).filter(|rest| !rest.is_empty())
}

/// Whether `backup` is a preserved original that was swapped into `final_name`
pub fn is_backup_of(backup: &str, final_name: &str) -> bool {
    if policy::classify_name(backup) != FileClass::OriginalBackup {
        return false;
    }
    let Some(original) = backup.strip_suffix(BACKUP_SUFFIX) else {
        return false;
    };
    policy::classify_name(original).is_eligible() && stem_of(original) == stem_of(final_name)
}

/// Every path involved in replacing one source file with its transcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPlan {
    pub source: PathBuf,
    pub working: PathBuf,
    pub backup: PathBuf,
    pub target: PathBuf,
}

impl SwapPlan {
    pub fn new(dir: &Path, source_name: &str, container: &str) -> Self {
        Self {
            source: dir.join(source_name),
            working: dir.join(working_name(source_name, container)),
            backup: dir.join(backup_name(source_name)),
            target: dir.join(final_name(source_name, container)),
        }
    }

    /// The final name belongs to a different file that already exists
    pub fn clobbers_target(&self) -> bool {
        self.target != self.source && self.target.exists()
    }
}
