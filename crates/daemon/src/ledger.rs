use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::naming::LEDGER_FILE;

/// Outcome of the last completed transcode of one media item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeRecord {
    #[serde(rename = "movie")]
    pub item: String,
    #[serde(rename = "originalFile")]
    pub source_file: String,
    #[serde(rename = "originalCodec")]
    pub source_codec: String,
    #[serde(rename = "originalWidth")]
    pub source_width: u32,
    #[serde(rename = "originalPixFormat")]
    pub source_pix_fmt: String,

    #[serde(rename = "transcodedFile")]
    pub output_file: String,
    #[serde(rename = "transcodedCodec")]
    pub output_codec: String,
    #[serde(rename = "transcodedWidth")]
    pub output_width: u32,
    /// Authoritative "up to date" fingerprint
    #[serde(rename = "transcodedSize")]
    pub output_size: u64,
    #[serde(rename = "transcodedBitrate")]
    pub output_bitrate: String,
    #[serde(rename = "transcodedDuration")]
    pub output_duration: String,
    #[serde(rename = "transcodedSpeed")]
    pub speed: String,
    #[serde(rename = "transcodedCRF")]
    pub crf: u32,
    #[serde(rename = "transcodedAt", skip_serializing_if = "Option::is_none")]
    pub transcoded_at: Option<DateTime<Utc>>,
}

/// Every media item's last record, keyed by item name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    records: BTreeMap<String, TranscodeRecord>,
}

pub fn ledger_path(library_root: &Path) -> PathBuf {
    library_root.join(LEDGER_FILE)
}

impl Ledger {
    /// Load the ledger; a missing or unreadable document is an empty ledger
    pub fn load(library_root: &Path) -> Self {
        let path = ledger_path(library_root);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot read ledger {}: {}; treating every item as unprocessed", path.display(), e);
                }
                return Self::default();
            }
        };

        match serde_json::from_str::<BTreeMap<String, Option<TranscodeRecord>>>(&content) {
            Ok(entries) => Self {
                records: entries
                    .into_iter()
                    .filter_map(|(item, record)| record.map(|r| (item, r)))
                    .collect(),
            },
            Err(e) => {
                warn!("Corrupt ledger {}: {}; treating every item as unprocessed", path.display(), e);
                Self::default()
            }
        }
    }

    /// Re-read the document, put `record` under `item` and write it all back
    pub fn save(library_root: &Path, item: &str, record: TranscodeRecord) -> Result<Self> {
        let mut ledger = Self::load(library_root);
        ledger.records.insert(item.to_string(), record);
        ledger.write(library_root)?;
        debug!("Ledger now holds {} record(s)", ledger.len());
        Ok(ledger)
    }

    fn write(&self, library_root: &Path) -> Result<()> {
        let path = ledger_path(library_root);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&self.records).context("Failed to serialize ledger")?;

        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create ledger temp file: {}", tmp.display()))?;
        file.write_all(&json)
            .and_then(|_| file.write_all(b"\n"))
            .and_then(|_| file.sync_all())
            .with_context(|| format!("Failed to write ledger temp file: {}", tmp.display()))?;
        drop(file);

        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace ledger: {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, item: &str) -> Option<&TranscodeRecord> {
        self.records.get(item)
    }

    /// Whether a file of `current_size` is the recorded output for `item`
    pub fn is_up_to_date(&self, item: &str, current_size: u64) -> bool {
        self.get(item).is_some_and(|r| r.output_size == current_size)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
