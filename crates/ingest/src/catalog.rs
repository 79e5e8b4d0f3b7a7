//! Persisted catalog schema.
//!
//! The catalog maps sha8 keys to [`CatalogEntry`] records. Entries whose file
//! was confirmed missing live in `dangling_items` until resurrected. Keys the
//! schema does not know about are kept in `extra` maps so a load/write cycle
//! never drops fields written by other tools.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ffprobe::ProbeFacts;

pub const CATALOG_VERSION: u32 = 2;

pub const CLEANUP_HISTORY_CAP: usize = 10;
pub const RESURRECT_HISTORY_CAP: usize = 10;
pub const SCORE_HISTORY_CAP: usize = 50;

fn current_version() -> u32 {
    CATALOG_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub items: BTreeMap<String, CatalogEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dangling_items: BTreeMap<String, CatalogEntry>,
    #[serde(default)]
    pub meta_info: MetaInfo,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION,
            items: BTreeMap::new(),
            dangling_items: BTreeMap::new(),
            meta_info: MetaInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_root: Option<PathBuf>,
    #[serde(default)]
    pub cleanup_history: Vec<CleanupRecord>,
    #[serde(default)]
    pub resurrect_history: Vec<ResurrectRecord>,
    #[serde(default)]
    pub score_history: Vec<ScoreRecord>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One validated asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub run_id: String,
    pub segment_id: String,
    /// Full identity hash the key was derived from
    pub identity_sha256: String,
    pub path: PathBuf,
    pub duration: f64,
    pub bitrate_bps: u64,
    pub video_codec: String,
    pub audio_codec: String,
    pub file_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_mtime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<QualityScore>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dangling_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dangling_reason: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Reviewer verdict attached to an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub visual: u8,
    pub audio: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<String>,
    pub scored_at: DateTime<Utc>,
}

/// Host identity stamped on audit records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvFingerprint {
    pub host: String,
    pub pid: u32,
    pub os: String,
}

impl EnvFingerprint {
    pub fn capture() -> Self {
        Self {
            host: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            pid: std::process::id(),
            os: sysinfo::System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub event_id: Uuid,
    pub at: DateTime<Utc>,
    pub mode: String,
    pub found: usize,
    pub moved: usize,
    pub deleted: usize,
    pub failed: usize,
    pub dangling_observed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResurrectRecord {
    pub event_id: Uuid,
    pub at: DateTime<Utc>,
    pub apply: bool,
    pub limit: usize,
    pub examined: usize,
    pub eligible: usize,
    pub restored: usize,
    pub deferred: usize,
    pub rejected: BTreeMap<String, usize>,
    pub env: EnvFingerprint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub at: DateTime<Utc>,
    pub key: String,
    pub visual: u8,
    pub audio: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scorer: Option<String>,
}

/// Append `item` and drop the oldest records beyond `cap`
pub fn push_bounded<T>(history: &mut Vec<T>, item: T, cap: usize) {
    history.push(item);
    truncate_oldest(history, cap);
}

fn truncate_oldest<T>(history: &mut Vec<T>, cap: usize) {
    if history.len() > cap {
        let excess = history.len() - cap;
        history.drain(..excess);
    }
}

impl Catalog {
    /// Trim every history ring buffer to its cap
    pub fn enforce_history_bounds(&mut self) {
        truncate_oldest(&mut self.meta_info.cleanup_history, CLEANUP_HISTORY_CAP);
        truncate_oldest(&mut self.meta_info.resurrect_history, RESURRECT_HISTORY_CAP);
        truncate_oldest(&mut self.meta_info.score_history, SCORE_HISTORY_CAP);
    }

    /// Resolve a recorded path: relative paths hang off `state_root`
    pub fn resolve_path(&self, recorded: &Path) -> PathBuf {
        match &self.meta_info.state_root {
            Some(root) if recorded.is_relative() => root.join(recorded),
            _ => recorded.to_path_buf(),
        }
    }

    /// File names referenced by live and dangling entries
    pub fn referenced_names(&self) -> std::collections::HashSet<String> {
        self.items
            .values()
            .chain(self.dangling_items.values())
            .filter_map(|e| e.file_name().map(str::to_string))
            .collect()
    }
}

impl CatalogEntry {
    /// Build a fresh entry from a validated probe
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: &str,
        segment_id: &str,
        identity_sha256: &str,
        path: &Path,
        duration: f64,
        bitrate_bps: u64,
        video_codec: &str,
        audio_codec: &str,
        file_bytes: u64,
        file_mtime: Option<f64>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            segment_id: segment_id.to_string(),
            identity_sha256: identity_sha256.to_ascii_lowercase(),
            path: path.to_path_buf(),
            duration,
            bitrate_bps,
            video_codec: video_codec.to_string(),
            audio_codec: audio_codec.to_string(),
            file_bytes,
            file_mtime,
            created_at: Some(Utc::now()),
            refreshed_at: None,
            restored_at: None,
            score: None,
            dangling_since: None,
            dangling_reason: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// Same identity and same file name: a re-ingest rather than a collision
    pub fn same_asset(&self, other: &CatalogEntry) -> bool {
        self.identity_sha256.eq_ignore_ascii_case(&other.identity_sha256) && self.file_name() == other.file_name()
    }

    /// Overwrite exactly the probe-derived fields and the refresh stamp.
    ///
    /// Probe fields the report left empty keep their previous value; every
    /// other field (ids, score, lifecycle stamps, unknown keys) is untouched.
    pub fn apply_probe(&mut self, facts: &ProbeFacts, file_bytes: u64, file_mtime: f64, now: DateTime<Utc>) {
        if let Some(duration) = facts.duration {
            self.duration = duration;
        }
        if let Some(bitrate) = facts.bitrate_bps {
            self.bitrate_bps = bitrate;
        }
        if let Some(codec) = &facts.video_codec {
            self.video_codec = codec.clone();
        }
        if let Some(codec) = &facts.audio_codec {
            self.audio_codec = codec.clone();
        }
        self.file_bytes = file_bytes;
        self.file_mtime = Some(file_mtime);
        self.refreshed_at = Some(now);
    }

    /// Stamp the entry as dangling
    pub fn mark_dangling(&mut self, reason: &str, now: DateTime<Utc>) {
        if self.dangling_since.is_none() {
            self.dangling_since = Some(now);
        }
        self.dangling_reason = Some(reason.to_string());
    }

    /// Remove the dangling-only fields and stamp the restoration
    pub fn clear_dangling(&mut self, now: DateTime<Utc>) {
        self.dangling_since = None;
        self.dangling_reason = None;
        self.extra.remove("dangling_since");
        self.extra.remove("dangling_reason");
        self.restored_at = Some(now);
    }
}

#[cfg(test)]
pub(crate) fn sample_entry(key: &str, path: &Path) -> CatalogEntry {
    let identity = format!("{}{}", key, "0".repeat(56));
    CatalogEntry::new("run-1", "seg-1", &identity, path, 12.0, 4_000_000, "h264", "aac", 2_100_000, None)
}
