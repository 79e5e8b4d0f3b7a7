//! Orphan detection and cleanup for the final directory.
//!
//! An orphan is a managed file no catalog entry refers to. Cleanup never acts
//! on a catalog it cannot parse, never touches the newest files, and only
//! quarantines or deletes when explicitly asked to.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::catalog::{push_bounded, Catalog, CleanupRecord, CLEANUP_HISTORY_CAP};
use crate::error::{CatalogError, Result};
use crate::scan::{list_media, MediaFile};
use crate::store::{CatalogStore, LoadPolicy};

/// Safety filters applied before a file may be called an orphan
#[derive(Debug, Clone)]
pub struct OrphanFilters {
    pub extension: String,
    /// The newest files (overall, and among unreferenced) that are always kept
    pub keep_last_n: usize,
    /// Smaller files are likely truncated writes still in progress
    pub min_bytes: u64,
    /// Only files whose mtime is older than this count
    pub older_than: Option<Duration>,
}

impl Default for OrphanFilters {
    fn default() -> Self {
        Self {
            extension: "mp4".to_string(),
            keep_last_n: 2,
            min_bytes: 500 * 1024,
            older_than: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Orphan {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    DryRun,
    Quarantine,
    Delete,
}

impl CleanupMode {
    /// Resolve the two explicit CLI flags; neither means dry run
    pub fn from_flags(quarantine: bool, delete: bool) -> Self {
        match (quarantine, delete) {
            (true, _) => CleanupMode::Quarantine,
            (false, true) => CleanupMode::Delete,
            (false, false) => CleanupMode::DryRun,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupMode::DryRun => "dry_run",
            CleanupMode::Quarantine => "quarantine",
            CleanupMode::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupCounts {
    pub found: usize,
    pub moved: usize,
    pub deleted: usize,
    pub failed: usize,
    pub bytes: u64,
}

/// Pure selection over an already-listed directory
pub fn select_orphans(
    mut files: Vec<MediaFile>,
    referenced: &HashSet<String>,
    filters: &OrphanFilters,
    now: SystemTime,
) -> Vec<Orphan> {
    // Newest first; ties broken by name so protection is deterministic
    files.sort_by(|a, b| b.mtime.cmp(&a.mtime).then_with(|| a.file_name.cmp(&b.file_name)));

    let mut protected: HashSet<&str> = files.iter().take(filters.keep_last_n).map(|f| f.file_name.as_str()).collect();
    protected.extend(
        files
            .iter()
            .filter(|f| !referenced.contains(&f.file_name))
            .take(filters.keep_last_n)
            .map(|f| f.file_name.as_str()),
    );

    let cutoff = filters.older_than.and_then(|age| now.checked_sub(age));

    files
        .iter()
        .filter(|f| !referenced.contains(&f.file_name))
        .filter(|f| !protected.contains(f.file_name.as_str()))
        .filter(|f| f.size >= filters.min_bytes)
        .filter(|f| cutoff.map_or(true, |c| f.mtime < c))
        .map(|f| Orphan {
            path: f.path.clone(),
            file_name: f.file_name.clone(),
            size: f.size,
            mtime: DateTime::<Utc>::from(f.mtime),
        })
        .collect()
}

/// List `final_dir` and select orphans against `referenced` file names
pub fn find_orphans(
    final_dir: &Path,
    referenced: &HashSet<String>,
    filters: &OrphanFilters,
    now: SystemTime,
) -> anyhow::Result<Vec<Orphan>> {
    let files = list_media(final_dir, &filters.extension)?;
    let total = files.len();
    let orphans = select_orphans(files, referenced, filters, now);
    debug!("{} of {} files in {} are orphans", orphans.len(), total, final_dir.display());
    Ok(orphans)
}

/// `<timestamp>__orphan__<name>` inside the quarantine dir, numbered on collision
fn quarantine_target(quarantine_dir: &Path, file_name: &str, now: DateTime<Utc>) -> PathBuf {
    let stamp = now.format("%Y%m%dT%H%M%SZ");
    let first = quarantine_dir.join(format!("{}__orphan__{}", stamp, file_name));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| quarantine_dir.join(format!("{}__orphan-{}__{}", stamp, n, file_name)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

/// Quarantine or delete each orphan. Per-file failures are counted, not raised.
pub fn reconcile_orphans(orphans: &[Orphan], mode: CleanupMode, quarantine_dir: &Path) -> CleanupCounts {
    let mut counts = CleanupCounts { found: orphans.len(), ..CleanupCounts::default() };
    if mode == CleanupMode::DryRun {
        for orphan in orphans {
            info!("[dry-run] would clean {} ({} bytes)", orphan.path.display(), orphan.size);
        }
        return counts;
    }

    if mode == CleanupMode::Quarantine {
        if let Err(e) = fs::create_dir_all(quarantine_dir) {
            warn!("Cannot create quarantine dir {}: {}", quarantine_dir.display(), e);
            counts.failed = orphans.len();
            return counts;
        }
    }

    let now = Utc::now();
    for orphan in orphans {
        let outcome = match mode {
            CleanupMode::Quarantine => {
                let target = quarantine_target(quarantine_dir, &orphan.file_name, now);
                fs::rename(&orphan.path, &target).map(|_| {
                    info!("Quarantined {} -> {}", orphan.path.display(), target.display());
                    counts.moved += 1;
                })
            }
            CleanupMode::Delete => fs::remove_file(&orphan.path).map(|_| {
                info!("Deleted orphan {}", orphan.path.display());
                counts.deleted += 1;
            }),
            CleanupMode::DryRun => Ok(()),
        };
        match outcome {
            Ok(()) => counts.bytes += orphan.size,
            Err(e) => {
                warn!("Failed to clean {}: {}", orphan.path.display(), e);
                counts.failed += 1;
            }
        }
    }
    counts
}

/// Inputs of one cleanup pass
#[derive(Debug, Clone)]
pub struct CleanupRequest {
    pub final_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub filters: OrphanFilters,
    pub mode: CleanupMode,
    /// Move entries whose file is confirmed missing into `dangling_items`
    pub mark_dangling: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub mode: CleanupMode,
    pub orphans: Vec<Orphan>,
    pub counts: CleanupCounts,
    /// Live entries whose file is gone
    pub dangling_observed: Vec<String>,
    pub dangling_marked: usize,
}

/// Only NotFound counts; permission errors and the like prove nothing
fn confirmed_missing(path: &Path) -> bool {
    matches!(fs::metadata(path), Err(e) if e.kind() == ErrorKind::NotFound)
}

/// Keys of live entries whose file is confirmed absent
pub fn detect_dangling(catalog: &Catalog) -> Vec<String> {
    catalog
        .items
        .iter()
        .filter(|(_, entry)| confirmed_missing(&catalog.resolve_path(&entry.path)))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Move confirmed-missing entries to `dangling_items`; returns how many moved
fn mark_dangling(catalog: &mut Catalog, keys: &[String], now: DateTime<Utc>) -> usize {
    let mut moved = 0;
    for key in keys {
        // Re-confirm right before the move; the file may have come back
        let still_missing = catalog
            .items
            .get(key)
            .is_some_and(|e| confirmed_missing(&catalog.resolve_path(&e.path)));
        if !still_missing {
            continue;
        }
        if let Some(mut entry) = catalog.items.remove(key) {
            entry.mark_dangling("missing_file", now);
            info!("Marked {} dangling ({} is missing)", key, entry.path.display());
            catalog.dangling_items.insert(key.clone(), entry);
            moved += 1;
        }
    }
    moved
}

/// One full cleanup pass against the catalog.
///
/// Refuses to run when the catalog is corrupt. The catalog lock is held from
/// the referenced-name snapshot until the history write, so no file can be
/// published into `final_dir` while the pass decides what is unreferenced.
/// History is appended after the file operations, and only when something
/// was moved or deleted; a failure to persist it is logged and ignored.
pub fn cleanup(store: &CatalogStore, req: &CleanupRequest) -> Result<CleanupReport> {
    let _lock = store.lock()?;
    let mut catalog = store.load(LoadPolicy::Strict)?;
    let referenced = catalog.referenced_names();
    let dangling_observed = detect_dangling(&catalog);
    if !dangling_observed.is_empty() {
        warn!("{} catalog entries point at missing files", dangling_observed.len());
    }

    let orphans = find_orphans(&req.final_dir, &referenced, &req.filters, SystemTime::now())
        .map_err(|e| CatalogError::Scan { dir: req.final_dir.clone(), message: format!("{:#}", e) })?;

    let mut dangling_marked = 0;
    if req.mark_dangling && req.mode != CleanupMode::DryRun && !dangling_observed.is_empty() {
        dangling_marked = mark_dangling(&mut catalog, &dangling_observed, Utc::now());
        if dangling_marked > 0 {
            store.write(&mut catalog)?;
        }
    }

    let counts = reconcile_orphans(&orphans, req.mode, &req.quarantine_dir);
    info!(
        "Cleanup ({}): {} orphans, {} moved, {} deleted, {} failed, {} dangling",
        req.mode.as_str(),
        counts.found,
        counts.moved,
        counts.deleted,
        counts.failed,
        dangling_observed.len()
    );

    if req.mode != CleanupMode::DryRun && counts.moved + counts.deleted > 0 {
        let record = CleanupRecord {
            event_id: Uuid::new_v4(),
            at: Utc::now(),
            mode: req.mode.as_str().to_string(),
            found: counts.found,
            moved: counts.moved,
            deleted: counts.deleted,
            failed: counts.failed,
            dangling_observed: dangling_observed.len(),
        };
        push_bounded(&mut catalog.meta_info.cleanup_history, record, CLEANUP_HISTORY_CAP);
        if let Err(e) = store.write(&mut catalog) {
            warn!("Could not record cleanup history: {}", e);
        }
    }

    Ok(CleanupReport { mode: req.mode, orphans, counts, dangling_observed, dangling_marked })
}
