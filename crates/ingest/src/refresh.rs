//! Re-probe final files whose modification time moved since the last probe.
//!
//! Probing happens without the lock; the results are merged in one locked
//! read-modify-write at the end so a slow ffprobe never blocks other writers.

use std::path::{Path, PathBuf};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{CatalogError, Result};
use crate::ffprobe::{ProbeFacts, Prober};
use crate::identity::key_for_file_name;
use crate::scan::{list_media, MediaFile};
use crate::store::{CatalogStore, LoadPolicy};

#[derive(Debug, Clone)]
pub struct RefreshOptions {
    /// Re-probe even when the recorded mtime matches
    pub force: bool,
    pub extension: String,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self { force: false, extension: "mp4".to_string() }
    }
}

/// A file whose key belongs to an entry recorded under another file name
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyMismatch {
    pub key: String,
    pub file: PathBuf,
    pub recorded: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshStats {
    pub scanned: usize,
    pub probed: usize,
    pub skipped_unchanged: usize,
    pub updated: usize,
    pub untracked: usize,
    pub probe_failed: usize,
    pub mismatches: Vec<KeyMismatch>,
}

/// Float seconds can lose their last bits through JSON
fn same_mtime(recorded: f64, current: f64) -> bool {
    (recorded - current).abs() < 1e-6
}

struct Probed {
    key: String,
    file: MediaFile,
    facts: ProbeFacts,
}

/// Walk `final_dir`, re-probe changed files and merge the probe-derived fields.
pub async fn refresh<P: Prober>(
    prober: &P,
    store: &CatalogStore,
    final_dir: &Path,
    opts: &RefreshOptions,
) -> Result<RefreshStats> {
    let files = list_media(final_dir, &opts.extension)
        .map_err(|e| CatalogError::Scan { dir: final_dir.to_path_buf(), message: format!("{:#}", e) })?;
    let snapshot = store.load(LoadPolicy::Lenient)?;

    let mut stats = RefreshStats { scanned: files.len(), ..RefreshStats::default() };
    let mut probed = Vec::new();

    for file in files {
        let key = key_for_file_name(&file.file_name);
        let Some(entry) = snapshot.items.get(&key) else {
            debug!("{} has no catalog entry, leaving it alone", file.file_name);
            stats.untracked += 1;
            continue;
        };
        if entry.file_name() != Some(file.file_name.as_str()) {
            warn!(
                "Key {} of {} belongs to {}, skipping",
                key,
                file.path.display(),
                entry.path.display()
            );
            stats.mismatches.push(KeyMismatch { key, file: file.path.clone(), recorded: entry.path.clone() });
            continue;
        }
        if !opts.force && entry.file_mtime.is_some_and(|recorded| same_mtime(recorded, file.mtime_secs())) {
            stats.skipped_unchanged += 1;
            continue;
        }

        stats.probed += 1;
        match prober.probe(&file.path).await {
            Ok(facts) => probed.push(Probed { key, file, facts }),
            Err(e) => {
                warn!("Probe failed for {}: {}", file.path.display(), e);
                stats.probe_failed += 1;
            }
        }
    }

    if !probed.is_empty() {
        let now = Utc::now();
        stats.updated = store
            .update_async(LoadPolicy::Lenient, |catalog| {
                let mut updated = 0;
                for p in &probed {
                    // The entry may have been removed or replaced while we probed
                    match catalog.items.get_mut(&p.key) {
                        Some(entry) if entry.file_name() == Some(p.file.file_name.as_str()) => {
                            entry.apply_probe(&p.facts, p.file.size, p.file.mtime_secs(), now);
                            updated += 1;
                        }
                        _ => debug!("Entry {} changed during refresh, dropping its probe", p.key),
                    }
                }
                Ok(updated)
            })
            .await?;
    }

    info!(
        "Refresh of {}: {} scanned, {} probed, {} updated, {} unchanged, {} untracked, {} failed, {} mismatched",
        final_dir.display(),
        stats.scanned,
        stats.probed,
        stats.updated,
        stats.skipped_unchanged,
        stats.untracked,
        stats.probe_failed,
        stats.mismatches.len()
    );
    Ok(stats)
}
