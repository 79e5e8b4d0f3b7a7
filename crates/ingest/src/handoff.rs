//! Staging → validation → final handoff for one incoming asset.
//!
//! An asset only becomes visible at its final path after it validated in
//! staging. Every failure leaves the file wherever it got to (source, staging)
//! for manual inspection; nothing on this path deletes an asset.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{error, info, warn};

use crate::catalog::CatalogEntry;
use crate::error::CatalogError;
use crate::ffprobe::Prober;
use crate::identity::sha8;
use crate::scan::mtime_secs;
use crate::sidecar;
use crate::stability::{wait_stable, StabilityOptions};
use crate::store::{CatalogStore, LoadPolicy};
use crate::validate::{validate_with_retry, FailReason, ProbeResult, ValidationRules};

/// One asset to hand off
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub source: PathBuf,
    pub final_path: PathBuf,
    pub run_id: String,
    pub segment_id: String,
    /// Full identity hash; its first eight hex characters become the catalog key
    pub identity_sha256: String,
    pub target_duration: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct HandoffOptions {
    pub staging_dir: PathBuf,
    pub stability: StabilityOptions,
    pub rules: ValidationRules,
    /// Validation attempts, counting the first
    pub attempts: u32,
    pub backoff: Duration,
}

/// Staging location for a final path: same file name, inside the staging dir
pub fn staging_path_for(staging_dir: &Path, final_path: &Path) -> Option<PathBuf> {
    final_path.file_name().map(|name| staging_dir.join(name))
}

/// Move `from` to `to`, failing with `AlreadyExists` instead of replacing `to`.
///
/// The hard link claims the destination atomically. Where linking is not
/// possible (cross-device, no hard links) the existence check and rename are
/// separate steps.
fn move_no_clobber(from: &Path, to: &Path) -> io::Result<()> {
    match fs::hard_link(from, to) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(from) {
                // Leave exactly one copy behind
                let _ = fs::remove_file(to);
                return Err(e);
            }
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
        Err(e) if fs::symlink_metadata(to).is_ok() => {
            Err(io::Error::new(ErrorKind::AlreadyExists, format!("{} already exists ({})", to.display(), e)))
        }
        Err(_) => fs::rename(from, to),
    }
}

/// Run the whole handoff for `req`.
pub async fn handoff<P: Prober>(
    prober: &P,
    store: &CatalogStore,
    req: &HandoffRequest,
    opts: &HandoffOptions,
) -> ProbeResult {
    let Some(key) = sha8(&req.identity_sha256) else {
        return ProbeResult::new(&req.source).fail(
            FailReason::InvalidIdentity,
            format!("identity hash {:?} has no 8-character hex prefix", req.identity_sha256),
        );
    };

    info!("Handoff {}: waiting for {} to settle", key, req.source.display());
    if !wait_stable(&req.source, &opts.stability).await {
        warn!("Handoff {}: {} never stabilized within {:?}", key, req.source.display(), opts.stability.timeout);
        return ProbeResult::new(&req.source).fail(
            FailReason::DownloadNeverStabilized,
            format!("not stable within {:?}", opts.stability.timeout),
        );
    }

    let Some(staging) = staging_path_for(&opts.staging_dir, &req.final_path) else {
        return ProbeResult::new(&req.source)
            .fail(FailReason::StagingMoveFailed, format!("final path {} has no file name", req.final_path.display()));
    };
    if let Err(e) = fs::create_dir_all(&opts.staging_dir).and_then(|_| move_no_clobber(&req.source, &staging)) {
        error!("Handoff {}: staging move {} -> {} failed: {}", key, req.source.display(), staging.display(), e);
        return ProbeResult::new(&req.source).fail(FailReason::StagingMoveFailed, e.to_string());
    }
    info!("Handoff {}: staged at {}", key, staging.display());

    let mut result =
        validate_with_retry(prober, &staging, req.target_duration, &opts.rules, opts.attempts, opts.backoff).await;
    if !result.ok {
        let reason = result.reason.map(|r| r.as_str()).unwrap_or("unknown");
        warn!("Handoff {}: validation failed with {}, leaving {} in staging", key, reason, staging.display());
        if let Err(e) = sidecar::write_why_txt(&staging, reason, result.detail.as_deref()) {
            warn!("Handoff {}: {}", key, e);
        }
        return result;
    }

    match commit(store, req, &key, &staging, &result).await {
        Ok(()) => {
            info!("Handoff {}: ✅ committed {}", key, req.final_path.display());
            result.path = req.final_path.clone();
            result.key = Some(key);
            result
        }
        Err((reason, detail)) => {
            error!("Handoff {}: {} ({})", key, reason, detail);
            if let Err(e) = sidecar::write_why_txt(&staging, reason.as_str(), Some(&detail)) {
                warn!("Handoff {}: {}", key, e);
            }
            result.fail(reason, detail)
        }
    }
}

/// Under the catalog lock: conflict check, final rename, catalog write.
///
/// The final path is never overwritten, except by a re-ingest of the asset
/// the catalog already records there. A failed catalog write moves the file
/// back into staging so that a final file always has an entry.
async fn commit(
    store: &CatalogStore,
    req: &HandoffRequest,
    key: &str,
    staging: &Path,
    validated: &ProbeResult,
) -> Result<(), (FailReason, String)> {
    let catalog_failure = |e: CatalogError| match e {
        CatalogError::LockTimeout { .. } => (FailReason::LockTimeout, e.to_string()),
        CatalogError::Conflict { .. } => (FailReason::Conflict, e.to_string()),
        other => (FailReason::CatalogWriteFailed, other.to_string()),
    };

    let _lock = store.lock_async().await.map_err(catalog_failure)?;
    let mut catalog = store.load(LoadPolicy::Lenient).map_err(catalog_failure)?;

    let mtime = fs::metadata(staging).and_then(|m| m.modified()).ok().map(mtime_secs);
    let mut entry = CatalogEntry::new(
        &req.run_id,
        &req.segment_id,
        &req.identity_sha256,
        &req.final_path,
        validated.duration.unwrap_or_default(),
        validated.bitrate_bps.unwrap_or_default(),
        validated.video_codec.as_deref().unwrap_or_default(),
        validated.audio_codec.as_deref().unwrap_or_default(),
        validated.file_bytes.unwrap_or_default(),
        mtime,
    );

    let mut replaces_own_file = false;
    if let Some(existing) = catalog.items.get(key) {
        if !existing.same_asset(&entry) {
            return Err(catalog_failure(CatalogError::Conflict { key: key.to_string() }));
        }
        replaces_own_file = catalog.resolve_path(&existing.path) == req.final_path;
        // Re-ingest of the same asset keeps everything callers attached to it
        let mut merged = existing.clone();
        merged.run_id = entry.run_id;
        merged.segment_id = entry.segment_id;
        merged.path = entry.path;
        merged.duration = entry.duration;
        merged.bitrate_bps = entry.bitrate_bps;
        merged.video_codec = entry.video_codec;
        merged.audio_codec = entry.audio_codec;
        merged.file_bytes = entry.file_bytes;
        merged.file_mtime = entry.file_mtime;
        merged.refreshed_at = entry.created_at;
        entry = merged;
    }

    if let Some(parent) = req.final_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            return Err((FailReason::FinalMoveFailed, e.to_string()));
        }
    }
    let moved = if replaces_own_file {
        fs::rename(staging, &req.final_path)
    } else {
        move_no_clobber(staging, &req.final_path)
    };
    moved.map_err(|e| (FailReason::FinalMoveFailed, format!("{}: {}", req.final_path.display(), e)))?;

    catalog.items.insert(key.to_string(), entry);
    if let Err(e) = store.write(&mut catalog) {
        if let Err(back) = fs::rename(&req.final_path, staging) {
            error!(
                "Catalog write failed and {} could not be moved back to staging: {}",
                req.final_path.display(),
                back
            );
        }
        return Err(catalog_failure(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{sample_entry, Catalog};
    use crate::test_support::{scenario_facts, write_sized, FakeProber};

    const IDENTITY: &str = "aabbccdd11223344556677889900aabbccddeeff00112233445566778899aabb";

    struct Layout {
        _root: tempfile::TempDir,
        incoming: PathBuf,
        staging: PathBuf,
        final_dir: PathBuf,
        store: CatalogStore,
    }

    fn layout() -> Layout {
        let root = tempfile::tempdir().unwrap();
        let incoming = root.path().join("downloads");
        fs::create_dir_all(&incoming).unwrap();
        let staging = root.path().join("staging");
        let final_dir = root.path().join("final");
        let store = CatalogStore::new(root.path().join("index.json")).with_lock_timeout(Duration::from_millis(200));
        Layout { incoming, staging, final_dir, store, _root: root }
    }

    fn options(l: &Layout) -> HandoffOptions {
        HandoffOptions {
            staging_dir: l.staging.clone(),
            stability: StabilityOptions {
                timeout: Duration::from_secs(2),
                interval: Duration::from_millis(10),
                cycles: 3,
            },
            rules: ValidationRules::default(),
            attempts: 3,
            backoff: Duration::from_millis(1),
        }
    }

    fn request(l: &Layout, source: PathBuf) -> HandoffRequest {
        HandoffRequest {
            source,
            final_path: l.final_dir.join("run7_seg3_aabbccdd.mp4"),
            run_id: "run7".to_string(),
            segment_id: "3".to_string(),
            identity_sha256: IDENTITY.to_string(),
            target_duration: Some(12.0),
        }
    }

    #[tokio::test]
    async fn test_valid_export_is_promoted_and_cataloged() {
        let l = layout();
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source.clone());

        let result = handoff(&FakeProber::always(scenario_facts(12.02)), &l.store, &req, &options(&l)).await;

        assert!(result.ok, "{:?}", result);
        assert_eq!(result.key.as_deref(), Some("aabbccdd"));
        assert!(req.final_path.exists());
        assert!(!source.exists());
        assert!(!l.staging.join("run7_seg3_aabbccdd.mp4").exists());

        let catalog = l.store.load(LoadPolicy::Strict).unwrap();
        assert_eq!(catalog.items.len(), 1);
        let entry = &catalog.items["aabbccdd"];
        assert_eq!(entry.path, req.final_path);
        assert_eq!(entry.duration, 12.02);
        assert_eq!(entry.bitrate_bps, 4_000_000);
        assert_eq!(entry.file_bytes, 2_100_000);
        assert_eq!(entry.identity_sha256, IDENTITY);
        assert!(entry.file_mtime.is_some());
    }

    #[tokio::test]
    async fn test_duration_mismatch_stays_in_staging() {
        let l = layout();
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source);

        let result = handoff(&FakeProber::always(scenario_facts(13.0)), &l.store, &req, &options(&l)).await;

        assert_eq!(result.reason, Some(FailReason::DurationMismatch));
        let staged = l.staging.join("run7_seg3_aabbccdd.mp4");
        assert!(staged.exists());
        assert!(l.staging.join("run7_seg3_aabbccdd.why.txt").exists());
        assert!(!req.final_path.exists());
        assert!(!l.store.path().exists());
    }

    #[tokio::test]
    async fn test_missing_source_never_stabilizes() {
        let l = layout();
        let mut opts = options(&l);
        opts.stability.timeout = Duration::from_millis(60);
        let req = request(&l, l.incoming.join("not-there.mp4"));

        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &l.store, &req, &opts).await;
        assert_eq!(result.reason, Some(FailReason::DownloadNeverStabilized));
        assert!(!l.staging.exists());
    }

    #[tokio::test]
    async fn test_transient_probe_failure_is_retried() {
        let l = layout();
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source);
        let prober = FakeProber::sequence(vec![None, Some(scenario_facts(12.0))]);

        let result = handoff(&prober, &l.store, &req, &options(&l)).await;
        assert!(result.ok, "{:?}", result);
        assert_eq!(prober.calls(), 2);
    }

    #[tokio::test]
    async fn test_bad_identity_touches_nothing() {
        let l = layout();
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let mut req = request(&l, source.clone());
        req.identity_sha256 = "not-a-hash".to_string();

        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &l.store, &req, &options(&l)).await;
        assert_eq!(result.reason, Some(FailReason::InvalidIdentity));
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_key_collision_with_different_asset_is_rejected() {
        let l = layout();
        l.store
            .update(LoadPolicy::Strict, |catalog| {
                let mut other = sample_entry("aabbccdd", &l.final_dir.join("older_aabbccdd.mp4"));
                other.identity_sha256 = format!("aabbccdd{}", "e".repeat(56));
                catalog.items.insert("aabbccdd".to_string(), other);
                Ok(())
            })
            .unwrap();
        let before = l.store.load(LoadPolicy::Strict).unwrap();

        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source);
        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &l.store, &req, &options(&l)).await;

        assert_eq!(result.reason, Some(FailReason::Conflict));
        assert!(l.staging.join("run7_seg3_aabbccdd.mp4").exists());
        assert!(!req.final_path.exists());
        assert_eq!(l.store.load(LoadPolicy::Strict).unwrap(), before);
    }

    #[tokio::test]
    async fn test_lock_timeout_keeps_file_in_staging() {
        let l = layout();
        let _held = l.store.lock().unwrap();
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source);

        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &l.store, &req, &options(&l)).await;
        assert_eq!(result.reason, Some(FailReason::LockTimeout));
        assert!(l.staging.join("run7_seg3_aabbccdd.mp4").exists());
        assert!(!req.final_path.exists());
    }

    #[tokio::test]
    async fn test_reingest_preserves_caller_fields() {
        let l = layout();
        let prober = FakeProber::always(scenario_facts(12.0));
        let first = write_sized(&l.incoming, "export.mp4", 2_100_000);
        assert!(handoff(&prober, &l.store, &request(&l, first), &options(&l)).await.ok);

        l.store
            .update(LoadPolicy::Strict, |catalog| {
                let entry = catalog.items.get_mut("aabbccdd").unwrap();
                entry.extra.insert("upload_id".to_string(), serde_json::Value::from("yt-123"));
                Ok(())
            })
            .unwrap();

        let second = write_sized(&l.incoming, "export2.mp4", 2_200_000);
        let result = handoff(&prober, &l.store, &request(&l, second), &options(&l)).await;
        assert!(result.ok, "{:?}", result);

        let catalog = l.store.load(LoadPolicy::Strict).unwrap();
        let entry = &catalog.items["aabbccdd"];
        assert_eq!(entry.file_bytes, 2_200_000);
        assert_eq!(entry.extra["upload_id"], serde_json::Value::from("yt-123"));
    }

    #[tokio::test]
    async fn test_second_upload_never_replaces_a_staged_asset() {
        let l = layout();
        let prober = FakeProber::always(scenario_facts(13.0));
        let first = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let result = handoff(&prober, &l.store, &request(&l, first), &options(&l)).await;
        assert_eq!(result.reason, Some(FailReason::DurationMismatch));

        let second = write_sized(&l.incoming, "export2.mp4", 2_200_000);
        let result = handoff(&prober, &l.store, &request(&l, second.clone()), &options(&l)).await;
        assert_eq!(result.reason, Some(FailReason::StagingMoveFailed));

        // The earlier asset and its why.txt are untouched; the new one stays where it was
        let staged = l.staging.join("run7_seg3_aabbccdd.mp4");
        assert_eq!(fs::metadata(&staged).unwrap().len(), 2_100_000);
        let why = fs::read_to_string(l.staging.join("run7_seg3_aabbccdd.why.txt")).unwrap();
        assert!(why.contains("duration_mismatch"));
        assert_eq!(fs::metadata(&second).unwrap().len(), 2_200_000);
    }

    #[tokio::test]
    async fn test_unreferenced_final_file_is_not_overwritten() {
        let l = layout();
        fs::create_dir_all(&l.final_dir).unwrap();
        let squatter = write_sized(&l.final_dir, "run7_seg3_aabbccdd.mp4", 5_000);
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source);

        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &l.store, &req, &options(&l)).await;

        assert_eq!(result.reason, Some(FailReason::FinalMoveFailed));
        assert_eq!(fs::metadata(&squatter).unwrap().len(), 5_000);
        assert_eq!(fs::metadata(l.staging.join("run7_seg3_aabbccdd.mp4")).unwrap().len(), 2_100_000);
        assert!(l.staging.join("run7_seg3_aabbccdd.why.txt").exists());
        assert!(l.store.load(LoadPolicy::Strict).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_staging_dir_that_is_a_file_fails_the_move() {
        let l = layout();
        fs::write(&l.staging, b"not a directory").unwrap();
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source.clone());

        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &l.store, &req, &options(&l)).await;

        assert_eq!(result.reason, Some(FailReason::StagingMoveFailed));
        assert!(source.exists());
        assert!(!req.final_path.exists());
        assert!(!l.store.path().exists());
    }

    #[tokio::test]
    async fn test_uncreatable_final_parent_keeps_file_in_staging() {
        let l = layout();
        let blocker = l._root.path().join("blocker");
        fs::write(&blocker, b"file where a directory should be").unwrap();
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let mut req = request(&l, source);
        req.final_path = blocker.join("run7_seg3_aabbccdd.mp4");

        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &l.store, &req, &options(&l)).await;

        assert_eq!(result.reason, Some(FailReason::FinalMoveFailed));
        assert!(l.staging.join("run7_seg3_aabbccdd.mp4").exists());
        assert!(l.store.load(LoadPolicy::Strict).unwrap().items.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_catalog_write_moves_file_back_to_staging() {
        use crate::test_support::{read_only_enforced, set_mode};

        let l = layout();
        let catalog_dir = l._root.path().join("catalog");
        let store = CatalogStore::new(catalog_dir.join("index.json")).with_lock_timeout(Duration::from_millis(200));
        store.write(&mut Catalog::default()).unwrap();
        drop(store.lock().unwrap());
        fs::create_dir_all(&l.final_dir).unwrap();

        set_mode(&catalog_dir, 0o555);
        if !read_only_enforced(&catalog_dir) {
            // Privileged runs ignore mode bits
            set_mode(&catalog_dir, 0o755);
            return;
        }
        let source = write_sized(&l.incoming, "export.mp4", 2_100_000);
        let req = request(&l, source);
        let result = handoff(&FakeProber::always(scenario_facts(12.0)), &store, &req, &options(&l)).await;
        set_mode(&catalog_dir, 0o755);

        assert_eq!(result.reason, Some(FailReason::CatalogWriteFailed));
        assert!(!req.final_path.exists());
        assert!(l.staging.join("run7_seg3_aabbccdd.mp4").exists());
        assert!(store.load(LoadPolicy::Strict).unwrap().items.is_empty());
    }
}
