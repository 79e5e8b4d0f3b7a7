//! Restore dangling entries whose file has come back.
//!
//! Each dangling entry must pass five gates, in order: the file exists, it
//! lies inside the declared root, its name carries the entry's sha8, the key
//! is free in `items`, and the file is not still being written. Gates run on
//! a snapshot without the lock; apply mode re-checks membership and conflicts
//! under the lock before moving anything.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{push_bounded, Catalog, CatalogEntry, EnvFingerprint, ResurrectRecord, RESURRECT_HISTORY_CAP};
use crate::error::Result;
use crate::identity::sha8_suffix;
use crate::scan::mtime_secs;
use crate::stability::size_stable_across;
use crate::store::{CatalogStore, LoadPolicy};

/// First gate a dangling entry failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    MissingFile,
    PermissionDenied,
    OutsideRoot,
    NoSha8,
    Conflict,
    Unstable,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::MissingFile => "missing_file",
            Rejection::PermissionDenied => "permission_denied",
            Rejection::OutsideRoot => "outside_root",
            Rejection::NoSha8 => "no_sha8",
            Rejection::Conflict => "conflict",
            Rejection::Unstable => "unstable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResurrectOptions {
    /// Without this only eligibility is reported
    pub apply: bool,
    /// Maximum entries moved back by one apply run
    pub limit: usize,
    /// Skip the filename sha8 gate
    pub allow_missing_sha8: bool,
    /// Overrides `meta_info.state_root`
    pub state_root: Option<PathBuf>,
    pub recheck_delay: Duration,
}

impl Default for ResurrectOptions {
    fn default() -> Self {
        Self {
            apply: false,
            limit: 25,
            allow_missing_sha8: false,
            state_root: None,
            recheck_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Outcome {
    Rejected { reason: Rejection, detail: String },
    Eligible,
    Restored,
    /// Eligible but over this run's limit
    Deferred,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryOutcome {
    pub key: String,
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResurrectStats {
    pub root: PathBuf,
    pub examined: usize,
    pub eligible: usize,
    pub restored: usize,
    pub deferred: usize,
    pub rejected: BTreeMap<String, usize>,
    pub entries: Vec<EntryOutcome>,
}

/// Lexically normalize: fold `.` and `..` without touching the filesystem.
/// Returns `None` when `..` would climb above the start.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => return None,
            },
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Trusted root: the explicit option, else the catalog's `state_root`, else
/// the catalog's own directory. A relative root is made absolute against the
/// working directory so containment never compares against an empty path.
fn resolve_root(opts: &ResurrectOptions, catalog: &Catalog, catalog_path: &Path) -> PathBuf {
    let declared = opts
        .state_root
        .clone()
        .or_else(|| catalog.meta_info.state_root.clone())
        .unwrap_or_else(|| match catalog_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        });
    if declared.is_absolute() {
        return declared;
    }
    fs::canonicalize(&declared).unwrap_or(declared)
}

fn lexically_inside(path: &Path, root: &Path) -> bool {
    match (normalize(path), normalize(root)) {
        (Some(p), Some(r)) => p.starts_with(r),
        _ => false,
    }
}

fn canonically_inside(path: &Path, root: &Path) -> bool {
    match (fs::canonicalize(path), fs::canonicalize(root)) {
        (Ok(p), Ok(r)) => p.starts_with(r),
        _ => false,
    }
}

/// Gates 1–4. Returns the resolved path of a candidate that passed.
fn check_static_gates(
    key: &str,
    entry: &CatalogEntry,
    root: &Path,
    items_has_key: bool,
    allow_missing_sha8: bool,
) -> std::result::Result<PathBuf, (Rejection, String)> {
    let resolved = if entry.path.is_absolute() { entry.path.clone() } else { root.join(&entry.path) };

    // Root guard comes first lexically so an escaping path is reported as
    // such whether or not anything exists there
    if !lexically_inside(&resolved, root) {
        return Err((Rejection::OutsideRoot, format!("{} is not under {}", resolved.display(), root.display())));
    }

    match fs::metadata(&resolved) {
        Ok(m) if m.is_file() => {}
        Ok(_) => return Err((Rejection::MissingFile, format!("{} is not a regular file", resolved.display()))),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            return Err((Rejection::PermissionDenied, e.to_string()));
        }
        Err(e) => return Err((Rejection::MissingFile, e.to_string())),
    }

    if !canonically_inside(&resolved, root) {
        return Err((Rejection::OutsideRoot, format!("{} resolves outside {}", resolved.display(), root.display())));
    }

    let file_name = resolved.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    match sha8_suffix(file_name) {
        Some(suffix) if suffix == key => {}
        Some(suffix) => {
            return Err((Rejection::NoSha8, format!("file name carries {} but the entry key is {}", suffix, key)));
        }
        None if allow_missing_sha8 => {}
        None => return Err((Rejection::NoSha8, format!("{} has no sha8 suffix", file_name))),
    }

    if items_has_key {
        return Err((Rejection::Conflict, format!("key {} already exists in items", key)));
    }

    Ok(resolved)
}

/// Evaluate every dangling entry and, in apply mode, restore up to `limit`.
///
/// Refuses to run on a corrupt catalog. One history record is appended per
/// invocation, best effort.
pub async fn resurrect(store: &CatalogStore, opts: &ResurrectOptions) -> Result<ResurrectStats> {
    let snapshot = store.load(LoadPolicy::Strict)?;
    let root = resolve_root(opts, &snapshot, store.path());

    let mut stats = ResurrectStats { root: root.clone(), ..ResurrectStats::default() };
    let mut eligible: Vec<(String, PathBuf)> = Vec::new();

    for (key, entry) in &snapshot.dangling_items {
        stats.examined += 1;
        let gated = check_static_gates(
            key,
            entry,
            &root,
            snapshot.items.contains_key(key),
            opts.allow_missing_sha8,
        );
        let gated = match gated {
            Ok(path) => {
                if size_stable_across(&path, opts.recheck_delay).await {
                    Ok(path)
                } else {
                    Err((Rejection::Unstable, format!("{} changed during the re-check", path.display())))
                }
            }
            Err(rejection) => Err(rejection),
        };

        match gated {
            Ok(path) => {
                debug!("Dangling {} is eligible ({})", key, path.display());
                eligible.push((key.clone(), path));
            }
            Err((reason, detail)) => {
                debug!("Dangling {} rejected: {} ({})", key, reason.as_str(), detail);
                *stats.rejected.entry(reason.as_str().to_string()).or_default() += 1;
                stats.entries.push(EntryOutcome {
                    key: key.clone(),
                    path: entry.path.clone(),
                    outcome: Outcome::Rejected { reason, detail },
                });
            }
        }
    }
    stats.eligible = eligible.len();

    if !opts.apply {
        for (key, path) in eligible {
            stats.entries.push(EntryOutcome { key, path, outcome: Outcome::Eligible });
        }
    } else if !eligible.is_empty() {
        let now = Utc::now();
        let limit = opts.limit;
        let outcomes = store.update_async(LoadPolicy::Strict, |catalog| {
            let mut outcomes = Vec::new();
            let mut restored = 0;
            for (key, path) in eligible {
                if restored >= limit {
                    outcomes.push(EntryOutcome { key, path, outcome: Outcome::Deferred });
                    continue;
                }
                if catalog.items.contains_key(&key) {
                    let detail = format!("key {} appeared in items during this run", key);
                    outcomes.push(EntryOutcome { key, path, outcome: Outcome::Rejected { reason: Rejection::Conflict, detail } });
                    continue;
                }
                let Some(mut entry) = catalog.dangling_items.remove(&key) else {
                    debug!("Dangling {} was resolved by another process", key);
                    continue;
                };
                entry.clear_dangling(now);
                entry.path = path.clone();
                if let Ok(metadata) = fs::metadata(&path) {
                    entry.file_bytes = metadata.len();
                    entry.file_mtime = metadata.modified().ok().map(mtime_secs);
                }
                info!("Restored {} from dangling ({})", key, path.display());
                catalog.items.insert(key.clone(), entry);
                restored += 1;
                outcomes.push(EntryOutcome { key, path, outcome: Outcome::Restored });
            }
            Ok(outcomes)
        })
        .await?;

        for outcome in outcomes {
            match &outcome.outcome {
                Outcome::Restored => stats.restored += 1,
                Outcome::Deferred => stats.deferred += 1,
                Outcome::Rejected { reason, .. } => {
                    *stats.rejected.entry(reason.as_str().to_string()).or_default() += 1;
                }
                Outcome::Eligible => {}
            }
            stats.entries.push(outcome);
        }
    }

    info!(
        "Resurrect ({}): {} examined, {} eligible, {} restored, {} deferred, rejected {:?}",
        if opts.apply { "apply" } else { "dry-run" },
        stats.examined,
        stats.eligible,
        stats.restored,
        stats.deferred,
        stats.rejected
    );

    let record = ResurrectRecord {
        event_id: Uuid::new_v4(),
        at: Utc::now(),
        apply: opts.apply,
        limit: opts.limit,
        examined: stats.examined,
        eligible: stats.eligible,
        restored: stats.restored,
        deferred: stats.deferred,
        rejected: stats.rejected.clone(),
        env: EnvFingerprint::capture(),
    };
    let persisted = store
        .update_async(LoadPolicy::Strict, |catalog| {
            push_bounded(&mut catalog.meta_info.resurrect_history, record, RESURRECT_HISTORY_CAP);
            Ok(())
        })
        .await;
    if let Err(e) = persisted {
        warn!("Could not record resurrect history: {}", e);
    }

    Ok(stats)
}
