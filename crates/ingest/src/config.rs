use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ffprobe::ProbeConfig;
use crate::handoff::HandoffOptions;
use crate::orphans::OrphanFilters;
use crate::resurrect::ResurrectOptions;
use crate::stability::StabilityOptions;
use crate::store::CatalogStore;
use crate::validate::ValidationRules;

/// Configuration for the clip vault ingest tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Directory holding canonical assets
    pub final_dir: PathBuf,
    /// Directory holding in-flight assets that have not passed validation yet
    pub staging_dir: PathBuf,
    /// Directory receiving quarantined orphans
    pub quarantine_dir: PathBuf,
    /// Path of the catalog JSON file
    pub catalog_path: PathBuf,
    /// Trusted root for resolving catalog paths (falls back to the catalog's `state_root`)
    pub state_root: Option<PathBuf>,
    /// Extension of managed asset files, without the dot
    pub extension: String,
    /// Seconds to wait for the catalog lock before giving up
    pub lock_timeout_secs: f64,
    /// Milliseconds between lock attempts
    pub lock_poll_ms: u64,
    pub probe: ProbeConfig,
    pub stability: StabilityConfig,
    pub validation: ValidationRules,
    pub handoff: RetryConfig,
    pub cleanup: CleanupConfig,
    pub resurrect: ResurrectConfig,
}

/// Polling parameters for the stability wait
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    pub timeout_secs: f64,
    pub interval_secs: f64,
    pub cycles: u32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120.0,
            interval_secs: 1.5,
            cycles: 3,
        }
    }
}

/// Validation retry policy used by the handoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub backoff_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_secs: 2.0,
        }
    }
}

/// Safety filters for orphan cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Number of most recently modified files that are never treated as orphans
    pub keep_last_n: usize,
    /// Files smaller than this are assumed to be truncated writes and left alone
    pub min_bytes: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            keep_last_n: 2,
            min_bytes: 500 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResurrectConfig {
    /// Maximum entries restored by one apply run
    pub limit: usize,
    /// Delay between the two size observations of the stability re-check
    pub recheck_secs: f64,
}

impl Default for ResurrectConfig {
    fn default() -> Self {
        Self {
            limit: 25,
            recheck_secs: 1.0,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl IngestConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            final_dir: PathBuf::from("/data/videos/final"),
            staging_dir: PathBuf::from("/data/videos/staging"),
            quarantine_dir: PathBuf::from("/data/videos/quarantine"),
            catalog_path: PathBuf::from("/data/videos/index.json"),
            state_root: None,
            extension: "mp4".to_string(),
            lock_timeout_secs: 10.0,
            lock_poll_ms: 100,
            probe: ProbeConfig::default(),
            stability: StabilityConfig::default(),
            validation: ValidationRules::default(),
            handoff: RetryConfig::default(),
            cleanup: CleanupConfig::default(),
            resurrect: ResurrectConfig::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Catalog store wired with the configured lock bounds
    pub fn store(&self) -> CatalogStore {
        CatalogStore::new(&self.catalog_path)
            .with_lock_timeout(Duration::from_secs_f64(self.lock_timeout_secs))
            .with_lock_poll(Duration::from_millis(self.lock_poll_ms))
    }

    pub fn stability_options(&self) -> StabilityOptions {
        StabilityOptions {
            timeout: Duration::from_secs_f64(self.stability.timeout_secs),
            interval: Duration::from_secs_f64(self.stability.interval_secs),
            cycles: self.stability.cycles,
        }
    }

    pub fn handoff_options(&self) -> HandoffOptions {
        HandoffOptions {
            staging_dir: self.staging_dir.clone(),
            stability: self.stability_options(),
            rules: self.validation.clone(),
            attempts: self.handoff.attempts,
            backoff: Duration::from_secs_f64(self.handoff.backoff_secs),
        }
    }

    pub fn orphan_filters(&self) -> OrphanFilters {
        OrphanFilters {
            extension: self.extension.clone(),
            keep_last_n: self.cleanup.keep_last_n,
            min_bytes: self.cleanup.min_bytes,
            older_than: None,
        }
    }

    pub fn resurrect_options(&self) -> ResurrectOptions {
        ResurrectOptions {
            apply: false,
            limit: self.resurrect.limit,
            allow_missing_sha8: false,
            state_root: self.state_root.clone(),
            recheck_delay: Duration::from_secs_f64(self.resurrect.recheck_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_file_yields_defaults() {
        let cfg = IngestConfig::load_config(Some(Path::new("/nonexistent/clipvault.toml"))).unwrap();
        assert_eq!(cfg.extension, "mp4");
        assert_eq!(cfg.cleanup.keep_last_n, 2);
        assert_eq!(cfg.cleanup.min_bytes, 500 * 1024);
        assert_eq!(cfg.lock_timeout_secs, 10.0);
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipvault.toml");
        std::fs::write(
            &path,
            r#"
final_dir = "/srv/final"
extension = "webm"

[validation]
min_bitrate_bps = 2500000

[cleanup]
keep_last_n = 5
"#,
        )
        .unwrap();

        let cfg = IngestConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.final_dir, PathBuf::from("/srv/final"));
        assert_eq!(cfg.extension, "webm");
        assert_eq!(cfg.validation.min_bitrate_bps, 2_500_000);
        assert_eq!(cfg.validation.duration_tolerance, 0.15);
        assert_eq!(cfg.cleanup.keep_last_n, 5);
        assert_eq!(cfg.cleanup.min_bytes, 500 * 1024);
        assert_eq!(cfg.stability.cycles, 3);
    }

    #[test]
    fn test_json_config_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipvault.json");
        std::fs::write(&path, r#"{"catalog_path": "/srv/index.json", "handoff": {"attempts": 5}}"#).unwrap();

        let cfg = IngestConfig::load_config(Some(&path)).unwrap();
        assert_eq!(cfg.catalog_path, PathBuf::from("/srv/index.json"));
        assert_eq!(cfg.handoff.attempts, 5);
        assert_eq!(cfg.handoff.backoff_secs, 2.0);
    }
}
