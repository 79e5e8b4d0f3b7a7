use std::fmt;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use log::{debug, info};

use crate::ffprobe::{ProbeFacts, Prober};

/// Why an asset was refused on its way to the final directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    MissingFile,
    TooSmall,
    FfprobeFailed,
    DurationMismatch,
    LowBitrate,
    VideoCodecUnexpected,
    AudioCodecUnexpected,
    DownloadNeverStabilized,
    StagingMoveFailed,
    FinalMoveFailed,
    InvalidIdentity,
    Conflict,
    LockTimeout,
    CatalogWriteFailed,
}

impl FailReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailReason::MissingFile => "missing_file",
            FailReason::TooSmall => "too_small",
            FailReason::FfprobeFailed => "ffprobe_failed",
            FailReason::DurationMismatch => "duration_mismatch",
            FailReason::LowBitrate => "low_bitrate",
            FailReason::VideoCodecUnexpected => "video_codec_unexpected",
            FailReason::AudioCodecUnexpected => "audio_codec_unexpected",
            FailReason::DownloadNeverStabilized => "download_never_stabilized",
            FailReason::StagingMoveFailed => "staging_move_failed",
            FailReason::FinalMoveFailed => "final_move_failed",
            FailReason::InvalidIdentity => "invalid_identity",
            FailReason::Conflict => "conflict",
            FailReason::LockTimeout => "lock_timeout",
            FailReason::CatalogWriteFailed => "catalog_write_failed",
        }
    }

    /// Failures that may clear up on their own while the file settles
    pub fn is_transient(&self) -> bool {
        matches!(self, FailReason::FfprobeFailed | FailReason::TooSmall)
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    pub min_bytes: u64,
    /// Allowed absolute difference between measured and target duration, in seconds
    pub duration_tolerance: f64,
    pub min_bitrate_bps: u64,
    pub allowed_video_codecs: Vec<String>,
    pub allowed_audio_codecs: Vec<String>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_bytes: 1_000_000,
            duration_tolerance: 0.15,
            min_bitrate_bps: 1_000_000,
            allowed_video_codecs: ["h264", "hevc", "vp9", "av1"].map(String::from).to_vec(),
            allowed_audio_codecs: ["aac", "opus", "mp3"].map(String::from).to_vec(),
        }
    }
}

fn allowed(list: &[String], codec: Option<&str>) -> bool {
    codec.is_some_and(|c| list.iter().any(|a| a.eq_ignore_ascii_case(c)))
}

/// Outcome of validating one file. Measured fields are filled in as far as
/// the gates got before the first failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub path: PathBuf,
    pub ok: bool,
    pub reason: Option<FailReason>,
    /// Human-readable specifics for the reason
    pub detail: Option<String>,
    pub duration: Option<f64>,
    pub bitrate_bps: Option<u64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub file_bytes: Option<u64>,
    /// Catalog key written on a successful handoff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ProbeResult {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            ok: false,
            reason: None,
            detail: None,
            duration: None,
            bitrate_bps: None,
            video_codec: None,
            audio_codec: None,
            file_bytes: None,
            key: None,
        }
    }

    pub fn fail(mut self, reason: FailReason, detail: impl Into<String>) -> Self {
        self.ok = false;
        self.reason = Some(reason);
        self.detail = Some(detail.into());
        self
    }

    fn absorb(&mut self, facts: &ProbeFacts) {
        self.duration = facts.duration;
        self.bitrate_bps = facts.bitrate_bps;
        self.video_codec = facts.video_codec.clone();
        self.audio_codec = facts.audio_codec.clone();
    }
}

/// Run every gate against `path` in order, stopping at the first failure.
///
/// Gate order: existence, minimum size, probe, duration (only with a target),
/// bitrate floor, video codec, audio codec.
pub async fn validate<P: Prober>(
    prober: &P,
    path: &Path,
    target_duration: Option<f64>,
    rules: &ValidationRules,
) -> ProbeResult {
    let mut result = ProbeResult::new(path);

    let metadata = match std::fs::metadata(path) {
        Ok(m) if m.is_file() => m,
        Ok(_) => return result.fail(FailReason::MissingFile, "not a regular file"),
        Err(e) => return result.fail(FailReason::MissingFile, e.to_string()),
    };
    let size = metadata.len();
    result.file_bytes = Some(size);

    if size < rules.min_bytes {
        return result.fail(FailReason::TooSmall, format!("{} bytes < {} bytes", size, rules.min_bytes));
    }

    let facts = match prober.probe(path).await {
        Ok(facts) => facts,
        Err(e) => return result.fail(FailReason::FfprobeFailed, e.to_string()),
    };
    result.absorb(&facts);

    let Some(duration) = facts.duration else {
        return result.fail(FailReason::FfprobeFailed, "probe reported no duration");
    };

    if let Some(target) = target_duration {
        let delta = (duration - target).abs();
        if delta > rules.duration_tolerance {
            return result.fail(
                FailReason::DurationMismatch,
                format!("measured {:.3}s, target {:.3}s, tolerance {:.3}s", duration, target, rules.duration_tolerance),
            );
        }
    }

    let bitrate = facts.bitrate_bps.unwrap_or(0);
    if bitrate < rules.min_bitrate_bps {
        return result.fail(
            FailReason::LowBitrate,
            format!("{} bps < {} bps", bitrate, rules.min_bitrate_bps),
        );
    }

    if !allowed(&rules.allowed_video_codecs, facts.video_codec.as_deref()) {
        return result.fail(
            FailReason::VideoCodecUnexpected,
            format!("video codec {:?} not in {:?}", facts.video_codec, rules.allowed_video_codecs),
        );
    }
    if !allowed(&rules.allowed_audio_codecs, facts.audio_codec.as_deref()) {
        return result.fail(
            FailReason::AudioCodecUnexpected,
            format!("audio codec {:?} not in {:?}", facts.audio_codec, rules.allowed_audio_codecs),
        );
    }

    debug!("{} passed all gates ({:.3}s, {} bps)", path.display(), duration, bitrate);
    result.ok = true;
    result
}

/// Validate with bounded retries on transient reasons, sleeping `backoff` between attempts
pub async fn validate_with_retry<P: Prober>(
    prober: &P,
    path: &Path,
    target_duration: Option<f64>,
    rules: &ValidationRules,
    attempts: u32,
    backoff: std::time::Duration,
) -> ProbeResult {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = validate(prober, path, target_duration, rules).await;
        let transient = result.reason.is_some_and(|r| r.is_transient());
        if result.ok || !transient || attempt >= attempts {
            return result;
        }
        info!(
            "{}: attempt {}/{} failed with {} - retrying in {:?}",
            path.display(),
            attempt,
            attempts,
            result.reason.map(|r| r.as_str()).unwrap_or("unknown"),
            backoff
        );
        attempt += 1;
        tokio::time::sleep(backoff).await;
    }
}
