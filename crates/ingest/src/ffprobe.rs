use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use log::debug;

/// Complete ffprobe output structure
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    #[serde(rename = "format_name")]
    pub format_name: Option<String>,
    pub duration: Option<String>,
    pub size: Option<String>,
    #[serde(rename = "bit_rate")]
    pub bit_rate: Option<String>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeStream {
    #[serde(rename = "codec_type")]
    pub codec_type: Option<String>,
    #[serde(rename = "codec_name")]
    pub codec_name: Option<String>,
    pub duration: Option<String>,
}

/// Facts the validator and refresher care about, extracted from one probe run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeFacts {
    pub duration: Option<f64>,
    pub bitrate_bps: Option<u64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub size_bytes: Option<u64>,
    pub format_name: Option<String>,
}

/// Why a probe produced no usable report. Every variant is transient from the
/// caller's point of view.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ffprobe timed out after {0:?}")]
    Timeout(Duration),
    #[error("ffprobe exited with code {code}: {stderr}")]
    Failed { code: i32, stderr: String },
    #[error("unparseable ffprobe output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("path has no parent directory or file name: {0}")]
    BadPath(PathBuf),
}

/// Anything that can turn a media file into [`ProbeFacts`].
#[allow(async_fn_in_trait)]
pub trait Prober {
    async fn probe(&self, path: &Path) -> Result<ProbeFacts, ProbeError>;
}

/// How to invoke ffprobe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// ffprobe binary used when no Docker image is configured
    pub ffprobe_bin: PathBuf,
    /// Run ffprobe inside this image instead of on the host
    pub docker_image: Option<String>,
    /// Path to docker binary
    pub docker_bin: PathBuf,
    pub timeout_secs: f64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_bin: PathBuf::from("ffprobe"),
            docker_image: None,
            docker_bin: PathBuf::from("docker"),
            timeout_secs: 10.0,
        }
    }
}

/// The real prober: shells out to ffprobe, directly or through Docker
#[derive(Debug, Clone)]
pub struct FfprobeCommand {
    cfg: ProbeConfig,
}

impl FfprobeCommand {
    pub fn new(cfg: ProbeConfig) -> Self {
        Self { cfg }
    }

    fn build_command(&self, file_path: &Path) -> Result<Command, ProbeError> {
        const REPORT_ARGS: [&str; 6] = ["-v", "error", "-print_format", "json", "-show_format", "-show_streams"];

        let Some(image) = &self.cfg.docker_image else {
            let mut cmd = Command::new(&self.cfg.ffprobe_bin);
            cmd.args(REPORT_ARGS).arg(file_path);
            return Ok(cmd);
        };

        // Container sees the parent directory mounted read-only at /config
        let bad_path = || ProbeError::BadPath(file_path.to_path_buf());
        let parent_dir = file_path.parent().ok_or_else(bad_path)?;
        let basename = file_path.file_name().and_then(|n| n.to_str()).ok_or_else(bad_path)?;
        let container_path = format!("/config/{}", basename);

        debug!("ffprobe: mounting {} to /config in {}", parent_dir.display(), image);

        let mut cmd = Command::new(&self.cfg.docker_bin);
        cmd.arg("run")
            .arg("--rm")
            .arg("--entrypoint")
            .arg("ffprobe")
            .arg("-v")
            .arg(format!("{}:/config:ro", parent_dir.display()))
            .arg(image)
            .args(REPORT_ARGS)
            .arg(container_path);
        Ok(cmd)
    }

    /// Run ffprobe and parse the JSON output
    pub async fn probe_file(&self, file_path: &Path) -> Result<FFProbeData, ProbeError> {
        let mut cmd = self.build_command(file_path)?;
        cmd.kill_on_drop(true);

        let program = if self.cfg.docker_image.is_some() {
            self.cfg.docker_bin.display().to_string()
        } else {
            self.cfg.ffprobe_bin.display().to_string()
        };
        debug!("ffprobe: probing {} via {}", file_path.display(), program);

        let limit = Duration::from_secs_f64(self.cfg.timeout_secs);
        let output = match tokio::time::timeout(limit, cmd.output()).await {
            Ok(result) => result.map_err(|source| ProbeError::Spawn { program, source })?,
            Err(_) => return Err(ProbeError::Timeout(limit)),
        };

        if !output.status.success() {
            return Err(ProbeError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_report(&output.stdout)
    }
}

impl Prober for FfprobeCommand {
    async fn probe(&self, path: &Path) -> Result<ProbeFacts, ProbeError> {
        let data = self.probe_file(path).await?;
        Ok(data.facts())
    }
}

/// Parse raw ffprobe JSON
pub fn parse_report(raw: &[u8]) -> Result<FFProbeData, ProbeError> {
    Ok(serde_json::from_slice(raw)?)
}

fn parse_num<T: std::str::FromStr>(value: Option<&str>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

impl FFProbeData {
    fn first_codec(&self, kind: &str) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind) && s.codec_name.is_some())
    }

    /// Reduce the report to the facts used for validation
    pub fn facts(&self) -> ProbeFacts {
        let video = self.first_codec("video");
        let audio = self.first_codec("audio");

        // Container duration first, then the video stream's own duration
        let duration = parse_num::<f64>(self.format.duration.as_deref())
            .or_else(|| video.and_then(|s| parse_num(s.duration.as_deref())))
            .filter(|d| d.is_finite() && *d > 0.0);
        let size_bytes = parse_num::<u64>(self.format.size.as_deref());

        // Some muxers leave bit_rate empty; derive it from size and duration
        let bitrate_bps = parse_num::<u64>(self.format.bit_rate.as_deref()).or_else(|| match (size_bytes, duration) {
            (Some(size), Some(secs)) => Some((size as f64 * 8.0 / secs).round() as u64),
            _ => None,
        });

        ProbeFacts {
            duration,
            bitrate_bps,
            video_codec: video.and_then(|s| s.codec_name.clone()),
            audio_codec: audio.and_then(|s| s.codec_name.clone()),
            size_bytes,
            format_name: self.format.format_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 1080, "height": 1920, "duration": "12.020000"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac", "sample_rate": "48000"}
        ],
        "format": {
            "filename": "seg_aabbccdd.mp4",
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "12.020000",
            "size": "2100000",
            "bit_rate": "4000000"
        }
    }"#;

    #[test]
    fn test_facts_from_full_report() {
        let facts = parse_report(SAMPLE.as_bytes()).unwrap().facts();
        assert_eq!(facts.duration, Some(12.02));
        assert_eq!(facts.bitrate_bps, Some(4_000_000));
        assert_eq!(facts.video_codec.as_deref(), Some("h264"));
        assert_eq!(facts.audio_codec.as_deref(), Some("aac"));
        assert_eq!(facts.size_bytes, Some(2_100_000));
    }

    #[test]
    fn test_bitrate_derived_when_container_omits_it() {
        let raw = r#"{"streams": [], "format": {"format_name": "mp4", "duration": "10.0", "size": "5000000"}}"#;
        let facts = parse_report(raw.as_bytes()).unwrap().facts();
        assert_eq!(facts.bitrate_bps, Some(4_000_000));
        assert_eq!(facts.video_codec, None);
        assert_eq!(facts.audio_codec, None);
    }

    #[test]
    fn test_stream_duration_used_when_format_duration_is_missing() {
        let raw = r#"{"streams": [{"codec_type": "video", "codec_name": "vp9", "duration": "8.5"}], "format": {}}"#;
        let facts = parse_report(raw.as_bytes()).unwrap().facts();
        assert_eq!(facts.duration, Some(8.5));
        assert_eq!(facts.video_codec.as_deref(), Some("vp9"));
    }

    #[test]
    fn test_garbage_output_is_a_parse_error() {
        let err = parse_report(b"not json at all").unwrap_err();
        assert!(matches!(err, ProbeError::Parse(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_spawn_error() {
        let prober = FfprobeCommand::new(ProbeConfig {
            ffprobe_bin: PathBuf::from("/nonexistent/bin/ffprobe-clipvault"),
            ..ProbeConfig::default()
        });
        let err = prober.probe(Path::new("/tmp/whatever.mp4")).await.unwrap_err();
        assert!(matches!(err, ProbeError::Spawn { .. }), "unexpected: {err}");
    }
}
