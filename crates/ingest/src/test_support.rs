//! Canned prober and filesystem fixtures shared by the unit tests.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::ffprobe::{ProbeError, ProbeFacts, Prober};

/// Facts of the 2.1 MB h264/aac export used throughout the tests
pub fn scenario_facts(duration: f64) -> ProbeFacts {
    ProbeFacts {
        duration: Some(duration),
        bitrate_bps: Some(4_000_000),
        video_codec: Some("h264".to_string()),
        audio_codec: Some("aac".to_string()),
        size_bytes: Some(2_100_000),
        format_name: Some("mov,mp4,m4a,3gp,3g2,mj2".to_string()),
    }
}

/// Prober that replays queued answers (`None` = probe failure), then repeats a fallback
pub struct FakeProber {
    queue: Mutex<VecDeque<Option<ProbeFacts>>>,
    fallback: Option<ProbeFacts>,
    calls: AtomicUsize,
}

impl FakeProber {
    pub fn always(facts: ProbeFacts) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), fallback: Some(facts), calls: AtomicUsize::new(0) }
    }

    pub fn failing() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), fallback: None, calls: AtomicUsize::new(0) }
    }

    /// Replay `answers` in order; the last answer repeats once the queue is drained
    pub fn sequence(answers: Vec<Option<ProbeFacts>>) -> Self {
        let fallback = answers.last().cloned().flatten();
        Self { queue: Mutex::new(answers.into()), fallback, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Prober for FakeProber {
    async fn probe(&self, path: &Path) -> Result<ProbeFacts, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().unwrap().pop_front();
        let answer = match next {
            Some(answer) => answer,
            None => self.fallback.clone(),
        };
        answer.ok_or_else(|| ProbeError::Failed {
            code: 1,
            stderr: format!("{}: Invalid data found when processing input", path.display()),
        })
    }
}

/// Create a (sparse) file of exactly `size` bytes
pub fn write_sized(dir: &Path, name: &str, size: u64) -> PathBuf {
    let path = dir.join(name);
    let file = File::create(&path).unwrap();
    file.set_len(size).unwrap();
    path
}

/// Create a file and backdate its mtime by `age`
pub fn write_aged(dir: &Path, name: &str, size: u64, age: Duration) -> PathBuf {
    let path = write_sized(dir, name, size);
    let file = File::options().write(true).open(&path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
    path
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(unix)]
/// Whether `dir` really refuses new files. False when the tests run with
/// privileges that ignore mode bits.
pub fn read_only_enforced(dir: &Path) -> bool {
    let canary = dir.join(".write-canary");
    match File::create(&canary) {
        Ok(_) => {
            let _ = std::fs::remove_file(&canary);
            false
        }
        Err(_) => true,
    }
}
