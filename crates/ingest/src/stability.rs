use std::path::Path;
use std::time::{Duration, Instant, SystemTime};
use log::debug;

/// Parameters for [`wait_stable`]
#[derive(Debug, Clone)]
pub struct StabilityOptions {
    /// Total time budget
    pub timeout: Duration,
    /// Sleep between polls
    pub interval: Duration,
    /// Consecutive polls that must match the one before
    pub cycles: u32,
}

impl Default for StabilityOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            interval: Duration::from_millis(1500),
            cycles: 3,
        }
    }
}

/// (size, mtime) of a non-empty regular file, `None` otherwise
fn observe(path: &Path) -> Option<(u64, SystemTime)> {
    let metadata = std::fs::metadata(path).ok()?;
    if !metadata.is_file() || metadata.len() == 0 {
        return None;
    }
    Some((metadata.len(), metadata.modified().ok()?))
}

/// Poll `path` until `cycles` consecutive polls each saw the same non-zero
/// size and mtime as the poll before. The first poll only sets the baseline,
/// so even `cycles = 1` compares two observations.
///
/// Returns false on timeout, including when the file never appears. Never
/// errors: a missing or empty file just resets the count.
pub async fn wait_stable(path: &Path, opts: &StabilityOptions) -> bool {
    let required = opts.cycles.max(1);
    let deadline = Instant::now() + opts.timeout;
    let mut last: Option<(u64, SystemTime)> = None;
    let mut streak = 0u32;

    loop {
        let current = observe(path);
        streak = match (current, last) {
            (Some(cur), Some(prev)) if cur == prev => streak + 1,
            _ => 0,
        };
        last = current;

        if streak >= required {
            debug!("{} stable after {} matching polls", path.display(), streak);
            return true;
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(
                "{} not stable within {:?} (last observation {:?}, streak {})",
                path.display(),
                opts.timeout,
                last,
                streak
            );
            return false;
        }
        tokio::time::sleep(opts.interval.min(deadline - now)).await;
    }
}

/// Stat twice, `delay` apart, and report whether size and mtime held still
pub async fn size_stable_across(path: &Path, delay: Duration) -> bool {
    let Some(first) = observe(path) else {
        return false;
    };
    tokio::time::sleep(delay).await;
    observe(path) == Some(first)
}
