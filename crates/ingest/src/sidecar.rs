use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use std::fs;

/// Get the path to the why.txt file for a given media file
pub fn why_txt_path(file_path: &Path) -> PathBuf {
    let mut path = file_path.to_path_buf();
    path.set_extension("why.txt");
    path
}

/// Write a why.txt file next to an asset explaining why it stopped where it is
pub fn write_why_txt(file_path: &Path, reason: &str, detail: Option<&str>) -> Result<()> {
    let why_path = why_txt_path(file_path);
    let body = match detail {
        Some(detail) => format!("{}\n{}\n", reason, detail),
        None => format!("{}\n", reason),
    };
    fs::write(&why_path, body)
        .with_context(|| format!("Failed to write why.txt: {}", why_path.display()))?;
    Ok(())
}
