use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::{Context, Result};
use walkdir::WalkDir;
use log::{debug, warn};

/// One managed file observed on disk
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFile {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub mtime: SystemTime,
}

impl MediaFile {
    /// Modification time as float seconds since the epoch, the catalog's representation
    pub fn mtime_secs(&self) -> f64 {
        mtime_secs(self.mtime)
    }
}

pub fn mtime_secs(t: SystemTime) -> f64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

/// List files with the given extension directly inside `dir`.
///
/// A missing directory is an empty listing. Entries that vanish between the
/// listing and the stat are skipped.
pub fn list_media(dir: &Path, extension: &str) -> Result<Vec<MediaFile>> {
    let mut files = Vec::new();
    if !dir.exists() {
        warn!("Media directory does not exist: {}", dir.display());
        return Ok(files);
    }

    let walker = WalkDir::new(dir).min_depth(1).max_depth(1).follow_links(false);
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                if e.depth() == 0 {
                    return Err(e).with_context(|| format!("Failed to read directory: {}", dir.display()));
                }
                warn!("Error reading directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || !has_extension(entry.path(), extension) {
            continue;
        }

        let Some(file_name) = entry.file_name().to_str() else {
            warn!("Skipping non UTF-8 file name: {}", entry.path().display());
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!("File vanished during scan {}: {}", entry.path().display(), e);
                continue;
            }
        };

        files.push(MediaFile {
            path: entry.path().to_path_buf(),
            file_name: file_name.to_string(),
            size: metadata.len(),
            mtime: metadata.modified().unwrap_or(UNIX_EPOCH),
        });
    }

    debug!("Found {} .{} files in {}", files.len(), extension, dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lists_only_matching_top_level_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a_aabbccdd.mp4"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("b.MP4"), vec![0u8; 20]).unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::write(dir.path().join("a_aabbccdd.why.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.mp4"), b"x").unwrap();

        let mut files = list_media(dir.path(), "mp4").unwrap();
        files.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        let names: Vec<_> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["a_aabbccdd.mp4", "b.MP4"]);
        assert_eq!(files[0].size, 10);
        assert_eq!(files[1].size, 20);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let files = list_media(Path::new("/nonexistent/clipvault/final"), "mp4").unwrap();
        assert!(files.is_empty());
    }
}
