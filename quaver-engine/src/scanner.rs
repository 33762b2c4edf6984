//! Filesystem discovery
//!
//! Streams candidate media files out of a library root without ever
//! materializing the whole tree. Selection is by extension; whether a
//! file actually parses as audio is decided later, per file, by the
//! ingest pipeline.

use std::path::{Path, PathBuf};

use quaver_common::config::ScanConfig;
use tracing::warn;
use walkdir::WalkDir;

/// Filenames that are never media regardless of extension.
const JUNK_FILENAMES: &[&str] = &[".DS_Store", "Thumbs.db", "desktop.ini"];

/// One discovered file with the cheap metadata needed for the
/// unchanged-file shortcut.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub file_size: i64,
    /// Modification time as unix seconds; absent when the platform
    /// does not report one.
    pub file_mtime: Option<i64>,
}

/// Walk a root and yield media files in deterministic order.
///
/// Unreadable directories and files are logged and skipped; a scan
/// never aborts because of one bad entry. Symlinks are not followed.
pub fn discover_files<'a>(
    config: &'a ScanConfig,
    root: &'a Path,
) -> impl Iterator<Item = DiscoveredFile> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()))
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable directory entry");
                    return None;
                }
            };
            if !entry.file_type().is_file() {
                return None;
            }
            if !is_media_candidate(config, entry.path()) {
                return None;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unstatable file");
                    return None;
                }
            };
            let file_mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            Some(DiscoveredFile {
                path: entry.path().to_path_buf(),
                file_size: metadata.len() as i64,
                file_mtime,
            })
        })
}

/// Whether a path looks like media worth handing to the pipeline.
pub fn is_media_candidate(config: &ScanConfig, path: &Path) -> bool {
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if JUNK_FILENAMES.contains(&name) {
            return false;
        }
    }
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return false,
    };
    config.extensions.iter().any(|allowed| allowed == &ext)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn discovers_media_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("a/one.mp3"), b"x");
        touch(&root.join("a/two.FLAC"), b"x");
        touch(&root.join("b/cover.jpg"), b"x");
        touch(&root.join("notes.txt"), b"x");

        let config = ScanConfig::default();
        let found: Vec<_> = discover_files(&config, root)
            .map(|f| f.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(found, vec!["one.mp3", "two.FLAC"]);
    }

    #[test]
    fn skips_hidden_entries_and_junk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join(".hidden/secret.mp3"), b"x");
        touch(&root.join(".stray.mp3"), b"x");
        touch(&root.join("music/song.mp3"), b"x");

        let config = ScanConfig::default();
        let found: Vec<_> = discover_files(&config, root).collect();
        assert_eq!(found.len(), 1);
        assert!(found[0].path.ends_with("music/song.mp3"));
    }

    #[test]
    fn reports_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("song.mp3"), b"hello");

        let config = ScanConfig::default();
        let found: Vec<_> = discover_files(&config, root).collect();
        assert_eq!(found[0].file_size, 5);
        assert!(found[0].file_mtime.is_some());
    }

    #[test]
    fn extensionless_files_are_not_candidates() {
        let config = ScanConfig::default();
        assert!(!is_media_candidate(&config, Path::new("/music/README")));
        assert!(is_media_candidate(&config, Path::new("/music/a.ogg")));
        assert!(!is_media_candidate(&config, Path::new("/music/.DS_Store")));
    }
}
