//! Candidate sources: things that stream paths of documents worth scanning.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::XLSTART_MARKER;
use crate::error::SearchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchStrategy {
    /// Read the volume's file record table directly.
    Accelerated,
    /// Recursive directory walk.
    Generic,
}

/// Pick the search strategy. The accelerated path needs elevated rights, a
/// supported filesystem, and must not be disabled by the operator.
pub fn choose_strategy(elevated: bool, fs_supported: bool, force_generic: bool) -> SearchStrategy {
    if elevated && fs_supported && !force_generic {
        SearchStrategy::Accelerated
    } else {
        SearchStrategy::Generic
    }
}

/// Whether `path` qualifies as a candidate document.
pub fn is_candidate(path: &Path, extensions: &[String]) -> bool {
    let matches_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(e))
        })
        .unwrap_or(false);
    if matches_ext {
        return true;
    }
    let normalized = path.to_string_lossy().replace('\\', "/").to_ascii_lowercase();
    normalized.contains(&XLSTART_MARKER.to_ascii_lowercase())
}

/// A producer of candidate paths.
///
/// `out` is moved in and dropped on every return path, which closes the
/// queue for the consumer. Returns the number of paths emitted.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        root: &Path,
        extensions: &[String],
        out: mpsc::Sender<PathBuf>,
    ) -> Result<usize, SearchError>;
}

/// Generic recursive walk. Unreadable entries are skipped.
#[derive(Debug, Default, Clone)]
pub struct WalkDirSource;

#[async_trait]
impl CandidateSource for WalkDirSource {
    fn name(&self) -> &'static str {
        "walk"
    }

    async fn search(
        &self,
        root: &Path,
        extensions: &[String],
        out: mpsc::Sender<PathBuf>,
    ) -> Result<usize, SearchError> {
        validate_root(root)?;
        let root = root.to_path_buf();
        let extensions = extensions.to_vec();
        let count = tokio::task::spawn_blocking(move || {
            let mut count = 0usize;
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!("skipping unreadable entry: {err}");
                        continue;
                    }
                };
                if entry.file_type().is_dir() || !is_candidate(entry.path(), &extensions) {
                    continue;
                }
                if out.blocking_send(entry.into_path()).is_err() {
                    break;
                }
                count += 1;
            }
            count
        })
        .await
        .map_err(|e| SearchError::Io(std::io::Error::other(e)))?;
        info!("directory walk found {count} candidates");
        Ok(count)
    }
}

/// Accelerated search over the volume file record table.
///
/// This build carries no raw volume reader, so it always asks for a fallback:
/// `UnsupportedPlatform` off Windows and `Fallback` on it.
#[derive(Debug, Default, Clone)]
pub struct VolumeRecordSource;

#[async_trait]
impl CandidateSource for VolumeRecordSource {
    fn name(&self) -> &'static str {
        "volume-records"
    }

    async fn search(
        &self,
        root: &Path,
        _extensions: &[String],
        _out: mpsc::Sender<PathBuf>,
    ) -> Result<usize, SearchError> {
        validate_root(root)?;
        if cfg!(windows) {
            Err(SearchError::Fallback(
                "volume record reader not available".into(),
            ))
        } else {
            Err(SearchError::UnsupportedPlatform)
        }
    }
}

/// The search root must be an existing directory.
pub fn validate_root(root: &Path) -> Result<(), SearchError> {
    if root.as_os_str().is_empty() {
        return Err(SearchError::InvalidInput("empty path".into()));
    }
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SearchError::InvalidInput(format!(
            "{} is not a directory",
            root.display()
        ))),
        Err(e) => Err(SearchError::InvalidInput(format!("{}: {e}", root.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_EXTENSIONS;

    fn exts() -> Vec<String> {
        DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strategy_truth_table() {
        use SearchStrategy::*;
        for elevated in [false, true] {
            for fs_ok in [false, true] {
                for forced in [false, true] {
                    let want = if elevated && fs_ok && !forced {
                        Accelerated
                    } else {
                        Generic
                    };
                    assert_eq!(choose_strategy(elevated, fs_ok, forced), want);
                }
            }
        }
    }

    #[test]
    fn candidate_matching() {
        let e = exts();
        assert!(is_candidate(Path::new("/home/bob/Book1.xlsm"), &e));
        assert!(is_candidate(Path::new("/home/bob/OLD.XLS"), &e));
        assert!(!is_candidate(Path::new("/home/bob/notes.txt"), &e));
        assert!(!is_candidate(Path::new("/home/bob/xlsm"), &e));
        assert!(is_candidate(
            Path::new("C:\\Users\\bob\\AppData\\Roaming\\Microsoft\\Excel\\XLSTART\\evil.bin"),
            &e
        ));
    }

    #[tokio::test]
    async fn walk_emits_matching_files_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("a.xlsx"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/deeper/b.xlsb"), b"x").unwrap();
        std::fs::write(dir.path().join("sub/c.docx"), b"x").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let count = WalkDirSource.search(dir.path(), &exts(), tx).await.unwrap();
        assert_eq!(count, 2);

        let mut got = Vec::new();
        while let Some(p) = rx.recv().await {
            got.push(p.file_name().unwrap().to_string_lossy().to_string());
        }
        got.sort();
        assert_eq!(got, vec!["a.xlsx", "b.xlsb"]);
    }

    #[tokio::test]
    async fn bad_root_is_invalid_input() {
        let (tx, _rx) = mpsc::channel(1);
        let err = WalkDirSource
            .search(Path::new("/no/such/root/anywhere"), &exts(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::InvalidInput(_)));
        assert!(!err.triggers_fallback());
    }

    #[tokio::test]
    async fn volume_source_requests_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let err = VolumeRecordSource
            .search(dir.path(), &exts(), tx)
            .await
            .unwrap_err();
        assert!(err.triggers_fallback());
    }
}
