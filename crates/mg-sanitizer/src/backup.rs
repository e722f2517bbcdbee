use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

/// Prefix given to a document after it was sanitized.
pub const SANITIZED_PREFIX: &str = "G-";

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".gz.bak");
    PathBuf::from(name)
}

/// Write a gzip copy of `path` next to it as `<name>.gz.bak`.
///
/// A copy that fails halfway removes the partial archive.
pub fn archive(path: &Path) -> io::Result<PathBuf> {
    let dest = backup_path(path);
    let src = BufReader::new(File::open(path)?);
    let out = File::create(&dest)?;
    if let Err(e) = compress(src, out) {
        if let Err(rm) = std::fs::remove_file(&dest) {
            tracing::warn!("cannot remove partial backup {}: {rm}", dest.display());
        }
        return Err(e);
    }
    Ok(dest)
}

fn compress(mut src: impl Read, out: File) -> io::Result<()> {
    let mut gz = GzEncoder::new(BufWriter::new(out), Compression::fast());
    io::copy(&mut src, &mut gz)?;
    let mut out = gz.finish()?;
    out.flush()?;
    out.get_ref().sync_all()
}

/// Rename `dir/name` to `dir/G-name`, so sync clients drop cached state.
pub fn mark_sanitized(path: &Path) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut renamed = std::ffi::OsString::from(SANITIZED_PREFIX);
    renamed.push(name);
    let dest = path.with_file_name(renamed);
    std::fs::rename(path, &dest)?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn archive_is_gzip_of_original() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("Book1.xlsm");
        std::fs::write(&doc, b"PK\x03\x04 spreadsheet bytes").unwrap();

        let bak = archive(&doc).unwrap();
        assert_eq!(bak, dir.path().join("Book1.xlsm.gz.bak"));

        let mut plain = Vec::new();
        GzDecoder::new(File::open(&bak).unwrap())
            .read_to_end(&mut plain)
            .unwrap();
        assert_eq!(plain, b"PK\x03\x04 spreadsheet bytes");
    }

    #[test]
    fn archive_of_missing_file_fails_without_leaving_backup() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("gone.xls");
        assert!(archive(&doc).is_err());
        assert!(!backup_path(&doc).exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_copy_removes_partial_backup() {
        // Opening a directory succeeds on Unix; reading it does not.
        let dir = tempfile::tempdir().unwrap();
        let unreadable = dir.path().join("Book1.xlsm");
        std::fs::create_dir(&unreadable).unwrap();

        assert!(archive(&unreadable).is_err());
        assert!(!backup_path(&unreadable).exists());
    }

    #[test]
    fn mark_sanitized_prefixes_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("Book1.xlsm");
        std::fs::write(&doc, b"x").unwrap();

        let renamed = mark_sanitized(&doc).unwrap();
        assert_eq!(renamed, dir.path().join("G-Book1.xlsm"));
        assert!(renamed.exists());
        assert!(!doc.exists());
    }
}
