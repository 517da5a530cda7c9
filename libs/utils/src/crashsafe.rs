use std::fs::{self, File};
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};

/// Suffix carried by the temporary side of an atomic overwrite. A file with
/// this suffix left on disk is a torn write from a crashed peer and can be
/// unlinked by anyone.
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

fn temp_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut s = path.to_string();
    s.push_str(TEMP_FILE_SUFFIX);
    Utf8PathBuf::from(s)
}

/// Overwrite `final_path` with `content` so that a crash at any point leaves
/// either the old version or the new one: write to `<final_path>.tmp`, fsync,
/// rename over the destination, fsync the parent directory.
///
/// On failure the temp file is unlinked (best effort) and the error returned;
/// the destination is untouched.
pub fn overwrite(final_path: &Utf8Path, content: &[u8]) -> io::Result<()> {
    let tmp_path = temp_path(final_path);

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file); // close before rename
        fs::rename(&tmp_path, final_path)?;
        if let Some(parent) = final_path.parent() {
            fsync(parent)?;
        }
        Ok(())
    })();

    if result.is_err() {
        // ignore secondary failure, the original error matters more
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

/// Flush a file or directory to disk.
pub fn fsync(path: &Utf8Path) -> io::Result<()> {
    File::open(path)
        .and_then(|file| file.sync_all())
        .map_err(|e| io::Error::new(e.kind(), format!("Failed to fsync file {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    #[test]
    fn overwrite_is_visible_and_replaces() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("backup.control");

        overwrite(&target, b"status = RUNNING\n").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"status = RUNNING\n");

        overwrite(&target, b"status = OK\n").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"status = OK\n");

        // no temp leftovers after a successful overwrite
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn overwrite_failure_keeps_old_version() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("missing_subdir").join("backup.control");

        // parent directory does not exist, create must fail
        overwrite(&target, b"whatever").unwrap_err();
        assert!(!target.exists());
    }
}
