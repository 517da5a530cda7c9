//! Creating the directory tree of a fresh backup.

use std::fs::DirBuilder;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;

use anyhow::{bail, Context};
use camino::Utf8Path;

use crate::backup::Backup;
use crate::{CatalogConf, DATABASE_DIR, EXTERNAL_DIR};

const DIR_PERMISSION: u32 = 0o700;

/// Split a colon-separated list of external directory paths, dropping empty
/// components. Sorted, so slot numbering is stable across runs.
pub fn make_external_directory_list(external_dir_str: &str) -> Vec<String> {
    let mut dirs: Vec<String> = external_dir_str
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    dirs.sort();
    dirs
}

/// Name of the container for the N-th external directory, counting from 1.
pub fn external_dir_slot(num: usize) -> String {
    format!("{EXTERNAL_DIR}/externaldir{num}")
}

fn dir_is_empty(path: &Utf8Path) -> anyhow::Result<bool> {
    match path.read_dir_utf8() {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e).with_context(|| format!("Cannot open directory {path:?}")),
    }
}

/// Create the directory tree for `backup`: the backup directory itself, the
/// database dir, and one slot per external directory. Refuses a destination
/// that already has contents.
pub fn create_backup_dir(
    conf: &CatalogConf,
    instance: &str,
    backup: &Backup,
) -> anyhow::Result<()> {
    let mut subdirs = vec![DATABASE_DIR.to_string()];
    if let Some(external_str) = &backup.external_dir_str {
        // numeration of external dir slots starts with 1
        for (i, _) in make_external_directory_list(external_str).iter().enumerate() {
            subdirs.push(external_dir_slot(i + 1));
        }
    }

    let path = conf.backup_dir(instance, backup.id());
    if !dir_is_empty(&path)? {
        bail!("backup destination is not empty {path:?}");
    }

    let mut builder = DirBuilder::new();
    builder.recursive(true).mode(DIR_PERMISSION);

    builder
        .create(&path)
        .with_context(|| format!("Cannot create directory {path:?}"))?;
    for subdir in subdirs {
        let subdir_path = path.join(subdir);
        builder
            .create(&subdir_path)
            .with_context(|| format!("Cannot create directory {subdir_path:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino_tempfile::tempdir;
    use utils::id::BackupId;

    use super::*;

    #[test]
    fn external_list_is_split_and_sorted() {
        assert_eq!(
            make_external_directory_list("/mnt/b:/mnt/a::/mnt/c"),
            vec!["/mnt/a", "/mnt/b", "/mnt/c"]
        );
        assert!(make_external_directory_list("").is_empty());
    }

    #[test]
    fn creates_database_and_external_slots() {
        let dir = tempdir().unwrap();
        let conf = CatalogConf::new(dir.path());
        let mut backup = Backup::stub(BackupId(1000));
        backup.external_dir_str = Some("/etc/tablespaces:/mnt/extra".to_string());

        create_backup_dir(&conf, "node", &backup).unwrap();

        let base = conf.backup_dir("node", backup.id());
        assert!(base.join(DATABASE_DIR).is_dir());
        assert!(base.join("external_directories/externaldir1").is_dir());
        assert!(base.join("external_directories/externaldir2").is_dir());
        assert!(!base.join("external_directories/externaldir3").exists());
    }

    #[test]
    fn refuses_non_empty_destination() {
        let dir = tempdir().unwrap();
        let conf = CatalogConf::new(dir.path());
        let backup = Backup::stub(BackupId(1000));

        let base = conf.backup_dir("node", backup.id());
        fs::create_dir_all(&base).unwrap();
        fs::write(base.join("leftover"), "x").unwrap();

        create_backup_dir(&conf, "node", &backup).unwrap_err();
    }

    #[test]
    fn empty_existing_destination_is_reused() {
        let dir = tempdir().unwrap();
        let conf = CatalogConf::new(dir.path());
        let backup = Backup::stub(BackupId(1000));

        fs::create_dir_all(conf.backup_dir("node", backup.id())).unwrap();
        create_backup_dir(&conf, "node", &backup).unwrap();
        assert!(conf.backup_dir("node", backup.id()).join(DATABASE_DIR).is_dir());
    }
}
