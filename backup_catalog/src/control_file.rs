//! The `backup.control` codec.
//!
//! A textual `key = value` stanza in three fixed sections. Reading is
//! tolerant: unknown keys and garbled values produce warnings and a
//! best-effort record, except for values nobody should guess about
//! (backup mode, compression algorithm). Writing is atomic through a temp
//! file and rename.

use std::fmt::Write as _;
use std::str::FromStr;

use anyhow::Context;
use camino::Utf8Path;
use tracing::warn;
use utils::id::BackupId;
use utils::lsn::Lsn;
use utils::{crashsafe, time_ext};

use crate::backup::{Backup, BackupStatus};
use crate::config;
use crate::{CatalogConf, BACKUP_CONTROL_FILE};

/// Render the control-file stanza for `backup`.
pub fn deparse_control(backup: &Backup) -> String {
    let mut out = String::new();

    // the unwraps inside write! cannot fail on a String
    let w = &mut out;
    writeln!(w, "#Configuration").unwrap();
    writeln!(w, "backup-mode = {}", backup.backup_mode).unwrap();
    writeln!(w, "stream = {}", backup.stream).unwrap();
    writeln!(w, "compress-alg = {}", backup.compress_alg).unwrap();
    writeln!(w, "compress-level = {}", backup.compress_level).unwrap();
    writeln!(w, "from-replica = {}", backup.from_replica).unwrap();

    writeln!(w, "\n#Compatibility").unwrap();
    writeln!(w, "block-size = {}", backup.block_size).unwrap();
    writeln!(w, "xlog-block-size = {}", backup.wal_block_size).unwrap();
    writeln!(w, "checksum-version = {}", backup.checksum_version).unwrap();
    if !backup.program_version.is_empty() {
        writeln!(w, "program-version = {}", backup.program_version).unwrap();
    }
    if !backup.server_version.is_empty() {
        writeln!(w, "server-version = {}", backup.server_version).unwrap();
    }

    writeln!(w, "\n#Result backup info").unwrap();
    writeln!(w, "timelineid = {}", backup.tli).unwrap();
    writeln!(w, "start-lsn = {}", backup.start_lsn).unwrap();
    writeln!(w, "stop-lsn = {}", backup.stop_lsn).unwrap();
    writeln!(w, "start-time = '{}'", time_ext::time2iso(backup.start_time as i64)).unwrap();
    if backup.merge_time > 0 {
        writeln!(w, "merge-time = '{}'", time_ext::time2iso(backup.merge_time as i64)).unwrap();
    }
    if backup.end_time > 0 {
        writeln!(w, "end-time = '{}'", time_ext::time2iso(backup.end_time as i64)).unwrap();
    }
    writeln!(w, "recovery-xid = {}", backup.recovery_xid).unwrap();
    if backup.recovery_time > 0 {
        writeln!(
            w,
            "recovery-time = '{}'",
            time_ext::time2iso(backup.recovery_time as i64)
        )
        .unwrap();
    }

    // the size of the data directory, not counting archived WAL
    if backup.data_bytes >= 0 {
        writeln!(w, "data-bytes = {}", backup.data_bytes).unwrap();
    }
    if backup.wal_bytes >= 0 {
        writeln!(w, "wal-bytes = {}", backup.wal_bytes).unwrap();
    }
    if backup.uncompressed_bytes >= 0 {
        writeln!(w, "uncompressed-bytes = {}", backup.uncompressed_bytes).unwrap();
    }
    if backup.pgdata_bytes >= 0 {
        writeln!(w, "pgdata-bytes = {}", backup.pgdata_bytes).unwrap();
    }

    writeln!(w, "status = {}", backup.status).unwrap();

    if let Some(parent) = backup.parent_backup {
        writeln!(w, "parent-backup-id = '{parent}'").unwrap();
    }
    if let Some(conninfo) = &backup.primary_conninfo {
        writeln!(w, "primary-conninfo = '{conninfo}'").unwrap();
    }
    if let Some(dirs) = &backup.external_dir_str {
        writeln!(w, "external-dirs = '{dirs}'").unwrap();
    }

    out
}

/// Persist `backup` into its control file atomically.
pub fn write_backup(conf: &CatalogConf, instance: &str, backup: &Backup) -> anyhow::Result<()> {
    let path = conf
        .backup_dir(instance, backup.id())
        .join(BACKUP_CONTROL_FILE);
    crashsafe::overwrite(&path, deparse_control(backup).as_bytes())
        .with_context(|| format!("Cannot write control file {path:?}"))
}

/// Reread the backup with the given id and persist only a status change.
/// Silently a no-op when the control file has vanished meanwhile (the read
/// warns about it).
pub fn write_backup_status(
    conf: &CatalogConf,
    instance: &str,
    backup: &mut Backup,
    status: BackupStatus,
) -> anyhow::Result<()> {
    let Some(mut on_disk) = read_backup(conf, instance, backup.id())? else {
        return Ok(());
    };
    backup.status = status;
    on_disk.status = status;
    write_backup(conf, instance, &on_disk)
}

/// Load one backup by id. `None` when there is no usable control file.
pub fn read_backup(
    conf: &CatalogConf,
    instance: &str,
    id: BackupId,
) -> anyhow::Result<Option<Backup>> {
    let path = conf.backup_dir(instance, id).join(BACKUP_CONTROL_FILE);
    read_backup_control_file(&path)
}

fn parse_num_or_warn<T>(dst: &mut T, value: &str, key: &str, path: &Utf8Path)
where
    T: FromStr,
{
    match value.trim().parse::<T>() {
        Ok(v) => *dst = v,
        Err(_) => warn!("Invalid value \"{value}\" for option \"{key}\" in {path:?}"),
    }
}

fn parse_time_or_warn(dst: &mut u64, value: &str, key: &str, path: &Utf8Path) {
    let parsed = time_ext::parse_iso(value)
        .ok()
        .or_else(|| value.trim().parse::<i64>().ok());
    match parsed {
        Some(secs) if secs >= 0 => *dst = secs as u64,
        _ => warn!("Invalid value \"{value}\" for option \"{key}\" in {path:?}"),
    }
}

fn parse_lsn_or_warn(dst: &mut Lsn, value: &str, key: &str) {
    match value.parse::<Lsn>() {
        Ok(lsn) => *dst = lsn,
        Err(_) => warn!("Invalid {} \"{value}\"", key.to_uppercase().replace('-', "_")),
    }
}

/// Parse a control file into a backup record.
///
/// `Ok(None)` means "no backup here": the file is missing, empty, or its
/// mandatory `start-time` is absent or garbled. Those cases are warnings so
/// that a catalog scan keeps going. I/O failures and unparseable
/// mode/compression values are real errors.
pub fn read_backup_control_file(path: &Utf8Path) -> anyhow::Result<Option<Backup>> {
    if !path.exists() {
        warn!("Control file {path:?} doesn't exist");
        return Ok(None);
    }

    let options = config::read_kv_file(path)?;
    let mut backup = Backup::empty();
    let mut parsed_options = 0;

    for option in options {
        let option = match option {
            Ok(option) => option,
            Err(line) => {
                warn!("Syntax error in {path:?}: \"{line}\"");
                continue;
            }
        };
        let key = option.key.as_str();
        let value = option.value.as_str();
        parsed_options += 1;

        if config::key_matches(key, "backup-mode") {
            backup.backup_mode = value
                .parse()
                .with_context(|| format!("in control file {path:?}"))?;
        } else if config::key_matches(key, "timelineid") {
            parse_num_or_warn(&mut backup.tli, value, key, path);
        } else if config::key_matches(key, "start-lsn") {
            parse_lsn_or_warn(&mut backup.start_lsn, value, key);
        } else if config::key_matches(key, "stop-lsn") {
            parse_lsn_or_warn(&mut backup.stop_lsn, value, key);
        } else if config::key_matches(key, "start-time") {
            parse_time_or_warn(&mut backup.start_time, value, key, path);
        } else if config::key_matches(key, "merge-time") {
            parse_time_or_warn(&mut backup.merge_time, value, key, path);
        } else if config::key_matches(key, "end-time") {
            parse_time_or_warn(&mut backup.end_time, value, key, path);
        } else if config::key_matches(key, "recovery-xid") {
            parse_num_or_warn(&mut backup.recovery_xid, value, key, path);
        } else if config::key_matches(key, "recovery-time") {
            parse_time_or_warn(&mut backup.recovery_time, value, key, path);
        } else if config::key_matches(key, "data-bytes") {
            parse_num_or_warn(&mut backup.data_bytes, value, key, path);
        } else if config::key_matches(key, "wal-bytes") {
            parse_num_or_warn(&mut backup.wal_bytes, value, key, path);
        } else if config::key_matches(key, "uncompressed-bytes") {
            parse_num_or_warn(&mut backup.uncompressed_bytes, value, key, path);
        } else if config::key_matches(key, "pgdata-bytes") {
            parse_num_or_warn(&mut backup.pgdata_bytes, value, key, path);
        } else if config::key_matches(key, "block-size") {
            parse_num_or_warn(&mut backup.block_size, value, key, path);
        } else if config::key_matches(key, "xlog-block-size") {
            parse_num_or_warn(&mut backup.wal_block_size, value, key, path);
        } else if config::key_matches(key, "checksum-version") {
            parse_num_or_warn(&mut backup.checksum_version, value, key, path);
        } else if config::key_matches(key, "program-version") {
            backup.program_version = value.to_string();
        } else if config::key_matches(key, "server-version") {
            backup.server_version = value.to_string();
        } else if config::key_matches(key, "stream") {
            match config::parse_bool(value) {
                Ok(v) => backup.stream = v,
                Err(_) => warn!("Invalid value \"{value}\" for option \"{key}\" in {path:?}"),
            }
        } else if config::key_matches(key, "from-replica") {
            match config::parse_bool(value) {
                Ok(v) => backup.from_replica = v,
                Err(_) => warn!("Invalid value \"{value}\" for option \"{key}\" in {path:?}"),
            }
        } else if config::key_matches(key, "status") {
            match value.parse::<BackupStatus>() {
                Ok(status) => backup.status = status,
                Err(_) => warn!("Invalid STATUS \"{value}\""),
            }
        } else if config::key_matches(key, "parent-backup-id") {
            match value.parse::<BackupId>() {
                Ok(id) => backup.parent_backup = Some(id),
                Err(_) => warn!("Invalid parent-backup-id \"{value}\" in {path:?}"),
            }
        } else if config::key_matches(key, "compress-alg") {
            backup.compress_alg = value
                .parse()
                .with_context(|| format!("in control file {path:?}"))?;
        } else if config::key_matches(key, "compress-level") {
            parse_num_or_warn(&mut backup.compress_level, value, key, path);
        } else if config::key_matches(key, "primary-conninfo") {
            backup.primary_conninfo = Some(value.to_string());
        } else if config::key_matches(key, "external-dirs") {
            backup.external_dir_str = Some(value.to_string());
        } else {
            parsed_options -= 1;
            warn!("Unknown option \"{key}\" in {path:?}");
        }
    }

    if parsed_options == 0 {
        warn!("Control file {path:?} is empty");
        return Ok(None);
    }
    if backup.start_time == 0 {
        warn!("Invalid ID/start-time, control file {path:?} is corrupted");
        return Ok(None);
    }

    Ok(Some(backup))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use camino_tempfile::tempdir;
    use utils::lsn::Lsn;

    use super::*;
    use crate::backup::{BackupMode, CompressAlg};

    fn sample_backup() -> Backup {
        let mut backup = Backup::empty();
        backup.backup_mode = BackupMode::Delta;
        backup.status = BackupStatus::Ok;
        backup.tli = 2;
        backup.start_lsn = "0/3000028".parse().unwrap();
        backup.stop_lsn = "0/3000130".parse().unwrap();
        backup.start_time = 1566668924;
        backup.end_time = 1566668999;
        backup.recovery_xid = 570;
        backup.recovery_time = 1566668995;
        backup.data_bytes = 24175;
        backup.wal_bytes = 16777216;
        backup.uncompressed_bytes = 24175;
        backup.pgdata_bytes = 22288792;
        backup.compress_alg = CompressAlg::Zlib;
        backup.compress_level = 4;
        backup.checksum_version = 1;
        backup.stream = false;
        backup.from_replica = true;
        backup.parent_backup = Some(BackupId(1566668000));
        backup.primary_conninfo = Some("user=backup host=localhost port=5432".to_string());
        backup.program_version = "2.1.5".to_string();
        backup.server_version = "11".to_string();
        backup.external_dir_str = Some("/etc/tablespaces:/mnt/extra".to_string());
        backup
    }

    fn catalog_with_backup(backup: &Backup) -> (camino_tempfile::Utf8TempDir, CatalogConf) {
        let dir = tempdir().unwrap();
        let conf = CatalogConf::new(dir.path());
        fs::create_dir_all(conf.backup_dir("node", backup.id())).unwrap();
        (dir, conf)
    }

    #[test]
    fn write_read_roundtrip() {
        let backup = sample_backup();
        let (_dir, conf) = catalog_with_backup(&backup);

        write_backup(&conf, "node", &backup).unwrap();
        let loaded = read_backup(&conf, "node", backup.id()).unwrap().unwrap();

        assert_eq!(loaded, backup);
    }

    #[test]
    fn status_update_changes_only_status() {
        let mut backup = sample_backup();
        let (_dir, conf) = catalog_with_backup(&backup);
        write_backup(&conf, "node", &backup).unwrap();

        write_backup_status(&conf, "node", &mut backup, BackupStatus::Orphan).unwrap();
        assert_eq!(backup.status, BackupStatus::Orphan);

        let loaded = read_backup(&conf, "node", backup.id()).unwrap().unwrap();
        assert_eq!(loaded.status, BackupStatus::Orphan);
        assert_eq!(loaded.start_lsn, backup.start_lsn);
        assert_eq!(loaded.data_bytes, backup.data_bytes);
    }

    #[test]
    fn missing_control_file_is_no_backup() {
        let dir = tempdir().unwrap();
        let conf = CatalogConf::new(dir.path());
        let loaded = read_backup(&conf, "node", BackupId(12345)).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn empty_and_unknown_only_files_are_no_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.control");

        fs::write(&path, "").unwrap();
        assert!(read_backup_control_file(&path).unwrap().is_none());

        fs::write(&path, "# just comments\nwho-knows = 42\n").unwrap();
        assert!(read_backup_control_file(&path).unwrap().is_none());
    }

    #[test]
    fn missing_start_time_is_no_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.control");
        fs::write(&path, "backup-mode = full\nstatus = OK\n").unwrap();
        assert!(read_backup_control_file(&path).unwrap().is_none());
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.control");
        fs::write(
            &path,
            "backup-mode = full\nstart-time = '2019-08-24 17:48:44+00'\nfuture-option = 1\n",
        )
        .unwrap();
        let backup = read_backup_control_file(&path).unwrap().unwrap();
        assert_eq!(backup.backup_mode, BackupMode::Full);
        assert_eq!(backup.start_time, 1566668924);
    }

    #[test]
    fn bogus_mode_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.control");
        fs::write(
            &path,
            "backup-mode = sideways\nstart-time = '2019-08-24 17:48:44+00'\n",
        )
        .unwrap();
        read_backup_control_file(&path).unwrap_err();
    }

    #[test]
    fn invalid_lsn_downgrades_to_unset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.control");
        fs::write(
            &path,
            "backup-mode = full\nstart-time = '2019-08-24 17:48:44+00'\nstart-lsn = bogus\n",
        )
        .unwrap();
        let backup = read_backup_control_file(&path).unwrap().unwrap();
        assert_eq!(backup.start_lsn, Lsn::INVALID);
    }

    #[test]
    fn underscored_keys_parse_too() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("backup.control");
        fs::write(
            &path,
            "backup_mode = full\nstart_time = '2019-08-24 17:48:44+00'\nprimary_conninfo = 'x=y'\n",
        )
        .unwrap();
        let backup = read_backup_control_file(&path).unwrap().unwrap();
        assert_eq!(backup.backup_mode, BackupMode::Full);
        assert_eq!(backup.primary_conninfo.as_deref(), Some("x=y"));
    }
}
