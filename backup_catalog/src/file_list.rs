//! The `database_file_list` codec: one JSON object per line describing every
//! file captured in a backup, plus the rollup byte totals computed while
//! writing.

use std::fs::{self, File};
use std::io::{BufWriter, Write};

use anyhow::Context;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use utils::crashsafe::{self, TEMP_FILE_SUFFIX};

use crate::backup::{Backup, CompressAlg, BLCKSZ};
use crate::{CatalogConf, DATABASE_FILE_LIST};

/// Write window for the list; flushed when full and at close.
pub const FILE_LIST_BUFFER_SIZE: usize = BLCKSZ as usize * 500;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

/// Directories have no meaningful size of their own; account a nominal
/// block for each.
const DIRECTORY_NOMINAL_BYTES: i64 = 4096;

/// One file captured in a backup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackupFileEntry {
    /// Path relative to the backup's data directory (or to the external
    /// directory slot named by `external_dir_num`).
    pub path: String,
    /// Bytes actually written into the backup for this file.
    pub size: i64,
    /// Raw `st_mode` bits.
    pub mode: u32,
    pub is_datafile: bool,
    pub is_cfs: bool,
    pub crc: u32,
    pub compress_alg: CompressAlg,
    /// 0 means the main data directory; external directories count from 1.
    pub external_dir_num: u32,
    #[serde(rename = "dbOid")]
    pub db_oid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_blocks: Option<i32>,
    /// Size before compression; consulted for the rollups, never persisted.
    #[serde(skip)]
    pub uncompressed_size: i64,
}

impl BackupFileEntry {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Byte totals accumulated while writing a file list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileListTotals {
    pub data_bytes: i64,
    pub wal_bytes: i64,
    pub uncompressed_bytes: i64,
}

impl FileListTotals {
    fn account(&mut self, entry: &BackupFileEntry) {
        if entry.is_dir() {
            self.data_bytes += DIRECTORY_NOMINAL_BYTES;
            self.uncompressed_bytes += DIRECTORY_NOMINAL_BYTES;
            return;
        }
        if entry.is_regular() && entry.size > 0 {
            // WAL streamed into the data directory is counted separately
            if entry.external_dir_num == 0 && wal_meta::is_xlog_file_name(entry.file_name()) {
                self.wal_bytes += entry.size;
            } else {
                self.data_bytes += entry.size;
                self.uncompressed_bytes += entry.uncompressed_size;
            }
        }
    }
}

/// Stream `files` into the backup's `database_file_list`, one JSON object
/// per line, atomically via a temp file. On success the rollup totals are
/// stored back into `backup`.
pub fn write_backup_filelist(
    conf: &CatalogConf,
    instance: &str,
    backup: &mut Backup,
    files: &[BackupFileEntry],
) -> anyhow::Result<()> {
    let path = conf
        .backup_dir(instance, backup.id())
        .join(DATABASE_FILE_LIST);
    let tmp_path = Utf8PathBuf::from(format!("{path}{TEMP_FILE_SUFFIX}"));

    let mut totals = FileListTotals::default();

    let result = (|| -> anyhow::Result<()> {
        let file = File::create(&tmp_path)?;
        let mut out = BufWriter::with_capacity(FILE_LIST_BUFFER_SIZE, file);

        for entry in files {
            totals.account(entry);
            serde_json::to_writer(&mut out, entry)?;
            out.write_all(b"\n")?;
        }

        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);

        fs::rename(&tmp_path, &path)?;
        if let Some(parent) = path.parent() {
            crashsafe::fsync(parent)?;
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.with_context(|| format!("Cannot write file list {tmp_path:?}"))?;

    backup.data_bytes = totals.data_bytes;
    backup.wal_bytes = totals.wal_bytes;
    backup.uncompressed_bytes = totals.uncompressed_bytes;
    Ok(())
}

/// Load the file list of a backup. A missing or garbled list is fatal for
/// the caller; there is nothing sensible to do with a backup whose contents
/// are unknown.
pub fn read_backup_filelist(
    conf: &CatalogConf,
    instance: &str,
    backup: &Backup,
) -> anyhow::Result<Vec<BackupFileEntry>> {
    let path = conf
        .backup_dir(instance, backup.id())
        .join(DATABASE_FILE_LIST);
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to get file list for backup {}", backup.id()))?;

    let mut files = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: BackupFileEntry = serde_json::from_str(line)
            .with_context(|| format!("Invalid line {} in file list {path:?}", lineno + 1))?;
        files.push(entry);
    }
    Ok(files)
}
