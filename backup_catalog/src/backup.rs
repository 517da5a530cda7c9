//! The backup record and its enumerated attributes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utils::id::BackupId;
use utils::lsn::Lsn;
use wal_meta::TimeLineId;

/// Database block size the backups were taken with. Used as the default for
/// freshly initialized records until the control file says otherwise.
pub const BLCKSZ: u32 = 8192;
pub const XLOG_BLCKSZ: u32 = 8192;

/// Sentinel for the signed byte counters: the value was never computed.
pub const BYTES_INVALID: i64 = -1;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what} \"{value}\"")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

/// How the backup was taken: a base copy or one of the incremental flavours.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackupMode {
    /// Unset or unparseable; only seen on stub records.
    #[default]
    Invalid,
    /// Page-level incremental, based on WAL scan.
    Page,
    /// Page-level incremental, based on the ptrack map.
    Ptrack,
    /// Block-level incremental, reads every file and copies changed blocks.
    Delta,
    /// Full copy of the data directory.
    Full,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Invalid => "invalid",
            BackupMode::Page => "page",
            BackupMode::Ptrack => "ptrack",
            BackupMode::Delta => "delta",
            BackupMode::Full => "full",
        }
    }
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(BackupMode::Full),
            "page" => Ok(BackupMode::Page),
            "ptrack" => Ok(BackupMode::Ptrack),
            "delta" => Ok(BackupMode::Delta),
            _ => Err(ParseEnumError {
                what: "backup-mode",
                value: s.to_string(),
            }),
        }
    }
}

/// Lifecycle state persisted in the control file, uppercase on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackupStatus {
    /// Unset, or the control file was unreadable.
    #[default]
    Invalid,
    Ok,
    Error,
    Running,
    Merging,
    Deleting,
    Deleted,
    Done,
    Orphan,
    Corrupt,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Invalid => "INVALID",
            BackupStatus::Ok => "OK",
            BackupStatus::Error => "ERROR",
            BackupStatus::Running => "RUNNING",
            BackupStatus::Merging => "MERGING",
            BackupStatus::Deleting => "DELETING",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Done => "DONE",
            BackupStatus::Orphan => "ORPHAN",
            BackupStatus::Corrupt => "CORRUPT",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "OK" => Ok(BackupStatus::Ok),
            "ERROR" => Ok(BackupStatus::Error),
            "RUNNING" => Ok(BackupStatus::Running),
            "MERGING" => Ok(BackupStatus::Merging),
            "DELETING" => Ok(BackupStatus::Deleting),
            "DELETED" => Ok(BackupStatus::Deleted),
            "DONE" => Ok(BackupStatus::Done),
            "ORPHAN" => Ok(BackupStatus::Orphan),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            _ => Err(ParseEnumError {
                what: "status",
                value: s.to_string(),
            }),
        }
    }
}

/// Compression applied to backed-up files.
///
/// `NotDefined` and `None` both render as `"none"`, so the distinction is
/// lost on a write/read round-trip; nothing downstream tells them apart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressAlg {
    #[default]
    NotDefined,
    None,
    Pglz,
    Zlib,
}

impl CompressAlg {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressAlg::NotDefined | CompressAlg::None => "none",
            CompressAlg::Pglz => "pglz",
            CompressAlg::Zlib => "zlib",
        }
    }
}

impl fmt::Display for CompressAlg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressAlg {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(CompressAlg::None),
            "pglz" => Ok(CompressAlg::Pglz),
            "zlib" => Ok(CompressAlg::Zlib),
            _ => Err(ParseEnumError {
                what: "compress algorithm",
                value: s.to_string(),
            }),
        }
    }
}

impl Serialize for CompressAlg {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CompressAlg {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Everything the catalog knows about one backup.
///
/// Identified by `start_time`; the base36 rendering of that value is the
/// backup's directory name. `parent_backup_link` is a weak edge: an index
/// into the list the scanner returned, resolved after loading and allowed
/// to stay unset when the parent is missing from disk.
#[derive(Clone, Debug, PartialEq)]
pub struct Backup {
    pub backup_mode: BackupMode,
    pub status: BackupStatus,
    pub tli: TimeLineId,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,

    /// Seconds since epoch; doubles as the backup id.
    pub start_time: u64,
    pub merge_time: u64,
    pub end_time: u64,
    pub recovery_xid: u64,
    pub recovery_time: u64,

    pub data_bytes: i64,
    pub wal_bytes: i64,
    pub uncompressed_bytes: i64,
    pub pgdata_bytes: i64,

    pub compress_alg: CompressAlg,
    pub compress_level: i32,

    pub block_size: u32,
    pub wal_block_size: u32,
    pub checksum_version: u32,

    pub stream: bool,
    pub from_replica: bool,

    pub parent_backup: Option<BackupId>,
    /// Index of the parent in the owning backup list; never persisted.
    pub parent_backup_link: Option<usize>,

    pub primary_conninfo: Option<String>,
    pub program_version: String,
    pub server_version: String,
    /// Colon-separated list of external directory paths.
    pub external_dir_str: Option<String>,
}

impl Backup {
    /// A record with nothing filled in yet.
    pub fn empty() -> Backup {
        Backup {
            backup_mode: BackupMode::Invalid,
            status: BackupStatus::Invalid,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            start_time: 0,
            merge_time: 0,
            end_time: 0,
            recovery_xid: 0,
            recovery_time: 0,
            data_bytes: BYTES_INVALID,
            wal_bytes: BYTES_INVALID,
            uncompressed_bytes: 0,
            pgdata_bytes: 0,
            compress_alg: CompressAlg::NotDefined,
            compress_level: 1,
            block_size: BLCKSZ,
            wal_block_size: XLOG_BLCKSZ,
            checksum_version: 0,
            stream: false,
            from_replica: false,
            parent_backup: None,
            parent_backup_link: None,
            primary_conninfo: None,
            program_version: String::new(),
            server_version: String::new(),
            external_dir_str: None,
        }
    }

    /// Placeholder for a backup directory whose control file is missing or
    /// unreadable. Keeps garbage entries visible for cleanup commands.
    pub fn stub(id: BackupId) -> Backup {
        Backup {
            start_time: id.0,
            ..Backup::empty()
        }
    }

    pub fn id(&self) -> BackupId {
        BackupId(self.start_time)
    }

    /// Anything that is not FULL depends on an ancestor.
    pub fn is_incremental(&self) -> bool {
        self.backup_mode != BackupMode::Full
    }

    /// Only OK and DONE backups can be restored from or serve as parents.
    pub fn is_valid_status(&self) -> bool {
        matches!(self.status, BackupStatus::Ok | BackupStatus::Done)
    }
}
