//! Backup catalog core of a physical-backup manager for a WAL-logged
//! database.
//!
//! The catalog is the on-disk and in-memory authority over which backups
//! exist, how they relate across WAL timelines, which archived WAL segments
//! retention must preserve, and which process currently owns a backup for
//! exclusive mutation. The physical copy pipelines, transports, and the CLI
//! all live elsewhere and drive this crate through its public API.
//!
//! On-disk layout:
//!
//! ```text
//! <backup_root>/
//!   backups/
//!     <instance>/
//!       instance.conf
//!       <base36(start_time)>/
//!         backup.control
//!         backup.pid
//!         database/
//!         database_file_list
//!         external_directories/externaldir<N>/
//!   wal/
//!     <instance>/
//!       XXXXXXXXXXXXXXXXXXXXXXXX[.gz|.partial|.NNNNNNNN.backup]
//!       XXXXXXXX.history
//! ```

use camino::Utf8PathBuf;
use utils::id::BackupId;

pub mod backup;
pub mod backup_dir;
pub mod catalog;
pub mod config;
pub mod control_file;
pub mod file_list;
pub mod instance;
pub mod lock_file;
pub mod retention;
pub mod wal_archive;

/// Backup metadata, one per backup directory. Written atomically.
pub const BACKUP_CONTROL_FILE: &str = "backup.control";

/// Exclusive lock file, holds the owner's PID.
pub const BACKUP_LOCK_FILE: &str = "backup.pid";

/// Newline-delimited JSON list of every file in the backup.
pub const DATABASE_FILE_LIST: &str = "database_file_list";

/// Per-instance configuration, next to the backup directories.
pub const INSTANCE_CONFIG_FILE: &str = "instance.conf";

/// Data directory contents inside a backup directory.
pub const DATABASE_DIR: &str = "database";

/// Container for copies of the instance's external directories.
pub const EXTERNAL_DIR: &str = "external_directories";

const BACKUPS_DIR: &str = "backups";
const WAL_DIR: &str = "wal";

/// Location of one backup catalog on disk. All path composition goes
/// through here.
#[derive(Clone, Debug)]
pub struct CatalogConf {
    pub backup_root: Utf8PathBuf,
}

impl CatalogConf {
    pub fn new(backup_root: impl Into<Utf8PathBuf>) -> Self {
        CatalogConf {
            backup_root: backup_root.into(),
        }
    }

    /// `<root>/backups`, the parent of all instance directories.
    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.backup_root.join(BACKUPS_DIR)
    }

    /// `<root>/backups/<instance>`.
    pub fn instance_dir(&self, instance: &str) -> Utf8PathBuf {
        self.backups_dir().join(instance)
    }

    /// `<root>/wal/<instance>`, the WAL archive of one instance.
    pub fn wal_dir(&self, instance: &str) -> Utf8PathBuf {
        self.backup_root.join(WAL_DIR).join(instance)
    }

    /// `<root>/backups/<instance>/<base36 id>`.
    pub fn backup_dir(&self, instance: &str, id: BackupId) -> Utf8PathBuf {
        self.instance_dir(instance).join(id.to_string())
    }
}

pub(crate) fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}
