//! Per-backup exclusive lock files.
//!
//! A backup directory is owned by at most one process at a time, announced
//! by a `backup.pid` file holding the owner's PID. Creation with `O_EXCL`
//! makes the claim atomic; a leftover file from a dead owner is detected by
//! probing the recorded PID and reclaimed. All lock files acquired by this
//! process are unlinked again by a process-exit hook.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Mutex, MutexGuard, Once};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getpid, getppid, Pid};
use once_cell::sync::Lazy;
use tracing::warn;
use utils::id::BackupId;

use crate::catalog::BackupList;
use crate::{CatalogConf, BACKUP_LOCK_FILE};

/// A launcher two generations up may pass its own PID down so that a lock
/// file left over from a previous boot cycle is still recognized as ours.
pub const GRANDPARENT_PID_ENV: &str = "PG_GRANDPARENT_PID";

/// The create/inspect/unlink cycle can race against peers doing the same.
/// Retry, but not forever: an unwritable directory would spin otherwise.
const MAX_LOCK_ATTEMPTS: u32 = 100;

/// Lock files held by this process, unlinked at exit.
static LOCK_FILES: Lazy<Mutex<Vec<Utf8PathBuf>>> = Lazy::new(|| Mutex::new(Vec::new()));
static EXIT_HOOK: Once = Once::new();

fn held_lock_files() -> MutexGuard<'static, Vec<Utf8PathBuf>> {
    match LOCK_FILES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

extern "C" fn unlink_lock_files_atexit() {
    // try_lock: never block process exit on a wedged registry
    let Ok(paths) = LOCK_FILES.try_lock() else {
        return;
    };
    for path in paths.iter() {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("{path}: {e}");
            }
        }
    }
}

fn grandparent_pid_from_env() -> Option<i32> {
    std::env::var(GRANDPARENT_PID_ENV).ok()?.trim().parse().ok()
}

/// A lock file holding our own PID, our parent's, or the grandparent PID
/// passed via the environment must be stale: a reboot can hand out exactly
/// the PID a previous owner had, and that PID now names an ancestor shell
/// of ours. On hosts without a real process hierarchy the ancestor checks
/// degrade to the self check.
fn is_self_or_ancestor(pid: i32) -> bool {
    pid == getpid().as_raw()
        || pid == getppid().as_raw()
        || Some(pid) == grandparent_pid_from_env()
}

/// Try to take the exclusive lock on a backup directory.
///
/// Returns `Ok(false)` when a live peer holds the lock, so the caller can
/// report which backup is busy. Stale locks are reclaimed. Unreadable lock
/// state and I/O failures are errors.
pub fn lock_backup(backup_dir: &Utf8Path, id: BackupId) -> anyhow::Result<bool> {
    let lock_file = backup_dir.join(BACKUP_LOCK_FILE);
    let mut ntries = 0u32;

    let file = loop {
        // O_EXCL makes the claim atomic. Keep the mode at 0600.
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&lock_file)
        {
            Ok(file) => break file,
            Err(e) => {
                let recheck =
                    matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::PermissionDenied);
                if !recheck || ntries > MAX_LOCK_ATTEMPTS {
                    return Err(e)
                        .with_context(|| format!("Could not create lock file {lock_file:?}"));
                }
            }
        }
        ntries += 1;

        // Somebody else got there first. Find out who, racing against the
        // possibility that they are just now releasing.
        let contents = match fs::read_to_string(&lock_file) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Could not open lock file {lock_file:?}"))
            }
        };
        if contents.is_empty() {
            bail!("Lock file {lock_file:?} is empty");
        }
        let owner_pid: i32 = contents
            .trim()
            .parse()
            .ok()
            .filter(|pid| *pid > 0)
            .with_context(|| {
                format!(
                    "Bogus data in lock file {lock_file:?}: \"{}\"",
                    contents.trim()
                )
            })?;

        if !is_self_or_ancestor(owner_pid) {
            match kill(Pid::from_raw(owner_pid), None) {
                Ok(()) => {
                    warn!("Process {owner_pid} is using backup {id} and still is running");
                    return Ok(false);
                }
                Err(Errno::ESRCH) => {
                    warn!("Process {owner_pid} which used backup {id} no longer exists");
                }
                Err(Errno::EPERM) => {
                    // not ours to signal, assume the owner is alive
                    warn!("Process {owner_pid} is using backup {id} and cannot be checked");
                    return Ok(false);
                }
                Err(e) => bail!("Failed to send signal 0 to a process {owner_pid}: {e}"),
            }
        }

        // Looks like nobody's home. Unlink and race for the claim again.
        fs::remove_file(&lock_file)
            .with_context(|| format!("Could not remove old lock file {lock_file:?}"))?;
    };

    let fill_result = (|| {
        (&file).write_all(format!("{}\n", getpid().as_raw()).as_bytes())?;
        file.sync_all()
    })();
    if let Err(e) = fill_result {
        let _ = fs::remove_file(&lock_file);
        return Err(e).with_context(|| format!("Could not write lock file {lock_file:?}"));
    }
    drop(file);

    EXIT_HOOK.call_once(|| unsafe {
        libc::atexit(unlink_lock_files_atexit);
    });
    held_lock_files().push(lock_file);

    Ok(true)
}

/// Release a lock this process holds. Missing files are fine; the exit hook
/// and stale detection make releases idempotent.
pub fn unlock_backup(backup_dir: &Utf8Path) -> anyhow::Result<()> {
    let lock_file = backup_dir.join(BACKUP_LOCK_FILE);
    match fs::remove_file(&lock_file) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Could not remove lock file {lock_file:?}"))
        }
    }
    held_lock_files().retain(|path| path != &lock_file);
    Ok(())
}

/// Lock a slice of the backup list, walking from the higher index to the
/// lower. Any contention is promoted to an error naming the busy backup.
pub fn lock_backup_list(
    conf: &CatalogConf,
    instance: &str,
    list: &BackupList,
    from_idx: usize,
    to_idx: usize,
) -> anyhow::Result<()> {
    if list.is_empty() {
        return Ok(());
    }

    let start = from_idx.max(to_idx);
    let end = from_idx.min(to_idx);
    for i in (end..=start).rev() {
        let backup = list.get(i);
        let dir = conf.backup_dir(instance, backup.id());
        if !lock_backup(&dir, backup.id())? {
            bail!("Cannot lock backup {} directory", backup.id());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use camino_tempfile::tempdir;

    use super::*;

    // comfortably above the default kernel pid_max, kill(2) gives ESRCH
    const DEAD_PID: i32 = 999_999_999;

    #[test]
    fn fresh_lock_is_acquired() {
        let dir = tempdir().unwrap();
        assert!(lock_backup(dir.path(), BackupId(1000)).unwrap());

        let contents = fs::read_to_string(dir.path().join(BACKUP_LOCK_FILE)).unwrap();
        assert_eq!(contents.trim().parse::<i32>().unwrap(), getpid().as_raw());

        unlock_backup(dir.path()).unwrap();
        assert!(!dir.path().join(BACKUP_LOCK_FILE).exists());
    }

    #[test]
    fn own_pid_in_lock_file_is_stale() {
        let dir = tempdir().unwrap();
        let lock_file = dir.path().join(BACKUP_LOCK_FILE);
        fs::write(&lock_file, format!("{}\n", getpid().as_raw())).unwrap();

        assert!(lock_backup(dir.path(), BackupId(1000)).unwrap());
        unlock_backup(dir.path()).unwrap();
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = tempdir().unwrap();
        let lock_file = dir.path().join(BACKUP_LOCK_FILE);
        fs::write(&lock_file, format!("{DEAD_PID}\n")).unwrap();

        assert!(lock_backup(dir.path(), BackupId(1000)).unwrap());
        let contents = fs::read_to_string(&lock_file).unwrap();
        assert_eq!(contents.trim().parse::<i32>().unwrap(), getpid().as_raw());
        unlock_backup(dir.path()).unwrap();
    }

    #[test]
    fn live_foreign_owner_is_contention() {
        let dir = tempdir().unwrap();
        let lock_file = dir.path().join(BACKUP_LOCK_FILE);
        // PID 1 always exists; signalling it yields either success or EPERM,
        // both of which mean "owned by someone alive"
        fs::write(&lock_file, "1\n").unwrap();

        assert!(!lock_backup(dir.path(), BackupId(1000)).unwrap());
        // the foreign lock file is left in place
        assert_eq!(fs::read_to_string(&lock_file).unwrap(), "1\n");
    }

    #[test]
    fn bogus_lock_contents_are_fatal() {
        let dir = tempdir().unwrap();
        let lock_file = dir.path().join(BACKUP_LOCK_FILE);

        fs::write(&lock_file, "").unwrap();
        lock_backup(dir.path(), BackupId(1000)).unwrap_err();

        fs::write(&lock_file, "not a pid\n").unwrap();
        lock_backup(dir.path(), BackupId(1000)).unwrap_err();

        fs::write(&lock_file, "-5\n").unwrap();
        lock_backup(dir.path(), BackupId(1000)).unwrap_err();
    }

    #[test]
    fn missing_backup_dir_is_fatal() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("no_such_backup");
        lock_backup(&missing, BackupId(1000)).unwrap_err();
    }
}
