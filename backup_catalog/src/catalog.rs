//! Scanning the catalog directory tree and reasoning about the backup DAG.
//!
//! The scanner owns every record it returns; relationships between backups
//! (parent links, timeline buckets) are indices into the returned list, so
//! a missing parent is simply an unresolved index and never a dangling
//! pointer.

use anyhow::Context;
use tracing::{info, warn};
use utils::id::BackupId;
use wal_meta::TimeLineId;

use crate::backup::{Backup, BackupMode};
use crate::control_file;
use crate::instance::InstanceConfig;
use crate::{is_hidden_name, CatalogConf, BACKUP_CONTROL_FILE};

/// Enumerate the instances registered in the catalog, with their
/// configuration. An empty catalog is unusual enough to warn about but is
/// not an error.
pub fn list_instances(conf: &CatalogConf) -> anyhow::Result<Vec<InstanceConfig>> {
    let path = conf.backups_dir();
    let mut instances = Vec::new();

    let dir = path
        .read_dir_utf8()
        .with_context(|| format!("Cannot open directory {path:?}"))?;
    for entry in dir {
        let entry = entry.with_context(|| format!("Cannot read directory {path:?}"))?;
        let name = entry.file_name();
        if is_hidden_name(name) || !entry.path().is_dir() {
            continue;
        }
        instances.push(InstanceConfig::load(conf, name)?);
    }

    if instances.is_empty() {
        warn!("This backup catalog contains no backup instances");
    }

    instances.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(instances)
}

/// Outcome of walking a backup's ancestry towards its base FULL backup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParentChain {
    /// The walk ended on a non-FULL backup: some ancestor is missing from
    /// the catalog (or the chain is corrupted). Holds the oldest ancestor
    /// that is still present.
    Broken { oldest_present: usize },
    /// Every ancestor is present but at least one is not OK/DONE. Holds the
    /// oldest such ancestor.
    Damaged { oldest_invalid: usize },
    /// Every ancestor is present and OK/DONE. Holds the base FULL backup.
    Intact { base_full: usize },
}

/// All backups of one instance, sorted by id descending. The element order
/// is what every index-valued edge in the catalog refers to, so the list
/// never reorders itself after construction.
#[derive(Debug, Default)]
pub struct BackupList {
    backups: Vec<Backup>,
}

impl BackupList {
    /// Build a list from loose records: sort by id descending and resolve
    /// parent links.
    pub fn from_backups(mut backups: Vec<Backup>) -> BackupList {
        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let mut list = BackupList { backups };
        list.link_parents();
        list
    }

    /// Scan one instance's backup directories.
    ///
    /// Directories without a readable control file surface as INVALID stubs
    /// so that cleanup commands can still see them. With `requested` set,
    /// only the matching backup is returned.
    pub fn load(
        conf: &CatalogConf,
        instance: &str,
        requested: Option<BackupId>,
    ) -> anyhow::Result<BackupList> {
        let instance_path = conf.instance_dir(instance);
        let mut backups = Vec::new();

        let dir = instance_path
            .read_dir_utf8()
            .with_context(|| format!("Cannot open directory {instance_path:?}"))?;
        for entry in dir {
            let entry =
                entry.with_context(|| format!("Cannot read directory {instance_path:?}"))?;
            let name = entry.file_name();
            if is_hidden_name(name) || !entry.path().is_dir() {
                continue;
            }

            let control_path = entry.path().join(BACKUP_CONTROL_FILE);
            let backup = match control_file::read_backup_control_file(&control_path)? {
                Some(backup) => {
                    if backup.id().to_string() != name {
                        warn!(
                            "backup ID in control file {:?} doesn't match name of the backup folder {:?}",
                            backup.id().to_string(),
                            control_path
                        );
                    }
                    backup
                }
                None => {
                    // keep the entry visible as a stub, if the directory
                    // name still tells us which backup it was
                    match name.parse::<BackupId>() {
                        Ok(id) => Backup::stub(id),
                        Err(_) => {
                            warn!("Skip directory {:?}: not a backup", entry.path());
                            continue;
                        }
                    }
                }
            };

            if let Some(requested) = requested {
                if backup.id() != requested {
                    continue;
                }
            }
            backups.push(backup);
        }

        Ok(BackupList::from_backups(backups))
    }

    /// Resolve `parent_backup` ids into indices. The list is sorted by id
    /// descending, so a binary search with reversed ordering finds the
    /// ancestor; ids without a match stay unlinked.
    fn link_parents(&mut self) {
        for i in 0..self.backups.len() {
            if self.backups[i].backup_mode == BackupMode::Full {
                continue;
            }
            let Some(parent) = self.backups[i].parent_backup else {
                continue;
            };
            let found = self
                .backups
                .binary_search_by(|probe| probe.start_time.cmp(&parent.0).reverse());
            if let Ok(parent_idx) = found {
                self.backups[i].parent_backup_link = Some(parent_idx);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backups.is_empty()
    }

    pub fn get(&self, idx: usize) -> &Backup {
        &self.backups[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backup> {
        self.backups.iter()
    }

    pub fn backups(&self) -> &[Backup] {
        &self.backups
    }

    /// Position of a backup in this list, warning on a miss.
    pub fn index_of(&self, id: BackupId) -> Option<usize> {
        let found = self.backups.iter().position(|b| b.id() == id);
        if found.is_none() {
            warn!("Failed to find backup {id}");
        }
        found
    }

    /// Walk the parent links of `idx` to their end and hand back the base
    /// FULL backup, or `None` (with a warning) when the chain does not lead
    /// to one.
    pub fn find_parent_full(&self, idx: usize) -> Option<usize> {
        let mut cur = idx;
        while let Some(parent) = self.backups[cur].parent_backup_link {
            cur = parent;
        }

        let end = &self.backups[cur];
        if end.backup_mode != BackupMode::Full {
            if let Some(missing) = end.parent_backup {
                warn!("Backup {missing} is missing");
            } else {
                warn!(
                    "Failed to find parent FULL backup for {}",
                    self.backups[idx].id()
                );
            }
            return None;
        }
        Some(cur)
    }

    /// Classify the ancestry of `idx`; see [`ParentChain`].
    pub fn scan_parent_chain(&self, idx: usize) -> ParentChain {
        let mut cur = idx;
        let mut oldest_invalid = None;

        loop {
            if !self.backups[cur].is_valid_status() {
                oldest_invalid = Some(cur);
            }
            match self.backups[cur].parent_backup_link {
                Some(parent) => cur = parent,
                None => break,
            }
        }

        if self.backups[cur].backup_mode != BackupMode::Full {
            // the invalid-status of a dead-end ancestor is beside the point
            return ParentChain::Broken { oldest_present: cur };
        }
        if let Some(oldest_invalid) = oldest_invalid {
            return ParentChain::Damaged { oldest_invalid };
        }
        ParentChain::Intact { base_full: cur }
    }

    /// Does `child_idx` descend from the backup with id `parent_id`?
    ///
    /// This follows recorded `parent_backup` ids, so it answers "descends
    /// from" even across a gap where the chain is otherwise broken; it does
    /// not guarantee the chain is intact. With `inclusive`, a backup counts
    /// as its own descendant.
    pub fn is_parent(&self, parent_id: BackupId, child_idx: usize, inclusive: bool) -> bool {
        if inclusive && self.backups[child_idx].id() == parent_id {
            return true;
        }

        let mut cur = child_idx;
        loop {
            if self.backups[cur].parent_backup == Some(parent_id) {
                return true;
            }
            match self.backups[cur].parent_backup_link {
                Some(parent) => cur = parent,
                None => return false,
            }
        }
    }

    /// Find the latest valid descendant of the latest valid FULL backup on
    /// the given timeline; the natural parent for a new incremental backup.
    ///
    /// Backups with a broken or partly-invalid ancestry are reported and
    /// skipped. `current_id` names the backup being taken right now, which
    /// must not parent itself.
    pub fn last_data_backup(&self, tli: TimeLineId, current_id: BackupId) -> Option<usize> {
        let full_idx = self.backups.iter().position(|b| {
            b.backup_mode == BackupMode::Full && b.is_valid_status() && b.tli == tli
        })?;
        let full_id = self.backups[full_idx].id();
        info!("Latest valid FULL backup: {full_id}");

        for (i, backup) in self.backups.iter().enumerate() {
            if backup.is_valid_status() {
                match self.scan_parent_chain(i) {
                    ParentChain::Broken { oldest_present } => {
                        let missing = self.backups[oldest_present]
                            .parent_backup
                            .unwrap_or(BackupId::INVALID);
                        warn!(
                            "Backup {} has missing parent: {missing}. Cannot be a parent",
                            backup.id()
                        );
                    }
                    ParentChain::Damaged { oldest_invalid } => {
                        warn!(
                            "Backup {} has invalid parent: {}. Cannot be a parent",
                            backup.id(),
                            self.backups[oldest_invalid].id()
                        );
                    }
                    ParentChain::Intact { .. } => {
                        if self.is_parent(full_id, i, true) {
                            info!("Parent backup: {}", backup.id());
                            return Some(i);
                        }
                    }
                }
            } else if backup.id() == current_id {
                // skip yourself
            } else {
                warn!(
                    "Backup {} has status: {}. Cannot be a parent.",
                    backup.id(),
                    backup.status
                );
            }
        }

        None
    }

    /// True when at least two valid backups name `target_idx` as their
    /// direct parent. Deleting such a backup would orphan a whole subtree.
    pub fn is_prolific(&self, target_idx: usize) -> bool {
        let target_id = self.backups[target_idx].id();
        let children = self
            .backups
            .iter()
            .filter(|b| b.parent_backup == Some(target_id) && b.is_valid_status())
            .count();
        children >= 2
    }
}
