//! Scanning one instance's WAL archive into per-timeline state.
//!
//! The archive directory is walked in file-name order, so segments arrive
//! grouped by timeline and ascending, with each timeline's `.history` file
//! first. The scan yields a [`TimelineInfo`] per timeline: its observed
//! segment interval, the gaps in it, its parent timeline as declared by the
//! history file, and the backups that were taken on it.

use anyhow::{anyhow, Context};
use camino::Utf8PathBuf;
use tracing::{debug, warn};
use utils::lsn::Lsn;
use walkdir::WalkDir;
use wal_meta::{names, read_timeline_history, TimeLineId, XLogSegNo};

use crate::catalog::BackupList;
use crate::instance::InstanceConfig;
use crate::retention;
use crate::CatalogConf;

/// What kind of archive file a [`WalFile`] entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalFileType {
    /// A complete WAL segment, plain or compressed.
    Segment,
    /// An incomplete segment left behind by a promoted standby.
    PartialSegment,
    /// A backup history file; bookkeeping only, carries no WAL.
    BackupHistoryFile,
}

/// One file of the WAL archive, annotated with its segment number and the
/// retention verdict.
#[derive(Clone, Debug)]
pub struct WalFile {
    pub path: Utf8PathBuf,
    pub name: String,
    pub size: u64,
    pub segno: XLogSegNo,
    pub file_type: WalFileType,
    pub compressed: bool,
    /// Set by the retention engine: this file must survive a WAL purge.
    pub keep: bool,
}

/// A closed interval of segment numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegnoInterval {
    pub begin_segno: XLogSegNo,
    pub end_segno: XLogSegNo,
}

impl SegnoInterval {
    pub fn contains(&self, segno: XLogSegNo) -> bool {
        (self.begin_segno..=self.end_segno).contains(&segno)
    }
}

/// Everything the catalog knows about one timeline of the archive.
///
/// `parent_link`, `oldest_backup`, and `closest_backup` are indices into
/// the timelines vector and the backup list respectively; the timeline
/// owns only its own file list and intervals.
#[derive(Clone, Debug)]
pub struct TimelineInfo {
    pub tli: TimeLineId,
    /// Where this timeline branched off its parent; invalid for timeline 1.
    pub switchpoint: Lsn,
    pub parent_tli: TimeLineId,
    /// Index of the parent in the timelines list, when it is on the archive.
    pub parent_link: Option<usize>,

    /// First and last segment observed on the archive for this timeline.
    pub begin_segno: XLogSegNo,
    pub end_segno: XLogSegNo,
    /// Number of complete segment files, compressed companions included.
    pub n_xlog_files: usize,
    /// Bytes of all counted segment files.
    pub size: u64,

    pub xlog_filelist: Vec<WalFile>,
    /// Gaps in the segment sequence, each a proper closed interval.
    pub lost_segments: Vec<SegnoInterval>,

    /// Indices into the instance's backup list, in list (id-descending)
    /// order.
    pub backups: Vec<usize>,
    pub oldest_backup: Option<usize>,
    pub closest_backup: Option<usize>,

    /// Retention state; invalid until the retention engine ran.
    pub anchor_lsn: Lsn,
    pub anchor_tli: TimeLineId,
    pub keep_segments: Vec<SegnoInterval>,
}

impl TimelineInfo {
    pub fn new(tli: TimeLineId) -> TimelineInfo {
        TimelineInfo {
            tli,
            switchpoint: Lsn::INVALID,
            parent_tli: 0,
            parent_link: None,
            begin_segno: 0,
            end_segno: 0,
            n_xlog_files: 0,
            size: 0,
            xlog_filelist: Vec::new(),
            lost_segments: Vec::new(),
            backups: Vec::new(),
            oldest_backup: None,
            closest_backup: None,
            anchor_lsn: Lsn::INVALID,
            anchor_tli: 0,
            keep_segments: Vec::new(),
        }
    }
}

/// The current accumulator is the last pushed timeline; start a new one
/// whenever the walk crosses into a different timeline.
fn current_timeline(timelines: &mut Vec<TimelineInfo>, tli: TimeLineId) -> &mut TimelineInfo {
    if timelines.last().map_or(true, |t| t.tli != tli) {
        timelines.push(TimelineInfo::new(tli));
    }
    let last = timelines.len() - 1;
    &mut timelines[last]
}

/// Scan the WAL archive of `instance` and attach `backups` to the timelines
/// they were taken on.
pub fn scan_wal_archive(
    conf: &CatalogConf,
    instance: &InstanceConfig,
    backups: &BackupList,
) -> anyhow::Result<Vec<TimelineInfo>> {
    let archive_dir = conf.wal_dir(&instance.name);
    let seg_size = instance.wal_seg_size;

    let mut timelines: Vec<TimelineInfo> = Vec::new();

    for entry in WalkDir::new(&archive_dir).min_depth(1).sort_by_file_name() {
        let entry =
            entry.with_context(|| format!("Cannot read WAL archive {archive_dir:?}"))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .with_context(|| format!("Cannot stat file {:?}", entry.path()))?
            .len();
        let path = Utf8PathBuf::from_path_buf(entry.into_path())
            .map_err(|p| anyhow!("non-UTF8 file name in WAL archive: {p:?}"))?;
        let Some(name) = path.file_name().map(str::to_string) else {
            continue;
        };

        match names::classify(&name) {
            None => {
                warn!("unexpected WAL file name \"{name}\"");
            }
            Some(names::WalFileName::TimelineHistory { tli }) => {
                if timelines.last().map_or(true, |t| t.tli != tli) {
                    let history = read_timeline_history(&archive_dir, tli)?;
                    let timeline = current_timeline(&mut timelines, tli);
                    // entry 0 is the timeline itself, entry 1 its parent
                    if let Some(parent) = history.get(1) {
                        timeline.switchpoint = parent.switchpoint;
                        timeline.parent_tli = parent.tli;
                    }
                }
            }
            Some(names::WalFileName::BackupHistory { tli, log, seg }) => {
                debug!("backup history file \"{name}\"");
                let segno = seg_size.segno_of_name(log, seg);
                let timeline = current_timeline(&mut timelines, tli);
                timeline.xlog_filelist.push(WalFile {
                    path,
                    name,
                    size,
                    segno,
                    file_type: WalFileType::BackupHistoryFile,
                    compressed: false,
                    keep: false,
                });
            }
            Some(names::WalFileName::PartialSegment { tli, log, seg }) => {
                debug!("partial WAL file \"{name}\"");
                let segno = seg_size.segno_of_name(log, seg);
                let timeline = current_timeline(&mut timelines, tli);
                timeline.xlog_filelist.push(WalFile {
                    path,
                    name,
                    size,
                    segno,
                    file_type: WalFileType::PartialSegment,
                    compressed: false,
                    keep: false,
                });
            }
            Some(
                names::WalFileName::Segment { tli, log, seg }
                | names::WalFileName::CompressedSegment { tli, log, seg },
            ) => {
                let compressed = name.ends_with(".gz");
                let segno = seg_size.segno_of_name(log, seg);
                let timeline = current_timeline(&mut timelines, tli);

                // Segments before the first observed one may be lost or may
                // never have existed; only gaps inside the run are reported.
                if timeline.n_xlog_files != 0 {
                    let expected = timeline.end_segno + 1;
                    if segno == timeline.end_segno {
                        // a repeated segno is fine only as a plain/.gz pair
                        let companion = timeline
                            .xlog_filelist
                            .iter()
                            .rev()
                            .find(|f| f.file_type == WalFileType::Segment);
                        if companion.map_or(true, |f| f.compressed == compressed) {
                            warn!("duplicate WAL segment \"{name}\"");
                        }
                    } else if segno != expected {
                        timeline.lost_segments.push(SegnoInterval {
                            begin_segno: expected,
                            end_segno: segno - 1,
                        });
                    }
                }

                if timeline.begin_segno == 0 {
                    timeline.begin_segno = segno;
                }
                // the last file of this timeline so far
                timeline.end_segno = segno;
                timeline.n_xlog_files += 1;
                timeline.size += size;

                timeline.xlog_filelist.push(WalFile {
                    path,
                    name,
                    size,
                    segno,
                    file_type: WalFileType::Segment,
                    compressed,
                    keep: false,
                });
            }
        }
    }

    // resolve parent pointers; a parent always sorts (and was pushed)
    // before its children
    for i in 0..timelines.len() {
        let parent_tli = timelines[i].parent_tli;
        if parent_tli == 0 {
            continue;
        }
        let parent_pos = timelines[..i].iter().position(|t| t.tli == parent_tli);
        timelines[i].parent_link = parent_pos;
    }

    // attach backups to the timeline they were taken on
    for timeline in &mut timelines {
        for (idx, backup) in backups.iter().enumerate() {
            if backup.tli == timeline.tli {
                timeline.backups.push(idx);
            }
        }
    }

    for i in 0..timelines.len() {
        timelines[i].oldest_backup = oldest_backup(&timelines[i], backups);
        timelines[i].closest_backup = closest_backup(&timelines, i, backups);
    }

    Ok(timelines)
}

/// Scan the archive and run WAL retention over the result. The returned
/// backup list owns every record the timelines refer to by index.
pub fn load_timelines(
    conf: &CatalogConf,
    instance: &InstanceConfig,
) -> anyhow::Result<(Vec<TimelineInfo>, BackupList)> {
    let backups = BackupList::load(conf, &instance.name, None)?;
    let mut timelines = scan_wal_archive(conf, instance, &backups)?;
    retention::apply_wal_retention(instance, &mut timelines, &backups);
    Ok((timelines, backups))
}

/// The backup on this timeline needing the most of its WAL: the one with
/// the smallest valid start position.
fn oldest_backup(timeline: &TimelineInfo, backups: &BackupList) -> Option<usize> {
    let mut oldest: Option<usize> = None;
    for &idx in &timeline.backups {
        let backup = backups.get(idx);
        if !backup.start_lsn.is_valid() {
            continue;
        }
        if oldest.map_or(true, |o| backup.start_lsn < backups.get(o).start_lsn) {
            oldest = Some(idx);
        }
    }
    oldest
}

/// Walk parent timelines and find the valid backup closest below this
/// timeline's branch point. `None` means the timeline is unreachable by
/// point-in-time recovery from any backup.
fn closest_backup(
    timelines: &[TimelineInfo],
    tl_idx: usize,
    backups: &BackupList,
) -> Option<usize> {
    let mut closest: Option<usize> = None;
    let mut cur = tl_idx;

    while closest.is_none() {
        let parent = timelines[cur].parent_link?;
        let switchpoint = timelines[cur].switchpoint;

        for &idx in &timelines[parent].backups {
            let backup = backups.get(idx);
            // only valid backups finished before the branch point count
            if backup.stop_lsn.is_valid()
                && backup.stop_lsn <= switchpoint
                && backup.is_valid_status()
            {
                if closest.map_or(true, |c| backup.stop_lsn > backups.get(c).stop_lsn) {
                    closest = Some(idx);
                }
            }
        }
        cur = parent;
    }

    closest
}
