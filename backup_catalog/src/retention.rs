//! WAL retention: decide which archived segments must survive a purge.
//!
//! The single knob is the instance's `wal_depth`: on every timeline, the
//! newest `wal_depth` valid backups must stay capable of point-in-time
//! recovery. The backup whose start position satisfies the depth becomes
//! the timeline's anchor; everything from the anchor onward is kept.
//!
//! ```text
//! ---B----B1------B2------B3----->   timeline 1, wal_depth = 2
//!
//!    B    B1      B2------B3----->   segments kept after a purge
//! ```
//!
//! Two complications:
//!
//! * A timeline with fewer than `wal_depth` usable backups must stay
//!   reachable through its ancestry. Its anchor is then borrowed from the
//!   closest valid backup below the branch point, and the segment ranges
//!   connecting that backup to the branch point are pinned on each ancestor
//!   timeline.
//! * Backups older than the anchor that rely on the archive (ARCHIVE
//!   wal-mode) still need the segments between their start and stop
//!   positions to restore consistently, so those ranges are pinned as well.
//!   STREAM backups carry their own WAL and need nothing from the archive.

use tracing::debug;
use utils::lsn::Lsn;
use wal_meta::TimeLineId;

use crate::catalog::BackupList;
use crate::instance::InstanceConfig;
use crate::wal_archive::{SegnoInterval, TimelineInfo};

/// Annotate `timelines` with anchors, pinned segment intervals, and per-file
/// `keep` flags. A non-positive `wal_depth` leaves everything untouched.
pub fn apply_wal_retention(
    instance: &InstanceConfig,
    timelines: &mut [TimelineInfo],
    backups: &BackupList,
) {
    if instance.wal_depth <= 0 {
        return;
    }
    let seg_size = instance.wal_seg_size;

    for i in 0..timelines.len() {
        // Walk this timeline's backups newest first and let the wal_depth'th
        // usable one become the anchor. The list is id-descending, and ids
        // follow start order.
        let mut anchor: Option<(Lsn, TimeLineId)> = None;
        {
            let timeline = &timelines[i];
            let mut count = 0;
            for &idx in &timeline.backups {
                let backup = backups.get(idx);
                if !backup.is_valid_status() {
                    continue;
                }
                // sanity
                if !backup.start_lsn.is_valid() || backup.tli == 0 {
                    continue;
                }

                debug!("Timeline {}: backup {}", timeline.tli, backup.id());
                count += 1;
                if count == instance.wal_depth {
                    debug!("Timeline {}: anchor {}", timeline.tli, backup.id());
                    anchor = Some((backup.start_lsn, backup.tli));
                    break;
                }
            }
        }
        if let Some((anchor_lsn, anchor_tli)) = anchor {
            timelines[i].anchor_lsn = anchor_lsn;
            timelines[i].anchor_tli = anchor_tli;
        } else {
            // Not enough usable backups here. Borrow the anchor from the
            // closest backup below the branch point, if recovery can reach
            // this timeline at all, and pin the connecting segment ranges
            // on the ancestor timelines.
            let Some(closest_idx) = timelines[i].closest_backup else {
                // unreachable timeline, regular purge rules apply
                continue;
            };
            let closest = backups.get(closest_idx);
            // sanity
            if !closest.start_lsn.is_valid() || closest.tli == 0 {
                continue;
            }

            timelines[i].anchor_lsn = closest.start_lsn;
            timelines[i].anchor_tli = closest.tli;

            let closest_tli = closest.tli;
            let closest_start = closest.start_lsn;
            let mut cur = i;
            while let Some(parent) = timelines[cur].parent_link {
                let switch_segno = seg_size.segno_of_lsn(timelines[cur].switchpoint);
                if timelines[parent].tli != closest_tli {
                    // the whole observed stretch up to the branch point
                    let begin_segno = timelines[parent].begin_segno;
                    timelines[parent].keep_segments.push(SegnoInterval {
                        begin_segno,
                        end_segno: switch_segno,
                    });
                    cur = parent;
                } else {
                    // reached the timeline holding the closest backup
                    timelines[parent].keep_segments.push(SegnoInterval {
                        begin_segno: seg_size.segno_of_lsn(closest_start),
                        end_segno: switch_segno,
                    });
                    break;
                }
            }

            // this timeline is wholly protected through its ancestry
            continue;
        }

        // Pin the start..stop ranges of ARCHIVE backups older than the
        // anchor; they are not covered by it but must stay restorable.
        let anchor_lsn = timelines[i].anchor_lsn;
        let mut pinned = Vec::new();
        for &idx in &timelines[i].backups {
            let backup = backups.get(idx);
            // streamed WAL is embedded in the backup itself
            if backup.stream {
                continue;
            }
            // sanity
            if !backup.start_lsn.is_valid() || backup.tli == 0 {
                continue;
            }
            if backup.start_lsn >= anchor_lsn {
                continue;
            }

            let begin_segno = seg_size.segno_of_lsn(backup.start_lsn);
            let mut end_segno = seg_size.segno_of_lsn(backup.stop_lsn);
            // a standby's stop position may point at a record that
            // continues into the next segment
            if backup.from_replica {
                end_segno += 1;
            }
            pinned.push(SegnoInterval {
                begin_segno,
                end_segno,
            });
        }
        timelines[i].keep_segments.extend(pinned);
    }

    // Translate anchors and pinned intervals into per-file keep flags.
    for timeline in timelines.iter_mut() {
        // no anchor: the timeline is left to the regular purge rules
        if !timeline.anchor_lsn.is_valid() {
            continue;
        }
        // an anchor on another timeline protects this one entirely
        if timeline.anchor_tli > 0 && timeline.anchor_tli != timeline.tli {
            continue;
        }

        let anchor_segno = seg_size.segno_of_lsn(timeline.anchor_lsn);
        for wal_file in &mut timeline.xlog_filelist {
            if wal_file.segno >= anchor_segno {
                wal_file.keep = true;
                continue;
            }
            if timeline
                .keep_segments
                .iter()
                .any(|interval| interval.contains(wal_file.segno))
            {
                wal_file.keep = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;

    use super::*;
    use crate::backup::{Backup, BackupMode, BackupStatus};
    use crate::wal_archive::{WalFile, WalFileType};

    fn make_backup(start_time: u64, tli: TimeLineId, start_lsn: &str, stop_lsn: &str) -> Backup {
        let mut backup = Backup::empty();
        backup.start_time = start_time;
        backup.backup_mode = BackupMode::Full;
        backup.status = BackupStatus::Ok;
        backup.tli = tli;
        backup.start_lsn = start_lsn.parse().unwrap();
        backup.stop_lsn = stop_lsn.parse().unwrap();
        backup
    }

    fn wal_file(segno: u64) -> WalFile {
        let name = format!("0000000100000000{:08X}", segno);
        WalFile {
            path: Utf8PathBuf::from(format!("/archive/{name}")),
            name,
            size: 16,
            segno,
            file_type: WalFileType::Segment,
            compressed: false,
            keep: false,
        }
    }

    fn timeline_with_files(tli: TimeLineId, segnos: std::ops::RangeInclusive<u64>) -> TimelineInfo {
        let mut timeline = TimelineInfo::new(tli);
        timeline.begin_segno = *segnos.start();
        timeline.end_segno = *segnos.end();
        for segno in segnos {
            timeline.xlog_filelist.push(wal_file(segno));
            timeline.n_xlog_files += 1;
        }
        timeline
    }

    fn bucket(timelines: &mut [TimelineInfo], backups: &BackupList) {
        for timeline in timelines.iter_mut() {
            timeline.backups = backups
                .iter()
                .enumerate()
                .filter(|(_, b)| b.tli == timeline.tli)
                .map(|(i, _)| i)
                .collect();
        }
    }

    fn instance_with_depth(wal_depth: i32) -> InstanceConfig {
        let mut instance = InstanceConfig::new("node");
        instance.wal_depth = wal_depth;
        instance
    }

    fn kept_segnos(timeline: &TimelineInfo) -> Vec<u64> {
        timeline
            .xlog_filelist
            .iter()
            .filter(|f| f.keep)
            .map(|f| f.segno)
            .collect()
    }

    #[test]
    fn zero_depth_disables_retention() {
        let backups =
            BackupList::from_backups(vec![make_backup(1000, 1, "0/3000028", "0/3000130")]);
        let mut timelines = vec![timeline_with_files(1, 1..=10)];
        bucket(&mut timelines, &backups);

        apply_wal_retention(&instance_with_depth(0), &mut timelines, &backups);
        assert!(!timelines[0].anchor_lsn.is_valid());
        assert!(kept_segnos(&timelines[0]).is_empty());
    }

    #[test]
    fn anchor_keeps_tail_and_pins_older_archive_backups() {
        // newest -> oldest: D, C, B, A on one timeline, wal_depth = 2,
        // so C anchors; B and A get pinned start..stop ranges
        let backups = BackupList::from_backups(vec![
            make_backup(1000, 1, "0/1000028", "0/1000130"), // A: segno 1
            make_backup(2000, 1, "0/3000028", "0/3000130"), // B: segno 3
            make_backup(3000, 1, "0/6000028", "0/6000130"), // C: segno 6
            make_backup(4000, 1, "0/9000028", "0/9000130"), // D: segno 9
        ]);
        let mut timelines = vec![timeline_with_files(1, 1..=10)];
        bucket(&mut timelines, &backups);

        apply_wal_retention(&instance_with_depth(2), &mut timelines, &backups);

        let tl = &timelines[0];
        assert_eq!(tl.anchor_lsn, "0/6000028".parse().unwrap());
        assert_eq!(tl.anchor_tli, 1);
        assert_eq!(
            tl.keep_segments,
            vec![
                SegnoInterval { begin_segno: 3, end_segno: 3 },
                SegnoInterval { begin_segno: 1, end_segno: 1 },
            ]
        );
        // 6.. from the anchor, 1 and 3 for the pinned backups; 2, 4, 5 purgeable
        assert_eq!(kept_segnos(tl), vec![1, 3, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn stream_backups_pin_nothing() {
        let mut stream_backup = make_backup(1000, 1, "0/1000028", "0/1000130");
        stream_backup.stream = true;
        let backups = BackupList::from_backups(vec![
            stream_backup,
            make_backup(3000, 1, "0/6000028", "0/6000130"),
        ]);
        let mut timelines = vec![timeline_with_files(1, 1..=10)];
        bucket(&mut timelines, &backups);

        apply_wal_retention(&instance_with_depth(1), &mut timelines, &backups);

        let tl = &timelines[0];
        assert_eq!(tl.anchor_lsn, "0/6000028".parse().unwrap());
        assert!(tl.keep_segments.is_empty());
        assert_eq!(kept_segnos(tl), vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn replica_stop_position_rounds_up_a_segment() {
        // R's stop lsn lands in segno 42; with from_replica the pinned
        // interval must end at 43
        let mut replica_backup = make_backup(1000, 1, "0/28000028", "0/2A000130"); // 40..42
        replica_backup.from_replica = true;
        let backups = BackupList::from_backups(vec![
            replica_backup,
            make_backup(3000, 1, "0/2D000028", "0/2D000130"), // segno 45
        ]);
        let mut timelines = vec![timeline_with_files(1, 40..=46)];
        bucket(&mut timelines, &backups);

        apply_wal_retention(&instance_with_depth(1), &mut timelines, &backups);

        let tl = &timelines[0];
        assert_eq!(
            tl.keep_segments,
            vec![SegnoInterval { begin_segno: 40, end_segno: 43 }]
        );
        assert_eq!(kept_segnos(tl), vec![40, 41, 42, 43, 45, 46]);
    }

    #[test]
    fn branched_timeline_borrows_anchor_from_parent() {
        // timeline 2 branched at 0/5000000 and has no backups of its own;
        // the FULL on timeline 1 below the branch point must keep it
        // reachable
        let backups =
            BackupList::from_backups(vec![make_backup(1000, 1, "0/3000028", "0/3000130")]);

        let tl1 = timeline_with_files(1, 1..=8);
        let mut tl2 = timeline_with_files(2, 5..=9);
        tl2.parent_tli = 1;
        tl2.parent_link = Some(0);
        tl2.switchpoint = "0/5000000".parse().unwrap();
        tl2.closest_backup = Some(0);
        let mut timelines = vec![tl1, tl2];
        bucket(&mut timelines, &backups);

        apply_wal_retention(&instance_with_depth(1), &mut timelines, &backups);

        // timeline 2 is wholly protected by an anchor on timeline 1
        assert_eq!(timelines[1].anchor_tli, 1);
        assert_eq!(timelines[1].anchor_lsn, "0/3000028".parse().unwrap());
        assert!(kept_segnos(&timelines[1]).is_empty());

        // timeline 1 pinned the stretch from the closest backup to the
        // branch point, on top of its own anchor
        assert_eq!(
            timelines[0].keep_segments,
            vec![SegnoInterval { begin_segno: 3, end_segno: 5 }]
        );
        // its own anchor already keeps 3.., so the pin changes nothing here
        assert_eq!(kept_segnos(&timelines[0]), vec![3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn depth_below_backup_count_walks_grandparents() {
        // timeline 3 -> timeline 2 -> timeline 1, closest backup on 1;
        // the intermediate timeline pins its whole observed stretch
        let backups =
            BackupList::from_backups(vec![make_backup(1000, 1, "0/2000028", "0/2000130")]);

        let tl1 = timeline_with_files(1, 1..=6);
        let mut tl2 = timeline_with_files(2, 5..=12);
        tl2.parent_tli = 1;
        tl2.parent_link = Some(0);
        tl2.switchpoint = "0/5000000".parse().unwrap();
        tl2.closest_backup = Some(0);
        let mut tl3 = timeline_with_files(3, 11..=14);
        tl3.parent_tli = 2;
        tl3.parent_link = Some(1);
        tl3.switchpoint = "0/B000000".parse().unwrap();
        tl3.closest_backup = Some(0);
        let mut timelines = vec![tl1, tl2, tl3];
        bucket(&mut timelines, &backups);

        apply_wal_retention(&instance_with_depth(1), &mut timelines, &backups);

        // timeline 3 borrowed its anchor from timeline 1
        assert_eq!(timelines[2].anchor_tli, 1);
        // timeline 2 pinned begin..switchpoint(tl3), timeline 1 pinned
        // closest..switchpoint(tl2); timeline 2 walked the same way for its
        // own protection
        assert!(timelines[1]
            .keep_segments
            .contains(&SegnoInterval { begin_segno: 5, end_segno: 11 }));
        assert!(timelines[0]
            .keep_segments
            .contains(&SegnoInterval { begin_segno: 2, end_segno: 5 }));

        // timeline 1 marks files by anchor + pins
        assert_eq!(kept_segnos(&timelines[0]), vec![2, 3, 4, 5, 6]);
        // timelines 2 and 3 carry foreign anchors, no per-file marking
        assert!(kept_segnos(&timelines[1]).is_empty());
        assert!(kept_segnos(&timelines[2]).is_empty());
    }

    #[test]
    fn unreachable_timeline_is_left_alone() {
        let backups = BackupList::from_backups(vec![]);
        let mut timelines = vec![timeline_with_files(7, 1..=4)];
        bucket(&mut timelines, &backups);

        apply_wal_retention(&instance_with_depth(2), &mut timelines, &backups);
        assert!(!timelines[0].anchor_lsn.is_valid());
        assert!(timelines[0].keep_segments.is_empty());
        assert!(kept_segnos(&timelines[0]).is_empty());
    }
}
