use std::fs;

use anyhow::{bail, Context};
use camino::Utf8Path;
use utils::lsn::Lsn;

use crate::TimeLineId;

/// One line of timeline ancestry. `switchpoint` is the LSN at which this
/// timeline ended and its child began; invalid for the timeline the history
/// was requested for (it has not ended).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineId,
    pub switchpoint: Lsn,
}

/// File name of the history file describing `tli`'s ancestry.
pub fn timeline_history_file_name(tli: TimeLineId) -> String {
    format!("{tli:08X}.history")
}

/// Read and parse `<archive_dir>/<TLI>.history`.
///
/// The result is ordered newest first: entry 0 is `tli` itself (with an
/// invalid switchpoint), entry 1 its immediate parent, and so on. This
/// mirrors the order recovery would walk the ancestry in.
pub fn read_timeline_history(
    archive_dir: &Utf8Path,
    tli: TimeLineId,
) -> anyhow::Result<Vec<TimelineHistoryEntry>> {
    let path = archive_dir.join(timeline_history_file_name(tli));
    let contents =
        fs::read_to_string(&path).with_context(|| format!("Cannot read history file {path:?}"))?;

    let mut entries = Vec::new();
    let mut last_tli: TimeLineId = 0;

    for line in contents.lines() {
        // the server writes comment lines starting with '#'
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(tli_field), Some(lsn_field)) = (fields.next(), fields.next()) else {
            bail!("syntax error in history file {path:?}: \"{line}\"");
        };
        let entry_tli: TimeLineId = tli_field
            .parse()
            .with_context(|| format!("syntax error in history file {path:?}: \"{line}\""))?;
        let switchpoint: Lsn = lsn_field
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid switchpoint in history file {path:?}: \"{line}\""))?;

        if entry_tli <= last_tli {
            bail!("Timeline IDs must be in increasing sequence in {path:?}");
        }
        last_tli = entry_tli;

        // lines are oldest first on disk; keep the result newest first
        entries.insert(
            0,
            TimelineHistoryEntry {
                tli: entry_tli,
                switchpoint,
            },
        );
    }

    if tli <= last_tli {
        bail!("Timeline IDs must be less than child timeline's ID in {path:?}");
    }

    entries.insert(
        0,
        TimelineHistoryEntry {
            tli,
            switchpoint: Lsn::INVALID,
        },
    );

    Ok(entries)
}
