use crate::TimeLineId;

/// Length of a WAL segment file name: three zero-padded 8-digit hex fields,
/// `TTTTTTTTLLLLLLLLSSSSSSSS`.
pub const XLOG_FNAME_LEN: usize = 24;

/// What an archive directory entry's name says it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalFileName {
    /// `000000010000000000000002`
    Segment { tli: TimeLineId, log: u32, seg: u32 },
    /// `000000010000000000000002.gz`
    CompressedSegment { tli: TimeLineId, log: u32, seg: u32 },
    /// `000000010000000000000002.partial`
    PartialSegment { tli: TimeLineId, log: u32, seg: u32 },
    /// `000000010000000000000002.00000028.backup`
    BackupHistory { tli: TimeLineId, log: u32, seg: u32 },
    /// `00000002.history`
    TimelineHistory { tli: TimeLineId },
}

fn is_upper_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

fn parse_hex32(s: &str) -> Option<u32> {
    if is_upper_hex(s) {
        u32::from_str_radix(s, 16).ok()
    } else {
        None
    }
}

/// True for a plain (uncompressed, complete) WAL segment name. Suffixed
/// variants do not count.
pub fn is_xlog_file_name(name: &str) -> bool {
    name.len() == XLOG_FNAME_LEN && is_upper_hex(name)
}

/// Classify an archive file name. `None` means the name belongs to no known
/// archive file kind and the caller should warn about it.
pub fn classify(name: &str) -> Option<WalFileName> {
    // timeline history: 8 hex digits + ".history"
    if let Some(stem) = name.strip_suffix(".history") {
        if stem.len() == 8 {
            let tli = parse_hex32(stem)?;
            return Some(WalFileName::TimelineHistory { tli });
        }
        return None;
    }

    if name.len() < XLOG_FNAME_LEN || !name.is_ascii() || !is_upper_hex(&name[..XLOG_FNAME_LEN]) {
        return None;
    }
    let tli = parse_hex32(&name[0..8])?;
    let log = parse_hex32(&name[8..16])?;
    let seg = parse_hex32(&name[16..24])?;

    match &name[XLOG_FNAME_LEN..] {
        "" => Some(WalFileName::Segment { tli, log, seg }),
        ".gz" => Some(WalFileName::CompressedSegment { tli, log, seg }),
        ".partial" => Some(WalFileName::PartialSegment { tli, log, seg }),
        suffix => {
            // backup history: ".NNNNNNNN.backup" with a hex record offset
            let stem = suffix.strip_prefix('.')?.strip_suffix(".backup")?;
            if stem.len() == 8 && is_upper_hex(stem) {
                Some(WalFileName::BackupHistory { tli, log, seg })
            } else {
                None
            }
        }
    }
}
