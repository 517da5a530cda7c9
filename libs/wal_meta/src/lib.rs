//! Metadata of a WAL archive: file-name classification, segment-number
//! arithmetic, and timeline-history parsing. No I/O besides reading
//! `.history` files; the archive scan itself lives with the catalog.

pub mod history;
pub mod names;
pub mod seg_size;

pub use history::{read_timeline_history, TimelineHistoryEntry};
pub use names::{is_xlog_file_name, WalFileName, XLOG_FNAME_LEN};
pub use seg_size::WalSegSize;

/// Timeline identifier, a monotonic label for a line of WAL history.
pub type TimeLineId = u32;

/// Sequence number of a WAL segment within its timeline.
pub type XLogSegNo = u64;
