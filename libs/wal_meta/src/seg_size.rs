use utils::lsn::Lsn;

use crate::XLogSegNo;

/// One logical WAL "log file" spans 2^32 bytes of LSN space; segment files
/// subdivide it.
const BYTES_PER_LOG: u64 = 1 << 32;

pub const DEFAULT_XLOG_SEG_SIZE: u64 = 16 * 1024 * 1024;
const MIN_XLOG_SEG_SIZE: u64 = 1024 * 1024;
const MAX_XLOG_SEG_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid WAL segment size {0}: must be a power of two between 1MB and 1GB")]
pub struct WalSegSizeError(pub u64);

/// WAL segment geometry of one instance.
///
/// Two different quantities are needed and they are easy to mix up:
/// `bytes_per_segment` converts an LSN into a segment number, while
/// `segments_per_log` converts the `log`/`seg` halves of a segment file name
/// into the same numbering. They are kept together here so neither ever
/// stands in for the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalSegSize {
    bytes_per_segment: u64,
    segments_per_log: u64,
}

impl WalSegSize {
    pub fn from_bytes(bytes: u64) -> Result<Self, WalSegSizeError> {
        if !bytes.is_power_of_two() || !(MIN_XLOG_SEG_SIZE..=MAX_XLOG_SEG_SIZE).contains(&bytes) {
            return Err(WalSegSizeError(bytes));
        }
        Ok(WalSegSize {
            bytes_per_segment: bytes,
            segments_per_log: BYTES_PER_LOG / bytes,
        })
    }

    pub fn bytes_per_segment(&self) -> u64 {
        self.bytes_per_segment
    }

    pub fn segments_per_log(&self) -> u64 {
        self.segments_per_log
    }

    /// Segment number containing the given WAL position.
    pub fn segno_of_lsn(&self, lsn: Lsn) -> XLogSegNo {
        lsn.0 / self.bytes_per_segment
    }

    /// Segment number from the `log`/`seg` halves of a segment file name.
    pub fn segno_of_name(&self, log: u32, seg: u32) -> XLogSegNo {
        log as u64 * self.segments_per_log + seg as u64
    }
}

impl Default for WalSegSize {
    fn default() -> Self {
        WalSegSize::from_bytes(DEFAULT_XLOG_SEG_SIZE).expect("default segment size is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let seg = WalSegSize::default();
        assert_eq!(seg.bytes_per_segment(), 16 * 1024 * 1024);
        assert_eq!(seg.segments_per_log(), 256);
    }

    #[test]
    fn name_and_lsn_numbering_agree() {
        let seg = WalSegSize::default();
        // segment 000000010000000100000003 covers LSNs 1/03000000..1/04000000
        let by_name = seg.segno_of_name(1, 3);
        let by_lsn = seg.segno_of_lsn("1/03000000".parse().unwrap());
        assert_eq!(by_name, by_lsn);
        assert_eq!(by_name, 256 + 3);
    }

    #[test]
    fn rejected_sizes() {
        WalSegSize::from_bytes(0).unwrap_err();
        WalSegSize::from_bytes(3 * 1024 * 1024).unwrap_err();
        WalSegSize::from_bytes(512 * 1024).unwrap_err();
        WalSegSize::from_bytes(2 * 1024 * 1024 * 1024).unwrap_err();
        WalSegSize::from_bytes(64 * 1024 * 1024).unwrap();
    }
}
