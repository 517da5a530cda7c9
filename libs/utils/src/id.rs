use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Identifier of a single backup: its start time in seconds since epoch.
/// The canonical rendering is lowercase base36 and doubles as the backup's
/// directory name on disk.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct BackupId(pub u64);

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid backup id \"{0}\"")]
pub struct BackupIdParseError(pub String);

impl BackupId {
    /// `0` never names a real backup (nothing starts at the epoch).
    pub const INVALID: BackupId = BackupId(0);

    pub fn is_valid(self) -> bool {
        self != BackupId::INVALID
    }
}

/// Render `n` in lowercase base36.
pub fn base36enc(mut n: u64) -> String {
    let mut buf = [0u8; 13]; // u64::MAX is 13 base36 digits
    let mut pos = buf.len();

    loop {
        pos -= 1;
        buf[pos] = BASE36_DIGITS[(n % 36) as usize];
        n /= 36;
        if n == 0 {
            break;
        }
    }

    // written digits are pure ASCII
    std::str::from_utf8(&buf[pos..]).unwrap().to_string()
}

/// Decode a base36 string. Both letter cases are accepted; the canonical
/// form produced by [`base36enc`] is lowercase.
pub fn base36dec(s: &str) -> Result<u64, BackupIdParseError> {
    if s.is_empty() {
        return Err(BackupIdParseError(s.to_string()));
    }
    let mut n: u64 = 0;
    for c in s.chars() {
        let digit = c
            .to_digit(36)
            .ok_or_else(|| BackupIdParseError(s.to_string()))?;
        n = n
            .checked_mul(36)
            .and_then(|n| n.checked_add(digit as u64))
            .ok_or_else(|| BackupIdParseError(s.to_string()))?;
    }
    Ok(n)
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&base36enc(self.0))
    }
}

impl FromStr for BackupId {
    type Err = BackupIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        base36dec(s).map(BackupId)
    }
}

impl Serialize for BackupId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BackupId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
