use anyhow::{anyhow, Context};
use chrono::{DateTime, Local, TimeZone};

/// Render epoch seconds as ISO-8601 in the local timezone with a numeric
/// offset, e.g. `2019-08-24 18:28:44+0300`. This is the form persisted in
/// control files.
pub fn time2iso(epoch_secs: i64) -> String {
    let ts: DateTime<Local> = match Local.timestamp_opt(epoch_secs, 0) {
        chrono::LocalResult::Single(ts) => ts,
        // ambiguous or out of range, fall back to something still parseable
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        // out of range for a calendar rendering; raw seconds still parse back
        chrono::LocalResult::None => return format!("{epoch_secs}"),
    };
    ts.format("%Y-%m-%d %H:%M:%S%z").to_string()
}

/// Parse an ISO-8601 timestamp with numeric offset back into epoch seconds.
/// Accepts both `+0300` and `+03` style offsets.
pub fn parse_iso(value: &str) -> anyhow::Result<i64> {
    let value = value.trim();
    // %#z accepts offsets with the minutes part omitted
    for format in ["%Y-%m-%d %H:%M:%S%#z", "%Y-%m-%dT%H:%M:%S%#z"] {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Ok(ts.timestamp());
        }
    }
    // no offset at all: interpret in the local timezone
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Local
            .from_local_datetime(&naive)
            .single()
            .map(|ts| ts.timestamp())
            .ok_or_else(|| anyhow!("ambiguous local time \"{value}\""));
    }
    Err(anyhow!("invalid timestamp \"{value}\"")).context("expected YYYY-MM-DD HH:MM:SS[+TZ]")
}
