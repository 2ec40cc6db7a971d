//! File timestamp handling for deployments.
//!
//! The diff engine compares client and server modification times, and the
//! orchestrator writes client times back onto merged files so that the next
//! comparison stays meaningful. Both sides go through this module so they agree
//! on resolution: browsers report milliseconds, so that is the unit compared.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use filetime::FileTime;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Size and modification time of a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStamp {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl FileStamp {
    /// Read the stamp of `path`. Fails with `NotFound` when nothing is there.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        Ok(Self {
            size: metadata.len(),
            modified: system_time_to_utc(metadata.modified()?),
        })
    }
}

/// Convert a filesystem time to UTC. Pre-epoch times are clamped to the epoch.
pub fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time).max(DateTime::<Utc>::UNIX_EPOCH)
}

/// Whether two timestamps are equal at millisecond resolution.
pub fn same_instant(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    a.timestamp_millis() == b.timestamp_millis()
}

/// Set the last-modified time of `path`, keeping millisecond precision.
pub fn set_modified(path: &Path, when: &DateTime<Utc>) -> io::Result<()> {
    let millis = when.timestamp_millis();
    let secs = millis.div_euclid(1000);
    let nanos = (millis.rem_euclid(1000) * 1_000_000) as u32;
    filetime::set_file_mtime(path, FileTime::from_unix_time(secs, nanos))
}

/// Parse a client-supplied timestamp: RFC 3339 text, ISO 8601 text without
/// an offset (taken as UTC), or Unix milliseconds.
pub fn parse_client_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Serde `deserialize_with` for client timestamps: any text
/// [`parse_client_timestamp`] accepts, or a number of milliseconds.
pub fn deserialize_client_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }

    let parsed = match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
        Raw::Text(text) => parse_client_timestamp(&text),
    };
    parsed.ok_or_else(|| D::Error::custom("invalid timestamp"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_stamp_reads_size() -> io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"test content")?;
        temp_file.flush()?;

        let stamp = FileStamp::from_path(temp_file.path())?;
        assert_eq!(stamp.size, 12);
        assert!(stamp.modified.timestamp() > 0);
        Ok(())
    }

    #[test]
    fn test_set_modified_round_trips_millis() -> io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        let when = Utc.timestamp_millis_opt(1_700_000_123_456).unwrap();

        set_modified(temp_file.path(), &when)?;
        let stamp = FileStamp::from_path(temp_file.path())?;

        assert!(same_instant(&stamp.modified, &when));
        Ok(())
    }

    #[test]
    fn test_parse_client_timestamp() {
        let rfc = parse_client_timestamp("2024-03-01T10:20:30.123Z").unwrap();
        assert_eq!(rfc.timestamp_millis(), 1_709_288_430_123);

        let millis = parse_client_timestamp("1709288430123").unwrap();
        assert!(same_instant(&rfc, &millis));

        let no_offset = parse_client_timestamp("2024-03-01T10:20:30.1230000").unwrap();
        assert_eq!(no_offset, rfc);
        let whole_seconds = parse_client_timestamp("2024-03-01T10:20:30").unwrap();
        assert_eq!(whole_seconds.timestamp(), rfc.timestamp());

        assert!(parse_client_timestamp("").is_none());
        assert!(parse_client_timestamp("yesterday").is_none());
    }
}
