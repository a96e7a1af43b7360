//! Timestamp conversion for logical-decoding frames
//!
//! Stream timestamps are microseconds since the PostgreSQL epoch
//! (2000-01-01T00:00:00Z). These helpers shift them onto the Unix epoch for
//! display; no timezone handling beyond UTC.

use chrono::{DateTime, Utc};

// Seconds from Unix epoch (1970) to PostgreSQL epoch (2000)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Convert a stream timestamp (microseconds since 2000-01-01T00:00:00Z) to
/// a UTC datetime. Returns `None` for values outside chrono's range.
pub fn pg_micros_to_utc(ts: i64) -> Option<DateTime<Utc>> {
    let secs = ts.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let nsecs = ts.rem_euclid(1_000_000) * 1_000;
    DateTime::from_timestamp(secs, nsecs as u32)
}

/// Format a stream timestamp as "YYYY-MM-DD HH:MM:SS.ssssss UTC", falling
/// back to the raw microsecond count when out of range.
pub fn format_pg_timestamp(ts: i64) -> String {
    match pg_micros_to_utc(ts) {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S%.6f UTC").to_string(),
        None => format!("{ts}us since 2000-01-01"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_origin_maps_to_2000() {
        assert_eq!(format_pg_timestamp(0), "2000-01-01 00:00:00.000000 UTC");
    }

    #[test]
    fn microsecond_precision_is_kept() {
        let one_day = 86_400i64 * 1_000_000;
        assert_eq!(
            format_pg_timestamp(one_day + 1),
            "2000-01-02 00:00:00.000001 UTC"
        );
    }

    #[test]
    fn pre_epoch_values_convert() {
        let dt = pg_micros_to_utc(-1_000_000).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "1999-12-31 23:59:59");
    }
}
