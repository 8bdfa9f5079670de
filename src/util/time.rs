use time::OffsetDateTime;

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn now_millis() -> i64 {
    unix_millis(OffsetDateTime::now_utc())
}
