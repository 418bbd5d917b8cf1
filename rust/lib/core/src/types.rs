use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::ClientError;

/// Prefix marking ids minted locally for optimistic entities.
pub const PROVISIONAL_PREFIX: &str = "local-";

/// Generate a new random ID (UUIDv4, no dashes).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string().replace('-', "")
}

/// Generate an id for an optimistic entity that has no server record yet.
pub fn provisional_id() -> String {
    format!("{}{}", PROVISIONAL_PREFIX, new_id())
}

/// Whether `id` was minted by [`provisional_id`].
pub fn is_provisional(id: &str) -> bool {
    id.starts_with(PROVISIONAL_PREFIX)
}

/// Get the current time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Parse a backend timestamp. Accepts RFC 3339 as well as the
/// `YYYY-MM-DD HH:MM:SS[.fff][+00]` form some databases emit.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ClientError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let trimmed = raw.trim_end_matches("+00").trim_end_matches('Z');
    chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|_| ClientError::Decode(format!("invalid timestamp '{}'", raw)))
}

/// Source of "now" for time-windowed views.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and scripted demos.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));
    }

    #[test]
    fn provisional_ids_are_recognised() {
        let id = provisional_id();
        assert!(is_provisional(&id));
        assert!(!is_provisional(&new_id()));
    }

    #[test]
    fn parse_rfc3339_with_offset() {
        let ts = parse_timestamp("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn parse_database_style_timestamp() {
        let ts = parse_timestamp("2024-05-01 12:00:00.123456+00").unwrap();
        assert_eq!(ts.timestamp(), 1714564800);
    }

    #[test]
    fn parse_garbage_is_decode_error() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert_eq!(err.error_code(), "DECODE");
    }

    #[test]
    fn manual_clock_advances() {
        let start = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let clock = ManualClock::new(start);
        clock.advance(chrono::Duration::hours(3));
        assert_eq!(clock.now(), start + chrono::Duration::hours(3));
    }
}
