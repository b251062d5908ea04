use chrono::{DateTime, Utc};
use std::time::SystemTime;

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Normalizes a filesystem timestamp to UTC, falling back to the current
/// time when the platform cannot report one.
pub fn system_time_utc(time: Result<SystemTime, std::io::Error>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::{now_utc, system_time_utc};
    use chrono::Utc;
    use std::io;
    use std::time::SystemTime;

    #[test]
    fn now_utc_returns_current_time() {
        let before = Utc::now();
        let now = now_utc();
        let after = Utc::now();
        assert!(now >= before);
        assert!(now <= after);
    }

    #[test]
    fn system_time_converts_and_falls_back() {
        let converted = system_time_utc(Ok(SystemTime::UNIX_EPOCH));
        assert_eq!(converted.timestamp(), 0);

        let before = Utc::now();
        let fallback = system_time_utc(Err(io::Error::other("no mtime")));
        assert!(fallback >= before);
    }
}
