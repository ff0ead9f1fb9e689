use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

/// Current UTC epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format epoch milliseconds as an RFC 3339 UTC timestamp (millisecond precision).
pub fn ms_to_iso(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 / ISO 8601 timestamp to epoch milliseconds.
pub fn iso_to_ms(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Clamp to the unit interval.
pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Integer bucket for an epoch-millisecond timestamp. Used to make
/// detection and caching idempotent per time slice.
pub fn bucket(ms: i64, divisor_ms: i64) -> i64 {
    if divisor_ms <= 0 {
        return 0;
    }
    ms / divisor_ms
}

/// Lowercase, alphanumeric-and-dash slug for cache keys.
/// "Jerome Powell" → "jerome-powell".
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Round to three decimal places. Tick dedup compares at this precision.
pub fn round3(v: f64) -> f64 {
    (v * 1_000.0).round() / 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_round_trip() {
        let ms = 1_772_068_500_123i64;
        let iso = ms_to_iso(ms);
        assert_eq!(iso_to_ms(&iso), Some(ms));
    }

    #[test]
    fn bucket_is_stable_within_slice() {
        assert_eq!(bucket(1_000_000, 30_000), bucket(1_029_999, 30_000));
        assert_ne!(bucket(1_000_000, 30_000), bucket(1_030_000, 30_000));
    }

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Jerome  Powell!"), "jerome-powell");
        assert_eq!(slugify("BTC $100k?"), "btc-100k");
        assert_eq!(slugify("--"), "");
    }

    #[test]
    fn round3_precision() {
        assert_eq!(round3(0.123456), 0.123);
        assert_eq!(round3(0.9995), 1.0);
    }
}
