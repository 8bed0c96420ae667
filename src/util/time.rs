//! Duration parsing and formatting helpers

use std::time::Duration;

/// Parse a constraint limit or flag value into a duration
///
/// Accepts humantime syntax ("10ms", "1s", "2m30s"). A bare number is
/// interpreted as seconds.
pub fn parse_limit(s: &str) -> Duration {
    if let Ok(d) = humantime::parse_duration(s) {
        return d;
    }
    if let Ok(f) = s.parse::<f64>() {
        if f >= 0.0 {
            return Duration::from_secs_f64(f);
        }
    }
    Duration::ZERO
}

/// Format a duration for progress and report lines
///
/// Sub-millisecond durations render in microseconds, sub-second in
/// milliseconds, everything else in seconds.
pub fn format_duration(d: Duration) -> String {
    let us = d.as_micros();
    if us < 1_000 {
        format!("{}us", us)
    } else if us < 1_000_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limit_humantime() {
        assert_eq!(parse_limit("10ms"), Duration::from_millis(10));
        assert_eq!(parse_limit("2s"), Duration::from_secs(2));
        assert_eq!(parse_limit("1m"), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_limit_seconds_fallback() {
        assert_eq!(parse_limit("1.5"), Duration::from_secs_f64(1.5));
        assert_eq!(parse_limit("3"), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_limit_garbage() {
        assert_eq!(parse_limit("not-a-duration"), Duration::ZERO);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_micros(250)), "250us");
        assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
