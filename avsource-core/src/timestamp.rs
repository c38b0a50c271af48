//! Timestamp conversion between the backend time unit and seconds.
//!
//! Backends count time in integer microseconds. Everything handed to the
//! consumer is floating-point seconds.

/// Backend time unit per second
pub const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Convert a backend timestamp (microseconds) to seconds.
#[inline]
pub fn from_backend(timestamp_us: i64) -> f64 {
    timestamp_us as f64 / MICROS_PER_SECOND
}

/// Convert seconds to a backend timestamp (microseconds), truncating.
#[inline]
pub fn to_backend(seconds: f64) -> i64 {
    (seconds * MICROS_PER_SECOND) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_backend() {
        assert_eq!(from_backend(1_500_000), 1.5);
        assert_eq!(from_backend(0), 0.0);
        assert_eq!(from_backend(-40_000), -0.04);
    }

    #[test]
    fn test_to_backend_truncates() {
        assert_eq!(to_backend(2.5), 2_500_000);
        assert_eq!(to_backend(0.000_000_9), 0);
    }
}
