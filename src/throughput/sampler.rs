//! Conversion of (bytes, elapsed) into megabits per second.

use std::time::Duration;

/// Speed in Mbps for `bytes` transferred over `elapsed`.
///
/// A zero elapsed time (instant transfer, or a clock too coarse to see it)
/// yields `0.0` instead of infinity.
pub fn measure_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if seconds == 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / 1_000_000.0 / seconds
}

/// One timed transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub bytes: u64,
    pub elapsed: Duration,
    pub mbps: f64,
}

impl Sample {
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self {
            bytes,
            elapsed,
            mbps: measure_mbps(bytes, elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn test_zero_elapsed_is_zero() {
        for bytes in [0_u64, 1, 1500, 8 * 1024 * 1024, u32::MAX as u64] {
            assert_eq!(measure_mbps(bytes, Duration::ZERO), 0.0);
        }
    }

    #[test]
    fn test_one_megabit_per_second() {
        // 125_000 bytes = 1_000_000 bits.
        assert!(approx_eq(measure_mbps(125_000, Duration::from_secs(1)), 1.0));
    }

    #[test]
    fn test_matches_formula() {
        let cases = [
            (8_388_608_u64, Duration::from_millis(750)),
            (1, Duration::from_nanos(1)),
            (65_536, Duration::from_micros(1234)),
            (10_000_000, Duration::from_secs(10)),
        ];
        for (bytes, elapsed) in cases {
            let expected = bytes as f64 * 8.0 / 1_000_000.0 / elapsed.as_secs_f64();
            assert!(
                approx_eq(measure_mbps(bytes, elapsed), expected),
                "bytes={bytes} elapsed={elapsed:?}"
            );
        }
    }

    #[test]
    fn test_zero_bytes_is_zero() {
        assert_eq!(measure_mbps(0, Duration::from_secs(3)), 0.0);
    }

    #[test]
    fn test_sample_carries_speed() {
        let s = Sample::new(250_000, Duration::from_millis(500));
        assert_eq!(s.bytes, 250_000);
        assert!(approx_eq(s.mbps, 4.0));
    }
}
