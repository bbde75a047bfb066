//! Summary statistics over sample arrays.
//!
//! Everything is integer nanoseconds; means and percentiles truncate the
//! way the output format expects.

/// Summary of one sample array.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub mean: i64,
    pub min: i64,
    pub median: i64,
    pub max: i64,
    pub percentile: i64,
    pub stddev: i64,
}

impl Summary {
    /// Computes the summary in place; the sample array comes back sorted.
    /// Returns `None` for an empty array.
    pub fn over(samples: &mut [i64], percentile: f64) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        samples.sort_unstable();
        let n = samples.len();
        let sum: i128 = samples.iter().map(|&s| i128::from(s)).sum();
        let mean = (sum / n as i128) as i64;

        let pct_index = ((n as f64 * percentile / 100.0) as usize).min(n - 1);

        // Two-pass sample variance about the integer mean.
        let sq_sum: i128 = samples
            .iter()
            .map(|&s| {
                let d = i128::from(s) - i128::from(mean);
                d * d
            })
            .sum();
        let variance = if n > 1 { sq_sum / (n as i128 - 1) } else { 0 };

        Some(Self {
            mean,
            min: samples[0],
            median: samples[n / 2],
            max: samples[n - 1],
            percentile: samples[pct_index],
            stddev: (variance as f64).sqrt() as i64,
        })
    }

    /// Scales the location statistics down, e.g. halving a round-trip
    /// summary into a one-way estimate. The stddev is deliberately left
    /// untouched; callers reporting a scaled summary must flag that.
    pub fn scale_down(&mut self, divisor: i64) {
        self.mean /= divisor;
        self.min /= divisor;
        self.median /= divisor;
        self.max /= divisor;
        self.percentile /= divisor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_of_known_array() {
        let mut samples = vec![4i64, 1, 3, 2, 5];
        let s = Summary::over(&mut samples, 99.0).unwrap();

        assert_eq!(s.mean, 3);
        assert_eq!(s.min, 1);
        assert_eq!(s.max, 5);
        assert_eq!(s.median, 3); // element at n/2 of the sorted array
        assert_eq!(s.percentile, 5);
        assert_eq!(samples, [1, 2, 3, 4, 5]);
    }

    #[test]
    fn bounds_hold_for_any_samples() {
        let mut samples = vec![9i64, -3, 14, 0, 7, 7, 2];
        let s = Summary::over(&mut samples, 50.0).unwrap();

        assert!(s.min <= s.mean && s.mean <= s.max);
        assert!(s.min <= s.percentile && s.percentile <= s.max);
        assert!(s.stddev >= 0);
    }

    #[test]
    fn constant_samples_have_zero_stddev() {
        let mut samples = vec![100i64; 32];
        let s = Summary::over(&mut samples, 99.0).unwrap();
        assert_eq!(s.stddev, 0);
        assert_eq!(s.mean, 100);
        assert_eq!(s.percentile, 100);
    }

    #[test]
    fn mean_truncates_toward_zero() {
        let mut samples = vec![1i64, 2];
        assert_eq!(Summary::over(&mut samples, 99.0).unwrap().mean, 1);
    }

    #[test]
    fn percentile_100_is_clamped_to_max() {
        let mut samples = vec![10i64, 20, 30];
        let s = Summary::over(&mut samples, 100.0).unwrap();
        assert_eq!(s.percentile, 30);
    }

    #[test]
    fn negative_latencies_are_reported_as_is() {
        let mut samples = vec![-5i64, -1, 3];
        let s = Summary::over(&mut samples, 99.0).unwrap();
        assert_eq!(s.min, -5);
        assert_eq!(s.mean, -1);
    }

    #[test]
    fn empty_array_has_no_summary() {
        assert_eq!(Summary::over(&mut [], 99.0), None);
    }

    #[test]
    fn scale_down_leaves_stddev_alone() {
        let mut s = Summary {
            mean: 10,
            min: 4,
            median: 9,
            max: 21,
            percentile: 20,
            stddev: 6,
        };
        s.scale_down(2);
        assert_eq!(s.mean, 5);
        assert_eq!(s.min, 2);
        assert_eq!(s.median, 4);
        assert_eq!(s.max, 10);
        assert_eq!(s.percentile, 10);
        assert_eq!(s.stddev, 6);
    }
}
