//! Target share interval with a tolerance band.

use std::fmt;

/// Where an observed average share interval falls relative to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalBand {
    /// Shares arrive faster than the band allows; difficulty should rise.
    TooFast,
    /// Close enough to target; leave difficulty alone.
    Within,
    /// Shares arrive slower than the band allows; difficulty should fall.
    TooSlow,
}

/// Target average interval between shares, in seconds, and the band around
/// it inside which no retarget happens.
///
/// With a 15 second target and 30% variance the band is `[10.5, 19.5]`. The
/// band edges themselves count as within.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetargetBounds {
    target: f64,
    variance: f64,
}

impl RetargetBounds {
    /// Create bounds from a target interval and a variance in percent.
    pub fn new(target: f64, variance_percent: f64) -> Self {
        Self {
            target,
            variance: target * (variance_percent / 100.0),
        }
    }

    /// The target interval in seconds.
    pub fn target(&self) -> f64 {
        self.target
    }

    /// Half-width of the band in seconds.
    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn low(&self) -> f64 {
        self.target - self.variance
    }

    pub fn high(&self) -> f64 {
        self.target + self.variance
    }

    /// Classify an average share interval.
    pub fn classify(&self, average: f64) -> IntervalBand {
        if average > self.high() {
            IntervalBand::TooSlow
        } else if average < self.low() {
            IntervalBand::TooFast
        } else {
            IntervalBand::Within
        }
    }
}

impl fmt::Display for RetargetBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}s ±{:.1}s", self.target, self.variance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_band_edges() {
        let bounds = RetargetBounds::new(15.0, 30.0);
        assert!((bounds.low() - 10.5).abs() < 1e-9);
        assert!((bounds.high() - 19.5).abs() < 1e-9);
        assert!((bounds.variance() - 4.5).abs() < 1e-9);
    }

    #[test_case(2.0, IntervalBand::TooFast ; "much too fast")]
    #[test_case(10.4, IntervalBand::TooFast ; "just under low edge")]
    #[test_case(10.5, IntervalBand::Within ; "low edge")]
    #[test_case(15.0, IntervalBand::Within ; "on target")]
    #[test_case(19.5, IntervalBand::Within ; "high edge")]
    #[test_case(19.6, IntervalBand::TooSlow ; "just over high edge")]
    #[test_case(40.0, IntervalBand::TooSlow ; "much too slow")]
    fn test_classify(average: f64, expected: IntervalBand) {
        let bounds = RetargetBounds::new(15.0, 30.0);
        assert_eq!(bounds.classify(average), expected);
    }

    #[test]
    fn test_zero_variance() {
        let bounds = RetargetBounds::new(10.0, 0.0);
        assert_eq!(bounds.classify(10.0), IntervalBand::Within);
        assert_eq!(bounds.classify(9.9), IntervalBand::TooFast);
        assert_eq!(bounds.classify(10.1), IntervalBand::TooSlow);
    }

    #[test]
    fn test_display() {
        assert_eq!(RetargetBounds::new(15.0, 30.0).to_string(), "15.0s ±4.5s");
    }
}
