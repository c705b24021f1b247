//! Smoothed round-trip estimation driving the retransmission timeout.
//!
//! The estimator keeps the classic SRTT / RTTVAR pair: the first sample
//! initializes `srtt = rtt` and `rttvar = rtt/2`, later samples are folded in
//! with gains of 1/8 and 1/4. The timeout is `srtt + max(G, 4 * rttvar)`
//! clamped to a configured range, with G a 10 ms clock granularity floor.

use std::time::Duration;

use crate::config::RuftConfig;

const ALPHA: f64 = 0.125;
const BETA: f64 = 0.25;
const CLOCK_GRANULARITY_SECS: f64 = 0.010;

pub struct RttEstimator {
    srtt: Option<f64>,
    rttvar: f64,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    pub fn new(config: &RuftConfig) -> RttEstimator {
        RttEstimator {
            srtt: None,
            rttvar: 0.0,
            rto: config.initial_rto,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
        }
    }

    /// Folds one round-trip sample into the smoothed estimate and recomputes
    ///  the timeout. Callers must only sample segments that were acknowledged
    ///  without ever being retransmitted: an ACK for a retransmitted segment
    ///  cannot be attributed to one particular transmission.
    pub fn on_sample(&mut self, rtt: Duration) {
        let rtt = rtt.as_secs_f64();

        let srtt = match self.srtt {
            None => {
                self.rttvar = rtt / 2.0;
                rtt
            }
            Some(prev) => {
                self.rttvar = (1.0 - BETA) * self.rttvar + BETA * (prev - rtt).abs();
                (1.0 - ALPHA) * prev + ALPHA * rtt
            }
        };
        self.srtt = Some(srtt);

        let raw = srtt + (4.0 * self.rttvar).max(CLOCK_GRANULARITY_SECS);
        self.rto = Duration::from_secs_f64(raw).clamp(self.min_rto, self.max_rto);
    }

    /// The current retransmission timeout (the initial configured value until
    ///  the first sample arrives).
    pub fn rto(&self) -> Duration {
        self.rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt.map(Duration::from_secs_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::assert_approx_eq;

    fn estimator() -> RttEstimator {
        RttEstimator::new(&RuftConfig::new())
    }

    #[test]
    fn test_initial_rto_until_first_sample() {
        let est = estimator();
        assert_eq!(est.rto(), Duration::from_millis(500));
        assert_eq!(est.srtt(), None);
    }

    #[test]
    fn test_first_sample_initializes_estimate() {
        let mut est = estimator();
        est.on_sample(Duration::from_millis(200));

        assert_approx_eq(est.srtt().unwrap().as_secs_f64(), 0.2);
        // rttvar = 0.1, so rto = 0.2 + 4 * 0.1
        assert_approx_eq(est.rto().as_secs_f64(), 0.6);
    }

    #[test]
    fn test_subsequent_samples_are_smoothed() {
        let mut est = estimator();
        est.on_sample(Duration::from_millis(200));
        est.on_sample(Duration::from_millis(300));

        // rttvar = 0.75*0.1 + 0.25*|0.2 - 0.3| = 0.1
        // srtt   = 0.875*0.2 + 0.125*0.3      = 0.2125
        assert_approx_eq(est.srtt().unwrap().as_secs_f64(), 0.2125);
        assert_approx_eq(est.rto().as_secs_f64(), 0.6125);
    }

    #[test]
    fn test_rto_clamped_to_maximum() {
        let mut est = estimator();
        est.on_sample(Duration::from_secs(20));
        assert_eq!(est.rto(), Duration::from_secs(10));
    }

    #[test]
    fn test_rto_clamped_to_minimum() {
        let mut est = estimator();
        est.on_sample(Duration::from_millis(1));
        assert_eq!(est.rto(), Duration::from_millis(100));
    }

    #[test]
    fn test_granularity_floor_applies_when_variance_collapses() {
        let mut est = estimator();
        for _ in 0..50 {
            est.on_sample(Duration::from_millis(150));
        }
        // rttvar decays towards zero, leaving srtt + the 10ms floor, below the clamp
        assert_eq!(est.rto(), Duration::from_millis(160));
    }
}
