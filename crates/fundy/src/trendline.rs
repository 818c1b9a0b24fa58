//! # Trendline Overuse Detection
//!
//! Estimates the slope of the queuing-delay trend from inter-group delay
//! deltas via a windowed least-squares fit, then classifies the link as
//! normal, overusing or underusing against an adaptive threshold. The
//! threshold chases the observed trend so that a persistently noisy link
//! does not read as congestion, while large spikes are deliberately not
//! adapted to.

use std::collections::VecDeque;
use tracing::trace;

use crate::api::BandwidthUsage;

const DEFAULT_TRENDLINE_WINDOW_SIZE: usize = 20;
const DEFAULT_TRENDLINE_SMOOTHING_COEFF: f64 = 0.9;
const DEFAULT_TRENDLINE_THRESHOLD_GAIN: f64 = 4.0;
/// Trend spikes further than this over the threshold are ignored when
/// adapting the threshold.
const MAX_ADAPT_OFFSET_MS: f64 = 15.0;
const OVER_USING_TIME_THRESHOLD_MS: f64 = 10.0;
const MIN_NUM_DELTAS: i64 = 60;
const DELTA_COUNTER_MAX: i64 = 1_000;
const K_UP: f64 = 0.0087;
const K_DOWN: f64 = 0.039;

/// Least-squares slope of `(x, y)` points, `None` when x does not vary.
fn linear_fit_slope(points: &VecDeque<(f64, f64)>) -> Option<f64> {
    debug_assert!(points.len() >= 2);
    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let avg_x = sum_x / n;
    let avg_y = sum_y / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for &(x, y) in points {
        numerator += (x - avg_x) * (y - avg_y);
        denominator += (x - avg_x) * (x - avg_x);
    }
    if denominator == 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

/// Windowed delay-trend estimator with adaptive overuse thresholding.
#[derive(Debug)]
pub struct TrendlineEstimator {
    window_size: usize,
    smoothing_coef: f64,
    threshold_gain: f64,
    num_of_deltas: i64,
    first_arrival_time_ms: i64,
    accumulated_delay_ms: f64,
    smoothed_delay_ms: f64,
    /// (arrival time since first arrival, smoothed delay) pairs.
    delay_hist: VecDeque<(f64, f64)>,
    k_up: f64,
    k_down: f64,
    overusing_time_threshold_ms: f64,
    threshold_ms: f64,
    last_update_ms: i64,
    prev_trend: f64,
    time_over_using_ms: f64,
    overuse_counter: i64,
    hypothesis: BandwidthUsage,
}

impl TrendlineEstimator {
    pub fn new() -> Self {
        TrendlineEstimator {
            window_size: DEFAULT_TRENDLINE_WINDOW_SIZE,
            smoothing_coef: DEFAULT_TRENDLINE_SMOOTHING_COEFF,
            threshold_gain: DEFAULT_TRENDLINE_THRESHOLD_GAIN,
            num_of_deltas: 0,
            first_arrival_time_ms: -1,
            accumulated_delay_ms: 0.0,
            smoothed_delay_ms: 0.0,
            delay_hist: VecDeque::new(),
            k_up: K_UP,
            k_down: K_DOWN,
            overusing_time_threshold_ms: OVER_USING_TIME_THRESHOLD_MS,
            threshold_ms: 12.5,
            last_update_ms: -1,
            prev_trend: 0.0,
            time_over_using_ms: -1.0,
            overuse_counter: 0,
            hypothesis: BandwidthUsage::Normal,
        }
    }

    /// Feed one inter-group delta pair. Ignored unless deltas were actually
    /// computed for the packet.
    pub fn update(
        &mut self,
        recv_delta_ms: f64,
        send_delta_ms: f64,
        arrival_time_ms: i64,
        calculated_deltas: bool,
    ) {
        if !calculated_deltas {
            return;
        }
        let delta_ms = recv_delta_ms - send_delta_ms;
        self.num_of_deltas = (self.num_of_deltas + 1).min(DELTA_COUNTER_MAX);
        if self.first_arrival_time_ms == -1 {
            self.first_arrival_time_ms = arrival_time_ms;
        }

        // Exponential backoff filter.
        self.accumulated_delay_ms += delta_ms;
        self.smoothed_delay_ms = self.smoothing_coef * self.smoothed_delay_ms
            + (1.0 - self.smoothing_coef) * self.accumulated_delay_ms;

        self.delay_hist.push_back((
            (arrival_time_ms - self.first_arrival_time_ms) as f64,
            self.smoothed_delay_ms,
        ));
        if self.delay_hist.len() > self.window_size {
            self.delay_hist.pop_front();
        }
        let mut trend = self.prev_trend;
        if self.delay_hist.len() == self.window_size {
            // The delay trend approximates (send_rate - capacity)/capacity:
            // positive means queues are filling, negative means they drain.
            trend = linear_fit_slope(&self.delay_hist).unwrap_or(trend);
        }
        trace!(trend, delta_ms, "delay trend");
        self.detect(trend, send_delta_ms, arrival_time_ms);
    }

    pub fn state(&self) -> BandwidthUsage {
        self.hypothesis
    }

    fn detect(&mut self, trend: f64, ts_delta_ms: f64, now_ms: i64) {
        if self.num_of_deltas < 2 {
            self.hypothesis = BandwidthUsage::Normal;
            return;
        }
        let modified_trend =
            self.num_of_deltas.min(MIN_NUM_DELTAS) as f64 * trend * self.threshold_gain;
        if modified_trend > self.threshold_ms {
            if self.time_over_using_ms == -1.0 {
                // Initialize the timer. Assume that we've been over-using
                // half of the time since the previous sample.
                self.time_over_using_ms = ts_delta_ms / 2.0;
            } else {
                self.time_over_using_ms += ts_delta_ms;
            }
            self.overuse_counter += 1;
            if self.time_over_using_ms > self.overusing_time_threshold_ms
                && self.overuse_counter > 1
                && trend >= self.prev_trend
            {
                self.time_over_using_ms = 0.0;
                self.overuse_counter = 0;
                self.hypothesis = BandwidthUsage::Overusing;
            }
        } else if modified_trend < -self.threshold_ms {
            self.time_over_using_ms = -1.0;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Underusing;
        } else {
            self.time_over_using_ms = -1.0;
            self.overuse_counter = 0;
            self.hypothesis = BandwidthUsage::Normal;
        }
        self.prev_trend = trend;
        self.update_threshold(modified_trend, now_ms);
    }

    fn update_threshold(&mut self, modified_trend: f64, now_ms: i64) {
        if self.last_update_ms == -1 {
            self.last_update_ms = now_ms;
        }
        if modified_trend.abs() > self.threshold_ms + MAX_ADAPT_OFFSET_MS {
            // Avoid adapting the threshold to big latency spikes.
            self.last_update_ms = now_ms;
            return;
        }
        let k = if modified_trend.abs() < self.threshold_ms {
            self.k_down
        } else {
            self.k_up
        };
        const MAX_TIME_DELTA_MS: i64 = 100;
        let time_delta_ms = (now_ms - self.last_update_ms).min(MAX_TIME_DELTA_MS);
        self.threshold_ms +=
            k * (modified_trend.abs() - self.threshold_ms) * time_delta_ms as f64;
        self.threshold_ms = self.threshold_ms.clamp(6.0, 600.0);
        self.last_update_ms = now_ms;
    }
}

impl Default for TrendlineEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the estimator with a constant per-group delay change: groups
    /// sent 20 ms apart arrive `20 + delay_growth_ms` apart.
    fn drive(estimator: &mut TrendlineEstimator, groups: usize, delay_growth_ms: f64) {
        let mut arrival_ms = estimator.last_update_ms.max(0) + 20;
        for _ in 0..groups {
            estimator.update(20.0 + delay_growth_ms, 20.0, arrival_ms, true);
            arrival_ms += (20.0 + delay_growth_ms).max(1.0) as i64;
        }
    }

    #[test]
    fn steady_arrivals_stay_normal() {
        let mut estimator = TrendlineEstimator::new();
        drive(&mut estimator, 60, 0.0);
        assert_eq!(estimator.state(), BandwidthUsage::Normal);
    }

    #[test]
    fn growing_delay_detects_overuse() {
        let mut estimator = TrendlineEstimator::new();
        drive(&mut estimator, 60, 3.0);
        assert_eq!(estimator.state(), BandwidthUsage::Overusing);
    }

    #[test]
    fn draining_queue_detects_underuse() {
        let mut estimator = TrendlineEstimator::new();
        drive(&mut estimator, 40, 3.0);
        drive(&mut estimator, 40, -3.0);
        assert_eq!(estimator.state(), BandwidthUsage::Underusing);
    }

    #[test]
    fn single_delta_is_not_judged() {
        let mut estimator = TrendlineEstimator::new();
        estimator.update(120.0, 20.0, 20, true);
        assert_eq!(estimator.state(), BandwidthUsage::Normal);
    }

    #[test]
    fn uncalculated_deltas_are_ignored() {
        let mut estimator = TrendlineEstimator::new();
        for _ in 0..100 {
            estimator.update(100.0, 0.0, 20, false);
        }
        assert_eq!(estimator.state(), BandwidthUsage::Normal);
        assert_eq!(estimator.num_of_deltas, 0);
    }
}
