//! # Acknowledged Bitrate Estimation
//!
//! Smooths the throughput actually confirmed by feedback into a rate the
//! rest of the controller can trust. Samples taken while the sender is
//! application limited say more about the encoder than the link, so the
//! estimator widens its uncertainty around ALR boundaries instead of
//! chasing them.

use tracing::trace;

use crate::api::PacketResult;
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

// ─── Windowed Bayesian rate estimator ───────────────────────────────────────

const INITIAL_RATE_WINDOW_MS: i64 = 500;
const RATE_WINDOW_MS: i64 = 150;
const UNCERTAINTY_SCALE: f64 = 10.0;
/// Separate tunable for samples taken inside an application-limited region.
const UNCERTAINTY_SCALE_IN_ALR: f64 = 10.0;
const PREDICTION_VARIANCE: f64 = 5.0;

/// Accumulates received bytes over a sliding window and folds each completed
/// window into a variance-weighted running estimate. A longer window is used
/// until the first estimate exists so startup is not decided by a handful of
/// packets.
#[derive(Debug)]
struct BitrateEstimator {
    sum_bytes: i64,
    current_window_ms: i64,
    prev_time_ms: i64,
    bitrate_estimate_kbps: f64,
    bitrate_estimate_var: f64,
}

impl BitrateEstimator {
    fn new() -> Self {
        BitrateEstimator {
            sum_bytes: 0,
            current_window_ms: 0,
            prev_time_ms: -1,
            bitrate_estimate_kbps: -1.0,
            bitrate_estimate_var: 50.0,
        }
    }

    fn update(&mut self, at_time: Timestamp, amount: DataSize, in_alr: bool) {
        let rate_window_ms = if self.bitrate_estimate_kbps < 0.0 {
            INITIAL_RATE_WINDOW_MS
        } else {
            RATE_WINDOW_MS
        };
        let sample_kbps = self.update_window(at_time.ms(), amount.bytes(), rate_window_ms);
        let Some(sample_kbps) = sample_kbps else {
            return;
        };
        if self.bitrate_estimate_kbps < 0.0 {
            // This is the very first sample we get. Use it to initialize.
            self.bitrate_estimate_kbps = sample_kbps;
            return;
        }
        // Samples below the estimate while application limited widen the
        // uncertainty so they drag the estimate down more slowly.
        let scale = if in_alr && sample_kbps < self.bitrate_estimate_kbps {
            UNCERTAINTY_SCALE_IN_ALR
        } else {
            UNCERTAINTY_SCALE
        };
        let sample_uncertainty =
            scale * (self.bitrate_estimate_kbps - sample_kbps).abs() / self.bitrate_estimate_kbps;
        let sample_var = sample_uncertainty * sample_uncertainty;
        // Update a bayesian estimate of the rate, weighting it lower if the
        // sample is far from the current estimate.
        let pred_var = self.bitrate_estimate_var + PREDICTION_VARIANCE;
        self.bitrate_estimate_kbps = (sample_var * self.bitrate_estimate_kbps
            + pred_var * sample_kbps)
            / (sample_var + pred_var);
        self.bitrate_estimate_kbps = self.bitrate_estimate_kbps.max(0.0);
        self.bitrate_estimate_var = sample_var * pred_var / (sample_var + pred_var);
        trace!(
            estimate_kbps = self.bitrate_estimate_kbps,
            "acknowledged bitrate updated"
        );
    }

    fn update_window(&mut self, now_ms: i64, bytes: i64, rate_window_ms: i64) -> Option<f64> {
        if now_ms < self.prev_time_ms {
            // Feedback out of order, reset the window.
            self.prev_time_ms = -1;
            self.sum_bytes = 0;
            self.current_window_ms = 0;
        }
        if self.prev_time_ms >= 0 {
            self.current_window_ms += now_ms - self.prev_time_ms;
            // Reset if nothing arrived for a whole window, since the rate in
            // that case would have to be artificially low.
            if now_ms - self.prev_time_ms > rate_window_ms {
                self.sum_bytes = 0;
                self.current_window_ms %= rate_window_ms;
            }
        }
        self.prev_time_ms = now_ms;
        let mut sample_kbps = None;
        if self.current_window_ms >= rate_window_ms {
            sample_kbps = Some(8.0 * self.sum_bytes as f64 / rate_window_ms as f64);
            self.current_window_ms -= rate_window_ms;
            self.sum_bytes = 0;
        }
        self.sum_bytes += bytes;
        sample_kbps
    }

    fn bitrate(&self) -> Option<DataRate> {
        if self.bitrate_estimate_kbps < 0.0 {
            return None;
        }
        Some(DataRate::from_bps((self.bitrate_estimate_kbps * 1_000.0) as i64))
    }

    /// A rate over the partial window, available before the estimate settles.
    fn peek_rate(&self) -> Option<DataRate> {
        if self.current_window_ms > 0 {
            return Some(
                DataSize::from_bytes(self.sum_bytes)
                    / TimeDelta::from_millis(self.current_window_ms),
            );
        }
        None
    }

    fn expect_fast_rate_change(&mut self) {
        // The rate is likely to change as the application recovers from the
        // limited region, so let the next samples move the estimate faster.
        self.bitrate_estimate_var += 200.0;
    }
}

// ─── Acknowledged bitrate estimator ─────────────────────────────────────────

/// Robust throughput estimator over the stream of received packets.
#[derive(Debug)]
pub struct AcknowledgedBitrateEstimator {
    in_alr: bool,
    alr_ended_time: Option<Timestamp>,
    bitrate_estimator: BitrateEstimator,
}

impl AcknowledgedBitrateEstimator {
    pub fn new() -> Self {
        AcknowledgedBitrateEstimator {
            in_alr: false,
            alr_ended_time: None,
            bitrate_estimator: BitrateEstimator::new(),
        }
    }

    /// Feed received packets, sorted by receive time.
    pub fn incoming_packet_feedback_vector(&mut self, packet_feedback_vector: &[PacketResult]) {
        debug_assert!(
            packet_feedback_vector
                .windows(2)
                .all(|w| w[0].receive_time <= w[1].receive_time),
            "feedback must be sorted by receive time"
        );
        for packet in packet_feedback_vector {
            if let Some(alr_ended) = self.alr_ended_time {
                if packet.sent_packet.send_time > alr_ended {
                    self.bitrate_estimator.expect_fast_rate_change();
                    self.alr_ended_time = None;
                }
            }
            self.bitrate_estimator
                .update(packet.receive_time, packet.sent_packet.size, self.in_alr);
        }
    }

    pub fn bitrate(&self) -> Option<DataRate> {
        self.bitrate_estimator.bitrate()
    }

    pub fn peek_rate(&self) -> Option<DataRate> {
        self.bitrate_estimator.peek_rate()
    }

    pub fn set_alr(&mut self, in_alr: bool) {
        self.in_alr = in_alr;
    }

    pub fn set_alr_ended_time(&mut self, alr_ended_time: Timestamp) {
        self.alr_ended_time = Some(alr_ended_time);
    }
}

impl Default for AcknowledgedBitrateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SentPacket;
    use crate::units::DataSize;

    const PACKET_SIZE: i64 = 1_200;

    /// Evenly spaced received packets at `rate_bps` starting at `start_ms`.
    fn feedback_at_rate(start_ms: i64, duration_ms: i64, rate_bps: i64) -> Vec<PacketResult> {
        let interval_ms = PACKET_SIZE * 8 * 1_000 / rate_bps;
        let mut packets = Vec::new();
        let mut t = start_ms;
        while t < start_ms + duration_ms {
            packets.push(PacketResult {
                sent_packet: SentPacket {
                    send_time: Timestamp::from_millis(t - 20),
                    size: DataSize::from_bytes(PACKET_SIZE),
                    ..Default::default()
                },
                receive_time: Timestamp::from_millis(t),
            });
            t += interval_ms;
        }
        packets
    }

    #[test]
    fn no_estimate_before_first_window_completes() {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        estimator.incoming_packet_feedback_vector(&feedback_at_rate(0, 200, 480_000));
        assert!(estimator.bitrate().is_none());
        assert!(estimator.peek_rate().is_some(), "peek sees the partial window");
    }

    #[test]
    fn converges_to_the_offered_rate() {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        estimator.incoming_packet_feedback_vector(&feedback_at_rate(0, 4_000, 480_000));
        let estimate = estimator.bitrate().expect("settled").bps();
        let error = (estimate - 480_000).abs() as f64 / 480_000.0;
        assert!(error < 0.15, "estimate {estimate} too far from 480kbps");
    }

    #[test]
    fn tracks_a_rate_increase() {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        estimator.incoming_packet_feedback_vector(&feedback_at_rate(0, 3_000, 300_000));
        let low = estimator.bitrate().unwrap().bps();
        estimator.incoming_packet_feedback_vector(&feedback_at_rate(3_000, 4_000, 900_000));
        let high = estimator.bitrate().unwrap().bps();
        assert!(high > low, "estimate should follow the rate up: {low} -> {high}");
    }

    #[test]
    fn alr_end_accelerates_adaptation() {
        let mut slow = AcknowledgedBitrateEstimator::new();
        let mut fast = AcknowledgedBitrateEstimator::new();
        let warmup = feedback_at_rate(0, 3_000, 200_000);
        slow.incoming_packet_feedback_vector(&warmup);
        fast.incoming_packet_feedback_vector(&warmup);

        fast.set_alr_ended_time(Timestamp::from_millis(3_000));
        let burst = feedback_at_rate(3_100, 1_000, 800_000);
        slow.incoming_packet_feedback_vector(&burst);
        fast.incoming_packet_feedback_vector(&burst);

        assert!(
            fast.bitrate().unwrap() >= slow.bitrate().unwrap(),
            "widened variance must not slow adaptation"
        );
    }
}
