//! # Delay-Based Bandwidth Estimation
//!
//! Walks per-packet feedback through inter-arrival grouping and the
//! trendline overuse detector, then lets the AIMD controller turn the
//! verdict into a delay-based target rate. Probe results short-circuit the
//! ramp by seeding the estimate directly.

use tracing::debug;

use crate::aimd::{AimdRateControl, AimdRateControlConfig, RateControlInput};
use crate::api::{
    BandwidthUsage, NetworkStateEstimate, NetworkStatePredictor, PacketResult,
    TransportPacketsFeedback,
};
use crate::config::{is_enabled, KeyValueConfig};
use crate::inter_arrival::InterArrival;
use crate::trendline::TrendlineEstimator;
use crate::units::{DataRate, TimeDelta, Timestamp};

/// Feedback silence after which grouping and detection state is stale.
const STREAM_TIMEOUT: TimeDelta = TimeDelta::from_seconds(2);

/// Outcome of one feedback batch.
#[derive(Debug, Clone, Copy)]
pub struct DelayBasedBweResult {
    pub updated: bool,
    /// The target came from a probe and resets the loss-based send rate.
    pub probe: bool,
    pub target_bitrate: DataRate,
    pub recovered_from_overuse: bool,
    pub backoff_in_alr: bool,
}

impl Default for DelayBasedBweResult {
    fn default() -> Self {
        DelayBasedBweResult {
            updated: false,
            probe: false,
            target_bitrate: DataRate::zero(),
            recovered_from_overuse: false,
            backoff_in_alr: false,
        }
    }
}

/// Detects overuse/underuse from arrival-time gradients and produces a
/// delay-based rate.
pub struct DelayBasedBwe {
    alr_limited_backoff_enabled: bool,
    inter_arrival: InterArrival,
    delay_detector: TrendlineEstimator,
    detector_state: BandwidthUsage,
    last_seen_packet: Timestamp,
    rate_control: AimdRateControl,
    prev_bitrate: DataRate,
    prev_state: BandwidthUsage,
}

impl DelayBasedBwe {
    pub fn new(config: &dyn KeyValueConfig) -> Self {
        let aimd_config = AimdRateControlConfig {
            no_bitrate_increase_in_alr: is_enabled(
                config,
                "WebRTC-DontIncreaseDelayBasedBweInAlr",
            ),
            ..Default::default()
        };
        DelayBasedBwe {
            alr_limited_backoff_enabled: is_enabled(config, "WebRTC-Bwe-AlrLimitedBackoff"),
            inter_arrival: InterArrival::new(),
            delay_detector: TrendlineEstimator::new(),
            detector_state: BandwidthUsage::Normal,
            last_seen_packet: Timestamp::minus_infinity(),
            rate_control: AimdRateControl::new(aimd_config),
            prev_bitrate: DataRate::zero(),
            prev_state: BandwidthUsage::Normal,
        }
    }

    /// Process a feedback batch and re-run rate control.
    pub fn incoming_packet_feedback_vector(
        &mut self,
        msg: &TransportPacketsFeedback,
        acked_bitrate: Option<DataRate>,
        probe_bitrate: Option<DataRate>,
        network_estimate: Option<NetworkStateEstimate>,
        in_alr: bool,
        mut predictor: Option<&mut dyn NetworkStatePredictor>,
    ) -> DelayBasedBweResult {
        let packet_feedback_vector = msg.sorted_by_receive_time();
        if packet_feedback_vector.is_empty() {
            return DelayBasedBweResult::default();
        }

        self.rate_control.set_in_application_limited_region(in_alr);
        self.rate_control.set_network_state_estimate(network_estimate);

        let mut recovered_from_overuse = false;
        let mut prev_detector_state = self.detector_state;
        for packet_feedback in &packet_feedback_vector {
            self.incoming_packet_feedback(
                packet_feedback,
                msg.feedback_time,
                match predictor.as_mut() {
                    Some(predictor) => Some(&mut **predictor),
                    None => None,
                },
            );
            if prev_detector_state == BandwidthUsage::Underusing
                && self.detector_state == BandwidthUsage::Normal
            {
                recovered_from_overuse = true;
            }
            prev_detector_state = self.detector_state;
        }

        self.maybe_update_estimate(
            acked_bitrate,
            probe_bitrate,
            recovered_from_overuse,
            in_alr,
            msg.feedback_time,
        )
    }

    fn incoming_packet_feedback(
        &mut self,
        packet_feedback: &PacketResult,
        at_time: Timestamp,
        predictor: Option<&mut dyn NetworkStatePredictor>,
    ) {
        // Reset if the stream has timed out.
        if self.last_seen_packet.is_infinite()
            || at_time - self.last_seen_packet > STREAM_TIMEOUT
        {
            self.inter_arrival = InterArrival::new();
            self.delay_detector = TrendlineEstimator::new();
            self.detector_state = BandwidthUsage::Normal;
        }
        self.last_seen_packet = at_time;

        let deltas = self.inter_arrival.compute_deltas(
            packet_feedback.sent_packet.send_time,
            packet_feedback.receive_time,
            at_time,
            packet_feedback.sent_packet.size,
        );
        if let Some(deltas) = deltas {
            self.delay_detector.update(
                deltas.arrival_time_delta.ms_f64(),
                deltas.send_time_delta.ms_f64(),
                packet_feedback.receive_time.ms(),
                true,
            );
            self.detector_state = match predictor {
                Some(predictor) => predictor.update(
                    packet_feedback.sent_packet.send_time.ms(),
                    packet_feedback.receive_time.ms(),
                    self.delay_detector.state(),
                ),
                None => self.delay_detector.state(),
            };
        }
    }

    fn maybe_update_estimate(
        &mut self,
        acked_bitrate: Option<DataRate>,
        probe_bitrate: Option<DataRate>,
        recovered_from_overuse: bool,
        in_alr: bool,
        at_time: Timestamp,
    ) -> DelayBasedBweResult {
        let mut result = DelayBasedBweResult::default();

        if self.detector_state == BandwidthUsage::Overusing {
            if in_alr && self.alr_limited_backoff_enabled {
                if self.rate_control.time_to_reduce_further(at_time, self.prev_bitrate) {
                    let (updated, target) =
                        self.update_estimate(at_time, Some(self.prev_bitrate));
                    result.updated = updated;
                    result.target_bitrate = target;
                    result.backoff_in_alr = updated;
                }
            } else if let Some(acked) = acked_bitrate {
                if self.rate_control.time_to_reduce_further(at_time, acked) {
                    let (updated, target) = self.update_estimate(at_time, acked_bitrate);
                    result.updated = updated;
                    result.target_bitrate = target;
                }
            } else if self.rate_control.valid_estimate()
                && self.rate_control.initial_time_to_reduce_further(at_time)
            {
                // Overusing before the acknowledged rate exists: halve the
                // rate to get out of the way.
                self.rate_control
                    .set_estimate(self.rate_control.latest_estimate() / 2, at_time);
                result.updated = true;
                result.probe = false;
                result.target_bitrate = self.rate_control.latest_estimate();
            }
        } else if let Some(probe) = probe_bitrate {
            result.probe = true;
            result.updated = true;
            result.target_bitrate = probe;
            self.rate_control.set_estimate(probe, at_time);
        } else {
            let (updated, target) = self.update_estimate(at_time, acked_bitrate);
            result.updated = updated;
            result.target_bitrate = target;
            result.recovered_from_overuse = recovered_from_overuse;
        }

        let detector_state = self.detector_state;
        if (result.updated && self.prev_bitrate != result.target_bitrate)
            || detector_state != self.prev_state
        {
            let bitrate = if result.updated {
                result.target_bitrate
            } else {
                self.prev_bitrate
            };
            debug!(bitrate = %bitrate, state = ?detector_state, "delay-based update");
            self.prev_bitrate = bitrate;
            self.prev_state = detector_state;
        }
        result
    }

    fn update_estimate(
        &mut self,
        at_time: Timestamp,
        acked_bitrate: Option<DataRate>,
    ) -> (bool, DataRate) {
        let input = RateControlInput {
            bw_state: self.detector_state,
            estimated_throughput: acked_bitrate,
        };
        let target_rate = self.rate_control.update(&input, at_time);
        (self.rate_control.valid_estimate(), target_rate)
    }

    pub fn on_rtt_update(&mut self, avg_rtt: TimeDelta) {
        self.rate_control.set_rtt(avg_rtt);
    }

    pub fn set_start_bitrate(&mut self, start_bitrate: DataRate) {
        debug!(%start_bitrate, "delay-based BWE start bitrate");
        self.rate_control.set_start_bitrate(start_bitrate);
    }

    pub fn set_min_bitrate(&mut self, min_bitrate: DataRate) {
        self.rate_control.set_min_bitrate(min_bitrate);
    }

    pub fn latest_estimate(&self) -> Option<DataRate> {
        if self.rate_control.valid_estimate() {
            Some(self.rate_control.latest_estimate())
        } else {
            None
        }
    }

    pub fn get_expected_bwe_period(&self) -> TimeDelta {
        self.rate_control.get_expected_bandwidth_period()
    }

    pub fn last_state(&self) -> BandwidthUsage {
        self.detector_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PacedPacketInfo, SentPacket};
    use crate::config::NoSettings;
    use crate::units::DataSize;

    const START_BITRATE: DataRate = DataRate::from_bps(300_000);

    fn bwe() -> DelayBasedBwe {
        let mut bwe = DelayBasedBwe::new(&NoSettings);
        bwe.set_start_bitrate(START_BITRATE);
        bwe.set_min_bitrate(DataRate::from_bps(30_000));
        bwe
    }

    /// One feedback batch of `n` packets sent every `send_gap_ms` and
    /// arriving with `delay_growth_ms` extra queuing per packet.
    fn batch(
        first_send_ms: i64,
        n: usize,
        send_gap_ms: i64,
        base_delay_ms: i64,
        delay_growth_ms: i64,
    ) -> TransportPacketsFeedback {
        let mut feedbacks = Vec::new();
        let mut last_recv = 0;
        for i in 0..n as i64 {
            let send = first_send_ms + i * send_gap_ms;
            let recv = send + base_delay_ms + i * delay_growth_ms;
            last_recv = recv;
            feedbacks.push(PacketResult {
                sent_packet: SentPacket {
                    send_time: Timestamp::from_millis(send),
                    size: DataSize::from_bytes(1_200),
                    pacing_info: PacedPacketInfo::default(),
                    ..Default::default()
                },
                receive_time: Timestamp::from_millis(recv),
            });
        }
        TransportPacketsFeedback {
            feedback_time: Timestamp::from_millis(last_recv + 10),
            data_in_flight: DataSize::zero(),
            packet_feedbacks: feedbacks,
        }
    }

    fn run(
        bwe: &mut DelayBasedBwe,
        report: &TransportPacketsFeedback,
        acked: Option<DataRate>,
    ) -> DelayBasedBweResult {
        bwe.incoming_packet_feedback_vector(report, acked, None, None, false, None)
    }

    #[test]
    fn empty_feedback_produces_no_update() {
        let mut bwe = bwe();
        let report = TransportPacketsFeedback {
            feedback_time: Timestamp::from_millis(100),
            ..Default::default()
        };
        assert!(!run(&mut bwe, &report, None).updated);
    }

    #[test]
    fn steady_feedback_ramps_the_estimate_up() {
        let mut bwe = bwe();
        let mut target = DataRate::zero();
        for i in 0..50 {
            let report = batch(i * 200, 20, 10, 20, 0);
            let result = run(&mut bwe, &report, Some(DataRate::from_bps(300_000)));
            if result.updated {
                target = result.target_bitrate;
            }
        }
        assert!(
            target > START_BITRATE,
            "steady arrivals should raise the target, got {target}"
        );
    }

    #[test]
    fn growing_queuing_delay_backs_off() {
        let mut bwe = bwe();
        for i in 0..10 {
            run(
                &mut bwe,
                &batch(i * 200, 20, 10, 20, 0),
                Some(DataRate::from_bps(300_000)),
            );
        }
        let before = bwe.latest_estimate().expect("initialized");
        // Sustained +3 ms of queuing per packet, continuous across batches.
        let mut after = before;
        for i in 10..16 {
            let base = 20 + (i - 10) * 60;
            let result = run(
                &mut bwe,
                &batch(i * 200, 20, 10, base, 3),
                Some(DataRate::from_bps(250_000)),
            );
            if result.updated {
                after = result.target_bitrate;
            }
        }
        assert_eq!(bwe.last_state(), BandwidthUsage::Overusing);
        assert!(after < before, "overuse must back off: {before} -> {after}");
    }

    #[test]
    fn probe_result_seeds_the_estimate() {
        let mut bwe = bwe();
        let report = batch(0, 20, 10, 20, 0);
        let result = bwe.incoming_packet_feedback_vector(
            &report,
            None,
            Some(DataRate::from_bps(1_200_000)),
            None,
            false,
            None,
        );
        assert!(result.updated);
        assert!(result.probe);
        assert_eq!(result.target_bitrate.bps(), 1_200_000);
        assert_eq!(bwe.latest_estimate().unwrap().bps(), 1_200_000);
    }

    #[test]
    fn long_silence_resets_detection_state() {
        let mut bwe = bwe();
        for i in 0..6 {
            let base = 20 + i * 60;
            run(
                &mut bwe,
                &batch(i * 200, 20, 10, base, 3),
                Some(DataRate::from_bps(250_000)),
            );
        }
        assert_eq!(bwe.last_state(), BandwidthUsage::Overusing);
        // 2+ seconds of silence, then clean feedback.
        run(
            &mut bwe,
            &batch(10_000, 20, 10, 20, 0),
            Some(DataRate::from_bps(250_000)),
        );
        assert_eq!(bwe.last_state(), BandwidthUsage::Normal);
    }
}
