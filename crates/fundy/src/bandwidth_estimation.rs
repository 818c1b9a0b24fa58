//! # Loss-Based Bandwidth Estimation
//!
//! Fuses the periodic loss fraction, RTT, receiver estimate (REMB) and the
//! delay-based cap into the send bitrate. Below ~2% loss the rate climbs 8%
//! per second off a one-second sliding minimum; between 2% and 10% it holds;
//! above 10% it decreases multiplicatively, at most once per 300 ms + RTT.
//! The delay-based and receiver estimates are hard caps on the result.
//!
//! Two auxiliaries live here: an RTT-based backoff that cuts the rate when
//! the propagation RTT blows past a configured limit, and a link-capacity
//! tracker that exponentially follows the acknowledged throughput for the
//! optional "stable bandwidth" reporting mode.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::aimd::CONGESTION_CONTROLLER_MIN_BITRATE;
use crate::api::{SentPacket, TransportPacketsFeedback};
use crate::config::{KeyValueConfig, MaxRttLimitConfig};
use crate::units::{DataRate, TimeDelta, Timestamp};

const BWE_INCREASE_INTERVAL: TimeDelta = TimeDelta::from_millis(1_000);
const BWE_DECREASE_INTERVAL: TimeDelta = TimeDelta::from_millis(300);
const START_PHASE: TimeDelta = TimeDelta::from_millis(2_000);
const LIMIT_NUM_PACKETS: i64 = 20;
const DEFAULT_MAX_BITRATE: DataRate = DataRate::from_bps(1_000_000_000);
const LOW_LOSS_THRESHOLD: f64 = 0.02;
const HIGH_LOSS_THRESHOLD: f64 = 0.1;
const BITRATE_THRESHOLD: DataRate = DataRate::zero();
const MAX_RTCP_FEEDBACK_INTERVAL: TimeDelta = TimeDelta::from_millis(5_000);
const LOW_BITRATE_LOG_PERIOD: TimeDelta = TimeDelta::from_seconds(10);

// ─── RTT-based backoff ──────────────────────────────────────────────────────

/// Cuts the estimate when the timeout-corrected propagation RTT exceeds the
/// configured limit. Inert unless the `WebRTC-Bwe-MaxRttLimit` trial is on.
#[derive(Debug)]
struct RttBasedBackoff {
    config: MaxRttLimitConfig,
    last_propagation_rtt_update: Timestamp,
    last_propagation_rtt: TimeDelta,
    last_packet_sent: Timestamp,
}

impl RttBasedBackoff {
    fn new(config: MaxRttLimitConfig) -> Self {
        RttBasedBackoff {
            config,
            last_propagation_rtt_update: Timestamp::plus_infinity(),
            last_propagation_rtt: TimeDelta::zero(),
            last_packet_sent: Timestamp::minus_infinity(),
        }
    }

    fn update_propagation_rtt(&mut self, at_time: Timestamp, propagation_rtt: TimeDelta) {
        self.last_propagation_rtt_update = at_time;
        self.last_propagation_rtt = propagation_rtt;
    }

    /// The last propagation RTT, aged by the time we have been waiting for
    /// feedback while still sending.
    fn corrected_rtt(&self, at_time: Timestamp) -> TimeDelta {
        let time_since_rtt = at_time - self.last_propagation_rtt_update;
        let time_since_packet_sent = at_time - self.last_packet_sent;
        // Do not penalize the RTT for periods where nothing was sent.
        let timeout_correction =
            (time_since_rtt - time_since_packet_sent).max(TimeDelta::zero());
        timeout_correction + self.last_propagation_rtt
    }
}

// ─── Link capacity tracker ──────────────────────────────────────────────────

const CAPACITY_TRACKING_RATE: TimeDelta = TimeDelta::from_seconds(10);

/// Slow exponential tracker of acknowledged throughput; the "stable"
/// bandwidth figure reported when the host asks for it.
#[derive(Debug)]
struct LinkCapacityTracker {
    capacity_estimate_bps: f64,
    last_link_capacity_update: Timestamp,
    last_delay_based_estimate: DataRate,
}

impl LinkCapacityTracker {
    fn new() -> Self {
        LinkCapacityTracker {
            capacity_estimate_bps: 0.0,
            last_link_capacity_update: Timestamp::minus_infinity(),
            last_delay_based_estimate: DataRate::plus_infinity(),
        }
    }

    /// A falling delay-based estimate drags the capacity down with it.
    fn update_delay_based_estimate(&mut self, at_time: Timestamp, delay_based_bitrate: DataRate) {
        if delay_based_bitrate < self.last_delay_based_estimate {
            self.capacity_estimate_bps = self
                .capacity_estimate_bps
                .min(delay_based_bitrate.bps_f64());
            self.last_link_capacity_update = at_time;
        }
        self.last_delay_based_estimate = delay_based_bitrate;
    }

    fn on_starting_rate(&mut self, start_rate: DataRate) {
        if self.last_link_capacity_update.is_infinite() {
            self.capacity_estimate_bps = start_rate.bps_f64();
        }
    }

    fn on_rate_update(
        &mut self,
        acknowledged: Option<DataRate>,
        target: DataRate,
        at_time: Timestamp,
    ) {
        let Some(acknowledged) = acknowledged else {
            return;
        };
        let acknowledged_target = acknowledged.min(target);
        if acknowledged_target.bps_f64() > self.capacity_estimate_bps {
            let delta = at_time - self.last_link_capacity_update;
            let alpha = if delta.is_finite() {
                (-(delta.ms_f64() / CAPACITY_TRACKING_RATE.ms_f64())).exp()
            } else {
                0.0
            };
            self.capacity_estimate_bps = alpha * self.capacity_estimate_bps
                + (1.0 - alpha) * acknowledged_target.bps_f64();
        }
        self.last_link_capacity_update = at_time;
    }

    fn on_rtt_backoff(&mut self, backoff_rate: DataRate, at_time: Timestamp) {
        self.capacity_estimate_bps = self.capacity_estimate_bps.min(backoff_rate.bps_f64());
        self.last_link_capacity_update = at_time;
    }

    fn estimate(&self) -> DataRate {
        DataRate::from_bps(self.capacity_estimate_bps as i64)
    }
}

// ─── Send-side bandwidth estimation ─────────────────────────────────────────

/// The loss/RTT-driven view of the current estimate.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CurrentBweEstimate {
    pub bitrate: DataRate,
    /// Loss ratio as an 8-bit fixed-point value (`loss / 255`).
    pub fraction_loss: u8,
    pub round_trip_time: TimeDelta,
}

/// Feedback accounting exposed for dashboards.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BweFeedbackStats {
    pub packets_with_feedback: u64,
    pub packets_lost: u64,
}

/// Loss-based AIMD fuser over the send bitrate.
pub struct SendSideBandwidthEstimation {
    rtt_backoff: RttBasedBackoff,
    link_capacity: LinkCapacityTracker,
    /// (time, target) pairs over the last increase interval.
    min_bitrate_history: VecDeque<(Timestamp, DataRate)>,
    lost_packets_since_last_loss_update: i64,
    expected_packets_since_last_loss_update: i64,
    acknowledged_rate: Option<DataRate>,
    current_target: DataRate,
    last_logged_target: DataRate,
    min_bitrate_configured: DataRate,
    max_bitrate_configured: DataRate,
    last_low_bitrate_log: Timestamp,
    has_decreased_since_last_fraction_loss: bool,
    last_loss_packet_report: Timestamp,
    last_fraction_loss: u8,
    last_logged_fraction_loss: u8,
    last_round_trip_time: TimeDelta,
    receiver_limit: DataRate,
    delay_based_limit: DataRate,
    time_last_decrease: Timestamp,
    first_report_time: Timestamp,
    feedback_stats: BweFeedbackStats,
}

impl SendSideBandwidthEstimation {
    pub fn new(config: &dyn KeyValueConfig) -> Self {
        SendSideBandwidthEstimation {
            rtt_backoff: RttBasedBackoff::new(MaxRttLimitConfig::parse(config)),
            link_capacity: LinkCapacityTracker::new(),
            min_bitrate_history: VecDeque::new(),
            lost_packets_since_last_loss_update: 0,
            expected_packets_since_last_loss_update: 0,
            acknowledged_rate: None,
            current_target: DataRate::zero(),
            last_logged_target: DataRate::zero(),
            min_bitrate_configured: CONGESTION_CONTROLLER_MIN_BITRATE,
            max_bitrate_configured: DEFAULT_MAX_BITRATE,
            last_low_bitrate_log: Timestamp::minus_infinity(),
            has_decreased_since_last_fraction_loss: false,
            last_loss_packet_report: Timestamp::minus_infinity(),
            last_fraction_loss: 0,
            last_logged_fraction_loss: 0,
            last_round_trip_time: TimeDelta::zero(),
            receiver_limit: DataRate::plus_infinity(),
            delay_based_limit: DataRate::plus_infinity(),
            time_last_decrease: Timestamp::minus_infinity(),
            first_report_time: Timestamp::minus_infinity(),
            feedback_stats: BweFeedbackStats::default(),
        }
    }

    /// Clear estimator state for a new route. The parsed configuration
    /// (thresholds, RTT-limit trial) is preserved.
    pub fn on_route_change(&mut self) {
        self.link_capacity = LinkCapacityTracker::new();
        self.min_bitrate_history.clear();
        self.lost_packets_since_last_loss_update = 0;
        self.expected_packets_since_last_loss_update = 0;
        self.acknowledged_rate = None;
        self.current_target = DataRate::zero();
        self.min_bitrate_configured = CONGESTION_CONTROLLER_MIN_BITRATE;
        self.max_bitrate_configured = DEFAULT_MAX_BITRATE;
        self.last_low_bitrate_log = Timestamp::minus_infinity();
        self.has_decreased_since_last_fraction_loss = false;
        self.last_loss_packet_report = Timestamp::minus_infinity();
        self.last_fraction_loss = 0;
        self.last_logged_fraction_loss = 0;
        self.last_round_trip_time = TimeDelta::zero();
        self.receiver_limit = DataRate::plus_infinity();
        self.delay_based_limit = DataRate::plus_infinity();
        self.time_last_decrease = Timestamp::minus_infinity();
        self.first_report_time = Timestamp::minus_infinity();
    }

    pub fn set_bitrates(
        &mut self,
        send_bitrate: Option<DataRate>,
        min_bitrate: DataRate,
        max_bitrate: DataRate,
        at_time: Timestamp,
    ) {
        self.set_min_max_bitrate(min_bitrate, max_bitrate);
        if let Some(send_bitrate) = send_bitrate {
            self.link_capacity.on_starting_rate(send_bitrate);
            self.set_send_bitrate(send_bitrate, at_time);
        }
    }

    /// Force a new estimate, clearing the delay-based cap for one cycle.
    pub fn set_send_bitrate(&mut self, bitrate: DataRate, at_time: Timestamp) {
        debug_assert!(bitrate > DataRate::zero());
        // Reset to avoid being capped by the estimate.
        self.delay_based_limit = DataRate::plus_infinity();
        self.update_target_bitrate(bitrate, at_time);
        // Clear last sent bitrate history so the new value can be used
        // directly and not capped.
        self.min_bitrate_history.clear();
    }

    pub fn set_min_max_bitrate(&mut self, min_bitrate: DataRate, max_bitrate: DataRate) {
        self.min_bitrate_configured = min_bitrate.max(CONGESTION_CONTROLLER_MIN_BITRATE);
        if max_bitrate > DataRate::zero() && max_bitrate.is_finite() {
            self.max_bitrate_configured = max_bitrate.max(self.min_bitrate_configured);
        } else {
            self.max_bitrate_configured = DEFAULT_MAX_BITRATE;
        }
    }

    pub fn get_min_bitrate(&self) -> i64 {
        self.min_bitrate_configured.bps()
    }

    pub fn current_estimate(&self) -> CurrentBweEstimate {
        CurrentBweEstimate {
            bitrate: self.current_target.max(self.min_bitrate_configured),
            fraction_loss: self.last_fraction_loss,
            round_trip_time: self.last_round_trip_time,
        }
    }

    /// The stable link-capacity figure for reporting.
    pub fn get_estimated_link_capacity(&self) -> DataRate {
        self.link_capacity.estimate()
    }

    pub fn feedback_stats(&self) -> BweFeedbackStats {
        self.feedback_stats
    }

    /// Receiver estimate (REMB) caps the target from above.
    pub fn update_receiver_estimate(&mut self, at_time: Timestamp, bandwidth: DataRate) {
        self.receiver_limit = if bandwidth.is_zero() {
            DataRate::plus_infinity()
        } else {
            bandwidth
        };
        self.apply_target_limits(at_time);
    }

    /// Delay-based target caps the target from above.
    pub fn update_delay_based_estimate(&mut self, at_time: Timestamp, bitrate: DataRate) {
        self.link_capacity.update_delay_based_estimate(at_time, bitrate);
        self.delay_based_limit = if bitrate.is_zero() {
            DataRate::plus_infinity()
        } else {
            bitrate
        };
        self.apply_target_limits(at_time);
    }

    pub fn update_rtt(&mut self, rtt: TimeDelta, _at_time: Timestamp) {
        if rtt > TimeDelta::zero() {
            self.last_round_trip_time = rtt;
        }
    }

    pub fn update_propagation_rtt(&mut self, at_time: Timestamp, propagation_rtt: TimeDelta) {
        self.rtt_backoff.update_propagation_rtt(at_time, propagation_rtt);
    }

    pub fn on_sent_packet(&mut self, sent_packet: &SentPacket) {
        self.rtt_backoff.last_packet_sent = sent_packet.send_time;
    }

    pub fn set_acknowledged_rate(
        &mut self,
        acknowledged_rate: Option<DataRate>,
        _at_time: Timestamp,
    ) {
        self.acknowledged_rate = acknowledged_rate;
    }

    /// Per-report accounting over the raw feedback.
    pub fn incoming_packet_feedback_vector(&mut self, report: &TransportPacketsFeedback) {
        for feedback in &report.packet_feedbacks {
            self.feedback_stats.packets_with_feedback += 1;
            if !feedback.is_received() {
                self.feedback_stats.packets_lost += 1;
            }
        }
    }

    /// Feed aggregate loss counts; recomputes the loss fraction once at
    /// least 20 packets are covered.
    pub fn update_packets_lost(
        &mut self,
        packets_lost: i64,
        number_of_packets: i64,
        at_time: Timestamp,
    ) {
        if self.first_report_time.is_infinite() {
            self.first_report_time = at_time;
        }
        if number_of_packets <= 0 {
            return;
        }
        let expected = self.expected_packets_since_last_loss_update + number_of_packets;
        // Don't generate a loss rate until it can be based on enough packets.
        if expected < LIMIT_NUM_PACKETS {
            self.expected_packets_since_last_loss_update = expected;
            self.lost_packets_since_last_loss_update += packets_lost;
            return;
        }
        self.has_decreased_since_last_fraction_loss = false;
        let lost_q8 = (self.lost_packets_since_last_loss_update + packets_lost) << 8;
        self.last_fraction_loss = (lost_q8 / expected).min(255).max(0) as u8;
        self.lost_packets_since_last_loss_update = 0;
        self.expected_packets_since_last_loss_update = 0;
        self.last_loss_packet_report = at_time;
        self.update_estimate(at_time);
    }

    /// Periodic re-evaluation of the estimate.
    pub fn update_estimate(&mut self, at_time: Timestamp) {
        if self.rtt_backoff.corrected_rtt(at_time) > self.rtt_backoff.config.limit {
            if at_time - self.time_last_decrease >= self.rtt_backoff.config.drop_interval
                && self.current_target > self.rtt_backoff.config.floor
            {
                self.time_last_decrease = at_time;
                let new_bitrate = (self.current_target * self.rtt_backoff.config.drop_fraction)
                    .max(self.rtt_backoff.config.floor);
                self.link_capacity.on_rtt_backoff(new_bitrate, at_time);
                warn!(%new_bitrate, "propagation RTT over limit, backing off");
                self.update_target_bitrate(new_bitrate, at_time);
            }
            self.apply_target_limits(at_time);
            return;
        }

        // Trust the receiver estimate and the delay-based estimate during
        // the first 2 seconds if no packet loss has been reported, to allow
        // startup bitrate probing.
        if self.last_fraction_loss == 0 && self.is_in_start_phase(at_time) {
            let mut new_bitrate = self.current_target;
            if self.receiver_limit.is_finite() {
                new_bitrate = new_bitrate.max(self.receiver_limit);
            }
            if self.delay_based_limit.is_finite() {
                new_bitrate = new_bitrate.max(self.delay_based_limit);
            }
            if new_bitrate != self.current_target {
                self.min_bitrate_history.clear();
                self.min_bitrate_history.push_back((at_time, self.current_target));
                self.update_target_bitrate(new_bitrate, at_time);
                return;
            }
        }
        self.update_min_history(at_time);
        if self.last_loss_packet_report.is_infinite() {
            // No feedback received yet.
            self.apply_target_limits(at_time);
            return;
        }

        let time_since_loss_packet_report = at_time - self.last_loss_packet_report;
        if time_since_loss_packet_report < 1.2 * MAX_RTCP_FEEDBACK_INTERVAL {
            let loss = self.last_fraction_loss as f64 / 256.0;
            if self.current_target < BITRATE_THRESHOLD || loss <= LOW_LOSS_THRESHOLD {
                // Loss < 2%: increase by 8% of the windowed minimum.
                let min_bitrate = self
                    .min_bitrate_history
                    .front()
                    .map(|(_, rate)| *rate)
                    .unwrap_or(self.current_target);
                let new_bitrate =
                    DataRate::from_bps((min_bitrate.bps() as f64 * 1.08 + 0.5) as i64)
                        + DataRate::from_bps(1_000);
                self.update_target_bitrate(new_bitrate, at_time);
                return;
            } else if self.current_target > BITRATE_THRESHOLD {
                if loss <= HIGH_LOSS_THRESHOLD {
                    // Loss between 2% and 10%: hold.
                } else {
                    // Loss > 10%: limit decreases to once per interval + RTT.
                    if !self.has_decreased_since_last_fraction_loss
                        && (at_time - self.time_last_decrease)
                            >= (BWE_DECREASE_INTERVAL + self.last_round_trip_time)
                    {
                        self.time_last_decrease = at_time;
                        // Reduce rate: target * (1 - 0.5 * loss_ratio).
                        let new_bitrate = DataRate::from_bps(
                            (self.current_target.bps() as f64
                                * (512.0 - self.last_fraction_loss as f64)
                                / 512.0) as i64,
                        );
                        self.has_decreased_since_last_fraction_loss = true;
                        self.update_target_bitrate(new_bitrate, at_time);
                        return;
                    }
                }
            }
        }
        self.apply_target_limits(at_time);
    }

    fn is_in_start_phase(&self, at_time: Timestamp) -> bool {
        self.first_report_time.is_infinite()
            || at_time - self.first_report_time < START_PHASE
    }

    fn update_min_history(&mut self, at_time: Timestamp) {
        // Remove old data points; the precision is one millisecond, so add
        // one to still allow an increase when exactly on the boundary.
        while let Some(&(time, _)) = self.min_bitrate_history.front() {
            if at_time - time + TimeDelta::from_millis(1) > BWE_INCREASE_INTERVAL {
                self.min_bitrate_history.pop_front();
            } else {
                break;
            }
        }
        // Typical minimum sliding window: pop values higher than the
        // current bitrate before pushing it.
        while let Some(&(_, rate)) = self.min_bitrate_history.back() {
            if rate >= self.current_target {
                self.min_bitrate_history.pop_back();
            } else {
                break;
            }
        }
        self.min_bitrate_history.push_back((at_time, self.current_target));
    }

    fn get_upper_limit(&self) -> DataRate {
        self.delay_based_limit
            .min(self.receiver_limit)
            .min(self.max_bitrate_configured)
    }

    fn apply_target_limits(&mut self, at_time: Timestamp) {
        self.update_target_bitrate(self.current_target, at_time);
    }

    fn update_target_bitrate(&mut self, new_bitrate: DataRate, at_time: Timestamp) {
        let mut new_bitrate = new_bitrate.min(self.get_upper_limit());
        if new_bitrate < self.min_bitrate_configured {
            self.maybe_log_low_bitrate_warning(new_bitrate, at_time);
            new_bitrate = self.min_bitrate_configured;
        }
        self.current_target = new_bitrate;
        self.maybe_log_loss_based_state(at_time);
        self.link_capacity
            .on_rate_update(self.acknowledged_rate, self.current_target, at_time);
    }

    fn maybe_log_low_bitrate_warning(&mut self, bitrate: DataRate, at_time: Timestamp) {
        if at_time - self.last_low_bitrate_log > LOW_BITRATE_LOG_PERIOD {
            warn!(
                %bitrate,
                min = %self.min_bitrate_configured,
                "estimated bitrate below configured minimum"
            );
            self.last_low_bitrate_log = at_time;
        }
    }

    fn maybe_log_loss_based_state(&mut self, at_time: Timestamp) {
        if self.last_logged_fraction_loss != self.last_fraction_loss
            || self.last_logged_target != self.current_target
        {
            debug!(
                at_time = %at_time,
                bitrate = %self.current_target,
                fraction_loss = self.last_fraction_loss,
                rtt = %self.last_round_trip_time,
                "loss-based estimate"
            );
            self.last_logged_fraction_loss = self.last_fraction_loss;
            self.last_logged_target = self.current_target;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NoSettings;

    const START: DataRate = DataRate::from_bps(300_000);
    const MIN: DataRate = DataRate::from_bps(30_000);
    const MAX: DataRate = DataRate::from_bps(2_000_000);

    fn estimator_at(t0: Timestamp) -> SendSideBandwidthEstimation {
        let mut bwe = SendSideBandwidthEstimation::new(&NoSettings);
        bwe.set_bitrates(Some(START), MIN, MAX, t0);
        bwe
    }

    #[test]
    fn initial_estimate_is_the_starting_rate() {
        let bwe = estimator_at(Timestamp::from_millis(0));
        assert_eq!(bwe.current_estimate().bitrate, START);
        assert_eq!(bwe.current_estimate().fraction_loss, 0);
    }

    #[test]
    fn no_loss_increases_eight_percent_per_second() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        let mut now = Timestamp::from_millis(0);
        // Report clean loss intervals for a while.
        for _ in 0..10 {
            now = now + TimeDelta::from_millis(1_000);
            bwe.update_packets_lost(0, 100, now);
        }
        let target = bwe.current_estimate().bitrate;
        assert!(target > START, "clean reports must raise the rate: {target}");
        assert!(target <= MAX);
    }

    #[test]
    fn moderate_loss_holds_the_rate() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        let mut now = Timestamp::from_millis(0);
        // Leave the start phase first.
        bwe.update_packets_lost(0, 100, now + TimeDelta::from_millis(1));
        now = now + TimeDelta::from_millis(3_000);
        bwe.update_packets_lost(0, 100, now);
        let before = bwe.current_estimate().bitrate;
        // 5% loss: inside the hold band.
        now = now + TimeDelta::from_millis(1_000);
        bwe.update_packets_lost(5, 100, now);
        let after = bwe.current_estimate().bitrate;
        assert_eq!(after, before);
        assert_eq!(bwe.current_estimate().fraction_loss, (5 * 256 / 100) as u8);
    }

    #[test]
    fn heavy_loss_decreases_multiplicatively() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        let mut now = Timestamp::from_millis(0);
        bwe.update_packets_lost(0, 100, now + TimeDelta::from_millis(1));
        now = now + TimeDelta::from_millis(3_000);
        bwe.update_packets_lost(0, 100, now);
        let before = bwe.current_estimate().bitrate;
        now = now + TimeDelta::from_millis(1_000);
        bwe.update_packets_lost(50, 100, now);
        let estimate = bwe.current_estimate();
        assert!(estimate.bitrate < before);
        assert!(estimate.fraction_loss > 50);
        let expected =
            (before.bps() as f64 * (512.0 - estimate.fraction_loss as f64) / 512.0) as i64;
        assert_eq!(estimate.bitrate.bps(), expected);
    }

    #[test]
    fn decrease_is_rate_limited() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        let mut now = Timestamp::from_millis(0);
        bwe.update_packets_lost(0, 100, now + TimeDelta::from_millis(1));
        now = now + TimeDelta::from_millis(3_000);
        bwe.update_packets_lost(50, 100, now);
        let after_first = bwe.current_estimate().bitrate;
        // Another heavy report right away must not cut the rate again.
        now = now + TimeDelta::from_millis(50);
        bwe.update_packets_lost(50, 100, now);
        assert_eq!(bwe.current_estimate().bitrate, after_first);
    }

    #[test]
    fn fraction_loss_saturates_at_255() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        bwe.update_packets_lost(100, 100, Timestamp::from_millis(5_000));
        assert_eq!(bwe.current_estimate().fraction_loss, 255);
    }

    #[test]
    fn loss_reports_accumulate_until_twenty_packets() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        bwe.update_packets_lost(5, 10, Timestamp::from_millis(100));
        // Under 20 packets: no fraction computed yet.
        assert_eq!(bwe.current_estimate().fraction_loss, 0);
        bwe.update_packets_lost(5, 10, Timestamp::from_millis(200));
        assert_eq!(bwe.current_estimate().fraction_loss, (10 * 256 / 20) as u8);
    }

    #[test]
    fn delay_based_estimate_caps_the_target() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        bwe.update_delay_based_estimate(
            Timestamp::from_millis(100),
            DataRate::from_bps(250_000),
        );
        assert_eq!(bwe.current_estimate().bitrate.bps(), 250_000);
        // Clearing the cap via a forced send bitrate lifts it again.
        bwe.set_send_bitrate(START, Timestamp::from_millis(200));
        assert_eq!(bwe.current_estimate().bitrate, START);
    }

    #[test]
    fn receiver_estimate_caps_the_target_after_start_phase() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        bwe.update_packets_lost(0, 100, Timestamp::from_millis(1));
        bwe.update_receiver_estimate(
            Timestamp::from_millis(2_500),
            DataRate::from_bps(200_000),
        );
        bwe.update_estimate(Timestamp::from_millis(2_500));
        assert_eq!(bwe.current_estimate().bitrate.bps(), 200_000);
    }

    #[test]
    fn start_phase_jumps_to_delay_based_estimate() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        // A probe-driven delay-based estimate arrives early: adopt it.
        bwe.update_delay_based_estimate(
            Timestamp::from_millis(100),
            DataRate::from_bps(900_000),
        );
        bwe.update_estimate(Timestamp::from_millis(150));
        assert_eq!(bwe.current_estimate().bitrate.bps(), 900_000);
    }

    #[test]
    fn rtt_backoff_cuts_rate_when_enabled() {
        let trials = crate::config::FieldTrials::new()
            .set("WebRTC-Bwe-MaxRttLimit", "Enabled,limit:2000,floor:40000");
        let mut bwe = SendSideBandwidthEstimation::new(&trials);
        bwe.set_bitrates(Some(START), MIN, MAX, Timestamp::from_millis(0));
        bwe.on_sent_packet(&SentPacket {
            send_time: Timestamp::from_millis(100),
            ..Default::default()
        });
        bwe.update_propagation_rtt(Timestamp::from_millis(100), TimeDelta::from_millis(3_000));
        bwe.update_estimate(Timestamp::from_millis(200));
        assert_eq!(
            bwe.current_estimate().bitrate,
            START * 0.8,
            "one 20% cut toward the floor"
        );
    }

    #[test]
    fn min_bitrate_is_always_respected() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        let mut now = Timestamp::from_millis(0);
        bwe.update_packets_lost(0, 100, now + TimeDelta::from_millis(1));
        for _ in 0..50 {
            now = now + TimeDelta::from_millis(1_000);
            bwe.update_packets_lost(90, 100, now);
        }
        assert!(bwe.current_estimate().bitrate >= MIN);
    }

    #[test]
    fn stable_capacity_tracks_acknowledged_rate() {
        let mut bwe = estimator_at(Timestamp::from_millis(0));
        assert_eq!(bwe.get_estimated_link_capacity(), START);
        let mut now = Timestamp::from_millis(0);
        bwe.set_acknowledged_rate(Some(DataRate::from_bps(800_000)), now);
        for _ in 0..40 {
            now = now + TimeDelta::from_millis(1_000);
            bwe.update_packets_lost(0, 100, now);
        }
        let capacity = bwe.get_estimated_link_capacity();
        assert!(
            capacity > START,
            "capacity should drift toward min(acked, target): {capacity}"
        );
    }
}
