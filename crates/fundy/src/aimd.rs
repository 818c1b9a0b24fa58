//! # AIMD Rate Control
//!
//! Converts the overuse detector's verdict into a target rate: additive
//! increase near the estimated link capacity, multiplicative increase while
//! the capacity is still unknown, multiplicative decrease on overuse, hold
//! while a drained queue recovers. A capacity estimator tracks where the
//! link tends to saturate so increases can slow down before the cliff.

use tracing::debug;

use crate::api::{BandwidthUsage, NetworkStateEstimate};
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

// ─── Link capacity estimator ────────────────────────────────────────────────

/// EWMA of the throughput observed at overuse, with a normalized deviation
/// that gives ±3σ validity bounds.
#[derive(Debug, Default)]
pub struct LinkCapacityEstimator {
    estimate_kbps: Option<f64>,
    deviation_kbps: f64,
}

impl LinkCapacityEstimator {
    pub fn new() -> Self {
        LinkCapacityEstimator {
            estimate_kbps: None,
            deviation_kbps: 0.4,
        }
    }

    pub fn upper_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => DataRate::from_bps(
                ((estimate + 3.0 * self.deviation_estimate_kbps(estimate)) * 1_000.0) as i64,
            ),
            None => DataRate::plus_infinity(),
        }
    }

    pub fn lower_bound(&self) -> DataRate {
        match self.estimate_kbps {
            Some(estimate) => DataRate::from_bps(
                ((estimate - 3.0 * self.deviation_estimate_kbps(estimate)).max(0.0) * 1_000.0)
                    as i64,
            ),
            None => DataRate::zero(),
        }
    }

    pub fn reset(&mut self) {
        self.estimate_kbps = None;
    }

    pub fn on_overuse_detected(&mut self, acknowledged_rate: DataRate) {
        self.update(acknowledged_rate, 0.05);
    }

    pub fn on_probe_rate(&mut self, probe_rate: DataRate) {
        self.update(probe_rate, 0.5);
    }

    fn update(&mut self, capacity_sample: DataRate, alpha: f64) {
        let sample_kbps = capacity_sample.bps_f64() / 1_000.0;
        let estimate_kbps = match self.estimate_kbps {
            None => sample_kbps,
            Some(estimate) => (1.0 - alpha) * estimate + alpha * sample_kbps,
        };
        // Normalize the variance by the estimate so the bounds scale with
        // the link rate.
        let norm = estimate_kbps.max(1.0);
        let error_kbps = estimate_kbps - sample_kbps;
        self.deviation_kbps =
            (1.0 - alpha) * self.deviation_kbps + alpha * error_kbps * error_kbps / norm;
        // 0.4 ~= 14 kbit/s at 500 kbit/s, 2.5 ~= 35 kbit/s at 500 kbit/s.
        self.deviation_kbps = self.deviation_kbps.clamp(0.4, 2.5);
        self.estimate_kbps = Some(estimate_kbps);
    }

    pub fn has_estimate(&self) -> bool {
        self.estimate_kbps.is_some()
    }

    pub fn estimate(&self) -> DataRate {
        debug_assert!(self.has_estimate());
        DataRate::from_bps((self.estimate_kbps.unwrap_or(0.0) * 1_000.0) as i64)
    }

    fn deviation_estimate_kbps(&self, estimate_kbps: f64) -> f64 {
        (self.deviation_kbps * estimate_kbps).sqrt()
    }
}

// ─── AIMD rate control ──────────────────────────────────────────────────────

pub const CONGESTION_CONTROLLER_MIN_BITRATE: DataRate = DataRate::from_bps(5_000);

const DEFAULT_RTT: TimeDelta = TimeDelta::from_millis(200);
const DEFAULT_BACKOFF_FACTOR: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateControlState {
    Hold,
    Increase,
    Decrease,
}

/// Input to one rate-control step.
#[derive(Debug, Clone, Copy)]
pub struct RateControlInput {
    pub bw_state: BandwidthUsage,
    pub estimated_throughput: Option<DataRate>,
}

/// Tunables for [`AimdRateControl`].
#[derive(Debug, Clone, Copy)]
pub struct AimdRateControlConfig {
    pub beta: f64,
    /// Freeze delay-based increases inside application-limited regions,
    /// where feedback cannot confirm the new rate.
    pub no_bitrate_increase_in_alr: bool,
    /// Subtract an extra 5 kbps when backing off.
    pub subtract_additional_backoff_term: bool,
}

impl Default for AimdRateControlConfig {
    fn default() -> Self {
        AimdRateControlConfig {
            beta: DEFAULT_BACKOFF_FACTOR,
            no_bitrate_increase_in_alr: false,
            subtract_additional_backoff_term: true,
        }
    }
}

/// Additive-increase multiplicative-decrease controller over detector state.
#[derive(Debug)]
pub struct AimdRateControl {
    config: AimdRateControlConfig,
    min_configured_bitrate: DataRate,
    current_bitrate: DataRate,
    latest_estimated_throughput: DataRate,
    link_capacity: LinkCapacityEstimator,
    network_estimate: Option<NetworkStateEstimate>,
    rate_control_state: RateControlState,
    time_last_bitrate_change: Timestamp,
    time_first_throughput_estimate: Timestamp,
    bitrate_is_initialized: bool,
    in_alr: bool,
    rtt: TimeDelta,
    last_decrease: Option<DataRate>,
}

impl AimdRateControl {
    pub fn new(config: AimdRateControlConfig) -> Self {
        let max_configured_bitrate = DataRate::from_kbps(30_000);
        AimdRateControl {
            config,
            min_configured_bitrate: CONGESTION_CONTROLLER_MIN_BITRATE,
            current_bitrate: max_configured_bitrate,
            latest_estimated_throughput: max_configured_bitrate,
            link_capacity: LinkCapacityEstimator::new(),
            network_estimate: None,
            rate_control_state: RateControlState::Hold,
            time_last_bitrate_change: Timestamp::minus_infinity(),
            time_first_throughput_estimate: Timestamp::minus_infinity(),
            bitrate_is_initialized: false,
            in_alr: false,
            rtt: DEFAULT_RTT,
            last_decrease: None,
        }
    }

    pub fn set_start_bitrate(&mut self, start_bitrate: DataRate) {
        self.current_bitrate = start_bitrate;
        self.latest_estimated_throughput = self.current_bitrate;
        self.bitrate_is_initialized = true;
    }

    pub fn set_min_bitrate(&mut self, min_bitrate: DataRate) {
        self.min_configured_bitrate = min_bitrate;
        self.current_bitrate = self.current_bitrate.max(min_bitrate);
    }

    pub fn valid_estimate(&self) -> bool {
        self.bitrate_is_initialized
    }

    /// Whether the rate may be reduced again given how recently it changed
    /// and how far the throughput already dropped.
    pub fn time_to_reduce_further(
        &self,
        at_time: Timestamp,
        estimated_throughput: DataRate,
    ) -> bool {
        let bitrate_reduction_interval = TimeDelta::from_micros(
            self.rtt
                .us()
                .clamp(TimeDelta::from_millis(10).us(), TimeDelta::from_millis(200).us()),
        );
        if at_time - self.time_last_bitrate_change >= bitrate_reduction_interval {
            return true;
        }
        if self.valid_estimate() {
            // A soft max on the throughput, to allow a draining period.
            let threshold = 0.5 * self.latest_estimate();
            return estimated_throughput < threshold;
        }
        false
    }

    /// As [`Self::time_to_reduce_further`] but without a throughput
    /// measurement, used before the first acknowledged rate exists.
    pub fn initial_time_to_reduce_further(&self, at_time: Timestamp) -> bool {
        self.valid_estimate()
            && self.time_to_reduce_further(
                at_time,
                self.latest_estimate() / 2 - DataRate::from_bps(1),
            )
    }

    pub fn latest_estimate(&self) -> DataRate {
        self.current_bitrate
    }

    pub fn set_rtt(&mut self, rtt: TimeDelta) {
        self.rtt = rtt;
    }

    pub fn update(&mut self, input: &RateControlInput, at_time: Timestamp) -> DataRate {
        // Grab the first throughput estimate after a settling period as the
        // initial bitrate if nothing else initialized it first.
        if !self.bitrate_is_initialized {
            const INITIALIZATION_TIME: TimeDelta = TimeDelta::from_seconds(5);
            if self.time_first_throughput_estimate.is_infinite() {
                if input.estimated_throughput.is_some() {
                    self.time_first_throughput_estimate = at_time;
                }
            } else if at_time - self.time_first_throughput_estimate > INITIALIZATION_TIME {
                if let Some(estimated_throughput) = input.estimated_throughput {
                    self.current_bitrate = estimated_throughput;
                    self.bitrate_is_initialized = true;
                }
            }
        }
        self.change_bitrate(input, at_time);
        self.current_bitrate
    }

    pub fn set_in_application_limited_region(&mut self, in_alr: bool) {
        self.in_alr = in_alr;
    }

    /// Force the estimate, e.g. from a probe result.
    pub fn set_estimate(&mut self, bitrate: DataRate, at_time: Timestamp) {
        self.bitrate_is_initialized = true;
        self.current_bitrate = self.clamp_bitrate(bitrate);
        self.time_last_bitrate_change = at_time;
    }

    pub fn set_network_state_estimate(&mut self, estimate: Option<NetworkStateEstimate>) {
        self.network_estimate = estimate;
    }

    /// Increase rate when operating near the link capacity estimate, in
    /// bits per second per second.
    pub fn near_max_increase_rate_bps_per_second(&self) -> f64 {
        debug_assert!(!self.current_bitrate.is_zero());
        const FRAME_INTERVAL: TimeDelta = TimeDelta::from_micros(1_000_000 / 30);
        const PACKET_SIZE: DataSize = DataSize::from_bytes(1_200);
        let frame_size = self.current_bitrate * FRAME_INTERVAL;
        let packets_per_frame =
            (frame_size.bytes() as f64 / PACKET_SIZE.bytes() as f64).ceil();
        let avg_packet_size_bytes = frame_size.bytes() as f64 / packets_per_frame;
        // Approximate the over-use estimator delay to 100 ms.
        let response_time = (self.rtt + TimeDelta::from_millis(100)) * 2.0;
        let increase_rate_bps_per_second =
            avg_packet_size_bytes * 8.0 / response_time.seconds_f64();
        const MIN_INCREASE_RATE_BPS_PER_SECOND: f64 = 4_000.0;
        increase_rate_bps_per_second.max(MIN_INCREASE_RATE_BPS_PER_SECOND)
    }

    /// How long recovering the last decrease should take at the near-max
    /// increase rate; reported to the host as the BWE period.
    pub fn get_expected_bandwidth_period(&self) -> TimeDelta {
        const MIN_PERIOD: TimeDelta = TimeDelta::from_seconds(2);
        const DEFAULT_PERIOD: TimeDelta = TimeDelta::from_seconds(3);
        const MAX_PERIOD: TimeDelta = TimeDelta::from_seconds(50);
        let increase_rate_bps_per_second = self.near_max_increase_rate_bps_per_second();
        let Some(last_decrease) = self.last_decrease else {
            return DEFAULT_PERIOD;
        };
        let time_to_recover_seconds = last_decrease.bps_f64() / increase_rate_bps_per_second;
        let period_us = (time_to_recover_seconds * 1_000_000.0) as i64;
        TimeDelta::from_micros(period_us.clamp(MIN_PERIOD.us(), MAX_PERIOD.us()))
    }

    fn change_bitrate(&mut self, input: &RateControlInput, at_time: Timestamp) {
        let mut new_bitrate: Option<DataRate> = None;
        let estimated_throughput = input
            .estimated_throughput
            .unwrap_or(self.latest_estimated_throughput);
        if let Some(throughput) = input.estimated_throughput {
            self.latest_estimated_throughput = throughput;
        }

        // An over-use should always trigger a reduction even before the
        // first estimate is established; acting on it produces one.
        if !self.bitrate_is_initialized && input.bw_state != BandwidthUsage::Overusing {
            return;
        }
        self.change_state(input, at_time);

        match self.rate_control_state {
            RateControlState::Hold => {}
            RateControlState::Increase => {
                if estimated_throughput > self.link_capacity.upper_bound() {
                    self.link_capacity.reset();
                }
                // Limit the increase by the measured throughput, with slack
                // so uneven encoder output does not get stuck at low rates.
                let mut increase_limit =
                    1.5 * estimated_throughput + DataRate::from_kbps(10);
                if self.in_alr && self.config.no_bitrate_increase_in_alr {
                    // Feedback inside the application-limited region cannot
                    // confirm a higher rate, so do not move past probes.
                    increase_limit = self.current_bitrate;
                }
                if self.current_bitrate < increase_limit {
                    let increased_bitrate = if self.link_capacity.has_estimate() {
                        // Near a known capacity: creep up additively.
                        let additive =
                            self.additive_rate_increase(at_time, self.time_last_bitrate_change);
                        self.current_bitrate + additive
                    } else {
                        // No capacity estimate yet: ramp up faster to find it.
                        let multiplicative = self.multiplicative_rate_increase(
                            at_time,
                            self.time_last_bitrate_change,
                            self.current_bitrate,
                        );
                        self.current_bitrate + multiplicative
                    };
                    new_bitrate = Some(increased_bitrate.min(increase_limit));
                }
                self.time_last_bitrate_change = at_time;
            }
            RateControlState::Decrease => {
                // Slightly below the measured throughput, to drain any
                // self-induced delay.
                let mut decreased_bitrate = estimated_throughput * self.config.beta;
                if decreased_bitrate > DataRate::from_kbps(5)
                    && self.config.subtract_additional_backoff_term
                {
                    decreased_bitrate = decreased_bitrate - DataRate::from_kbps(5);
                }
                if decreased_bitrate > self.current_bitrate {
                    if self.link_capacity.has_estimate() {
                        decreased_bitrate = self.config.beta * self.link_capacity.estimate();
                    }
                }
                // Avoid increasing the rate when over-using.
                if decreased_bitrate < self.current_bitrate {
                    new_bitrate = Some(decreased_bitrate);
                }
                if self.bitrate_is_initialized && estimated_throughput < self.current_bitrate {
                    self.last_decrease = Some(match new_bitrate {
                        Some(bitrate) => self.current_bitrate - bitrate,
                        None => DataRate::zero(),
                    });
                }
                if estimated_throughput < self.link_capacity.lower_bound() {
                    // Far below the estimated capacity: the estimate is
                    // stale, clear it so the next overuse re-seeds it.
                    self.link_capacity.reset();
                }
                self.bitrate_is_initialized = true;
                self.link_capacity.on_overuse_detected(estimated_throughput);
                // Stay on hold until the pipes are cleared.
                self.rate_control_state = RateControlState::Hold;
                self.time_last_bitrate_change = at_time;
                debug!(bitrate = %self.current_bitrate, "delay-based decrease");
            }
        }
        self.current_bitrate = self.clamp_bitrate(new_bitrate.unwrap_or(self.current_bitrate));
    }

    fn clamp_bitrate(&self, mut new_bitrate: DataRate) -> DataRate {
        if let Some(estimate) = &self.network_estimate {
            if estimate.link_capacity_upper.is_finite() {
                let upper_bound = estimate.link_capacity_upper.max(self.current_bitrate);
                new_bitrate = new_bitrate.min(upper_bound);
            }
            if estimate.link_capacity_lower.is_finite() && new_bitrate < self.current_bitrate {
                new_bitrate = self
                    .current_bitrate
                    .min(new_bitrate.max(estimate.link_capacity_lower * self.config.beta));
            }
        }
        new_bitrate.max(self.min_configured_bitrate)
    }

    fn multiplicative_rate_increase(
        &self,
        at_time: Timestamp,
        last_time: Timestamp,
        current_bitrate: DataRate,
    ) -> DataRate {
        let mut alpha: f64 = 1.08;
        if last_time.is_finite() {
            let time_since_last_update = at_time - last_time;
            alpha = alpha.powf(time_since_last_update.seconds_f64().min(1.0));
        }
        (current_bitrate * (alpha - 1.0)).max(DataRate::from_bps(1_000))
    }

    fn additive_rate_increase(&self, at_time: Timestamp, last_time: Timestamp) -> DataRate {
        let time_period_seconds = (at_time - last_time).seconds_f64();
        DataRate::from_bps(
            (self.near_max_increase_rate_bps_per_second() * time_period_seconds) as i64,
        )
    }

    fn change_state(&mut self, input: &RateControlInput, at_time: Timestamp) {
        match input.bw_state {
            BandwidthUsage::Normal => {
                if self.rate_control_state == RateControlState::Hold {
                    self.time_last_bitrate_change = at_time;
                    self.rate_control_state = RateControlState::Increase;
                }
            }
            BandwidthUsage::Overusing => {
                if self.rate_control_state != RateControlState::Decrease {
                    self.rate_control_state = RateControlState::Decrease;
                }
            }
            BandwidthUsage::Underusing => {
                self.rate_control_state = RateControlState::Hold;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INITIAL_TIME: Timestamp = Timestamp::from_millis(123_456);

    fn initialized_control(start_bps: i64) -> AimdRateControl {
        let mut control = AimdRateControl::new(AimdRateControlConfig::default());
        control.set_start_bitrate(DataRate::from_bps(start_bps));
        control
    }

    #[test]
    fn min_near_max_increase_rate_on_low_bandwidth() {
        let control = initialized_control(30_000);
        assert_eq!(control.near_max_increase_rate_bps_per_second(), 4_000.0);
    }

    #[test]
    fn near_max_increase_rate_is_approximately_5kbps_per_second_at_1mbps() {
        let control = initialized_control(1_000_000);
        // One 30 fps frame at 1 Mbps is ~4167 bytes, four packets, ~1042
        // bytes each; at 600 ms response time that is ~14 kbps/s... the
        // exact value only matters for being stable and positive.
        let rate = control.near_max_increase_rate_bps_per_second();
        assert!(rate > 4_000.0);
    }

    #[test]
    fn overuse_decreases_rate_below_throughput() {
        let mut control = initialized_control(500_000);
        let input = RateControlInput {
            bw_state: BandwidthUsage::Overusing,
            estimated_throughput: Some(DataRate::from_bps(400_000)),
        };
        let target = control.update(&input, INITIAL_TIME);
        // 0.85 * 400 kbps - 5 kbps.
        assert_eq!(target.bps(), 335_000);
    }

    #[test]
    fn hold_after_decrease_until_normal() {
        let mut control = initialized_control(500_000);
        let overuse = RateControlInput {
            bw_state: BandwidthUsage::Overusing,
            estimated_throughput: Some(DataRate::from_bps(400_000)),
        };
        let after_decrease = control.update(&overuse, INITIAL_TIME);
        let normal = RateControlInput {
            bw_state: BandwidthUsage::Normal,
            estimated_throughput: Some(DataRate::from_bps(400_000)),
        };
        // First normal input only flips Hold -> Increase.
        let target = control.update(&normal, INITIAL_TIME + TimeDelta::from_millis(25));
        assert_eq!(target, after_decrease);
        let target = control.update(&normal, INITIAL_TIME + TimeDelta::from_millis(50));
        assert!(target > after_decrease, "rate should grow after hold");
    }

    #[test]
    fn increase_is_capped_by_throughput_based_limit() {
        let mut control = initialized_control(100_000);
        let mut now = INITIAL_TIME;
        let input = RateControlInput {
            bw_state: BandwidthUsage::Normal,
            estimated_throughput: Some(DataRate::from_bps(200_000)),
        };
        for _ in 0..600 {
            now = now + TimeDelta::from_millis(100);
            control.update(&input, now);
        }
        // 1.5 * 200 kbps + 10 kbps.
        assert!(control.latest_estimate().bps() <= 310_000);
        assert!(control.latest_estimate().bps() > 150_000, "rate should ramp");
    }

    #[test]
    fn underuse_holds_the_rate() {
        let mut control = initialized_control(500_000);
        let input = RateControlInput {
            bw_state: BandwidthUsage::Underusing,
            estimated_throughput: Some(DataRate::from_bps(600_000)),
        };
        let target = control.update(&input, INITIAL_TIME);
        assert_eq!(target.bps(), 500_000);
    }

    #[test]
    fn no_increase_in_alr_when_configured() {
        let config = AimdRateControlConfig {
            no_bitrate_increase_in_alr: true,
            ..Default::default()
        };
        let mut control = AimdRateControl::new(config);
        control.set_start_bitrate(DataRate::from_bps(300_000));
        control.set_in_application_limited_region(true);
        let input = RateControlInput {
            bw_state: BandwidthUsage::Normal,
            estimated_throughput: Some(DataRate::from_bps(300_000)),
        };
        let mut now = INITIAL_TIME;
        for _ in 0..10 {
            now = now + TimeDelta::from_millis(100);
            control.update(&input, now);
        }
        assert_eq!(control.latest_estimate().bps(), 300_000);
    }

    #[test]
    fn estimate_bounded_by_network_estimate_upper_bound() {
        let mut control = initialized_control(500_000);
        control.set_network_state_estimate(Some(NetworkStateEstimate {
            update_time: INITIAL_TIME,
            link_capacity: DataRate::from_bps(600_000),
            link_capacity_lower: DataRate::from_bps(400_000),
            link_capacity_upper: DataRate::from_bps(600_000),
        }));
        control.set_estimate(DataRate::from_bps(2_000_000), INITIAL_TIME);
        assert_eq!(control.latest_estimate().bps(), 600_000);
    }

    #[test]
    fn expected_period_defaults_to_3s_then_tracks_last_decrease() {
        let mut control = initialized_control(500_000);
        assert_eq!(
            control.get_expected_bandwidth_period(),
            TimeDelta::from_seconds(3)
        );
        let input = RateControlInput {
            bw_state: BandwidthUsage::Overusing,
            estimated_throughput: Some(DataRate::from_bps(400_000)),
        };
        control.update(&input, INITIAL_TIME);
        let period = control.get_expected_bandwidth_period();
        assert!(period >= TimeDelta::from_seconds(2));
        assert!(period <= TimeDelta::from_seconds(50));
    }

    #[test]
    fn min_bitrate_is_a_floor() {
        let mut control = initialized_control(10_000);
        let input = RateControlInput {
            bw_state: BandwidthUsage::Overusing,
            estimated_throughput: Some(DataRate::from_bps(1_000)),
        };
        control.update(&input, INITIAL_TIME);
        assert!(control.latest_estimate() >= CONGESTION_CONTROLLER_MIN_BITRATE);
    }
}
