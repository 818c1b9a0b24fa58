//! # Probe Controller
//!
//! Decides when to launch active probe clusters: exponential probes at
//! session start, a follow-up while results keep confirming headroom,
//! periodic probes inside application-limited regions, a recovery probe
//! after a large estimate drop, and one-off probes when the configured
//! ceiling rises. At most one probe sequence is in flight at a time; new
//! triggers wait until the previous sequence has concluded.

use tracing::{debug, warn};

use crate::api::ProbeClusterConfig;
use crate::units::{DataRate, TimeDelta, Timestamp};

// Maximum waiting time from the time of initiating probing to getting
// the measured results back.
const MAX_WAITING_TIME_FOR_PROBING_RESULT_MS: i64 = 1_000;

// Default probing bitrate limit. Applied only when the application didn't
// specify max bitrate.
const DEFAULT_MAX_PROBING_BITRATE_BPS: i64 = 5_000_000;

// Interval between probes when ALR periodic probing is enabled.
const ALR_PERIODIC_PROBING_INTERVAL_MS: i64 = 5_000;

// Time (in milliseconds) since the last large drop we should wait before
// probing again to recover.
const BITRATE_DROP_TIMEOUT_MS: i64 = 5_000;

// The expected reduction in estimate that counts as a large drop.
const BITRATE_DROP_THRESHOLD: f64 = 0.66;

// Fraction of the pre-drop bitrate a recovery probe aims at.
const PROBE_FRACTION_AFTER_DROP: f64 = 0.85;

// Expected probe result uncertainty; a recovery probe is only worth it when
// the pessimistic outcome still beats the current estimate.
const PROBE_UNCERTAINTY: f64 = 0.05;

// Timeout for ALR-ended recovery probing.
const ALR_ENDED_TIMEOUT_MS: i64 = 3_000;

// Minimum spacing between recovery probes.
const MIN_TIME_BETWEEN_ALR_PROBES_MS: i64 = 5_000;

// The first exponential probe runs at 3x the starting rate, the second at 6x.
const FIRST_EXPONENTIAL_PROBE_SCALE: f64 = 3.0;
const SECOND_EXPONENTIAL_PROBE_SCALE: f64 = 6.0;

// A follow-up probe doubles the measured result, as long as the result kept
// at least this fraction of the probed target.
const FURTHER_EXPONENTIAL_PROBE_SCALE: f64 = 2.0;
const REPEATED_PROBE_MIN_FRACTION: f64 = 0.7;

const MIN_PROBE_PACKETS_SENT: i32 = 5;
const MIN_PROBE_DURATION_MS: i64 = 15;

/// Probing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// No probing yet; waiting for constraints and network availability.
    Init,
    /// A probe sequence is in flight, with no exponential follow-up planned.
    Probing,
    /// A probe sequence is in flight and its result decides further probing.
    WaitingForProbingResult,
    /// Probing has concluded; triggers may start a new sequence.
    Done,
}

/// Emits probe clusters at defined trigger points.
#[derive(Debug)]
pub struct ProbeController {
    network_available: bool,
    state: ProbeState,
    min_bitrate_to_probe_further_bps: Option<i64>,
    time_last_probing_initiated_ms: i64,
    estimated_bitrate_bps: i64,
    start_bitrate_bps: i64,
    max_bitrate_bps: i64,
    last_bwe_drop_probing_time_ms: i64,
    alr_start_time_ms: Option<i64>,
    alr_end_time_ms: Option<i64>,
    enable_periodic_alr_probing: bool,
    time_of_last_large_drop_ms: i64,
    bitrate_before_last_large_drop_bps: i64,
    max_total_allocated_bitrate: i64,
    mid_call_probing_waiting_for_result: bool,
    mid_call_probing_succcess_threshold_bps: i64,
    next_probe_cluster_id: i32,
}

impl ProbeController {
    pub fn new() -> Self {
        let mut controller = ProbeController {
            network_available: true,
            state: ProbeState::Init,
            min_bitrate_to_probe_further_bps: None,
            time_last_probing_initiated_ms: 0,
            estimated_bitrate_bps: 0,
            start_bitrate_bps: 0,
            max_bitrate_bps: 0,
            last_bwe_drop_probing_time_ms: 0,
            alr_start_time_ms: None,
            alr_end_time_ms: None,
            enable_periodic_alr_probing: false,
            time_of_last_large_drop_ms: 0,
            bitrate_before_last_large_drop_bps: 0,
            max_total_allocated_bitrate: 0,
            mid_call_probing_waiting_for_result: false,
            mid_call_probing_succcess_threshold_bps: 0,
            next_probe_cluster_id: 1,
        };
        controller.reset(0);
        controller
    }

    pub fn state(&self) -> ProbeState {
        self.state
    }

    /// Apply new bitrate constraints; may start initial or mid-call probing.
    pub fn set_bitrates(
        &mut self,
        min_bitrate_bps: i64,
        start_bitrate_bps: i64,
        max_bitrate_bps: i64,
        at_time_ms: i64,
    ) -> Vec<ProbeClusterConfig> {
        if start_bitrate_bps > 0 {
            self.start_bitrate_bps = start_bitrate_bps;
            self.estimated_bitrate_bps = start_bitrate_bps;
        } else if self.start_bitrate_bps == 0 {
            self.start_bitrate_bps = min_bitrate_bps;
        }

        let old_max_bitrate_bps = self.max_bitrate_bps;
        self.max_bitrate_bps = max_bitrate_bps;

        match self.state {
            ProbeState::Init => {
                if self.network_available {
                    return self.initiate_exponential_probing(at_time_ms);
                }
            }
            ProbeState::Probing | ProbeState::WaitingForProbingResult => {}
            ProbeState::Done => {
                // Probe towards a raised ceiling when the estimate had
                // already converged onto the old one.
                if self.estimated_bitrate_bps != 0
                    && old_max_bitrate_bps < self.max_bitrate_bps
                    && self.estimated_bitrate_bps < self.max_bitrate_bps
                {
                    self.mid_call_probing_succcess_threshold_bps = std::cmp::min(
                        (self.estimated_bitrate_bps as f64 * 1.25) as i64,
                        (self.max_bitrate_bps as f64 * 0.80) as i64,
                    );
                    self.mid_call_probing_waiting_for_result = true;
                    return self.initiate_probing(at_time_ms, &[self.max_bitrate_bps], false);
                }
            }
        }
        Vec::new()
    }

    /// The allocator raised (or lowered) the total allocation ceiling.
    pub fn on_max_total_allocated_bitrate(
        &mut self,
        max_total_allocated_bitrate: i64,
        at_time_ms: i64,
    ) -> Vec<ProbeClusterConfig> {
        if self.state == ProbeState::Done
            && max_total_allocated_bitrate != self.max_total_allocated_bitrate
            && self.estimated_bitrate_bps != 0
            && (self.max_bitrate_bps <= 0 || self.estimated_bitrate_bps < self.max_bitrate_bps)
            && self.estimated_bitrate_bps < max_total_allocated_bitrate
        {
            self.max_total_allocated_bitrate = max_total_allocated_bitrate;
            return self.initiate_probing(at_time_ms, &[max_total_allocated_bitrate], false);
        }
        self.max_total_allocated_bitrate = max_total_allocated_bitrate;
        Vec::new()
    }

    pub fn on_network_availability(
        &mut self,
        at_time_ms: i64,
        network_available: bool,
    ) -> Vec<ProbeClusterConfig> {
        self.network_available = network_available;
        if !self.network_available && self.state == ProbeState::WaitingForProbingResult {
            self.state = ProbeState::Done;
            self.min_bitrate_to_probe_further_bps = None;
        }
        if self.network_available && self.state == ProbeState::Init && self.start_bitrate_bps > 0 {
            return self.initiate_exponential_probing(at_time_ms);
        }
        Vec::new()
    }

    /// A new estimate arrived; may extend an exponential probe sequence.
    pub fn set_estimated_bitrate(
        &mut self,
        bitrate_bps: i64,
        at_time_ms: i64,
    ) -> Vec<ProbeClusterConfig> {
        if self.mid_call_probing_waiting_for_result
            && bitrate_bps >= self.mid_call_probing_succcess_threshold_bps
        {
            self.mid_call_probing_waiting_for_result = false;
        }
        let mut pending_probes = Vec::new();
        match self.state {
            ProbeState::WaitingForProbingResult => {
                // Continue probing if the result indicates the channel has
                // greater capacity than the probed rate.
                if let Some(threshold) = self.min_bitrate_to_probe_further_bps {
                    if bitrate_bps > threshold {
                        pending_probes = self.initiate_probing(
                            at_time_ms,
                            &[(FURTHER_EXPONENTIAL_PROBE_SCALE * bitrate_bps as f64) as i64],
                            true,
                        );
                    }
                }
            }
            ProbeState::Probing => {
                // The in-flight sequence produced its estimate update.
                self.state = ProbeState::Done;
            }
            ProbeState::Init | ProbeState::Done => {}
        }

        if (bitrate_bps as f64) < BITRATE_DROP_THRESHOLD * self.estimated_bitrate_bps as f64 {
            self.time_of_last_large_drop_ms = at_time_ms;
            self.bitrate_before_last_large_drop_bps = self.estimated_bitrate_bps;
        }
        self.estimated_bitrate_bps = bitrate_bps;
        pending_probes
    }

    /// Raise the probing ceiling without emitting a probe.
    pub fn set_max_bitrate(&mut self, max_bitrate_bps: i64) {
        self.max_bitrate_bps = max_bitrate_bps;
    }

    pub fn enable_periodic_alr_probing(&mut self, enable: bool) {
        self.enable_periodic_alr_probing = enable;
    }

    pub fn set_alr_start_time_ms(&mut self, alr_start_time_ms: Option<i64>) {
        self.alr_start_time_ms = alr_start_time_ms;
    }

    pub fn set_alr_ended_time_ms(&mut self, alr_end_time_ms: i64) {
        self.alr_end_time_ms = Some(alr_end_time_ms);
    }

    /// Probe to recover after a large estimate drop. Only worthwhile in (or
    /// just after) an application-limited region, while the drop is fresh.
    pub fn request_probe(&mut self, at_time_ms: i64) -> Vec<ProbeClusterConfig> {
        let in_alr = self.alr_start_time_ms.is_some();
        let alr_ended_recently = self
            .alr_end_time_ms
            .map_or(false, |end_ms| at_time_ms - end_ms < ALR_ENDED_TIMEOUT_MS);
        if (in_alr || alr_ended_recently) && self.state == ProbeState::Done {
            let suggested_probe_bps =
                (PROBE_FRACTION_AFTER_DROP * self.bitrate_before_last_large_drop_bps as f64) as i64;
            let min_expected_probe_result_bps =
                ((1.0 - PROBE_UNCERTAINTY) * suggested_probe_bps as f64) as i64;
            let time_since_drop_ms = at_time_ms - self.time_of_last_large_drop_ms;
            let time_since_probe_ms = at_time_ms - self.last_bwe_drop_probing_time_ms;
            if min_expected_probe_result_bps > self.estimated_bitrate_bps
                && time_since_drop_ms < BITRATE_DROP_TIMEOUT_MS
                && time_since_probe_ms > MIN_TIME_BETWEEN_ALR_PROBES_MS
            {
                warn!("detected big bandwidth drop, start probing");
                self.last_bwe_drop_probing_time_ms = at_time_ms;
                return self.initiate_probing(at_time_ms, &[suggested_probe_bps], false);
            }
        }
        Vec::new()
    }

    /// Back to `Init`, as on a route change.
    pub fn reset(&mut self, at_time_ms: i64) {
        self.network_available = true;
        self.state = ProbeState::Init;
        self.min_bitrate_to_probe_further_bps = None;
        self.time_last_probing_initiated_ms = 0;
        self.estimated_bitrate_bps = 0;
        self.start_bitrate_bps = 0;
        self.max_bitrate_bps = 0;
        self.last_bwe_drop_probing_time_ms = at_time_ms;
        self.alr_end_time_ms = None;
        self.mid_call_probing_waiting_for_result = false;
        self.time_of_last_large_drop_ms = at_time_ms;
        self.bitrate_before_last_large_drop_bps = 0;
        self.max_total_allocated_bitrate = 0;
    }

    /// Periodic tick: expire stale sequences, run periodic ALR probing.
    pub fn process(&mut self, at_time_ms: i64) -> Vec<ProbeClusterConfig> {
        if at_time_ms - self.time_last_probing_initiated_ms
            > MAX_WAITING_TIME_FOR_PROBING_RESULT_MS
        {
            if self.state == ProbeState::WaitingForProbingResult
                || self.state == ProbeState::Probing
            {
                warn!("probe sequence timed out without a result");
                self.state = ProbeState::Done;
                self.min_bitrate_to_probe_further_bps = None;
            }
        }
        if self.enable_periodic_alr_probing && self.state == ProbeState::Done {
            // Probe bandwidth periodically while in the application-limited
            // region, since regular feedback cannot see past the encoder.
            if let Some(alr_start_ms) = self.alr_start_time_ms {
                if self.estimated_bitrate_bps > 0 {
                    let next_probe_time_ms = alr_start_ms.max(self.time_last_probing_initiated_ms)
                        + ALR_PERIODIC_PROBING_INTERVAL_MS;
                    if at_time_ms >= next_probe_time_ms {
                        return self.initiate_probing(
                            at_time_ms,
                            &[self.estimated_bitrate_bps * 2],
                            true,
                        );
                    }
                }
            }
        }
        Vec::new()
    }

    fn initiate_exponential_probing(&mut self, at_time_ms: i64) -> Vec<ProbeClusterConfig> {
        debug_assert!(self.network_available);
        debug_assert!(self.state == ProbeState::Init);
        debug_assert!(self.start_bitrate_bps > 0);
        // When probing at 1.8 Mbps (6x 300 kbps start) the continuation
        // threshold works out to 1.26 Mbps.
        let first = (FIRST_EXPONENTIAL_PROBE_SCALE * self.start_bitrate_bps as f64) as i64;
        let second = (SECOND_EXPONENTIAL_PROBE_SCALE * self.start_bitrate_bps as f64) as i64;
        self.initiate_probing(at_time_ms, &[first, second], true)
    }

    fn initiate_probing(
        &mut self,
        now_ms: i64,
        bitrates_to_probe: &[i64],
        mut probe_further: bool,
    ) -> Vec<ProbeClusterConfig> {
        let max_probe_bitrate_bps = if self.max_bitrate_bps > 0 {
            self.max_bitrate_bps
        } else {
            DEFAULT_MAX_PROBING_BITRATE_BPS
        };
        let mut pending_probes = Vec::with_capacity(bitrates_to_probe.len());
        let mut last_probe_bps = 0;
        for &requested_bps in bitrates_to_probe {
            debug_assert!(requested_bps > 0);
            let mut bitrate_bps = requested_bps;
            if bitrate_bps > max_probe_bitrate_bps {
                bitrate_bps = max_probe_bitrate_bps;
                probe_further = false;
            }
            let config = ProbeClusterConfig {
                at_time: Timestamp::from_millis(now_ms),
                target_data_rate: DataRate::from_bps(bitrate_bps),
                target_duration: TimeDelta::from_millis(MIN_PROBE_DURATION_MS),
                target_probe_count: MIN_PROBE_PACKETS_SENT,
                id: self.next_probe_cluster_id,
            };
            self.next_probe_cluster_id += 1;
            debug!(cluster_id = config.id, bitrate = %config.target_data_rate, "probe cluster");
            last_probe_bps = bitrate_bps;
            pending_probes.push(config);
        }
        self.time_last_probing_initiated_ms = now_ms;
        if probe_further {
            self.state = ProbeState::WaitingForProbingResult;
            self.min_bitrate_to_probe_further_bps =
                Some((last_probe_bps as f64 * REPEATED_PROBE_MIN_FRACTION) as i64);
        } else {
            self.state = ProbeState::Probing;
            self.min_bitrate_to_probe_further_bps = None;
        }
        pending_probes
    }
}

impl Default for ProbeController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_BPS: i64 = 100_000;
    const START_BPS: i64 = 300_000;
    const MAX_BPS: i64 = 100_000_000;

    fn started() -> (ProbeController, Vec<ProbeClusterConfig>) {
        let mut controller = ProbeController::new();
        let probes = controller.set_bitrates(MIN_BPS, START_BPS, MAX_BPS, 0);
        (controller, probes)
    }

    #[test]
    fn initiates_exponential_probing_on_start() {
        let (_, probes) = started();
        assert_eq!(probes.len(), 2);
        assert_eq!(probes[0].target_data_rate.bps(), 3 * START_BPS);
        assert_eq!(probes[1].target_data_rate.bps(), 6 * START_BPS);
        assert_ne!(probes[0].id, probes[1].id);
    }

    #[test]
    fn probes_further_while_results_confirm_headroom() {
        let (mut controller, _) = started();
        assert_eq!(controller.state(), ProbeState::WaitingForProbingResult);
        // Result above 0.7 * 1.8 Mbps: keep going at 2x.
        let probes = controller.set_estimated_bitrate(1_800_000, 10);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].target_data_rate.bps(), 2 * 1_800_000);
        // A weak result ends the sequence.
        let probes = controller.set_estimated_bitrate(1_000_000, 20);
        assert!(probes.is_empty());
    }

    #[test]
    fn probe_sequence_times_out_without_result() {
        let (mut controller, _) = started();
        assert!(controller.process(500).is_empty());
        assert_eq!(controller.state(), ProbeState::WaitingForProbingResult);
        controller.process(1_500);
        assert_eq!(controller.state(), ProbeState::Done);
    }

    #[test]
    fn periodic_alr_probing_fires_every_five_seconds() {
        let (mut controller, _) = started();
        controller.enable_periodic_alr_probing(true);
        controller.set_estimated_bitrate(500_000, 100);
        controller.process(1_200); // times out the initial sequence
        controller.set_alr_start_time_ms(Some(2_000));
        assert!(controller.process(3_000).is_empty());
        let probes = controller.process(7_100);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].target_data_rate.bps(), 2 * 500_000);
    }

    #[test]
    fn request_probe_after_drop_in_alr() {
        let (mut controller, _) = started();
        controller.set_estimated_bitrate(1_000_000, 100);
        controller.process(1_200);
        assert_eq!(controller.state(), ProbeState::Done);
        controller.set_alr_start_time_ms(Some(1_000));
        // A drop below 0.66x records the pre-drop rate.
        controller.set_estimated_bitrate(500_000, 6_100);
        let probes = controller.request_probe(6_200);
        assert_eq!(probes.len(), 1);
        assert_eq!(
            probes[0].target_data_rate.bps(),
            (PROBE_FRACTION_AFTER_DROP * 1_000_000.0) as i64
        );
    }

    #[test]
    fn request_probe_denied_outside_alr() {
        let (mut controller, _) = started();
        controller.set_estimated_bitrate(1_000_000, 100);
        controller.process(1_200);
        controller.set_estimated_bitrate(500_000, 6_100);
        assert!(controller.request_probe(6_200).is_empty());
    }

    #[test]
    fn raised_max_bitrate_triggers_one_probe() {
        let (mut controller, _) = started();
        controller.set_estimated_bitrate(MAX_BPS, 100);
        controller.process(1_200);
        let probes = controller.set_bitrates(MIN_BPS, START_BPS, 2 * MAX_BPS, 1_300);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].target_data_rate.bps(), 2 * MAX_BPS);
        // No re-probe while that sequence is in flight.
        assert!(controller
            .set_bitrates(MIN_BPS, START_BPS, 3 * MAX_BPS, 1_400)
            .is_empty());
    }

    #[test]
    fn probes_are_capped_at_max_bitrate() {
        let mut controller = ProbeController::new();
        let probes = controller.set_bitrates(MIN_BPS, START_BPS, 1_000_000, 0);
        assert!(probes.iter().all(|p| p.target_data_rate.bps() <= 1_000_000));
        // Capping also cancels further exponential probing.
        assert_eq!(controller.state(), ProbeState::Probing);
    }

    #[test]
    fn max_allocated_bitrate_probe_when_configured_trigger() {
        let (mut controller, _) = started();
        controller.set_estimated_bitrate(400_000, 100);
        controller.process(1_200);
        let probes = controller.on_max_total_allocated_bitrate(900_000, 1_300);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].target_data_rate.bps(), 900_000);
        // Same value again: no new probe.
        controller.set_estimated_bitrate(400_000, 1_400);
        assert!(controller
            .on_max_total_allocated_bitrate(900_000, 1_500)
            .is_empty());
    }

    #[test]
    fn reset_returns_to_init() {
        let (mut controller, _) = started();
        controller.reset(1_000);
        assert_eq!(controller.state(), ProbeState::Init);
        let probes = controller.set_bitrates(MIN_BPS, START_BPS, MAX_BPS, 1_100);
        assert_eq!(probes.len(), 2);
    }
}
