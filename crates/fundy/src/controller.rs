//! # Network Controller
//!
//! The top of the stack: owns the nine sub-estimators and controllers,
//! dispatches inbound events to them in order, fuses their outputs into a
//! target rate, and emits a [`NetworkControlUpdate`] whenever any observable
//! field changed. Pure logic, no I/O and no clocks; every method takes its
//! time from the event it handles.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::acknowledged::AcknowledgedBitrateEstimator;
use crate::aimd::CONGESTION_CONTROLLER_MIN_BITRATE;
use crate::alr::{AlrDetector, AlrDetectorConfig};
use crate::api::{
    NetworkAvailability, NetworkControlUpdate, NetworkEstimate, NetworkRouteChange,
    NetworkStateEstimate, NetworkStateEstimator, NetworkStatePredictor, PacerConfig,
    ProbeClusterConfig, ProcessInterval, RemoteBitrateReport, RoundTripTimeUpdate, SentPacket,
    StreamsConfig, TargetRateConstraints, TargetTransferRate, TransportLossReport,
    TransportPacketsFeedback,
};
use crate::bandwidth_estimation::SendSideBandwidthEstimation;
use crate::config::{
    is_enabled, is_not_disabled, KeyValueConfig, RateControlSettings, SafeResetConfig,
};
use crate::delay_based::DelayBasedBwe;
use crate::probe_bitrate::ProbeBitrateEstimator;
use crate::probe_controller::ProbeController;
use crate::pushback::CongestionWindowPushbackController;
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

/// Spacing of the loss updates derived from packet feedback, matching the
/// video report interval of the RTCP sender.
const LOSS_UPDATE_INTERVAL: TimeDelta = TimeDelta::from_millis(1_000);

/// Pacing rate relative to the target send rate. A higher factor lets the
/// pacer absorb encoder overshoots with lower delay.
const DEFAULT_PACE_MULTIPLIER: f64 = 2.5;

const MAX_FEEDBACK_RTT_WINDOW: usize = 32;
const MIN_CWND: DataSize = DataSize::from_bytes(2 * 1_500);

/// Host-supplied construction parameters.
pub struct NetworkControllerConfig {
    /// Initial constraints; applied on the first process interval.
    /// A starting rate is mandatory, it seeds the pacing target.
    pub constraints: TargetRateConstraints,
    pub stream_based_config: StreamsConfig,
    /// Key-value tunables, owned by the caller for the controller lifetime.
    pub key_value_config: Arc<dyn KeyValueConfig>,
}

/// Optional collaborators and mode switches.
#[derive(Default)]
pub struct FundyConfig {
    /// Derive RTT and loss from transport feedback instead of RTCP reports.
    pub feedback_only: bool,
    pub network_state_estimator: Option<Box<dyn NetworkStateEstimator>>,
    pub network_state_predictor: Option<Box<dyn NetworkStatePredictor>>,
}

/// Send-side bandwidth estimation and congestion control.
pub struct FundyController {
    key_value_config: Arc<dyn KeyValueConfig>,
    packet_feedback_only: bool,
    safe_reset_config: SafeResetConfig,
    use_stable_bandwidth_estimate: bool,
    use_downlink_delay_for_congestion_window: bool,
    fall_back_to_probe_rate: bool,
    use_min_allocatable_as_lower_bound: bool,
    rate_control_settings: RateControlSettings,

    probe_controller: ProbeController,
    congestion_window_pushback_controller: Option<CongestionWindowPushbackController>,
    bandwidth_estimation: SendSideBandwidthEstimation,
    alr_detector: AlrDetector,
    probe_bitrate_estimator: ProbeBitrateEstimator,
    network_estimator: Option<Box<dyn NetworkStateEstimator>>,
    network_state_predictor: Option<Box<dyn NetworkStatePredictor>>,
    delay_based_bwe: DelayBasedBwe,
    acknowledged_bitrate_estimator: AcknowledgedBitrateEstimator,

    initial_config: Option<NetworkControllerConfig>,

    min_data_rate: DataRate,
    max_data_rate: DataRate,
    starting_rate: Option<DataRate>,

    first_packet_sent: bool,
    last_sent_packet_time: Timestamp,

    estimate: Option<NetworkStateEstimate>,

    next_loss_update: Timestamp,
    lost_packets_since_last_loss_update: i64,
    expected_packets_since_last_loss_update: i64,

    feedback_max_rtts: VecDeque<i64>,
    last_packet_received_time: Timestamp,

    last_raw_target_rate: DataRate,
    last_pushback_target_rate: DataRate,
    last_estimated_bitrate_bps: i64,
    last_estimated_fraction_loss: u8,
    last_estimated_rtt_ms: i64,

    pacing_factor: f64,
    min_total_allocated_bitrate: DataRate,
    max_padding_rate: DataRate,
    max_total_allocated_bitrate: DataRate,

    previously_in_alr: bool,
    current_data_window: Option<DataSize>,
}

impl FundyController {
    /// Constructed once per transport session.
    ///
    /// Panics when `config.constraints.starting_rate` is absent: the
    /// starting rate seeds the pacing target and there is no sane default.
    pub fn new(config: NetworkControllerConfig, fundy_config: FundyConfig) -> Self {
        let starting_rate = config
            .constraints
            .starting_rate
            .expect("constraints.starting_rate is required");
        debug_assert!(starting_rate.is_finite());

        let key_value_config = Arc::clone(&config.key_value_config);
        let kv: &dyn KeyValueConfig = &*key_value_config;
        let rate_control_settings = RateControlSettings::parse_from_key_value_config(kv);
        let congestion_window_pushback_controller =
            if rate_control_settings.use_congestion_window_pushback() {
                Some(CongestionWindowPushbackController::new(
                    kv,
                    &rate_control_settings,
                ))
            } else {
                None
            };
        let mut delay_based_bwe = DelayBasedBwe::new(kv);
        delay_based_bwe.set_min_bitrate(CONGESTION_CONTROLLER_MIN_BITRATE);

        let pacing_factor = config
            .stream_based_config
            .pacing_factor
            .unwrap_or(DEFAULT_PACE_MULTIPLIER);
        let min_total_allocated_bitrate = config
            .stream_based_config
            .min_total_allocated_bitrate
            .unwrap_or(DataRate::zero());
        let max_padding_rate = config
            .stream_based_config
            .max_padding_rate
            .unwrap_or(DataRate::zero());

        FundyController {
            packet_feedback_only: fundy_config.feedback_only,
            safe_reset_config: SafeResetConfig::parse(kv),
            use_stable_bandwidth_estimate: is_enabled(kv, "WebRTC-Bwe-StableBandwidthEstimate"),
            use_downlink_delay_for_congestion_window: is_enabled(
                kv,
                "WebRTC-Bwe-CongestionWindowDownlinkDelay",
            ),
            fall_back_to_probe_rate: is_enabled(kv, "WebRTC-Bwe-ProbeRateFallback"),
            use_min_allocatable_as_lower_bound: is_not_disabled(
                kv,
                "WebRTC-Bwe-MinAllocAsLowerBound",
            ),
            rate_control_settings,
            probe_controller: ProbeController::new(),
            congestion_window_pushback_controller,
            bandwidth_estimation: SendSideBandwidthEstimation::new(kv),
            alr_detector: AlrDetector::new(AlrDetectorConfig::default()),
            probe_bitrate_estimator: ProbeBitrateEstimator::new(),
            network_estimator: fundy_config.network_state_estimator,
            network_state_predictor: fundy_config.network_state_predictor,
            delay_based_bwe,
            acknowledged_bitrate_estimator: AcknowledgedBitrateEstimator::new(),
            initial_config: Some(config),
            min_data_rate: DataRate::zero(),
            max_data_rate: DataRate::plus_infinity(),
            starting_rate: Some(starting_rate),
            first_packet_sent: false,
            last_sent_packet_time: Timestamp::minus_infinity(),
            estimate: None,
            next_loss_update: Timestamp::minus_infinity(),
            lost_packets_since_last_loss_update: 0,
            expected_packets_since_last_loss_update: 0,
            feedback_max_rtts: VecDeque::new(),
            last_packet_received_time: Timestamp::minus_infinity(),
            last_raw_target_rate: starting_rate,
            last_pushback_target_rate: starting_rate,
            last_estimated_bitrate_bps: 0,
            last_estimated_fraction_loss: 0,
            last_estimated_rtt_ms: 0,
            pacing_factor,
            min_total_allocated_bitrate,
            max_padding_rate,
            max_total_allocated_bitrate: DataRate::zero(),
            previously_in_alr: false,
            current_data_window: None,
            key_value_config,
        }
    }

    // ─── Event handlers ─────────────────────────────────────────────────

    pub fn on_network_availability(&mut self, msg: NetworkAvailability) -> NetworkControlUpdate {
        NetworkControlUpdate {
            probe_cluster_configs: self
                .probe_controller
                .on_network_availability(msg.at_time.ms(), msg.network_available),
            ..Default::default()
        }
    }

    pub fn on_network_route_change(&mut self, msg: NetworkRouteChange) -> NetworkControlUpdate {
        if msg.at_time.is_infinite() {
            error!("route change with non-finite timestamp, dropping");
            return NetworkControlUpdate::default();
        }
        let mut msg = msg;
        if self.safe_reset_config.enabled {
            let estimated_bitrate = if self.safe_reset_config.use_acked {
                self.acknowledged_bitrate_estimator
                    .bitrate()
                    .or_else(|| self.acknowledged_bitrate_estimator.peek_rate())
            } else {
                Some(self.bandwidth_estimation.current_estimate().bitrate)
            };
            if let Some(estimated_bitrate) = estimated_bitrate {
                msg.constraints.starting_rate = Some(match msg.constraints.starting_rate {
                    Some(starting_rate) => starting_rate.min(estimated_bitrate),
                    None => estimated_bitrate,
                });
            }
        }

        self.acknowledged_bitrate_estimator = AcknowledgedBitrateEstimator::new();
        self.probe_bitrate_estimator = ProbeBitrateEstimator::new();
        if let Some(network_estimator) = self.network_estimator.as_mut() {
            network_estimator.on_route_change(&msg);
        }
        self.delay_based_bwe = DelayBasedBwe::new(&*self.key_value_config);
        self.bandwidth_estimation.on_route_change();
        self.probe_controller.reset(msg.at_time.ms());

        let mut update = NetworkControlUpdate {
            probe_cluster_configs: self.reset_constraints(msg.constraints),
            ..Default::default()
        };
        self.maybe_trigger_on_network_changed(&mut update, msg.at_time);
        update
    }

    pub fn on_process_interval(&mut self, msg: ProcessInterval) -> NetworkControlUpdate {
        if msg.at_time.is_infinite() {
            error!("process interval with non-finite timestamp, dropping");
            return NetworkControlUpdate::default();
        }
        let mut update = NetworkControlUpdate::default();
        if let Some(initial_config) = self.initial_config.take() {
            update.probe_cluster_configs = self.reset_constraints(initial_config.constraints);
            update.pacer_config = Some(self.get_pacing_rates(msg.at_time));

            if let Some(requests_alr_probing) =
                initial_config.stream_based_config.requests_alr_probing
            {
                self.probe_controller
                    .enable_periodic_alr_probing(requests_alr_probing);
            }
            if let Some(total_bitrate) = initial_config
                .stream_based_config
                .max_total_allocated_bitrate
            {
                let probes = self
                    .probe_controller
                    .on_max_total_allocated_bitrate(total_bitrate.bps(), msg.at_time.ms());
                update.probe_cluster_configs.extend(probes);
                self.max_total_allocated_bitrate = total_bitrate;
            }
        }
        if let Some(pushback) = self.congestion_window_pushback_controller.as_mut() {
            if let Some(pacer_queue) = msg.pacer_queue {
                pushback.update_pacing_queue(pacer_queue.bytes());
            }
        }
        self.bandwidth_estimation.update_estimate(msg.at_time);
        let start_time_ms = self.alr_detector.application_limited_region_start_time();
        self.probe_controller.set_alr_start_time_ms(start_time_ms);

        let probes = self.probe_controller.process(msg.at_time.ms());
        update.probe_cluster_configs.extend(probes);

        match (
            self.congestion_window_pushback_controller.as_mut(),
            self.current_data_window,
        ) {
            (Some(pushback), Some(window)) => pushback.set_data_window(window),
            _ => update.congestion_window = self.current_data_window,
        }
        self.maybe_trigger_on_network_changed(&mut update, msg.at_time);
        update
    }

    pub fn on_remote_bitrate_report(&mut self, msg: RemoteBitrateReport) -> NetworkControlUpdate {
        if self.packet_feedback_only {
            error!("received REMB for packet-feedback-only controller");
            return NetworkControlUpdate::default();
        }
        self.bandwidth_estimation
            .update_receiver_estimate(msg.receive_time, msg.bandwidth);
        NetworkControlUpdate::default()
    }

    pub fn on_round_trip_time_update(
        &mut self,
        msg: RoundTripTimeUpdate,
    ) -> NetworkControlUpdate {
        if self.packet_feedback_only || msg.smoothed {
            return NetworkControlUpdate::default();
        }
        if msg.round_trip_time <= TimeDelta::zero() {
            error!("non-positive round trip time, dropping");
            return NetworkControlUpdate::default();
        }
        self.delay_based_bwe.on_rtt_update(msg.round_trip_time);
        self.bandwidth_estimation
            .update_rtt(msg.round_trip_time, msg.receive_time);
        NetworkControlUpdate::default()
    }

    pub fn on_sent_packet(&mut self, sent_packet: SentPacket) -> NetworkControlUpdate {
        let mut sent_packet = sent_packet;
        if sent_packet.send_time < self.last_sent_packet_time {
            warn!(
                send_time = %sent_packet.send_time,
                "sent packet violates send-time monotonicity, clamping"
            );
            sent_packet.send_time = self.last_sent_packet_time;
        }
        self.last_sent_packet_time = sent_packet.send_time;

        self.alr_detector
            .on_bytes_sent(sent_packet.size.bytes(), sent_packet.send_time.ms());
        self.acknowledged_bitrate_estimator.set_alr(
            self.alr_detector
                .application_limited_region_start_time()
                .is_some(),
        );

        if !self.first_packet_sent {
            self.first_packet_sent = true;
            // Initialize the feedback time to the send time so the RTT can
            // be estimated until the first feedback arrives.
            self.bandwidth_estimation
                .update_propagation_rtt(sent_packet.send_time, TimeDelta::zero());
        }
        self.bandwidth_estimation.on_sent_packet(&sent_packet);

        let network_changed = match self.congestion_window_pushback_controller.as_mut() {
            Some(pushback) => {
                pushback.update_outstanding_data(sent_packet.data_in_flight.bytes());
                true
            }
            None => false,
        };
        let mut update = NetworkControlUpdate::default();
        if network_changed {
            self.maybe_trigger_on_network_changed(&mut update, sent_packet.send_time);
        }
        update
    }

    pub fn on_streams_config(&mut self, msg: StreamsConfig) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate::default();
        if let Some(requests_alr_probing) = msg.requests_alr_probing {
            self.probe_controller
                .enable_periodic_alr_probing(requests_alr_probing);
        }
        if let Some(max_total_allocated_bitrate) = msg.max_total_allocated_bitrate {
            if max_total_allocated_bitrate != self.max_total_allocated_bitrate {
                if self
                    .rate_control_settings
                    .trigger_probe_on_max_allocated_bitrate_change()
                {
                    update.probe_cluster_configs =
                        self.probe_controller.on_max_total_allocated_bitrate(
                            max_total_allocated_bitrate.bps(),
                            msg.at_time.ms(),
                        );
                } else {
                    self.probe_controller
                        .set_max_bitrate(max_total_allocated_bitrate.bps());
                }
                self.max_total_allocated_bitrate = max_total_allocated_bitrate;
            }
        }
        let mut pacing_changed = false;
        if let Some(pacing_factor) = msg.pacing_factor {
            if pacing_factor != self.pacing_factor {
                self.pacing_factor = pacing_factor;
                pacing_changed = true;
            }
        }
        if let Some(min_total_allocated_bitrate) = msg.min_total_allocated_bitrate {
            if min_total_allocated_bitrate != self.min_total_allocated_bitrate {
                self.min_total_allocated_bitrate = min_total_allocated_bitrate;
                pacing_changed = true;

                if self.use_min_allocatable_as_lower_bound {
                    self.clamp_constraints();
                    self.delay_based_bwe.set_min_bitrate(self.min_data_rate);
                    self.bandwidth_estimation
                        .set_min_max_bitrate(self.min_data_rate, self.max_data_rate);
                }
            }
        }
        if let Some(max_padding_rate) = msg.max_padding_rate {
            if max_padding_rate != self.max_padding_rate {
                self.max_padding_rate = max_padding_rate;
                pacing_changed = true;
            }
        }
        if pacing_changed {
            update.pacer_config = Some(self.get_pacing_rates(msg.at_time));
        }
        update
    }

    pub fn on_target_rate_constraints(
        &mut self,
        constraints: TargetRateConstraints,
    ) -> NetworkControlUpdate {
        let mut update = NetworkControlUpdate {
            probe_cluster_configs: self.reset_constraints(constraints),
            ..Default::default()
        };
        self.maybe_trigger_on_network_changed(&mut update, constraints.at_time);
        update
    }

    pub fn on_transport_loss_report(&mut self, msg: TransportLossReport) -> NetworkControlUpdate {
        if self.packet_feedback_only {
            debug!("ignoring transport loss report in packet-feedback-only mode");
            return NetworkControlUpdate::default();
        }
        let total_packets_delta = msg.packets_received_delta + msg.packets_lost_delta;
        self.bandwidth_estimation.update_packets_lost(
            msg.packets_lost_delta as i64,
            total_packets_delta as i64,
            msg.receive_time,
        );
        NetworkControlUpdate::default()
    }

    pub fn on_transport_packets_feedback(
        &mut self,
        report: TransportPacketsFeedback,
    ) -> NetworkControlUpdate {
        if report.packet_feedbacks.is_empty() {
            // An empty batch says nothing; in particular it does not mean
            // "no loss".
            return NetworkControlUpdate::default();
        }

        if let Some(pushback) = self.congestion_window_pushback_controller.as_mut() {
            pushback.update_outstanding_data(report.data_in_flight.bytes());
        }

        let mut max_feedback_rtt = TimeDelta::minus_infinity();
        let mut min_propagation_rtt = TimeDelta::plus_infinity();
        let mut max_recv_time = Timestamp::minus_infinity();

        let feedbacks = report.received_with_send_info();
        for feedback in &feedbacks {
            max_recv_time = max_recv_time.max(feedback.receive_time);
        }
        for feedback in &feedbacks {
            let feedback_rtt = report.feedback_time - feedback.sent_packet.send_time;
            let min_pending_time = feedback.receive_time - max_recv_time;
            let propagation_rtt = feedback_rtt - min_pending_time;
            max_feedback_rtt = max_feedback_rtt.max(feedback_rtt);
            min_propagation_rtt = min_propagation_rtt.min(propagation_rtt);
        }

        if max_feedback_rtt.is_finite() {
            self.feedback_max_rtts.push_back(max_feedback_rtt.ms());
            if self.feedback_max_rtts.len() > MAX_FEEDBACK_RTT_WINDOW {
                self.feedback_max_rtts.pop_front();
            }
            self.bandwidth_estimation
                .update_propagation_rtt(report.feedback_time, min_propagation_rtt);
        }

        if self.packet_feedback_only {
            if !self.feedback_max_rtts.is_empty() {
                let sum_rtt_ms: i64 = self.feedback_max_rtts.iter().sum();
                let mean_rtt_ms = sum_rtt_ms / self.feedback_max_rtts.len() as i64;
                self.delay_based_bwe
                    .on_rtt_update(TimeDelta::from_millis(mean_rtt_ms));
            }

            let mut feedback_min_rtt = TimeDelta::plus_infinity();
            for packet_feedback in &feedbacks {
                let pending_time = packet_feedback.receive_time - max_recv_time;
                let rtt = report.feedback_time
                    - packet_feedback.sent_packet.send_time
                    - pending_time;
                // Value used for predicting NACK round trip time.
                feedback_min_rtt = feedback_min_rtt.min(rtt);
            }
            if feedback_min_rtt.is_finite() {
                self.bandwidth_estimation
                    .update_rtt(feedback_min_rtt, report.feedback_time);
            }

            self.expected_packets_since_last_loss_update +=
                report.packet_feedbacks.len() as i64;
            self.lost_packets_since_last_loss_update += report
                .packet_feedbacks
                .iter()
                .filter(|fb| !fb.is_received())
                .count() as i64;
            if report.feedback_time > self.next_loss_update {
                self.next_loss_update = report.feedback_time + LOSS_UPDATE_INTERVAL;
                self.bandwidth_estimation.update_packets_lost(
                    self.lost_packets_since_last_loss_update,
                    self.expected_packets_since_last_loss_update,
                    report.feedback_time,
                );
                self.expected_packets_since_last_loss_update = 0;
                self.lost_packets_since_last_loss_update = 0;
            }
        }

        let alr_start_time = self.alr_detector.application_limited_region_start_time();
        if self.previously_in_alr && alr_start_time.is_none() {
            let now_ms = report.feedback_time.ms();
            self.acknowledged_bitrate_estimator
                .set_alr_ended_time(report.feedback_time);
            self.probe_controller.set_alr_ended_time_ms(now_ms);
        }
        self.previously_in_alr = alr_start_time.is_some();

        let sorted_feedbacks = report.sorted_by_receive_time();
        self.acknowledged_bitrate_estimator
            .incoming_packet_feedback_vector(&sorted_feedbacks);
        let mut acknowledged_bitrate = self.acknowledged_bitrate_estimator.bitrate();
        for feedback in &sorted_feedbacks {
            if feedback.sent_packet.pacing_info.is_probe() {
                self.probe_bitrate_estimator
                    .handle_probe_and_estimate_bitrate(feedback);
            }
        }

        let probe_bitrate = self
            .probe_bitrate_estimator
            .fetch_and_reset_last_estimated_bitrate();
        if self.fall_back_to_probe_rate && acknowledged_bitrate.is_none() {
            acknowledged_bitrate = self.probe_bitrate_estimator.last_estimate();
        }
        self.bandwidth_estimation
            .set_acknowledged_rate(acknowledged_bitrate, report.feedback_time);
        self.bandwidth_estimation
            .incoming_packet_feedback_vector(&report);

        if let Some(network_estimator) = self.network_estimator.as_mut() {
            network_estimator.on_transport_packets_feedback(&report);
            self.estimate = network_estimator.get_current_estimate();
        }

        let mut update = NetworkControlUpdate::default();
        let result = self.delay_based_bwe.incoming_packet_feedback_vector(
            &report,
            acknowledged_bitrate,
            probe_bitrate,
            self.estimate,
            alr_start_time.is_some(),
            match self.network_state_predictor.as_mut() {
                Some(predictor) => Some(predictor.as_mut()),
                None => None,
            },
        );

        if result.updated {
            if result.probe {
                self.bandwidth_estimation
                    .set_send_bitrate(result.target_bitrate, report.feedback_time);
            }
            // SetSendBitrate resets the delay-based cap, so the delay-based
            // estimate has to be applied after it.
            self.bandwidth_estimation
                .update_delay_based_estimate(report.feedback_time, result.target_bitrate);
            self.maybe_trigger_on_network_changed(&mut update, report.feedback_time);
        }
        if result.recovered_from_overuse {
            self.probe_controller.set_alr_start_time_ms(alr_start_time);
            let probes = self.probe_controller.request_probe(report.feedback_time.ms());
            update.probe_cluster_configs.extend(probes);
        } else if result.backoff_in_alr {
            // Backed off while application limited: probe to find the way
            // back up.
            let probes = self.probe_controller.request_probe(report.feedback_time.ms());
            update.probe_cluster_configs.extend(probes);
        }

        // Without a valid RTT there is no basis for limiting outstanding
        // data.
        if self.rate_control_settings.use_congestion_window() && max_feedback_rtt.is_finite() {
            let time_since_last_packet = if self.last_packet_received_time.is_finite() {
                (report.feedback_time - self.last_packet_received_time)
                    .max(TimeDelta::zero())
            } else {
                TimeDelta::zero()
            };
            self.update_congestion_window_size(time_since_last_packet);
        }
        if max_recv_time.is_finite() {
            self.last_packet_received_time = max_recv_time;
        }
        match (
            self.congestion_window_pushback_controller.as_mut(),
            self.current_data_window,
        ) {
            (Some(pushback), Some(window)) => pushback.set_data_window(window),
            _ => update.congestion_window = self.current_data_window,
        }
        update
    }

    pub fn on_network_state_estimate(
        &mut self,
        msg: NetworkStateEstimate,
    ) -> NetworkControlUpdate {
        self.estimate = Some(msg);
        NetworkControlUpdate::default()
    }

    // ─── Snapshots ──────────────────────────────────────────────────────

    /// Current state without mutating anything, for host introspection.
    pub fn get_network_state(&self, at_time: Timestamp) -> NetworkControlUpdate {
        let bandwidth = if self.use_stable_bandwidth_estimate {
            self.bandwidth_estimation.get_estimated_link_capacity()
        } else {
            self.last_raw_target_rate
        };
        NetworkControlUpdate {
            target_rate: Some(TargetTransferRate {
                at_time,
                target_rate: bandwidth,
                network_estimate: NetworkEstimate {
                    at_time,
                    bandwidth,
                    round_trip_time: TimeDelta::from_millis(self.last_estimated_rtt_ms),
                    loss_rate_ratio: self.last_estimated_fraction_loss as f64 / 255.0,
                    bwe_period: self.delay_based_bwe.get_expected_bwe_period(),
                },
            }),
            pacer_config: Some(self.get_pacing_rates(at_time)),
            congestion_window: self.current_data_window,
            probe_cluster_configs: Vec::new(),
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn clamp_constraints(&mut self) {
        self.min_data_rate = self.min_data_rate.max(CONGESTION_CONTROLLER_MIN_BITRATE);
        if self.use_min_allocatable_as_lower_bound {
            self.min_data_rate = self.min_data_rate.max(self.min_total_allocated_bitrate);
        }
        if self.max_data_rate < self.min_data_rate {
            error!(
                max = %self.max_data_rate,
                min = %self.min_data_rate,
                "max bitrate smaller than min bitrate"
            );
            self.max_data_rate = self.min_data_rate;
        }
        if let Some(starting_rate) = self.starting_rate {
            if starting_rate < self.min_data_rate {
                error!(
                    start = %starting_rate,
                    min = %self.min_data_rate,
                    "start bitrate smaller than min bitrate"
                );
                self.starting_rate = Some(self.min_data_rate);
            }
        }
    }

    fn reset_constraints(
        &mut self,
        new_constraints: TargetRateConstraints,
    ) -> Vec<ProbeClusterConfig> {
        self.min_data_rate = new_constraints.min_data_rate.unwrap_or(DataRate::zero());
        self.max_data_rate = new_constraints
            .max_data_rate
            .unwrap_or(DataRate::plus_infinity());
        self.starting_rate = new_constraints.starting_rate;
        self.clamp_constraints();

        self.bandwidth_estimation.set_bitrates(
            self.starting_rate,
            self.min_data_rate,
            self.max_data_rate,
            new_constraints.at_time,
        );

        if let Some(starting_rate) = self.starting_rate {
            self.delay_based_bwe.set_start_bitrate(starting_rate);
        }
        self.delay_based_bwe.set_min_bitrate(self.min_data_rate);

        self.probe_controller.set_bitrates(
            self.min_data_rate.bps(),
            self.starting_rate.map_or(-1, |rate| rate.bps()),
            self.max_data_rate.bps_or(-1),
            new_constraints.at_time.ms(),
        )
    }

    fn update_congestion_window_size(&mut self, time_since_last_packet: TimeDelta) {
        let min_feedback_max_rtt_ms = *self
            .feedback_max_rtts
            .iter()
            .min()
            .expect("the window is nonempty when a finite RTT was observed");

        let mut time_window = TimeDelta::from_millis(
            min_feedback_max_rtt_ms
                + self
                    .rate_control_settings
                    .congestion_window_additional_time_ms(),
        );
        if self.use_downlink_delay_for_congestion_window {
            time_window = time_window + time_since_last_packet;
        }

        let mut data_window = self.last_raw_target_rate * time_window;
        data_window = match self.current_data_window {
            Some(current) => MIN_CWND.max((data_window + current) / 2),
            None => MIN_CWND.max(data_window),
        };
        self.current_data_window = Some(data_window);
    }

    fn maybe_trigger_on_network_changed(
        &mut self,
        update: &mut NetworkControlUpdate,
        at_time: Timestamp,
    ) {
        let estimate = self.bandwidth_estimation.current_estimate();
        let estimated_bitrate = estimate.bitrate;
        let fraction_loss = estimate.fraction_loss;
        let rtt_ms = estimate.round_trip_time.ms();

        let mut target_rate = estimated_bitrate;
        if let Some(pushback) = self.congestion_window_pushback_controller.as_mut() {
            let mut pushback_rate = pushback.update_target_bitrate(target_rate.bps());
            pushback_rate = pushback_rate.max(self.bandwidth_estimation.get_min_bitrate());
            target_rate = DataRate::from_bps(pushback_rate);
        }

        if estimated_bitrate.bps() != self.last_estimated_bitrate_bps
            || fraction_loss != self.last_estimated_fraction_loss
            || rtt_ms != self.last_estimated_rtt_ms
            || target_rate != self.last_pushback_target_rate
        {
            self.last_pushback_target_rate = target_rate;
            self.last_estimated_bitrate_bps = estimated_bitrate.bps();
            self.last_estimated_fraction_loss = fraction_loss;
            self.last_estimated_rtt_ms = rtt_ms;

            self.alr_detector.set_estimated_bitrate(estimated_bitrate.bps());

            self.last_raw_target_rate = estimated_bitrate;
            let bandwidth = if self.use_stable_bandwidth_estimate {
                self.bandwidth_estimation.get_estimated_link_capacity()
            } else {
                self.last_raw_target_rate
            };

            update.target_rate = Some(TargetTransferRate {
                at_time,
                target_rate,
                network_estimate: NetworkEstimate {
                    at_time,
                    bandwidth,
                    round_trip_time: TimeDelta::from_millis(rtt_ms),
                    loss_rate_ratio: fraction_loss as f64 / 255.0,
                    bwe_period: self.delay_based_bwe.get_expected_bwe_period(),
                },
            });

            let probes = self
                .probe_controller
                .set_estimated_bitrate(self.last_raw_target_rate.bps(), at_time.ms());
            update.probe_cluster_configs.extend(probes);
            update.pacer_config = Some(self.get_pacing_rates(at_time));

            debug!(
                at_time = %at_time,
                pushback_target = %self.last_pushback_target_rate,
                estimate = %self.last_raw_target_rate,
                "network changed"
            );
        }
    }

    fn get_pacing_rates(&self, at_time: Timestamp) -> PacerConfig {
        // Pacing follows the target before congestion-window pushback, so
        // the pacer does not build queues while pushback throttles the
        // encoder.
        let pacing_rate = self
            .min_total_allocated_bitrate
            .max(self.last_raw_target_rate)
            * self.pacing_factor;
        let padding_rate = self.max_padding_rate.min(self.last_pushback_target_rate);
        let time_window = TimeDelta::from_seconds(1);
        PacerConfig {
            at_time,
            time_window,
            data_window: pacing_rate * time_window,
            pad_window: padding_rate * time_window,
        }
    }
}
