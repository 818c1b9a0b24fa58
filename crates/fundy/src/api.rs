//! # Controller Messages
//!
//! Inbound events, outbound control updates, and the contracts of injected
//! collaborators. Every event is a plain timestamped struct; the controller
//! consumes them in arrival order and answers each with a
//! [`NetworkControlUpdate`].
//!
//! The host actuates updates: `pacer_config` goes to the pacer,
//! `probe_cluster_configs` to the packet scheduler, `congestion_window` to
//! the send queue and `target_rate` to the encoder rate allocator.

use serde::Serialize;

use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

// ─── Pacing info ────────────────────────────────────────────────────────────

/// Pacing metadata attached to a sent packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacedPacketInfo {
    /// Probe cluster this packet belongs to, or [`PacedPacketInfo::NOT_A_PROBE`].
    pub probe_cluster_id: i32,
    /// Minimum number of probes before the cluster can produce an estimate.
    pub probe_cluster_min_probes: i32,
    /// Minimum number of bytes before the cluster can produce an estimate.
    pub probe_cluster_min_bytes: i64,
}

impl PacedPacketInfo {
    pub const NOT_A_PROBE: i32 = -1;

    pub fn is_probe(&self) -> bool {
        self.probe_cluster_id != Self::NOT_A_PROBE
    }
}

impl Default for PacedPacketInfo {
    fn default() -> Self {
        PacedPacketInfo {
            probe_cluster_id: Self::NOT_A_PROBE,
            probe_cluster_min_probes: -1,
            probe_cluster_min_bytes: -1,
        }
    }
}

// ─── Packet records ─────────────────────────────────────────────────────────

/// A packet the transport has handed to the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct SentPacket {
    pub send_time: Timestamp,
    /// Size including transport-level overhead.
    pub size: DataSize,
    pub pacing_info: PacedPacketInfo,
    /// Bytes in flight after this packet was sent.
    pub data_in_flight: DataSize,
}

/// Per-packet feedback: when (and whether) a sent packet arrived.
///
/// `receive_time == +∞` encodes "lost".
#[derive(Debug, Clone, Copy)]
pub struct PacketResult {
    pub sent_packet: SentPacket,
    pub receive_time: Timestamp,
}

impl PacketResult {
    pub fn is_received(&self) -> bool {
        self.receive_time.is_finite()
    }
}

/// A transport-layer feedback report covering a batch of sent packets.
#[derive(Debug, Clone, Default)]
pub struct TransportPacketsFeedback {
    pub feedback_time: Timestamp,
    /// Bytes in flight when the report was generated.
    pub data_in_flight: DataSize,
    pub packet_feedbacks: Vec<PacketResult>,
}

impl TransportPacketsFeedback {
    /// All feedbacks, received or lost.
    pub fn packets_with_feedback(&self) -> Vec<PacketResult> {
        self.packet_feedbacks.clone()
    }

    /// Received packets that carry send-side info, in report order.
    pub fn received_with_send_info(&self) -> Vec<PacketResult> {
        self.packet_feedbacks
            .iter()
            .filter(|fb| fb.is_received() && fb.sent_packet.send_time.is_finite())
            .copied()
            .collect()
    }

    /// Received packets sorted by receive time. The input is not mutated.
    pub fn sorted_by_receive_time(&self) -> Vec<PacketResult> {
        let mut sorted = self.received_with_send_info();
        sorted.sort_by_key(|fb| fb.receive_time);
        sorted
    }
}

// ─── Inbound events ─────────────────────────────────────────────────────────

/// Rate bounds and an optional starting rate for the estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetRateConstraints {
    pub at_time: Timestamp,
    pub min_data_rate: Option<DataRate>,
    pub max_data_rate: Option<DataRate>,
    pub starting_rate: Option<DataRate>,
}

/// Link up/down notification.
#[derive(Debug, Clone, Copy)]
pub struct NetworkAvailability {
    pub at_time: Timestamp,
    pub network_available: bool,
}

/// The transport switched to a different network route.
#[derive(Debug, Clone, Copy)]
pub struct NetworkRouteChange {
    pub at_time: Timestamp,
    /// Constraints to apply on the new route.
    pub constraints: TargetRateConstraints,
}

/// Periodic tick from the host event loop (typically every 25 ms).
#[derive(Debug, Clone, Copy)]
pub struct ProcessInterval {
    pub at_time: Timestamp,
    /// Current pacer queue depth, when the host tracks one.
    pub pacer_queue: Option<DataSize>,
}

/// Receiver Estimated Maximum Bitrate, relayed from RTCP.
#[derive(Debug, Clone, Copy)]
pub struct RemoteBitrateReport {
    pub receive_time: Timestamp,
    pub bandwidth: DataRate,
}

/// An RTT measurement from the transport.
#[derive(Debug, Clone, Copy)]
pub struct RoundTripTimeUpdate {
    pub receive_time: Timestamp,
    pub round_trip_time: TimeDelta,
    /// Smoothed values are duplicates of earlier raw samples; ignored.
    pub smoothed: bool,
}

/// Aggregate packet-loss counts from receiver reports.
#[derive(Debug, Clone, Copy)]
pub struct TransportLossReport {
    pub receive_time: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub packets_lost_delta: u64,
    pub packets_received_delta: u64,
}

/// Stream-allocator driven settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamsConfig {
    pub at_time: Timestamp,
    pub requests_alr_probing: Option<bool>,
    pub pacing_factor: Option<f64>,
    pub min_total_allocated_bitrate: Option<DataRate>,
    pub max_padding_rate: Option<DataRate>,
    pub max_total_allocated_bitrate: Option<DataRate>,
}

// ─── Outbound updates ───────────────────────────────────────────────────────

/// A link estimate attached to [`TargetTransferRate`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NetworkEstimate {
    pub at_time: Timestamp,
    /// Link capacity: the stable estimate when configured, else the raw target.
    pub bandwidth: DataRate,
    pub round_trip_time: TimeDelta,
    /// Loss ratio in `[0, 1]`, derived from the Q8 loss fraction.
    pub loss_rate_ratio: f64,
    /// Expected time to recover from a rate reduction.
    pub bwe_period: TimeDelta,
}

/// The rate the encoder allocator should produce toward.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TargetTransferRate {
    pub at_time: Timestamp,
    pub network_estimate: NetworkEstimate,
    pub target_rate: DataRate,
}

/// Pacer budget: send at most `data_window` bytes per `time_window`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PacerConfig {
    pub at_time: Timestamp,
    pub data_window: DataSize,
    pub time_window: TimeDelta,
    /// Padding budget over the same window.
    pub pad_window: DataSize,
}

impl PacerConfig {
    pub fn data_rate(&self) -> DataRate {
        self.data_window / self.time_window
    }

    pub fn pad_rate(&self) -> DataRate {
        self.pad_window / self.time_window
    }
}

/// A probe burst for the packet scheduler to emit.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProbeClusterConfig {
    pub at_time: Timestamp,
    pub target_data_rate: DataRate,
    pub target_duration: TimeDelta,
    pub target_probe_count: i32,
    /// Correlates future probe-result feedback with this cluster.
    pub id: i32,
}

/// Everything the controller decided this tick. Absent fields announce no
/// change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkControlUpdate {
    pub congestion_window: Option<DataSize>,
    pub pacer_config: Option<PacerConfig>,
    pub probe_cluster_configs: Vec<ProbeClusterConfig>,
    pub target_rate: Option<TargetTransferRate>,
}

impl NetworkControlUpdate {
    pub fn is_empty(&self) -> bool {
        self.congestion_window.is_none()
            && self.pacer_config.is_none()
            && self.probe_cluster_configs.is_empty()
            && self.target_rate.is_none()
    }
}

// ─── Injected collaborators ─────────────────────────────────────────────────

/// Detector verdict on current link usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BandwidthUsage {
    Normal,
    Underusing,
    Overusing,
}

/// An externally computed estimate of link state.
#[derive(Debug, Clone, Copy)]
pub struct NetworkStateEstimate {
    pub update_time: Timestamp,
    pub link_capacity: DataRate,
    pub link_capacity_lower: DataRate,
    pub link_capacity_upper: DataRate,
}

/// Optional model-based estimator fed with raw feedback reports.
pub trait NetworkStateEstimator {
    fn on_transport_packets_feedback(&mut self, report: &TransportPacketsFeedback);
    fn on_route_change(&mut self, msg: &NetworkRouteChange);
    fn get_current_estimate(&self) -> Option<NetworkStateEstimate>;
}

/// Optional predictor that may override the overuse detector's verdict.
pub trait NetworkStatePredictor {
    fn update(
        &mut self,
        send_time_ms: i64,
        arrival_time_ms: i64,
        observed: BandwidthUsage,
    ) -> BandwidthUsage;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback_with(times: &[(i64, Option<i64>)]) -> TransportPacketsFeedback {
        TransportPacketsFeedback {
            feedback_time: Timestamp::from_millis(1_000),
            data_in_flight: DataSize::zero(),
            packet_feedbacks: times
                .iter()
                .map(|&(send_ms, recv_ms)| PacketResult {
                    sent_packet: SentPacket {
                        send_time: Timestamp::from_millis(send_ms),
                        size: DataSize::from_bytes(1_200),
                        ..Default::default()
                    },
                    receive_time: recv_ms
                        .map(Timestamp::from_millis)
                        .unwrap_or_else(Timestamp::plus_infinity),
                })
                .collect(),
        }
    }

    #[test]
    fn lost_packets_are_excluded_from_received_views() {
        let report = feedback_with(&[(0, Some(30)), (5, None), (10, Some(25))]);
        assert_eq!(report.packets_with_feedback().len(), 3);
        assert_eq!(report.received_with_send_info().len(), 2);
    }

    #[test]
    fn sorting_by_receive_time_does_not_mutate_input() {
        let report = feedback_with(&[(0, Some(30)), (10, Some(25))]);
        let sorted = report.sorted_by_receive_time();
        assert_eq!(sorted[0].receive_time, Timestamp::from_millis(25));
        // Original order untouched.
        assert_eq!(
            report.packet_feedbacks[0].receive_time,
            Timestamp::from_millis(30)
        );
    }

    #[test]
    fn default_pacing_info_is_not_a_probe() {
        assert!(!PacedPacketInfo::default().is_probe());
    }

    #[test]
    fn empty_update_reports_empty() {
        assert!(NetworkControlUpdate::default().is_empty());
    }
}
