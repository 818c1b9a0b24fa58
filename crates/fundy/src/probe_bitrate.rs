//! # Probe Bitrate Estimation
//!
//! Turns feedback on probe-cluster packets into a capacity estimate by
//! comparing the span over which a cluster was sent with the span over which
//! it was received. A cluster only produces an estimate once enough of its
//! probes (and bytes) have been seen, and obviously bogus timings are
//! rejected rather than fed into rate control.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::api::PacketResult;
use crate::units::{DataRate, DataSize, TimeDelta, Timestamp};

const MIN_RECEIVED_PROBES_RATIO: f64 = 0.80;
const MIN_RECEIVED_BYTES_RATIO: f64 = 0.80;
/// A probe cluster is a short burst; spans above this are measurement noise.
const MAX_PROBE_INTERVAL: TimeDelta = TimeDelta::from_millis(1_000);
/// The maximum receive/send rate ratio accepted as a valid measurement.
const MAX_VALID_RATIO: f64 = 2.0;
const MIN_RATIO_FOR_UNSATURATED_LINK: f64 = 0.9;
const TARGET_UTILIZATION_FRACTION: f64 = 0.95;
const MAX_CLUSTER_HISTORY: TimeDelta = TimeDelta::from_seconds(1);

#[derive(Debug)]
struct AggregatedCluster {
    num_probes: i32,
    first_send: Timestamp,
    last_send: Timestamp,
    first_receive: Timestamp,
    last_receive: Timestamp,
    size_last_send: DataSize,
    size_first_receive: DataSize,
    size_total: DataSize,
}

impl AggregatedCluster {
    fn new() -> Self {
        AggregatedCluster {
            num_probes: 0,
            first_send: Timestamp::plus_infinity(),
            last_send: Timestamp::minus_infinity(),
            first_receive: Timestamp::plus_infinity(),
            last_receive: Timestamp::minus_infinity(),
            size_last_send: DataSize::zero(),
            size_first_receive: DataSize::zero(),
            size_total: DataSize::zero(),
        }
    }
}

/// Estimates capacity from the reception timing of probe clusters.
#[derive(Debug, Default)]
pub struct ProbeBitrateEstimator {
    clusters: HashMap<i32, AggregatedCluster>,
    estimated_data_rate: Option<DataRate>,
    last_estimate: Option<DataRate>,
}

impl ProbeBitrateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb feedback for one probe packet; returns the cluster's capacity
    /// estimate once the cluster is complete enough to judge.
    pub fn handle_probe_and_estimate_bitrate(
        &mut self,
        packet_feedback: &PacketResult,
    ) -> Option<DataRate> {
        let cluster_id = packet_feedback.sent_packet.pacing_info.probe_cluster_id;
        debug_assert!(packet_feedback.sent_packet.pacing_info.is_probe());

        self.erase_old_clusters(packet_feedback.receive_time);

        let cluster = self
            .clusters
            .entry(cluster_id)
            .or_insert_with(AggregatedCluster::new);

        let send_time = packet_feedback.sent_packet.send_time;
        let receive_time = packet_feedback.receive_time;
        let size = packet_feedback.sent_packet.size;

        if send_time < cluster.first_send {
            cluster.first_send = send_time;
        }
        if send_time > cluster.last_send {
            cluster.last_send = send_time;
            cluster.size_last_send = size;
        }
        if receive_time < cluster.first_receive {
            cluster.first_receive = receive_time;
            cluster.size_first_receive = size;
        }
        if receive_time > cluster.last_receive {
            cluster.last_receive = receive_time;
        }
        cluster.size_total = cluster.size_total + size;
        cluster.num_probes += 1;

        let pacing_info = &packet_feedback.sent_packet.pacing_info;
        debug_assert!(pacing_info.probe_cluster_min_probes > 0);
        debug_assert!(pacing_info.probe_cluster_min_bytes > 0);
        let min_probes =
            (pacing_info.probe_cluster_min_probes as f64 * MIN_RECEIVED_PROBES_RATIO) as i32;
        let min_bytes =
            (pacing_info.probe_cluster_min_bytes as f64 * MIN_RECEIVED_BYTES_RATIO) as i64;
        if cluster.num_probes < min_probes || cluster.size_total.bytes() < min_bytes {
            return None;
        }

        let send_interval = cluster.last_send - cluster.first_send;
        let receive_interval = cluster.last_receive - cluster.first_receive;
        if send_interval <= TimeDelta::zero()
            || send_interval > MAX_PROBE_INTERVAL
            || receive_interval <= TimeDelta::zero()
            || receive_interval > MAX_PROBE_INTERVAL
        {
            warn!(
                cluster_id,
                %send_interval,
                %receive_interval,
                "probe failed, invalid send/receive interval"
            );
            return None;
        }

        // The send interval does not cover the transmission of the last
        // packet, so exclude its size; symmetrically the receive interval
        // does not cover the reception of the first packet.
        let send_size = cluster.size_total - cluster.size_last_send;
        let send_rate = send_size / send_interval;
        let receive_size = cluster.size_total - cluster.size_first_receive;
        let receive_rate = receive_size / receive_interval;

        let ratio = receive_rate.bps_f64() / send_rate.bps_f64();
        if ratio > MAX_VALID_RATIO {
            warn!(
                cluster_id,
                %send_rate,
                %receive_rate,
                "probe failed, receive/send ratio too high"
            );
            return None;
        }

        let mut res = send_rate.min(receive_rate);
        // Receiving at clearly lower rate than we sent at means the probe
        // found the link capacity; back off slightly so acting on the
        // estimate does not immediately overuse.
        if receive_rate < MIN_RATIO_FOR_UNSATURATED_LINK * send_rate {
            res = TARGET_UTILIZATION_FRACTION * receive_rate;
        }
        debug!(cluster_id, estimate = %res, "probe cluster estimated");
        self.last_estimate = Some(res);
        self.estimated_data_rate = Some(res);
        self.estimated_data_rate
    }

    /// Consume the latest estimate, leaving none behind.
    pub fn fetch_and_reset_last_estimated_bitrate(&mut self) -> Option<DataRate> {
        self.estimated_data_rate.take()
    }

    /// Peek at the most recent estimate without consuming it.
    pub fn last_estimate(&self) -> Option<DataRate> {
        self.last_estimate
    }

    fn erase_old_clusters(&mut self, timestamp: Timestamp) {
        self.clusters
            .retain(|_, cluster| cluster.last_receive + MAX_CLUSTER_HISTORY >= timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PacedPacketInfo, SentPacket};

    const DEFAULT_MIN_PROBES: i32 = 5;
    const DEFAULT_MIN_BYTES: i64 = 5_000;

    fn probe(
        cluster_id: i32,
        send_ms: i64,
        recv_ms: i64,
        size_bytes: i64,
    ) -> PacketResult {
        PacketResult {
            sent_packet: SentPacket {
                send_time: Timestamp::from_millis(send_ms),
                size: DataSize::from_bytes(size_bytes),
                pacing_info: PacedPacketInfo {
                    probe_cluster_id: cluster_id,
                    probe_cluster_min_probes: DEFAULT_MIN_PROBES,
                    probe_cluster_min_bytes: DEFAULT_MIN_BYTES,
                },
                ..Default::default()
            },
            receive_time: Timestamp::from_millis(recv_ms),
        }
    }

    fn feed(
        estimator: &mut ProbeBitrateEstimator,
        packets: &[(i64, i64)],
    ) -> Option<DataRate> {
        let mut last = None;
        for &(send_ms, recv_ms) in packets {
            last = estimator.handle_probe_and_estimate_bitrate(&probe(0, send_ms, recv_ms, 1_250));
        }
        last
    }

    #[test]
    fn no_estimate_until_enough_probes() {
        let mut estimator = ProbeBitrateEstimator::new();
        assert!(feed(&mut estimator, &[(0, 10), (10, 20), (20, 30)]).is_none());
        assert!(estimator.fetch_and_reset_last_estimated_bitrate().is_none());
    }

    #[test]
    fn estimates_from_send_and_receive_span() {
        let mut estimator = ProbeBitrateEstimator::new();
        // Five 1250 B probes, 10 ms apart on both sides: 4 * 1250 B / 40 ms
        // on each span = 1 Mbps.
        let estimate = feed(
            &mut estimator,
            &[(0, 60), (10, 70), (20, 80), (30, 90), (40, 100)],
        )
        .expect("complete cluster");
        assert_eq!(estimate.bps(), 1_000_000);
    }

    #[test]
    fn receive_limited_cluster_backs_off_to_utilization_fraction() {
        let mut estimator = ProbeBitrateEstimator::new();
        // Sent over 40 ms but received over 80 ms: the link is saturated.
        let estimate = feed(
            &mut estimator,
            &[(0, 60), (10, 80), (20, 100), (30, 120), (40, 140)],
        )
        .expect("complete cluster");
        // Receive rate is 500 kbps; backed off to 95% of it.
        assert_eq!(estimate.bps(), 475_000);
    }

    #[test]
    fn rejects_too_fast_receive_ratio() {
        let mut estimator = ProbeBitrateEstimator::new();
        // Received in a fraction of the send span: ratio > 2, not credible.
        let estimate = feed(
            &mut estimator,
            &[(0, 60), (40, 61), (80, 62), (120, 63), (160, 64)],
        );
        assert!(estimate.is_none());
    }

    #[test]
    fn fetch_consumes_but_peek_does_not() {
        let mut estimator = ProbeBitrateEstimator::new();
        feed(
            &mut estimator,
            &[(0, 60), (10, 70), (20, 80), (30, 90), (40, 100)],
        );
        assert!(estimator.last_estimate().is_some());
        assert!(estimator.fetch_and_reset_last_estimated_bitrate().is_some());
        assert!(estimator.fetch_and_reset_last_estimated_bitrate().is_none());
        assert!(estimator.last_estimate().is_some(), "peek survives the fetch");
    }
}
