//! Hot-path benchmarks for the feedback pipeline.
//!
//! Measures the per-batch cost of the paths a transport exercises for every
//! feedback report:
//! - full controller feedback processing (20-packet batches)
//! - acknowledged bitrate estimation alone
//! - inter-arrival delta computation alone
//!
//! Run with: cargo bench --package fundy

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

use fundy::acknowledged::AcknowledgedBitrateEstimator;
use fundy::api::{PacketResult, ProcessInterval, SentPacket, TargetRateConstraints,
    TransportPacketsFeedback};
use fundy::config::NoSettings;
use fundy::controller::{FundyConfig, FundyController, NetworkControllerConfig};
use fundy::inter_arrival::InterArrival;
use fundy::units::{DataRate, DataSize, Timestamp};

fn batch(first_send_ms: i64, n: i64) -> TransportPacketsFeedback {
    let mut feedbacks = Vec::new();
    for i in 0..n {
        let send = first_send_ms + i * 10;
        feedbacks.push(PacketResult {
            sent_packet: SentPacket {
                send_time: Timestamp::from_millis(send),
                size: DataSize::from_bytes(1_200),
                ..Default::default()
            },
            receive_time: Timestamp::from_millis(send + 20),
        });
    }
    TransportPacketsFeedback {
        feedback_time: Timestamp::from_millis(first_send_ms + n * 10 + 20),
        data_in_flight: DataSize::from_bytes(n * 1_200),
        packet_feedbacks: feedbacks,
    }
}

fn fresh_controller() -> FundyController {
    let mut controller = FundyController::new(
        NetworkControllerConfig {
            constraints: TargetRateConstraints {
                at_time: Timestamp::from_millis(0),
                min_data_rate: Some(DataRate::from_bps(30_000)),
                max_data_rate: Some(DataRate::from_bps(2_000_000)),
                starting_rate: Some(DataRate::from_bps(300_000)),
            },
            stream_based_config: Default::default(),
            key_value_config: Arc::new(NoSettings),
        },
        FundyConfig::default(),
    );
    controller.on_process_interval(ProcessInterval {
        at_time: Timestamp::from_millis(0),
        pacer_queue: None,
    });
    controller
}

fn bench_controller_feedback(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller_feedback");
    group.throughput(Throughput::Elements(20));
    group.bench_function("20_packet_batch", |b| {
        let mut controller = fresh_controller();
        let mut first_send_ms = 0;
        b.iter(|| {
            let report = batch(first_send_ms, 20);
            first_send_ms += 200;
            black_box(controller.on_transport_packets_feedback(report));
        });
    });
    group.finish();
}

fn bench_acknowledged_estimator(c: &mut Criterion) {
    let mut group = c.benchmark_group("acknowledged_estimator");
    group.throughput(Throughput::Elements(20));
    group.bench_function("20_packet_batch", |b| {
        let mut estimator = AcknowledgedBitrateEstimator::new();
        let mut first_send_ms = 0;
        b.iter(|| {
            let report = batch(first_send_ms, 20);
            first_send_ms += 200;
            estimator.incoming_packet_feedback_vector(&report.sorted_by_receive_time());
            black_box(estimator.bitrate());
        });
    });
    group.finish();
}

fn bench_inter_arrival(c: &mut Criterion) {
    let mut group = c.benchmark_group("inter_arrival");
    group.throughput(Throughput::Elements(1));
    group.bench_function("compute_deltas", |b| {
        let mut inter_arrival = InterArrival::new();
        let mut send_ms = 0;
        b.iter(|| {
            send_ms += 10;
            black_box(inter_arrival.compute_deltas(
                Timestamp::from_millis(send_ms),
                Timestamp::from_millis(send_ms + 20),
                Timestamp::from_millis(send_ms + 30),
                DataSize::from_bytes(1_200),
            ));
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_controller_feedback,
    bench_acknowledged_estimator,
    bench_inter_arrival
);
criterion_main!(benches);
