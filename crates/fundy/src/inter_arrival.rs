//! # Inter-Arrival Grouping
//!
//! Folds per-packet feedback into 5 ms send-time groups and emits the
//! inter-group send and arrival deltas the overuse detector feeds on.
//! Bursts paced out back to back are folded into the group they chase, so
//! pacer-induced clumping does not read as queuing delay.

use tracing::warn;

use crate::units::{DataSize, TimeDelta, Timestamp};

const SEND_TIME_GROUP_LENGTH: TimeDelta = TimeDelta::from_millis(5);
const BURST_DELTA_THRESHOLD: TimeDelta = TimeDelta::from_millis(5);
const MAX_BURST_DURATION: TimeDelta = TimeDelta::from_millis(100);
/// An arrival-clock jump beyond this resets all grouping state.
const ARRIVAL_TIME_OFFSET_THRESHOLD: TimeDelta = TimeDelta::from_seconds(3);
const REORDERED_RESET_THRESHOLD: usize = 3;

/// Deltas between two completed packet groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterArrivalDeltas {
    pub send_time_delta: TimeDelta,
    pub arrival_time_delta: TimeDelta,
    pub packet_size_delta: i64,
}

#[derive(Debug, Clone, Copy)]
struct SendTimeGroup {
    size: DataSize,
    first_send_time: Timestamp,
    send_time: Timestamp,
    first_arrival: Timestamp,
    complete_time: Timestamp,
    last_system_time: Timestamp,
}

impl SendTimeGroup {
    fn new() -> Self {
        SendTimeGroup {
            size: DataSize::zero(),
            first_send_time: Timestamp::minus_infinity(),
            send_time: Timestamp::minus_infinity(),
            first_arrival: Timestamp::minus_infinity(),
            complete_time: Timestamp::minus_infinity(),
            last_system_time: Timestamp::minus_infinity(),
        }
    }

    fn is_first_packet(&self) -> bool {
        self.complete_time.is_infinite()
    }
}

/// Computes send/arrival deltas between consecutive packet groups.
#[derive(Debug)]
pub struct InterArrival {
    current_group: SendTimeGroup,
    prev_group: SendTimeGroup,
    num_consecutive_reordered_packets: usize,
}

impl InterArrival {
    pub fn new() -> Self {
        InterArrival {
            current_group: SendTimeGroup::new(),
            prev_group: SendTimeGroup::new(),
            num_consecutive_reordered_packets: 0,
        }
    }

    /// Absorb one packet; yields deltas when this packet opens a new group
    /// and the two previous groups are both complete.
    pub fn compute_deltas(
        &mut self,
        send_time: Timestamp,
        arrival_time: Timestamp,
        system_time: Timestamp,
        packet_size: DataSize,
    ) -> Option<InterArrivalDeltas> {
        let mut deltas = None;
        if self.current_group.is_first_packet() {
            self.current_group.send_time = send_time;
            self.current_group.first_send_time = send_time;
            self.current_group.first_arrival = arrival_time;
        } else if self.current_group.send_time > send_time {
            // Reordered packet: older than the current group, ignore it.
            return None;
        } else if self.new_group(arrival_time, send_time) {
            // First packet of a later send burst: the previous group's
            // sample is ready.
            if self.prev_group.complete_time.is_finite() {
                let send_time_delta = self.current_group.send_time - self.prev_group.send_time;
                let arrival_time_delta =
                    self.current_group.complete_time - self.prev_group.complete_time;
                let system_time_delta =
                    self.current_group.last_system_time - self.prev_group.last_system_time;

                if arrival_time_delta - system_time_delta >= ARRIVAL_TIME_OFFSET_THRESHOLD {
                    warn!(
                        %arrival_time_delta,
                        "arrival clock offset exceeded threshold, resetting"
                    );
                    self.reset();
                    return None;
                }
                if arrival_time_delta < TimeDelta::zero() {
                    // The group has been reordered since its arrival stamp.
                    self.num_consecutive_reordered_packets += 1;
                    if self.num_consecutive_reordered_packets >= REORDERED_RESET_THRESHOLD {
                        warn!(
                            %arrival_time_delta,
                            "consecutive reordered groups, resetting"
                        );
                        self.reset();
                    }
                    return None;
                }
                self.num_consecutive_reordered_packets = 0;
                deltas = Some(InterArrivalDeltas {
                    send_time_delta,
                    arrival_time_delta,
                    packet_size_delta: self.current_group.size.bytes()
                        - self.prev_group.size.bytes(),
                });
            }
            self.prev_group = self.current_group;
            self.current_group.first_send_time = send_time;
            self.current_group.send_time = send_time;
            self.current_group.first_arrival = arrival_time;
            self.current_group.size = DataSize::zero();
        } else {
            self.current_group.send_time = self.current_group.send_time.max(send_time);
        }
        self.current_group.size = self.current_group.size + packet_size;
        self.current_group.complete_time = arrival_time;
        self.current_group.last_system_time = system_time;
        deltas
    }

    fn new_group(&self, arrival_time: Timestamp, send_time: Timestamp) -> bool {
        if self.current_group.is_first_packet() {
            false
        } else if self.belongs_to_burst(arrival_time, send_time) {
            false
        } else {
            send_time - self.current_group.first_send_time > SEND_TIME_GROUP_LENGTH
        }
    }

    fn belongs_to_burst(&self, arrival_time: Timestamp, send_time: Timestamp) -> bool {
        debug_assert!(self.current_group.complete_time.is_finite());
        let arrival_time_delta = arrival_time - self.current_group.complete_time;
        let send_time_delta = send_time - self.current_group.send_time;
        if send_time_delta.is_zero() {
            return true;
        }
        let propagation_delta = arrival_time_delta - send_time_delta;
        propagation_delta < TimeDelta::zero()
            && arrival_time_delta <= BURST_DELTA_THRESHOLD
            && arrival_time - self.current_group.first_arrival < MAX_BURST_DURATION
    }

    fn reset(&mut self) {
        self.num_consecutive_reordered_packets = 0;
        self.current_group = SendTimeGroup::new();
        self.prev_group = SendTimeGroup::new();
    }
}

impl Default for InterArrival {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: DataSize = DataSize::from_bytes(1_200);

    fn feed(
        ia: &mut InterArrival,
        send_ms: i64,
        arrival_ms: i64,
    ) -> Option<InterArrivalDeltas> {
        ia.compute_deltas(
            Timestamp::from_millis(send_ms),
            Timestamp::from_millis(arrival_ms),
            Timestamp::from_millis(arrival_ms),
            SIZE,
        )
    }

    #[test]
    fn needs_three_groups_for_first_deltas() {
        let mut ia = InterArrival::new();
        assert!(feed(&mut ia, 0, 20).is_none()); // group 1
        assert!(feed(&mut ia, 10, 30).is_none()); // group 2, prev incomplete
        let deltas = feed(&mut ia, 20, 40).expect("two complete groups");
        assert_eq!(deltas.send_time_delta, TimeDelta::from_millis(10));
        assert_eq!(deltas.arrival_time_delta, TimeDelta::from_millis(10));
        assert_eq!(deltas.packet_size_delta, 0);
    }

    #[test]
    fn packets_within_five_ms_share_a_group() {
        let mut ia = InterArrival::new();
        feed(&mut ia, 0, 20);
        feed(&mut ia, 2, 21); // same group as the first packet
        feed(&mut ia, 4, 23); // still the same group
        feed(&mut ia, 10, 30);
        let deltas = feed(&mut ia, 20, 40).expect("deltas");
        // Group one completed at arrival 23, group two at 30.
        assert_eq!(deltas.arrival_time_delta, TimeDelta::from_millis(7));
        assert_eq!(deltas.packet_size_delta, SIZE.bytes() - 3 * SIZE.bytes());
    }

    #[test]
    fn growing_arrival_deltas_are_reported() {
        let mut ia = InterArrival::new();
        feed(&mut ia, 0, 20);
        feed(&mut ia, 10, 35); // +5 ms of queuing per group
        let deltas = feed(&mut ia, 20, 50).expect("deltas");
        assert_eq!(deltas.send_time_delta, TimeDelta::from_millis(10));
        assert_eq!(deltas.arrival_time_delta, TimeDelta::from_millis(15));
    }

    #[test]
    fn reordered_send_times_are_ignored() {
        let mut ia = InterArrival::new();
        feed(&mut ia, 10, 20);
        assert!(feed(&mut ia, 2, 25).is_none());
        // The stream continues unaffected.
        feed(&mut ia, 20, 30);
        assert!(feed(&mut ia, 30, 40).is_some());
    }

    #[test]
    fn burst_packets_fold_into_the_previous_group() {
        let mut ia = InterArrival::new();
        feed(&mut ia, 0, 20);
        feed(&mut ia, 10, 30);
        // Sent 7 ms after the group start but arriving back to back with
        // negative propagation delta: a pacer burst, not a new group.
        assert!(feed(&mut ia, 17, 31).is_none());
        let deltas = feed(&mut ia, 30, 50).expect("deltas");
        // The burst extended group two's completion to arrival 31.
        assert_eq!(deltas.arrival_time_delta, TimeDelta::from_millis(11));
    }
}
