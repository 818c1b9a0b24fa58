//! # Congestion Window Pushback
//!
//! When bytes in flight approach the congestion window, the encoder target
//! is scaled down smoothly instead of letting the pacer queue grow. The
//! scale recovers once the window drains. The reduction never goes below
//! the configured pushback floor.

use tracing::trace;

use crate::config::{is_enabled, KeyValueConfig, RateControlSettings};
use crate::units::DataSize;

/// Reduces the effective send rate when in-flight data fills the window.
#[derive(Debug)]
pub struct CongestionWindowPushbackController {
    add_pacing: bool,
    min_pushback_target_bitrate_bps: i64,
    current_data_window: Option<DataSize>,
    outstanding_bytes: i64,
    pacing_bytes: i64,
    encoding_rate_ratio: f64,
}

impl CongestionWindowPushbackController {
    pub fn new(config: &dyn KeyValueConfig, settings: &RateControlSettings) -> Self {
        CongestionWindowPushbackController {
            add_pacing: is_enabled(config, "WebRTC-AddPacingToCongestionWindowPushback"),
            min_pushback_target_bitrate_bps: settings
                .congestion_window_min_pushback_target_bitrate_bps(),
            current_data_window: None,
            outstanding_bytes: 0,
            pacing_bytes: 0,
            encoding_rate_ratio: 1.0,
        }
    }

    pub fn update_outstanding_data(&mut self, outstanding_bytes: i64) {
        self.outstanding_bytes = outstanding_bytes;
    }

    pub fn update_pacing_queue(&mut self, pacing_bytes: i64) {
        self.pacing_bytes = pacing_bytes;
    }

    pub fn set_data_window(&mut self, data_window: DataSize) {
        self.current_data_window = Some(data_window);
    }

    /// Scale `bitrate_bps` by the current fill ratio of the window.
    pub fn update_target_bitrate(&mut self, bitrate_bps: i64) -> i64 {
        let Some(data_window) = self.current_data_window else {
            return bitrate_bps;
        };
        if data_window.is_zero() {
            return bitrate_bps;
        }
        let mut total_bytes = self.outstanding_bytes;
        if self.add_pacing {
            total_bytes += self.pacing_bytes;
        }
        let fill_ratio = total_bytes as f64 / data_window.bytes() as f64;
        if fill_ratio > 1.5 {
            self.encoding_rate_ratio *= 0.9;
        } else if fill_ratio > 1.0 {
            self.encoding_rate_ratio *= 0.95;
        } else if fill_ratio < 0.1 {
            self.encoding_rate_ratio = 1.0;
        } else {
            self.encoding_rate_ratio *= 1.05;
            self.encoding_rate_ratio = self.encoding_rate_ratio.min(1.0);
        }
        let mut adjusted_target_bitrate_bps =
            (bitrate_bps as f64 * self.encoding_rate_ratio) as i64;

        // Do not adjust below the minimum pushback bitrate, but keep the
        // previous target if that was even lower.
        if adjusted_target_bitrate_bps < self.min_pushback_target_bitrate_bps {
            adjusted_target_bitrate_bps =
                bitrate_bps.min(self.min_pushback_target_bitrate_bps);
        }
        trace!(
            fill_ratio,
            ratio = self.encoding_rate_ratio,
            adjusted = adjusted_target_bitrate_bps,
            "pushback"
        );
        adjusted_target_bitrate_bps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldTrials, NoSettings};

    fn controller() -> CongestionWindowPushbackController {
        let settings = RateControlSettings::parse_from_key_value_config(&NoSettings);
        CongestionWindowPushbackController::new(&NoSettings, &settings)
    }

    #[test]
    fn no_window_means_no_pushback() {
        let mut pushback = controller();
        pushback.update_outstanding_data(1_000_000);
        assert_eq!(pushback.update_target_bitrate(800_000), 800_000);
    }

    #[test]
    fn full_window_scales_bitrate_down() {
        let mut pushback = controller();
        pushback.set_data_window(DataSize::from_bytes(10_000));
        pushback.update_outstanding_data(16_000); // fill ratio 1.6
        let adjusted = pushback.update_target_bitrate(800_000);
        assert_eq!(adjusted, (800_000.0 * 0.9) as i64);
        let again = pushback.update_target_bitrate(800_000);
        assert!(
            (again - 648_000).abs() <= 1,
            "second pass compounds to 0.81x: {again}"
        );
    }

    #[test]
    fn drained_window_restores_full_rate() {
        let mut pushback = controller();
        pushback.set_data_window(DataSize::from_bytes(10_000));
        pushback.update_outstanding_data(16_000);
        pushback.update_target_bitrate(800_000);
        pushback.update_outstanding_data(500); // fill ratio 0.05
        assert_eq!(pushback.update_target_bitrate(800_000), 800_000);
    }

    #[test]
    fn never_pushes_below_the_floor() {
        let mut pushback = controller();
        pushback.set_data_window(DataSize::from_bytes(10_000));
        pushback.update_outstanding_data(100_000);
        let mut adjusted = 200_000;
        for _ in 0..100 {
            adjusted = pushback.update_target_bitrate(200_000);
        }
        assert_eq!(adjusted, 30_000, "default pushback floor");
    }

    #[test]
    fn low_target_is_not_raised_to_the_floor() {
        let mut pushback = controller();
        pushback.set_data_window(DataSize::from_bytes(10_000));
        pushback.update_outstanding_data(100_000);
        let adjusted = pushback.update_target_bitrate(20_000);
        assert_eq!(adjusted, 20_000);
    }

    #[test]
    fn pacing_queue_counts_when_enabled() {
        let trials =
            FieldTrials::new().set("WebRTC-AddPacingToCongestionWindowPushback", "Enabled");
        let settings = RateControlSettings::parse_from_key_value_config(&NoSettings);
        let mut pushback = CongestionWindowPushbackController::new(&trials, &settings);
        pushback.set_data_window(DataSize::from_bytes(10_000));
        pushback.update_outstanding_data(8_000);
        pushback.update_pacing_queue(8_000); // combined fill ratio 1.6
        let adjusted = pushback.update_target_bitrate(800_000);
        assert_eq!(adjusted, (800_000.0 * 0.9) as i64);
    }
}
