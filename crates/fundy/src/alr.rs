//! # Application-Limited Region Detection
//!
//! Watches the sent-byte stream against the current estimated bitrate. When
//! the application sustains well under the configured usage of the estimate,
//! the sender is application limited and throughput samples stop saying
//! anything about the link. The detector records when that region started so
//! the rest of the controller can discount measurements and schedule probes.

use crate::units::Timestamp;

// ─── Interval budget ────────────────────────────────────────────────────────

const BUDGET_WINDOW_MS: i64 = 500;

/// Byte budget that refills at a target rate over a sliding half-second
/// window. Positive remaining budget means the sender is underusing the
/// target.
#[derive(Debug)]
struct IntervalBudget {
    target_rate_kbps: i64,
    max_bytes_in_budget: i64,
    bytes_remaining: i64,
    can_build_up_underuse: bool,
}

impl IntervalBudget {
    fn new(initial_target_rate_kbps: i64, can_build_up_underuse: bool) -> Self {
        let mut budget = IntervalBudget {
            target_rate_kbps: 0,
            max_bytes_in_budget: 0,
            bytes_remaining: 0,
            can_build_up_underuse,
        };
        budget.set_target_rate_kbps(initial_target_rate_kbps);
        budget
    }

    fn set_target_rate_kbps(&mut self, target_rate_kbps: i64) {
        self.target_rate_kbps = target_rate_kbps;
        self.max_bytes_in_budget = BUDGET_WINDOW_MS * target_rate_kbps / 8;
        self.bytes_remaining = self
            .bytes_remaining
            .clamp(-self.max_bytes_in_budget, self.max_bytes_in_budget);
    }

    fn increase_budget(&mut self, delta_time_ms: i64) {
        let bytes = self.target_rate_kbps * delta_time_ms / 8;
        if self.bytes_remaining < 0 || self.can_build_up_underuse {
            // Under-shooting is accumulated so a later burst can use it.
            self.bytes_remaining = (self.bytes_remaining + bytes).min(self.max_bytes_in_budget);
        } else {
            self.bytes_remaining = bytes.min(self.max_bytes_in_budget);
        }
    }

    fn use_budget(&mut self, bytes: i64) {
        self.bytes_remaining = (self.bytes_remaining - bytes).max(-self.max_bytes_in_budget);
    }

    /// Remaining budget as a fraction of the window, in `[-1, 1]`.
    fn budget_ratio(&self) -> f64 {
        if self.max_bytes_in_budget == 0 {
            return 0.0;
        }
        self.bytes_remaining as f64 / self.max_bytes_in_budget as f64
    }
}

// ─── ALR detector ───────────────────────────────────────────────────────────

/// Detector tunables. The budget tracks `bandwidth_usage_ratio` of the
/// estimate; ALR starts when the unused budget climbs past
/// `start_budget_level_ratio` and stops when it falls under
/// `stop_budget_level_ratio`.
#[derive(Debug, Clone, Copy)]
pub struct AlrDetectorConfig {
    pub bandwidth_usage_ratio: f64,
    pub start_budget_level_ratio: f64,
    pub stop_budget_level_ratio: f64,
}

impl Default for AlrDetectorConfig {
    fn default() -> Self {
        AlrDetectorConfig {
            bandwidth_usage_ratio: 0.65,
            start_budget_level_ratio: 0.80,
            stop_budget_level_ratio: 0.50,
        }
    }
}

/// Flags application-limited periods from the sent-byte history.
#[derive(Debug)]
pub struct AlrDetector {
    config: AlrDetectorConfig,
    last_send_time_ms: Option<i64>,
    alr_budget: IntervalBudget,
    alr_started_time_ms: Option<i64>,
}

impl AlrDetector {
    pub fn new(config: AlrDetectorConfig) -> Self {
        AlrDetector {
            config,
            last_send_time_ms: None,
            alr_budget: IntervalBudget::new(0, true),
            alr_started_time_ms: None,
        }
    }

    pub fn on_bytes_sent(&mut self, bytes_sent: i64, send_time_ms: i64) {
        let Some(last_send_time_ms) = self.last_send_time_ms else {
            // Nothing to do here, we need at least one previous send time.
            self.last_send_time_ms = Some(send_time_ms);
            return;
        };
        let delta_time_ms = send_time_ms - last_send_time_ms;
        self.last_send_time_ms = Some(send_time_ms);

        self.alr_budget.use_budget(bytes_sent);
        self.alr_budget.increase_budget(delta_time_ms);

        if self.alr_budget.budget_ratio() > self.config.start_budget_level_ratio
            && self.alr_started_time_ms.is_none()
        {
            self.alr_started_time_ms = Some(send_time_ms);
        } else if self.alr_budget.budget_ratio() < self.config.stop_budget_level_ratio {
            self.alr_started_time_ms = None;
        }
    }

    /// Set a new estimated bitrate; the budget tracks a fraction of it.
    pub fn set_estimated_bitrate(&mut self, bitrate_bps: i64) {
        debug_assert!(bitrate_bps >= 0);
        let target_rate_kbps =
            (bitrate_bps as f64 * self.config.bandwidth_usage_ratio / 1_000.0) as i64;
        self.alr_budget.set_target_rate_kbps(target_rate_kbps);
    }

    /// When the current application-limited region began, if inside one.
    pub fn application_limited_region_start_time(&self) -> Option<i64> {
        self.alr_started_time_ms
    }

    /// Timestamp variant of the start time, for callers working in units.
    pub fn application_limited_region_start(&self) -> Option<Timestamp> {
        self.alr_started_time_ms.map(Timestamp::from_millis)
    }
}
