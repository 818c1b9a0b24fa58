//! # Key-Value Configuration
//!
//! The controller is tuned through an opaque key-value lookup owned by the
//! host. Unknown keys yield the empty string. Two prefix conventions apply to
//! every key: a value starting with `"Enabled"` turns a feature on, one
//! starting with `"Disabled"` turns it off; the empty string matches neither.
//!
//! Structured values are comma-separated token lists, either bare flags
//! (`"Enabled,ack"`) or `Key:value` pairs (`"QueueSize:350,MinBitrate:30000"`).
//! Malformed values are logged and replaced by defaults; configuration can
//! never abort the controller.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::warn;

use crate::units::{DataRate, TimeDelta};

// ─── Lookup trait ───────────────────────────────────────────────────────────

/// One-operation config contract: `lookup(key)` returns the configured value
/// or the empty string when the key is unknown.
pub trait KeyValueConfig {
    fn lookup(&self, key: &str) -> String;
}

/// A config with no keys set; every feature stays at its default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSettings;

impl KeyValueConfig for NoSettings {
    fn lookup(&self, _key: &str) -> String {
        String::new()
    }
}

/// Map-backed config for hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct FieldTrials {
    entries: HashMap<String, String>,
}

impl FieldTrials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.entries.insert(key.to_owned(), value.to_owned());
        self
    }
}

impl KeyValueConfig for FieldTrials {
    fn lookup(&self, key: &str) -> String {
        self.entries.get(key).cloned().unwrap_or_default()
    }
}

/// Whether `key`'s value starts with `"Enabled"`.
pub fn is_enabled(config: &dyn KeyValueConfig, key: &str) -> bool {
    config.lookup(key).starts_with("Enabled")
}

/// Whether `key`'s value does not start with `"Disabled"`.
pub fn is_not_disabled(config: &dyn KeyValueConfig, key: &str) -> bool {
    !config.lookup(key).starts_with("Disabled")
}

// ─── Token-list parsing ─────────────────────────────────────────────────────

/// Split a comma-separated token list into `(key, value)` pairs. Bare tokens
/// carry an empty value.
fn parse_token_list(raw: &str) -> Vec<(&str, &str)> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| match t.split_once(':') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (t, ""),
        })
        .collect()
}

fn parse_i64(key: &str, value: &str) -> Result<i64> {
    value
        .parse::<i64>()
        .with_context(|| format!("field `{key}` is not an integer: `{value}`"))
}

// ─── Safe reset on route change ─────────────────────────────────────────────

/// Parsed `WebRTC-Bwe-SafeResetOnRouteChange` trial: `"Enabled[,ack]"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SafeResetConfig {
    pub enabled: bool,
    /// Reseed from the acknowledged rate rather than the loss-based estimate.
    pub use_acked: bool,
}

impl SafeResetConfig {
    pub fn parse(config: &dyn KeyValueConfig) -> Self {
        let raw = config.lookup("WebRTC-Bwe-SafeResetOnRouteChange");
        let tokens = parse_token_list(&raw);
        SafeResetConfig {
            enabled: tokens.iter().any(|&(k, _)| k == "Enabled"),
            use_acked: tokens.iter().any(|&(k, _)| k == "ack"),
        }
    }
}

// ─── RTT-limit backoff ──────────────────────────────────────────────────────

/// Parsed `WebRTC-Bwe-MaxRttLimit` trial: `"Enabled[,limit:<ms>][,floor:<bps>]"`.
///
/// Disabled means an infinite limit, which keeps the backoff inert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaxRttLimitConfig {
    pub limit: TimeDelta,
    pub floor: DataRate,
    pub drop_fraction: f64,
    pub drop_interval: TimeDelta,
}

impl Default for MaxRttLimitConfig {
    fn default() -> Self {
        MaxRttLimitConfig {
            limit: TimeDelta::plus_infinity(),
            floor: DataRate::from_bps(5_000),
            drop_fraction: 0.8,
            drop_interval: TimeDelta::from_seconds(1),
        }
    }
}

impl MaxRttLimitConfig {
    pub fn parse(config: &dyn KeyValueConfig) -> Self {
        let raw = config.lookup("WebRTC-Bwe-MaxRttLimit");
        let mut parsed = MaxRttLimitConfig::default();
        if !raw.starts_with("Enabled") {
            return parsed;
        }
        parsed.limit = TimeDelta::from_seconds(3);
        for (key, value) in parse_token_list(&raw) {
            let applied: Result<()> = match key {
                "Enabled" => Ok(()),
                "limit" => parse_i64(key, value).map(|ms| {
                    parsed.limit = TimeDelta::from_millis(ms);
                }),
                "floor" => parse_i64(key, value).map(|bps| {
                    parsed.floor = DataRate::from_bps(bps);
                }),
                _ => Ok(()),
            };
            if let Err(err) = applied {
                warn!("WebRTC-Bwe-MaxRttLimit: {err:#}, keeping default");
            }
        }
        parsed
    }
}

// ─── Rate control settings ──────────────────────────────────────────────────

const DEFAULT_ADDITIONAL_TIME_MS: i64 = 100;
const DEFAULT_MIN_PUSHBACK_TARGET_BITRATE_BPS: i64 = 30_000;

/// Tunables parsed once at construction from the key-value config.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateControlSettings {
    /// `QueueSize:<ms>` from `WebRTC-CongestionWindow`; enables the window.
    congestion_window_queue_size_ms: Option<i64>,
    /// `MinBitrate:<bps>` from `WebRTC-CongestionWindow`; enables pushback.
    congestion_window_min_bitrate_bps: Option<i64>,
    /// `probe_max_allocation:<bool>` from `WebRTC-VideoRateControl`.
    probe_max_allocation: Option<bool>,
}

impl RateControlSettings {
    pub fn parse_from_key_value_config(config: &dyn KeyValueConfig) -> Self {
        let mut settings = RateControlSettings::default();
        for (key, value) in parse_token_list(&config.lookup("WebRTC-CongestionWindow")) {
            let applied: Result<()> = match key {
                "QueueSize" => parse_i64(key, value).map(|ms| {
                    settings.congestion_window_queue_size_ms = Some(ms);
                }),
                "MinBitrate" => parse_i64(key, value).map(|bps| {
                    settings.congestion_window_min_bitrate_bps = Some(bps);
                }),
                other => {
                    warn!("WebRTC-CongestionWindow: unknown field `{other}`");
                    Ok(())
                }
            };
            if let Err(err) = applied {
                warn!("WebRTC-CongestionWindow: {err:#}, keeping default");
            }
        }
        for (key, value) in parse_token_list(&config.lookup("WebRTC-VideoRateControl")) {
            if key == "probe_max_allocation" {
                match value.parse::<bool>() {
                    Ok(flag) => settings.probe_max_allocation = Some(flag),
                    Err(_) => warn!(
                        "WebRTC-VideoRateControl: `probe_max_allocation` \
                         is not a bool: `{value}`, keeping default"
                    ),
                }
            }
        }
        settings
    }

    /// Congestion window sizing is active when a queue size was configured.
    pub fn use_congestion_window(&self) -> bool {
        self.congestion_window_queue_size_ms.is_some()
    }

    /// Time added on top of the min feedback RTT when sizing the window.
    pub fn congestion_window_additional_time_ms(&self) -> i64 {
        self.congestion_window_queue_size_ms
            .unwrap_or(DEFAULT_ADDITIONAL_TIME_MS)
    }

    /// Pushback is active when both the window and a min bitrate are set.
    pub fn use_congestion_window_pushback(&self) -> bool {
        self.use_congestion_window() && self.congestion_window_min_bitrate_bps.is_some()
    }

    pub fn congestion_window_min_pushback_target_bitrate_bps(&self) -> i64 {
        self.congestion_window_min_bitrate_bps
            .unwrap_or(DEFAULT_MIN_PUSHBACK_TARGET_BITRATE_BPS)
    }

    pub fn trigger_probe_on_max_allocated_bitrate_change(&self) -> bool {
        self.probe_max_allocation.unwrap_or(true)
    }
}
