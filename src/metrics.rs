//! Process-wide connection metrics.
//!
//! All counters are plain atomics, gated on [`REPORT_METRICS`], following the
//! same shape as a typical connection-pool metrics struct: initialization is
//! static, there is no teardown, and writes never block.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// When false, every increment/record below is a no-op. Defaults to true.
pub static REPORT_METRICS: AtomicBool = AtomicBool::new(true);

/// Counters and gauges shared by every `Connection` in the process.
pub struct Metrics {
    total_connection_count: AtomicU64,
    active_connection_count: AtomicI64,
    active_channel_subscriptions: AtomicI64,
    active_pattern_subscriptions: AtomicI64,
    subscription_messages_received_count: AtomicU64,
    command_success_count: AtomicU64,
    command_failure_count: AtomicU64,
    round_trip_nanos_total: AtomicU64,
    round_trip_samples: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Metrics {
            total_connection_count: AtomicU64::new(0),
            active_connection_count: AtomicI64::new(0),
            active_channel_subscriptions: AtomicI64::new(0),
            active_pattern_subscriptions: AtomicI64::new(0),
            subscription_messages_received_count: AtomicU64::new(0),
            command_success_count: AtomicU64::new(0),
            command_failure_count: AtomicU64::new(0),
            round_trip_nanos_total: AtomicU64::new(0),
            round_trip_samples: AtomicU64::new(0),
        }
    }

    fn enabled(&self) -> bool {
        REPORT_METRICS.load(Ordering::Relaxed)
    }

    pub fn connection_opened(&self) {
        if !self.enabled() {
            return;
        }
        self.total_connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connection_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        if !self.enabled() {
            return;
        }
        self.active_connection_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn channel_subscriptions_set(&self, count: i64) {
        if !self.enabled() {
            return;
        }
        self.active_channel_subscriptions
            .store(count, Ordering::Relaxed);
    }

    pub fn pattern_subscriptions_set(&self, count: i64) {
        if !self.enabled() {
            return;
        }
        self.active_pattern_subscriptions
            .store(count, Ordering::Relaxed);
    }

    pub fn subscription_message_received(&self) {
        if !self.enabled() {
            return;
        }
        self.subscription_messages_received_count
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_succeeded(&self) {
        if !self.enabled() {
            return;
        }
        self.command_success_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self) {
        if !self.enabled() {
            return;
        }
        self.command_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_round_trip(&self, nanos: u64) {
        if !self.enabled() {
            return;
        }
        self.round_trip_nanos_total
            .fetch_add(nanos, Ordering::Relaxed);
        self.round_trip_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_connection_count(&self) -> u64 {
        self.total_connection_count.load(Ordering::Relaxed)
    }

    pub fn active_connection_count(&self) -> i64 {
        self.active_connection_count.load(Ordering::Relaxed)
    }

    pub fn active_channel_subscriptions(&self) -> i64 {
        self.active_channel_subscriptions.load(Ordering::Relaxed)
    }

    pub fn active_pattern_subscriptions(&self) -> i64 {
        self.active_pattern_subscriptions.load(Ordering::Relaxed)
    }

    pub fn subscription_messages_received_count(&self) -> u64 {
        self.subscription_messages_received_count
            .load(Ordering::Relaxed)
    }

    pub fn command_success_count(&self) -> u64 {
        self.command_success_count.load(Ordering::Relaxed)
    }

    pub fn command_failure_count(&self) -> u64 {
        self.command_failure_count.load(Ordering::Relaxed)
    }

    /// Mean command round-trip time across every sample recorded so far.
    pub fn mean_round_trip_nanos(&self) -> u64 {
        let samples = self.round_trip_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0;
        }
        self.round_trip_nanos_total.load(Ordering::Relaxed) / samples
    }
}

/// `RediStack.*`-namespaced process-wide counters.
pub static METRICS: Metrics = Metrics::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabling_report_metrics_suppresses_updates() {
        REPORT_METRICS.store(false, Ordering::Relaxed);
        let before = METRICS.command_success_count();
        METRICS.command_succeeded();
        assert_eq!(METRICS.command_success_count(), before);
        REPORT_METRICS.store(true, Ordering::Relaxed);
    }

    #[test]
    fn round_trip_mean_tracks_recorded_samples() {
        let m = Metrics::new();
        m.record_round_trip(100);
        m.record_round_trip(300);
        assert_eq!(m.mean_round_trip_nanos(), 200);
    }
}
