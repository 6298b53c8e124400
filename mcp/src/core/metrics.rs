//! Gateway metrics for monitoring backend traffic.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;

/// Counters for proxy calls and backend connections.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    in_flight_calls: AtomicU64,

    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    connection_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a proxy call. The returned guard marks it finished.
    pub fn start_call(self: &Arc<Self>) -> CallGuard {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.in_flight_calls.fetch_add(1, Ordering::Relaxed);
        scopeguard::guard(Arc::clone(self), finish_call as fn(Arc<GatewayMetrics>))
    }

    pub fn record_call_failed(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn in_flight_calls(&self) -> u64 {
        self.in_flight_calls.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            in_flight_calls: self.in_flight_calls.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

fn finish_call(metrics: Arc<GatewayMetrics>) {
    metrics.in_flight_calls.fetch_sub(1, Ordering::Relaxed);
}

/// Decrements the in-flight counter on every exit path.
pub type CallGuard = scopeguard::ScopeGuard<Arc<GatewayMetrics>, fn(Arc<GatewayMetrics>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub in_flight_calls: u64,
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub connection_errors: u64,
    pub reconnect_attempts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_guard_tracks_in_flight() {
        let metrics = Arc::new(GatewayMetrics::new());
        {
            let _guard = metrics.start_call();
            assert_eq!(metrics.in_flight_calls(), 1);
        }
        metrics.record_call_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_calls, 1);
        assert_eq!(snapshot.failed_calls, 1);
        assert_eq!(snapshot.in_flight_calls, 0);
    }

    #[test]
    fn test_connection_counters() {
        let metrics = GatewayMetrics::new();
        metrics.record_connection_opened();
        metrics.record_connection_opened();
        metrics.record_connection_closed();
        metrics.record_connection_error();
        metrics.record_reconnect_attempt();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_opened, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.connection_errors, 1);
        assert_eq!(snapshot.reconnect_attempts, 1);
    }
}
