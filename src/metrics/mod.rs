//! Prometheus-style counters for the server and registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Requests received from MCP clients
    pub requests_total: AtomicU64,
    /// Requests answered with an error
    pub requests_failed: AtomicU64,
    /// Notifications received from MCP clients
    pub notifications_total: AtomicU64,
    /// Tool executions through the registry
    pub tool_calls: AtomicU64,
    /// Tool executions that reported failure
    pub tool_failures: AtomicU64,
    /// Open server-side connections
    pub active_connections: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_notifications(&self) {
        self.notifications_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one tool execution and whether it succeeded.
    pub fn record_tool_call(&self, success: bool) {
        self.tool_calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.tool_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_active_connections(&self, count: u64) {
        self.active_connections.store(count, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            notifications_total: self.notifications_total.load(Ordering::Relaxed),
            tool_calls: self.tool_calls.load(Ordering::Relaxed),
            tool_failures: self.tool_failures.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP mcp_hub_requests_total Requests received from MCP clients
# TYPE mcp_hub_requests_total counter
mcp_hub_requests_total {}

# HELP mcp_hub_requests_failed Requests answered with a JSON-RPC error
# TYPE mcp_hub_requests_failed counter
mcp_hub_requests_failed {}

# HELP mcp_hub_notifications_total Notifications received from MCP clients
# TYPE mcp_hub_notifications_total counter
mcp_hub_notifications_total {}

# HELP mcp_hub_tool_calls Tool executions
# TYPE mcp_hub_tool_calls counter
mcp_hub_tool_calls {}

# HELP mcp_hub_tool_failures Tool executions that failed
# TYPE mcp_hub_tool_failures counter
mcp_hub_tool_failures {}

# HELP mcp_hub_active_connections Open server connections
# TYPE mcp_hub_active_connections gauge
mcp_hub_active_connections {}
"#,
            s.requests_total,
            s.requests_failed,
            s.notifications_total,
            s.tool_calls,
            s.tool_failures,
            s.active_connections
        )
    }
}

/// Metrics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub notifications_total: u64,
    pub tool_calls: u64,
    pub tool_failures: u64,
    pub active_connections: u64,
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_call_counters() {
        let metrics = Metrics::new();
        metrics.record_tool_call(true);
        metrics.record_tool_call(false);
        metrics.record_tool_call(false);

        let s = metrics.snapshot();
        assert_eq!(s.tool_calls, 3);
        assert_eq!(s.tool_failures, 2);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = Metrics::new();
        metrics.inc_requests();
        metrics.inc_requests();
        metrics.inc_failed();
        metrics.set_active_connections(4);

        let text = metrics.to_prometheus();
        assert!(text.contains("mcp_hub_requests_total 2\n"));
        assert!(text.contains("mcp_hub_requests_failed 1\n"));
        assert!(text.contains("mcp_hub_active_connections 4\n"));
        assert!(text.contains("# TYPE mcp_hub_active_connections gauge"));
    }

    #[test]
    fn test_timer_reports_elapsed_millis() {
        let timer = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let elapsed = timer.elapsed_ms();
        assert!((20..10_000).contains(&elapsed), "{}", elapsed);
    }
}
