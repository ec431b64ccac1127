//! Prometheus text exposition format.
//!
//! Renders a `MetricsSnapshot` for scraping by a Prometheus server or
//! compatible agent.

use std::fmt::Write;

use crate::collector::MetricsSnapshot;

/// Render a snapshot into Prometheus text format with a `pool` label.
pub fn render_prometheus(s: &MetricsSnapshot) -> String {
    let mut out = String::new();
    let pool = &s.pool_name;

    let counters: [(&str, &str, u64); 8] = [
        ("tidepool_connections_created_total", "Connections opened.", s.connections.created),
        ("tidepool_connections_closed_total", "Connections closed.", s.connections.closed),
        ("tidepool_connections_recycled_total", "Connections recycled for poor health.", s.connections.recycled),
        ("tidepool_connect_failures_total", "Failed connection attempts.", s.connections.connect_failures),
        ("tidepool_queries_total", "Statements executed.", s.queries.executed),
        ("tidepool_query_errors_total", "Statements that failed.", s.queries.errors),
        ("tidepool_read_retries_total", "Reads retried on another connection.", s.queries.read_retries),
        ("tidepool_acquire_timeouts_total", "Acquires that timed out.", s.acquires.timeouts),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name}{{pool=\"{pool}\"}} {value}");
    }

    let _ = writeln!(out, "# HELP tidepool_queries_by_category_total Statements by routing category.");
    let _ = writeln!(out, "# TYPE tidepool_queries_by_category_total counter");
    for (category, count) in &s.queries.by_category {
        let _ = writeln!(
            out,
            "tidepool_queries_by_category_total{{pool=\"{pool}\",category=\"{category}\"}} {count}"
        );
    }

    let gauges: [(&str, &str, f64); 5] = [
        ("tidepool_active_connections", "Connections checked out.", s.current_state.active_connections as f64),
        ("tidepool_idle_connections", "Connections available for checkout.", s.current_state.available_connections as f64),
        ("tidepool_waiting_acquires", "Callers in the wait queue.", s.current_state.waiting as f64),
        ("tidepool_error_rate", "Query error rate (0.0-1.0).", s.queries.error_rate),
        ("tidepool_latency_p99_ms", "P99 query latency in milliseconds.", s.queries.latency_p99_ms),
    ];
    for (name, help, value) in gauges {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} gauge");
        let _ = writeln!(out, "{name}{{pool=\"{pool}\"}} {value}");
    }

    let _ = writeln!(out, "# HELP tidepool_connection_health Health score per connection (0-100).");
    let _ = writeln!(out, "# TYPE tidepool_connection_health gauge");
    for (id, score) in &s.current_state.health_scores {
        let _ = writeln!(
            out,
            "tidepool_connection_health{{pool=\"{pool}\",connection=\"{id}\"}} {score}"
        );
    }

    out
}
