//! Endpoint orchestrator metrics (spec §2 "Share of core" accounting is
//! narrative only; this module backs the `metrics` crate counters/gauges the
//! orchestrator exports, mirroring the teacher's Prometheus conventions).

use metrics::{counter, gauge};

pub fn record_probe(endpoint_id: &str, healthy: bool, rtt_ms: f64) {
    counter!("opsctl_endpoint_probes_total", "endpoint" => endpoint_id.to_string()).increment(1);
    if !healthy {
        counter!("opsctl_endpoint_probe_failures_total", "endpoint" => endpoint_id.to_string())
            .increment(1);
    }
    gauge!("opsctl_endpoint_rtt_ms", "endpoint" => endpoint_id.to_string()).set(rtt_ms);
}

pub fn record_score(endpoint_id: &str, score: f64) {
    gauge!("opsctl_endpoint_score", "endpoint" => endpoint_id.to_string()).set(score);
}

pub fn record_switch(from: &str, to: &str) {
    counter!(
        "opsctl_endpoint_switches_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

pub fn record_no_healthy_alert() {
    counter!("opsctl_endpoint_no_healthy_total").increment(1);
}
