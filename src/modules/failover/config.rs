//! Endpoint catalog and FSM gating configuration (spec §4.H).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    pub url: String,
    /// Manual switches to this endpoint bypass dwell/canary gating.
    pub allow_force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointCatalogConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub current: String,
    /// Consecutive probe failures before an endpoint is forced `unhealthy`
    /// regardless of score (spec §3 endpoint health invariant, `K`).
    pub unhealthy_after_failures: u32,
    pub unhealthy_score_threshold: f64,
    pub probe_interval_ms: u64,
    pub probe_jitter_ms: u64,
    pub probe_timeout_ms: u64,
    pub min_dwell_secs: u64,
    pub canary_duration_secs: u64,
    pub stable_before_revert_secs: u64,
    pub brownout_max_step_pct: f64,
    pub brownout_step_secs: u64,
}

impl Default for EndpointCatalogConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![
                EndpointConfig {
                    id: "primary".into(),
                    url: "wss://primary.example".into(),
                    allow_force: true,
                },
                EndpointConfig {
                    id: "backup1".into(),
                    url: "wss://backup1.example".into(),
                    allow_force: true,
                },
                EndpointConfig {
                    id: "backup2".into(),
                    url: "wss://backup2.example".into(),
                    allow_force: true,
                },
            ],
            current: "primary".into(),
            unhealthy_after_failures: 3,
            unhealthy_score_threshold: 0.3,
            probe_interval_ms: 5_000,
            probe_jitter_ms: 500,
            probe_timeout_ms: 2_000,
            min_dwell_secs: 300,
            canary_duration_secs: 30,
            stable_before_revert_secs: 600,
            brownout_max_step_pct: 10.0,
            brownout_step_secs: 30,
        }
    }
}
