//! Per-endpoint health scoring and probing (spec §4.H "State per endpoint",
//! "Probes").

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::models::{EndpointHealth, EndpointStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointState {
    pub id: String,
    pub score: f64,
    pub rtt_ms: f64,
    pub failures: u32,
    pub consecutive_failures: u32,
    pub status: EndpointStatus,
    pub last_probe: chrono::DateTime<Utc>,
    pub rtt_history: VecDeque<f64>,
}

impl EndpointState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            score: 1.0,
            rtt_ms: 0.0,
            failures: 0,
            consecutive_failures: 0,
            status: EndpointStatus::Healthy,
            last_probe: Utc::now(),
            rtt_history: VecDeque::with_capacity(20),
        }
    }

    /// Apply one probe outcome and recompute `score`/`status` (spec §4.H:
    /// "on success score <- clamp(1 - avgRtt/1000, 0.1, 1); on failure score
    /// <- max(0, score - 0.2)").
    pub fn record_probe(
        &mut self,
        outcome: ProbeOutcome,
        unhealthy_after_failures: u32,
        unhealthy_score_threshold: f64,
    ) {
        self.last_probe = Utc::now();
        match outcome {
            ProbeOutcome::Success { rtt_ms } => {
                self.rtt_ms = rtt_ms;
                self.consecutive_failures = 0;
                if self.rtt_history.len() >= 20 {
                    self.rtt_history.pop_front();
                }
                self.rtt_history.push_back(rtt_ms);
                let avg_rtt: f64 =
                    self.rtt_history.iter().sum::<f64>() / self.rtt_history.len() as f64;
                self.score = (1.0 - avg_rtt / 1000.0).clamp(0.1, 1.0);
            }
            ProbeOutcome::Failure { timeout_ms } => {
                self.rtt_ms = timeout_ms;
                self.failures += 1;
                self.consecutive_failures += 1;
                self.score = (self.score - 0.2).max(0.0);
            }
        }
        self.status = if self.consecutive_failures >= unhealthy_after_failures
            || self.score < unhealthy_score_threshold
        {
            EndpointStatus::Unhealthy
        } else if self.score < 0.6 {
            EndpointStatus::Degraded
        } else {
            EndpointStatus::Healthy
        };
    }

    pub fn to_health(&self) -> EndpointHealth {
        EndpointHealth {
            id: self.id.clone(),
            score: self.score,
            rtt_ms: self.rtt_ms,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            status: self.status,
            last_probe: self.last_probe,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ProbeOutcome {
    Success { rtt_ms: f64 },
    Failure { timeout_ms: f64 },
}

/// Probe a single endpoint over TCP with a hard timeout (spec §4.H "Probes").
/// The URL's host:port is resolved and connected; RTT is measured to first
/// byte of the TCP handshake. Connection errors and timeouts both count as
/// failures with `rtt = timeout`.
pub async fn probe_endpoint(url: &str, timeout: Duration) -> ProbeOutcome {
    let target = match parse_host_port(url) {
        Some(t) => t,
        None => return ProbeOutcome::Failure {
            timeout_ms: timeout.as_millis() as f64,
        },
    };
    let started = std::time::Instant::now();
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&target)).await {
        Ok(Ok(_stream)) => ProbeOutcome::Success {
            rtt_ms: started.elapsed().as_secs_f64() * 1000.0,
        },
        _ => ProbeOutcome::Failure {
            timeout_ms: timeout.as_millis() as f64,
        },
    }
}

fn parse_host_port(url: &str) -> Option<String> {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    let host_port = without_scheme.split('/').next()?;
    if host_port.contains(':') {
        Some(host_port.to_string())
    } else {
        Some(format!("{host_port}:443"))
    }
}

/// `intervalMs + U(0, jitterMs)` per-endpoint probe cadence (spec §4.H).
pub fn next_probe_delay(interval_ms: u64, jitter_ms: u64) -> Duration {
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    Duration::from_millis(interval_ms + jitter)
}
