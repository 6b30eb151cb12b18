//! Endpoint Failover Orchestrator (spec §4.H, component H).
//!
//! Probes every catalog endpoint on a jittered cadence, scores them, and
//! drives a single-threaded FSM (`NORMAL -> SEEKING_TARGET -> PLANNED ->
//! SWITCHED -> REVERTING -> NORMAL`) gated by dwell time, canary success,
//! and brownout state. Concurrent probe results serialize on the FSM lock
//! (spec §5: "concurrent probe results serialize on the FSM lock").

pub mod config;
pub mod metrics;
pub mod mitigation;
pub mod prober;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::bus::topics::{BrownoutStep, EndpointSwitchPlan, EndpointSwitched};
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::clock::{jittered, Scheduler};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};

pub use config::{EndpointCatalogConfig, EndpointConfig};
pub use mitigation::BrownoutController;
pub use prober::{probe_endpoint, EndpointState, ProbeOutcome};

/// FSM states (spec §4.H FSM diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverState {
    Normal,
    SeekingTarget,
    Planned,
    Switched,
    Reverting,
    AlertNoHealthy,
}

struct OrchestratorState {
    endpoints: HashMap<String, EndpointState>,
    current: String,
    fsm: FailoverState,
    switched_at: Option<chrono::DateTime<Utc>>,
    dwell_since: chrono::DateTime<Utc>,
    planned_target: Option<String>,
    consecutive_switch_failures: u32,
    brownout: Option<BrownoutController>,
}

impl OrchestratorState {
    fn current_endpoint(&self) -> Option<&EndpointState> {
        self.endpoints.get(&self.current)
    }

    /// Best healthy alternative to `current`, by descending score (spec
    /// §4.H "best alt healthy").
    fn best_alternative(&self) -> Option<&EndpointState> {
        self.endpoints
            .values()
            .filter(|e| e.id != self.current && e.status == crate::models::EndpointStatus::Healthy)
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
    }
}

pub struct FailoverOrchestrator {
    state: Arc<RwLock<OrchestratorState>>,
    config: Arc<RwLock<EndpointCatalogConfig>>,
    bus: Arc<RwLock<Option<Arc<EventBus>>>>,
    audit: Arc<AuditSink>,
}

impl FailoverOrchestrator {
    pub fn new(audit: Arc<AuditSink>, config: EndpointCatalogConfig) -> Arc<Self> {
        let now = Utc::now();
        let mut endpoints = HashMap::new();
        for ep in &config.endpoints {
            endpoints.insert(ep.id.clone(), EndpointState::new(&ep.id));
        }
        let current = config.current.clone();
        Arc::new(Self {
            state: Arc::new(RwLock::new(OrchestratorState {
                endpoints,
                current,
                fsm: FailoverState::Normal,
                switched_at: None,
                dwell_since: now,
                planned_target: None,
                consecutive_switch_failures: 0,
                brownout: None,
            })),
            config: Arc::new(RwLock::new(config)),
            bus: Arc::new(RwLock::new(None)),
            audit,
        })
    }

    /// Record a probe outcome and evaluate the FSM (spec §4.H, §8 property 6:
    /// "status=unhealthy implies no endpoint.switch.plan targeting that
    /// endpoint").
    pub async fn record_probe(&self, id: &str, outcome: ProbeOutcome) {
        let cfg = self.config.read().clone();
        metrics::record_probe(
            id,
            matches!(outcome, ProbeOutcome::Success { .. }),
            match outcome {
                ProbeOutcome::Success { rtt_ms } => rtt_ms,
                ProbeOutcome::Failure { timeout_ms } => timeout_ms,
            },
        );

        let (health, transitions) = {
            let mut state = self.state.write();
            let entry = state
                .endpoints
                .entry(id.to_string())
                .or_insert_with(|| EndpointState::new(id));
            entry.record_probe(outcome, cfg.unhealthy_after_failures, cfg.unhealthy_score_threshold);
            metrics::record_score(id, entry.score);
            let health = entry.to_health();
            let transitions = self.evaluate_fsm(&mut state, &cfg);
            (health, transitions)
        };

        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::new(
                Topic::EndpointHealthSnapshot,
                "failover_orchestrator",
                Payload::EndpointHealthSnapshot(health),
            );
            bus.publish(Topic::EndpointHealthSnapshot, envelope).await;
            for t in transitions {
                self.emit_transition(&bus, t).await;
            }
        }
    }

    /// Gate check + state transition logic, run with the FSM lock held
    /// (spec §5: "single-threaded; concurrent probe results serialize on the
    /// FSM lock"). Returns events to publish once the lock is released.
    fn evaluate_fsm(
        &self,
        state: &mut OrchestratorState,
        cfg: &EndpointCatalogConfig,
    ) -> Vec<Transition> {
        let now = Utc::now();
        let mut out = Vec::new();

        match state.fsm {
            FailoverState::Normal => {
                let unhealthy = state
                    .current_endpoint()
                    .map(|e| e.status == crate::models::EndpointStatus::Unhealthy)
                    .unwrap_or(false);
                if unhealthy {
                    state.fsm = FailoverState::SeekingTarget;
                    state.dwell_since = now;
                    info!(current = %state.current, "current endpoint unhealthy, seeking target");
                }
            }
            FailoverState::SeekingTarget => {
                let dwell_ok = (now - state.dwell_since).num_seconds() >= cfg.min_dwell_secs as i64;
                let no_pending = state.planned_target.is_none();
                if let Some(alt) = state.best_alternative() {
                    if dwell_ok && no_pending {
                        let target = alt.id.clone();
                        state.planned_target = Some(target.clone());
                        state.fsm = FailoverState::Planned;
                        out.push(Transition::Plan {
                            from: state.current.clone(),
                            to: target,
                        });
                    }
                } else {
                    state.fsm = FailoverState::AlertNoHealthy;
                    out.push(Transition::NoHealthy {
                        current: state.current.clone(),
                    });
                }
            }
            FailoverState::Planned => {
                // Canary outcome is driven externally via `complete_canary`;
                // nothing to evaluate purely from probe results here.
            }
            FailoverState::Switched => {
                let stable = state
                    .switched_at
                    .map(|t| (now - t).num_seconds() >= cfg.stable_before_revert_secs as i64)
                    .unwrap_or(false);
                let primary_healthy = cfg
                    .endpoints
                    .first()
                    .and_then(|p| state.endpoints.get(&p.id))
                    .map(|e| e.status == crate::models::EndpointStatus::Healthy)
                    .unwrap_or(false);
                if stable && primary_healthy && state.current != cfg.endpoints.first().map(|p| p.id.clone()).unwrap_or_default() {
                    state.fsm = FailoverState::Reverting;
                    info!("stable for revert window, reverting to primary");
                }
            }
            FailoverState::Reverting => {
                // Reversion completes once the operator/scheduler calls
                // `complete_revert`; this arm exists so probe updates don't
                // regress the state while reverting is in flight.
            }
            FailoverState::AlertNoHealthy => {
                if state
                    .endpoints
                    .values()
                    .any(|e| e.status == crate::models::EndpointStatus::Healthy)
                {
                    state.fsm = FailoverState::SeekingTarget;
                    state.dwell_since = now;
                }
            }
        }
        out
    }

    async fn emit_transition(&self, bus: &Arc<EventBus>, t: Transition) {
        match t {
            Transition::Plan { from, to } => {
                let plan = EndpointSwitchPlan {
                    from: from.clone(),
                    to: to.clone(),
                    reason_codes: vec!["CURRENT_ENDPOINT_UNHEALTHY".to_string()],
                    planned_at: Utc::now(),
                };
                let envelope = Envelope::new(
                    Topic::EndpointSwitchPlan,
                    "failover_orchestrator",
                    Payload::EndpointSwitchPlan(plan),
                );
                bus.publish(Topic::EndpointSwitchPlan, envelope).await;
                self.audit
                    .record("failover_orchestrator", None, "switch_planned", &format!("{from}->{to}"))
                    .await;
            }
            Transition::NoHealthy { current } => {
                metrics::record_no_healthy_alert();
                warn!(current = %current, "no healthy endpoint candidate");
                self.audit
                    .record("failover_orchestrator", None, "no_healthy_candidate", &current)
                    .await;
                let envelope = Envelope::new(Topic::AuditLog, "failover_orchestrator", Payload::Empty);
                bus.publish(Topic::AuditLog, envelope).await;
            }
        }
    }

    /// Run the canary window and, on success, commit the switch; on failure,
    /// revert to `NORMAL` and count a switch failure (spec §4.H "PLANNED ->
    /// SWITCHED (canary ok); PLANNED -> NORMAL (canary fail)").
    pub async fn complete_canary(&self, canary_ok: bool) {
        let cfg = self.config.read().clone();
        let result = {
            let mut state = self.state.write();
            let target = state.planned_target.clone();
            state.planned_target = None;
            match (target, canary_ok) {
                (Some(target), true) => {
                    let from = std::mem::replace(&mut state.current, target.clone());
                    state.fsm = FailoverState::Switched;
                    state.switched_at = Some(Utc::now());
                    state.consecutive_switch_failures = 0;
                    metrics::record_switch(&from, &target);
                    Some((from, target))
                }
                (Some(_), false) => {
                    state.fsm = FailoverState::Normal;
                    state.consecutive_switch_failures += 1;
                    None
                }
                (None, _) => None,
            }
        };
        if let Some((from, to)) = result {
            if let Some(bus) = self.bus.read().clone() {
                let switched = EndpointSwitched {
                    from: from.clone(),
                    to: to.clone(),
                    reason_codes: vec!["CURRENT_ENDPOINT_UNHEALTHY".to_string()],
                };
                let envelope = Envelope::new(
                    Topic::EndpointSwitched,
                    "failover_orchestrator",
                    Payload::EndpointSwitched(switched),
                );
                bus.publish(Topic::EndpointSwitched, envelope).await;
            }
            self.audit
                .record("failover_orchestrator", None, "switched", &format!("{from}->{to}"))
                .await;
        }
        let _ = cfg;
    }

    /// Complete a `REVERTING -> NORMAL` transition back to the primary.
    pub fn complete_revert(&self) {
        let mut state = self.state.write();
        if state.fsm == FailoverState::Reverting {
            state.fsm = FailoverState::Normal;
            state.switched_at = None;
        }
    }

    /// Manual switch bypassing dwell/canary gating; only valid for operator
    /// commands carrying `force=true` (spec §4.H "Gates").
    pub fn force_switch(&self, target: &str) -> OpsResult<()> {
        let cfg = self.config.read();
        let allowed = cfg
            .endpoints
            .iter()
            .find(|e| e.id == target)
            .map(|e| e.allow_force)
            .unwrap_or(false);
        drop(cfg);
        if !allowed {
            return Err(crate::error::OpsError::Validation(format!(
                "endpoint {target} does not allow forced switch"
            )));
        }
        let mut state = self.state.write();
        state.current = target.to_string();
        state.fsm = FailoverState::Switched;
        state.switched_at = Some(Utc::now());
        Ok(())
    }

    /// Begin an optional gradual-shift brownout (spec §4.H "brownout.step",
    /// Design Notes Open Question #2).
    pub fn begin_brownout(&self, from: &str, to: &str) {
        let cfg = self.config.read();
        let ctrl = BrownoutController::new(
            from.to_string(),
            to.to_string(),
            cfg.brownout_max_step_pct,
            cfg.brownout_step_secs,
        );
        drop(cfg);
        self.state.write().brownout = Some(ctrl);
    }

    /// Advance the brownout controller one step if due, emitting
    /// `endpoint.brownout.step` (spec §4.H).
    pub async fn maybe_brownout_step(&self) {
        let step = {
            let mut state = self.state.write();
            match state.brownout.as_mut() {
                Some(ctrl) => ctrl.maybe_step(Utc::now()).map(|pct| (ctrl.from.clone(), ctrl.to.clone(), pct)),
                None => None,
            }
        };
        if let Some((from, to, pct)) = step {
            if let Some(bus) = self.bus.read().clone() {
                let envelope = Envelope::new(
                    Topic::EndpointBrownoutStep,
                    "failover_orchestrator",
                    Payload::EndpointBrownoutStep(BrownoutStep { from, to, pct_shifted: pct }),
                );
                bus.publish(Topic::EndpointBrownoutStep, envelope).await;
            }
        }
    }

    pub fn endpoints_snapshot(&self) -> HashMap<String, EndpointState> {
        self.state.read().endpoints.clone()
    }

    /// Atomically replace the endpoint catalog (spec §6 hot-reload
    /// "endpoint catalog"). Existing probe state for endpoints that remain
    /// in the new catalog is preserved; new entries start fresh.
    pub fn update_catalog(&self, cfg: EndpointCatalogConfig) {
        let mut state = self.state.write();
        let mut endpoints = HashMap::new();
        for ep in &cfg.endpoints {
            let entry = state
                .endpoints
                .remove(&ep.id)
                .unwrap_or_else(|| EndpointState::new(&ep.id));
            endpoints.insert(ep.id.clone(), entry);
        }
        state.endpoints = endpoints;
        if !state.endpoints.contains_key(&state.current) {
            state.current = cfg.current.clone();
        }
        drop(state);
        *self.config.write() = cfg;
    }
}

enum Transition {
    Plan { from: String, to: String },
    NoHealthy { current: String },
}

impl Clone for EndpointState {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            score: self.score,
            rtt_ms: self.rtt_ms,
            failures: self.failures,
            consecutive_failures: self.consecutive_failures,
            status: self.status,
            last_probe: self.last_probe,
            rtt_history: self.rtt_history.clone(),
        }
    }
}

#[async_trait]
impl Module for Arc<FailoverOrchestrator> {
    fn name(&self) -> &'static str {
        "failover_orchestrator"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(cfg) = serde_json::from_value::<EndpointCatalogConfig>(config.clone()) {
            let mut endpoints = HashMap::new();
            for ep in &cfg.endpoints {
                endpoints.insert(ep.id.clone(), EndpointState::new(&ep.id));
            }
            let mut state = self.state.write();
            state.endpoints = endpoints;
            state.current = cfg.current.clone();
            drop(state);
            *self.config.write() = cfg;
        }
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        let scheduler = Scheduler::new(bus.clone());
        let endpoints: Vec<(String, String, u64, u64, u64)> = {
            let cfg = self.config.read();
            cfg.endpoints
                .iter()
                .map(|e| {
                    (
                        e.id.clone(),
                        e.url.clone(),
                        cfg.probe_interval_ms,
                        cfg.probe_jitter_ms,
                        cfg.probe_timeout_ms,
                    )
                })
                .collect()
        };
        for (id, url, interval_ms, jitter_ms, timeout_ms) in endpoints {
            let this = this.clone();
            tokio::spawn(async move {
                loop {
                    let wait = jittered(Duration::from_millis(interval_ms), jitter_ms);
                    tokio::time::sleep(wait).await;
                    let outcome = probe_endpoint(&url, Duration::from_millis(timeout_ms)).await;
                    this.record_probe(&id, outcome).await;
                }
            });
        }
        let _ = scheduler;
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) -> OpsResult<()> {
        Ok(())
    }

    async fn health_snapshot(&self) -> Health {
        let state = self.state.read();
        let unhealthy = state
            .endpoints
            .values()
            .filter(|e| e.status == crate::models::EndpointStatus::Unhealthy)
            .count();
        let health_state = if matches!(state.fsm, FailoverState::AlertNoHealthy) {
            HealthState::Unhealthy
        } else if unhealthy > 0 {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
        Health {
            state: health_state,
            detail: format!("current={} fsm={:?}", state.current, state.fsm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EndpointCatalogConfig {
        let mut cfg = EndpointCatalogConfig::default();
        cfg.min_dwell_secs = 0;
        cfg
    }

    #[tokio::test]
    async fn s4_failover_plans_switch_to_best_alternative() {
        let audit = Arc::new(
            AuditSink::open(std::env::temp_dir().join("opsctl_test_audit_failover.jsonl"))
                .await
                .unwrap(),
        );
        let orchestrator = FailoverOrchestrator::new(audit, test_config());
        {
            let mut state = orchestrator.state.write();
            state.endpoints.get_mut("primary").unwrap().score = 0.9;
            state.endpoints.get_mut("backup1").unwrap().score = 0.4;
            state.endpoints.get_mut("backup2").unwrap().score = 0.6;
            state.endpoints.get_mut("backup1").unwrap().status = crate::models::EndpointStatus::Healthy;
            state.endpoints.get_mut("backup2").unwrap().status = crate::models::EndpointStatus::Healthy;
        }
        for _ in 0..3 {
            orchestrator
                .record_probe("primary", ProbeOutcome::Failure { timeout_ms: 2000.0 })
                .await;
        }
        let state = orchestrator.state.read();
        assert_eq!(
            state.endpoints.get("primary").unwrap().status,
            crate::models::EndpointStatus::Unhealthy
        );
        assert!(matches!(state.fsm, FailoverState::Planned | FailoverState::SeekingTarget));
    }

    #[test]
    fn unhealthy_endpoint_never_targeted_by_plan() {
        let cfg = test_config();
        let mut endpoints = HashMap::new();
        let mut a = EndpointState::new("a");
        a.status = crate::models::EndpointStatus::Unhealthy;
        endpoints.insert("a".to_string(), a);
        let state = OrchestratorState {
            endpoints,
            current: "a".to_string(),
            fsm: FailoverState::SeekingTarget,
            switched_at: None,
            dwell_since: Utc::now() - chrono::Duration::seconds(10),
            planned_target: None,
            consecutive_switch_failures: 0,
            brownout: None,
        };
        assert!(state.best_alternative().is_none());
        let _ = cfg;
    }
}
