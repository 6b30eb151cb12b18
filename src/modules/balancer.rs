//! Portfolio Exposure Balancer (spec §4.J, component J).
//!
//! Checks a candidate execution intent against hard caps (reject/defer on
//! breach), then scales down by `scale.step` until soft constraints hold
//! (spec §8 property 8: approved/adjusted exposure never exceeds any cap).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditSink;
use crate::bus::topics::{AccountExposureSnapshot, ExecutionIntent, PortfolioIntentResult, PortfolioOutcome};
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnHardBreach {
    Reject,
    Defer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleStep {
    pub step: f64,
    pub min_factor: f64,
}

impl Default for ScaleStep {
    fn default() -> Self {
        Self {
            step: 0.1,
            min_factor: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationThresholds {
    pub hard: f64,
    pub soft: f64,
    pub default_same_cluster: f64,
    pub marginal_risk_max_pct: f64,
}

impl Default for CorrelationThresholds {
    fn default() -> Self {
        Self {
            hard: 0.85,
            soft: 0.65,
            default_same_cluster: 0.5,
            marginal_risk_max_pct: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCaps {
    pub total_risk_pct: f64,
    pub per_symbol_pct: f64,
    pub per_cluster_pct: HashMap<String, f64>,
    pub per_factor_beta_abs: HashMap<String, f64>,
    pub long_short_imbalance_pct: f64,
    pub correlation: CorrelationThresholds,
    pub scale: ScaleStep,
    pub on_hard_breach: OnHardBreach,
    pub exposure_sla_secs: i64,
    pub policy_sla_secs: i64,
    /// Symbol -> cluster name, used to resolve which `per_cluster_pct`/
    /// correlation-hard bucket a candidate intent falls into.
    pub symbol_clusters: HashMap<String, String>,
}

impl Default for PolicyCaps {
    fn default() -> Self {
        Self {
            total_risk_pct: 20.0,
            per_symbol_pct: 5.0,
            per_cluster_pct: HashMap::new(),
            per_factor_beta_abs: HashMap::new(),
            long_short_imbalance_pct: 30.0,
            correlation: CorrelationThresholds::default(),
            scale: ScaleStep::default(),
            on_hard_breach: OnHardBreach::Reject,
            exposure_sla_secs: 30,
            policy_sla_secs: 300,
            symbol_clusters: HashMap::new(),
        }
    }
}

fn variant_base(variant: &str) -> f64 {
    match variant {
        "conservative" => 0.4,
        "aggressive" => 0.8,
        _ => 0.6,
    }
}

/// One hard-cap check; returns `Some(reason)` if breached.
fn hard_breach_reason(candidate_pct: f64, exposure: &AccountExposureSnapshot, caps: &PolicyCaps, symbol: &str, cluster: Option<&str>) -> Option<&'static str> {
    if exposure.total_risk_pct + candidate_pct > caps.total_risk_pct {
        return Some("total_risk_cap");
    }
    let existing_symbol = exposure.per_symbol_pct.get(symbol).copied().unwrap_or(0.0);
    if existing_symbol + candidate_pct > caps.per_symbol_pct {
        return Some("per_symbol_cap");
    }
    if let Some(cluster) = cluster {
        if let Some(cap) = caps.per_cluster_pct.get(cluster) {
            let existing = exposure.per_cluster_pct.get(cluster).copied().unwrap_or(0.0);
            if existing + candidate_pct > *cap {
                return Some("per_cluster_cap");
            }
        }
    }
    for (factor, cap) in &caps.per_factor_beta_abs {
        let existing = exposure.per_factor_beta.get(factor).copied().unwrap_or(0.0);
        if existing.abs() > *cap {
            return Some("factor_beta_cap");
        }
    }
    if let Some(cluster) = cluster {
        let existing_cluster_pct = exposure.per_cluster_pct.get(cluster).copied().unwrap_or(0.0);
        if existing_cluster_pct > 0.0 && caps.correlation.default_same_cluster >= caps.correlation.hard {
            return Some("correlation_hard_cap");
        }
    }
    if exposure.long_short_imbalance_pct.abs() > caps.long_short_imbalance_pct {
        return Some("long_short_imbalance_cap");
    }
    None
}

pub struct BalanceDecision {
    pub outcome: PortfolioOutcome,
    pub approved_risk_pct: f64,
    pub scale_factor: f64,
    pub reason: Option<String>,
    pub defer_until: Option<DateTime<Utc>>,
}

/// Core balancer algorithm (spec §4.J "Algorithm").
pub fn evaluate_intent(
    intent: &ExecutionIntent,
    caps: &PolicyCaps,
    exposure: &AccountExposureSnapshot,
    cluster: Option<&str>,
    now: DateTime<Utc>,
) -> BalanceDecision {
    let base = variant_base(&intent.variant);
    let candidate_risk_pct = base * intent.confidence;

    if let Some(reason) = hard_breach_reason(candidate_risk_pct, exposure, caps, &intent.symbol, cluster) {
        return match caps.on_hard_breach {
            OnHardBreach::Reject => BalanceDecision {
                outcome: PortfolioOutcome::Rejected,
                approved_risk_pct: 0.0,
                scale_factor: 0.0,
                reason: Some(reason.to_string()),
                defer_until: None,
            },
            OnHardBreach::Defer => BalanceDecision {
                outcome: PortfolioOutcome::Deferred,
                approved_risk_pct: 0.0,
                scale_factor: 0.0,
                reason: Some(reason.to_string()),
                defer_until: Some(now + chrono::Duration::seconds(30)),
            },
        };
    }

    // Scale downward until soft constraints (correlation soft threshold as a
    // proxy for "all soft constraints hold") pass or min_factor is crossed.
    let mut scale_factor = 1.0_f64;
    loop {
        let scaled_risk = candidate_risk_pct * scale_factor;
        let soft_ok = scaled_risk <= caps.correlation.marginal_risk_max_pct || scale_factor <= caps.scale.min_factor;
        if soft_ok {
            break;
        }
        scale_factor -= caps.scale.step;
        if scale_factor < caps.scale.min_factor {
            scale_factor = caps.scale.min_factor;
            break;
        }
    }

    let approved = candidate_risk_pct * scale_factor;
    let outcome = if scale_factor < 1.0 {
        PortfolioOutcome::Adjusted
    } else {
        PortfolioOutcome::Approved
    };

    BalanceDecision {
        outcome,
        approved_risk_pct: approved,
        scale_factor,
        reason: None,
        defer_until: None,
    }
}

pub struct PortfolioBalancer {
    caps: parking_lot::RwLock<PolicyCaps>,
    exposure: parking_lot::RwLock<Option<(AccountExposureSnapshot, DateTime<Utc>)>>,
    bus: parking_lot::RwLock<Option<Arc<EventBus>>>,
    audit: Arc<AuditSink>,
}

impl PortfolioBalancer {
    pub fn new(audit: Arc<AuditSink>, caps: PolicyCaps) -> Arc<Self> {
        Arc::new(Self {
            caps: parking_lot::RwLock::new(caps),
            exposure: parking_lot::RwLock::new(None),
            bus: parking_lot::RwLock::new(None),
            audit,
        })
    }

    pub fn update_exposure(&self, snapshot: AccountExposureSnapshot) {
        let now = Utc::now();
        *self.exposure.write() = Some((snapshot, now));
    }

    /// Atomically replace policy caps (spec §6 hot-reload "policy caps").
    pub fn update_caps(&self, caps: PolicyCaps) {
        *self.caps.write() = caps;
    }

    pub async fn handle_intent(&self, intent: ExecutionIntent) {
        let caps = self.caps.read().clone();
        let now = Utc::now();
        let exposure = self.exposure.read().clone();

        let Some((exposure, seen_at)) = exposure else {
            self.emit_missing(&intent, "missing_exposure").await;
            return;
        };
        if (now - seen_at).num_seconds() > caps.exposure_sla_secs {
            self.emit_missing(&intent, "stale_exposure").await;
            return;
        }

        let cluster = caps.symbol_clusters.get(&intent.symbol).cloned();
        let decision = evaluate_intent(&intent, &caps, &exposure, cluster.as_deref(), now);
        info!(
            symbol = %intent.symbol,
            outcome = ?decision.outcome,
            scale_factor = decision.scale_factor,
            "portfolio balancer decision"
        );

        let topic = match decision.outcome {
            PortfolioOutcome::Approved => Topic::PortfolioIntentApproved,
            PortfolioOutcome::Adjusted => Topic::PortfolioIntentAdjusted,
            PortfolioOutcome::Rejected => Topic::PortfolioIntentRejected,
            PortfolioOutcome::Deferred => Topic::PortfolioIntentDeferred,
        };
        let result = PortfolioIntentResult {
            symbol: intent.symbol.clone(),
            outcome: decision.outcome,
            approved_risk_pct: decision.approved_risk_pct,
            scale_factor: decision.scale_factor,
            reason: decision.reason.clone(),
            defer_until: decision.defer_until,
        };
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::with_correlation(
                topic,
                "portfolio_balancer",
                Payload::PortfolioIntentResult(result),
                intent.corr_id.clone(),
            );
            bus.publish(topic, envelope).await;
        }
        self.audit
            .record(
                "portfolio_balancer",
                Some(&intent.corr_id),
                "intent_decided",
                &format!("{:?} scale={:.2}", decision.outcome, decision.scale_factor),
            )
            .await;
    }

    async fn emit_missing(&self, intent: &ExecutionIntent, reason: &str) {
        let result = PortfolioIntentResult {
            symbol: intent.symbol.clone(),
            outcome: PortfolioOutcome::Rejected,
            approved_risk_pct: 0.0,
            scale_factor: 0.0,
            reason: Some(reason.to_string()),
            defer_until: None,
        };
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::with_correlation(
                Topic::PortfolioIntentRejected,
                "portfolio_balancer",
                Payload::PortfolioIntentResult(result),
                intent.corr_id.clone(),
            );
            bus.publish(Topic::PortfolioIntentRejected, envelope).await;
        }
        self.audit
            .record("portfolio_balancer", Some(&intent.corr_id), "state_missing", reason)
            .await;
    }
}

#[async_trait]
impl Module for Arc<PortfolioBalancer> {
    fn name(&self) -> &'static str {
        "portfolio_balancer"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(caps) = serde_json::from_value::<PolicyCaps>(config.clone()) {
            *self.caps.write() = caps;
        }
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::AccountExposure,
            "portfolio_balancer.exposure",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::AccountExposure(snapshot) = envelope.payload {
                        this.update_exposure(snapshot);
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::ExecutionIntentAccepted,
            "portfolio_balancer.intent",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::ExecutionIntentAccepted(intent) = envelope.payload {
                        this.handle_intent(intent).await;
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) -> OpsResult<()> {
        Ok(())
    }

    async fn health_snapshot(&self) -> Health {
        Health {
            state: HealthState::Healthy,
            detail: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;

    fn exposure() -> AccountExposureSnapshot {
        AccountExposureSnapshot {
            ts: Utc::now(),
            total_risk_pct: 5.0,
            per_symbol_pct: HashMap::new(),
            per_cluster_pct: HashMap::new(),
            per_factor_beta: HashMap::new(),
            long_short_imbalance_pct: 0.0,
            balances: vec![],
        }
    }

    #[test]
    fn property8_approved_never_exceeds_total_cap() {
        let caps = PolicyCaps::default();
        let intent = ExecutionIntent {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            variant: "aggressive".into(),
            confidence: 1.0,
            corr_id: "c1".into(),
        };
        let decision = evaluate_intent(&intent, &caps, &exposure(), None, Utc::now());
        assert!(exposure().total_risk_pct + decision.approved_risk_pct <= caps.total_risk_pct + 1e-9);
    }

    #[test]
    fn hard_breach_rejects_when_policy_says_reject() {
        let mut caps = PolicyCaps::default();
        caps.total_risk_pct = 5.0;
        caps.on_hard_breach = OnHardBreach::Reject;
        let intent = ExecutionIntent {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            variant: "aggressive".into(),
            confidence: 1.0,
            corr_id: "c1".into(),
        };
        let mut exp = exposure();
        exp.total_risk_pct = 4.9;
        let decision = evaluate_intent(&intent, &caps, &exp, None, Utc::now());
        assert_eq!(decision.outcome, PortfolioOutcome::Rejected);
    }

    #[test]
    fn factor_beta_cap_breaches_before_correlation_check() {
        let mut caps = PolicyCaps::default();
        caps.per_factor_beta_abs.insert("momentum".into(), 0.5);
        let intent = ExecutionIntent {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            variant: "base".into(),
            confidence: 1.0,
            corr_id: "c1".into(),
        };
        let mut exp = exposure();
        exp.per_factor_beta.insert("momentum".into(), 0.9);
        let decision = evaluate_intent(&intent, &caps, &exp, Some("majors"), Utc::now());
        assert_eq!(decision.outcome, PortfolioOutcome::Rejected);
        assert_eq!(decision.reason.as_deref(), Some("factor_beta_cap"));
    }

    #[test]
    fn correlation_hard_cap_breaches_same_cluster_exposure() {
        let mut caps = PolicyCaps::default();
        caps.correlation.default_same_cluster = 0.9;
        caps.correlation.hard = 0.85;
        caps.symbol_clusters.insert("ETHUSDT".into(), "majors".into());
        let intent = ExecutionIntent {
            symbol: "ETHUSDT".into(),
            side: Side::Buy,
            variant: "base".into(),
            confidence: 1.0,
            corr_id: "c1".into(),
        };
        let mut exp = exposure();
        exp.per_cluster_pct.insert("majors".into(), 2.0);
        let decision = evaluate_intent(&intent, &caps, &exp, Some("majors"), Utc::now());
        assert_eq!(decision.outcome, PortfolioOutcome::Rejected);
        assert_eq!(decision.reason.as_deref(), Some("correlation_hard_cap"));
    }
}
