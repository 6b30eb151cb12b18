//! Execution Guardrail Bridge (spec §4.L, component L).
//!
//! Consumes a proposed action bundle plus the current risk state and
//! feasibility report, applies the ordered mutation rules in spec §4.L, and
//! emits the final bundle, a diff report, and an audit record. Idempotent
//! per `corrId` (spec §8 property 4: REDUCE_ONLY closure).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditSink;
use crate::bus::topics::GuardrailReport;
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::{OpsError, OpsResult};
use crate::lifecycle::{Health, HealthState, Module};
use crate::models::{
    ActionBundle, ActionChild, Feasibility, FindingType, OrderType, Recommend, RiskState, Sentinel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardrailMode {
    Normal,
    Slowdown,
    ReduceOnly,
}

impl GuardrailMode {
    fn name(self) -> &'static str {
        match self {
            GuardrailMode::Normal => "NORMAL",
            GuardrailMode::Slowdown => "SLOWDOWN",
            GuardrailMode::ReduceOnly => "REDUCE_ONLY",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub twap_bump_ms: u64,
    pub iceberg_bump: f64,
    pub max_iceberg: f64,
    pub notional_trim_ratio: f64,
    pub diff_cap: usize,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            twap_bump_ms: 300,
            iceberg_bump: 0.03,
            max_iceberg: 0.5,
            notional_trim_ratio: 0.5,
            diff_cap: 20,
        }
    }
}

pub struct GuardrailOutput {
    pub after: ActionBundle,
    pub changes: Vec<String>,
    pub blocked_symbols: Vec<String>,
    pub mode: GuardrailMode,
}

/// Ordered mutation pipeline (spec §4.L "Rules, in order").
pub fn apply_guardrails(
    risk: &RiskState,
    feasibility: Option<&Feasibility>,
    mut bundle: ActionBundle,
    cfg: &GuardrailConfig,
) -> GuardrailOutput {
    let mut changes = Vec::new();
    let mut blocked = HashSet::new();
    let mut mode = GuardrailMode::Normal;

    // Rule 2: sentinel hard rules.
    if matches!(risk.sentinel, Sentinel::CircuitBreaker | Sentinel::HaltPartial) {
        mode = GuardrailMode::ReduceOnly;
        bundle.children.retain(|c| {
            let drop = matches!(c.side, crate::models::Side::Buy) && !c.reduce_only;
            if drop {
                diff_line(&mut changes, c, "DROP", None);
            }
            !drop
        });
        for child in bundle.children.iter_mut() {
            let before = (child.reduce_only, child.post_only, child.order_type);
            child.reduce_only = true;
            child.post_only = true;
            if child.order_type == OrderType::Limit {
                child.order_type = OrderType::PostOnly;
            }
            if before != (child.reduce_only, child.post_only, child.order_type) {
                diff_line(&mut changes, child, "REDUCE_ONLY_POST_ONLY", None);
            }
        }
    } else if matches!(risk.sentinel, Sentinel::Slowdown) {
        // Rule 3: SLOWDOWN enforcement.
        mode = GuardrailMode::Slowdown;
        for child in bundle.children.iter_mut() {
            if !child.post_only {
                child.post_only = true;
                diff_line(&mut changes, child, "POST_ONLY", None);
            }
            if child.order_type == OrderType::Limit {
                child.order_type = OrderType::PostOnly;
            }
            child.meta.twap_ms = Some(child.meta.twap_ms.unwrap_or(0) + cfg.twap_bump_ms);
            let new_iceberg = (child.meta.iceberg.unwrap_or(0.0) + cfg.iceberg_bump)
                .clamp(0.05, cfg.max_iceberg);
            child.meta.iceberg = Some(new_iceberg);
        }
    }

    // Rule 4: feasibility per-symbol findings.
    if let Some(feas) = feasibility {
        if let Some(plan) = feas.plan(bundle.plan_id) {
            for sym in &plan.symbols {
                let hard = sym.findings.iter().any(|f| f.kind.is_hard());
                let trim = sym
                    .findings
                    .iter()
                    .find(|f| matches!(f.kind, FindingType::Trim));
                let percent_price = sym.findings.iter().any(|f| matches!(f.kind, FindingType::PercentPrice));
                let min_notional = sym.findings.iter().any(|f| matches!(f.kind, FindingType::MinNotional));

                for child in bundle.children.iter_mut().filter(|c| c.symbol == sym.symbol) {
                    if hard && !child.reduce_only {
                        child.qty = 0.0;
                        child.post_only = true;
                        blocked.insert(sym.symbol.clone());
                        diff_line(&mut changes, child, "QTY_ZERO_HARD_FINDING", None);
                    }
                    if let Some(t) = trim {
                        let _ = t;
                        let before = child.qty;
                        child.qty *= cfg.notional_trim_ratio;
                        diff_line(&mut changes, child, "QTY", Some((before, child.qty)));
                    }
                    if percent_price {
                        child.meta.twap_ms = Some(child.meta.twap_ms.unwrap_or(0) + cfg.twap_bump_ms / 2);
                        child.post_only = true;
                    }
                    if min_notional {
                        child.qty = 0.0;
                        diff_line(&mut changes, child, "QTY_ZERO_MIN_NOTIONAL", None);
                    }
                }
            }

            // Rule 5: plan-level reject.
            if plan.recommend == Recommend::Reject {
                for child in bundle.children.iter_mut() {
                    child.reduce_only = true;
                    child.post_only = true;
                }
                if !matches!(mode, GuardrailMode::Slowdown) {
                    mode = GuardrailMode::ReduceOnly;
                }
            }
        }
    }

    // Rule 6: drop non-positive quantity children.
    let before_count = bundle.children.len();
    bundle.children.retain(|c| c.qty > 0.0);
    if bundle.children.len() != before_count {
        changes.push(format!("DROP {} children qty<=0", before_count - bundle.children.len()));
    }

    changes.truncate(cfg.diff_cap);

    GuardrailOutput {
        after: bundle,
        changes,
        blocked_symbols: blocked.into_iter().collect(),
        mode,
    }
}

fn diff_line(changes: &mut Vec<String>, child: &ActionChild, kind: &str, qty_change: Option<(f64, f64)>) {
    let key = format!("{}:{:?}:{:?}", child.symbol, child.side, child.order_type);
    match (kind, qty_change) {
        ("QTY", Some((a, b))) => changes.push(format!("QTY {key}: {a}->{b}")),
        _ => changes.push(format!("{kind} {key}")),
    }
}

pub struct GuardrailBridge {
    seen_corr_ids: Mutex<HashSet<String>>,
    config: Mutex<GuardrailConfig>,
    bus: Mutex<Option<Arc<EventBus>>>,
    audit: Arc<AuditSink>,
    latest_risk: Mutex<RiskState>,
    latest_feasibility: Mutex<Option<Feasibility>>,
}

impl GuardrailBridge {
    pub fn new(audit: Arc<AuditSink>, config: GuardrailConfig) -> Arc<Self> {
        Arc::new(Self {
            seen_corr_ids: Mutex::new(HashSet::new()),
            config: Mutex::new(config),
            bus: Mutex::new(None),
            audit,
            latest_risk: Mutex::new(RiskState::default()),
            latest_feasibility: Mutex::new(None),
        })
    }

    fn record_risk_state(&self, risk: RiskState) {
        *self.latest_risk.lock() = risk;
    }

    fn record_feasibility(&self, feasibility: Feasibility) {
        *self.latest_feasibility.lock() = Some(feasibility);
    }

    /// Process one proposed bundle through the full rule chain (spec §4.L).
    pub async fn process(
        &self,
        corr_id: &str,
        risk: RiskState,
        feasibility: Option<Feasibility>,
        bundle: ActionBundle,
    ) -> OpsResult<()> {
        // Rule 1: idempotency.
        {
            let mut seen = self.seen_corr_ids.lock();
            if seen.contains(corr_id) {
                return Err(OpsError::IdempotentDuplicate(corr_id.to_string()));
            }
            seen.insert(corr_id.to_string());
            if seen.len() > 100_000 {
                seen.clear();
            }
        }

        let cfg = self.config.lock().clone();
        let output = apply_guardrails(&risk, feasibility.as_ref(), bundle, &cfg);

        info!(
            corr_id,
            mode = output.mode.name(),
            changes = output.changes.len(),
            "guardrail bridge processed bundle"
        );

        if let Some(bus) = self.bus.lock().clone() {
            let actions_envelope = Envelope::with_correlation(
                Topic::OpsActions,
                "guardrail_bridge",
                Payload::Actions(output.after.clone()),
                corr_id.to_string(),
            );
            bus.publish(Topic::OpsActions, actions_envelope).await;

            let report = GuardrailReport {
                mode: output.mode.name().to_string(),
                changes: output.changes.clone(),
                blocked_symbols: output.blocked_symbols.clone(),
            };
            let report_envelope = Envelope::with_correlation(
                Topic::OpsGuardrailReport,
                "guardrail_bridge",
                Payload::GuardrailReport(report),
                corr_id.to_string(),
            );
            bus.publish(Topic::OpsGuardrailReport, report_envelope).await;
        }

        let first_six: Vec<_> = output.changes.iter().take(6).cloned().collect();
        self.audit
            .record(
                "guardrail_bridge",
                Some(corr_id),
                "guardrail_applied",
                &first_six.join("; "),
            )
            .await;
        Ok(())
    }
}

#[async_trait]
impl Module for Arc<GuardrailBridge> {
    fn name(&self) -> &'static str {
        "guardrail_bridge"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(cfg) = serde_json::from_value::<GuardrailConfig>(config.clone()) {
            *self.config.lock() = cfg;
        }
        *self.bus.lock() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::RiskState,
            "guardrail_bridge.risk_state",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::RiskState(state) = envelope.payload {
                        this.record_risk_state(state);
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::VivoFeasibility,
            "guardrail_bridge.feasibility",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::Feasibility(feasibility) = envelope.payload {
                        this.record_feasibility(feasibility);
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::OpsActionsProposed,
            "guardrail_bridge.proposed",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::ActionsProposed(bundle) = envelope.payload {
                        let risk = this.latest_risk.lock().clone();
                        let feasibility = this.latest_feasibility.lock().clone();
                        let corr_id = envelope.correlation_id.clone();
                        match this.process(&corr_id, risk, feasibility, bundle).await {
                            Ok(()) | Err(OpsError::IdempotentDuplicate(_)) => {}
                            Err(e) => return Err(e),
                        }
                    }
                    Ok(())
                })
            }),
            SubscribeOptions {
                idempotent: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) -> OpsResult<()> {
        Ok(())
    }

    async fn health_snapshot(&self) -> Health {
        Health {
            state: HealthState::Healthy,
            detail: format!("seen_corr_ids={}", self.seen_corr_ids.lock().len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChildMeta, PlanId, Side};

    fn bundle_with_child(child: ActionChild) -> ActionBundle {
        ActionBundle {
            plan_id: PlanId::A,
            corr_id: "c1".to_string(),
            children: vec![child],
        }
    }

    #[test]
    fn s2_slowdown_bumps_twap_and_iceberg() {
        let risk = RiskState {
            level: crate::models::RiskLevel::Amber,
            sentinel: Sentinel::Slowdown,
        };
        let child = ActionChild {
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: 1.0,
            price: None,
            reduce_only: false,
            post_only: false,
            meta: ChildMeta {
                twap_ms: Some(500),
                iceberg: Some(0.10),
            },
        };
        let cfg = GuardrailConfig {
            twap_bump_ms: 300,
            iceberg_bump: 0.03,
            ..Default::default()
        };
        let out = apply_guardrails(&risk, None, bundle_with_child(child), &cfg);
        assert_eq!(out.mode.name(), "SLOWDOWN");
        let c = &out.after.children[0];
        assert_eq!(c.order_type, OrderType::PostOnly);
        assert!(c.post_only);
        assert_eq!(c.meta.twap_ms, Some(800));
        assert!((c.meta.iceberg.unwrap() - 0.13).abs() < 1e-9);
    }

    #[test]
    fn property4_reduce_only_closure_under_circuit_breaker() {
        let risk = RiskState {
            level: crate::models::RiskLevel::Red,
            sentinel: Sentinel::CircuitBreaker,
        };
        let buy = ActionChild {
            symbol: "ETHUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty: 2.0,
            price: None,
            reduce_only: false,
            post_only: false,
            meta: ChildMeta::default(),
        };
        let out = apply_guardrails(&risk, None, bundle_with_child(buy), &GuardrailConfig::default());
        // BUY opening with no reduce_only is dropped entirely under hard sentinel.
        assert!(out.after.children.is_empty());
    }

    #[test]
    fn zero_qty_children_are_dropped() {
        let risk = RiskState::default();
        let child = ActionChild {
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            order_type: OrderType::Market,
            qty: 0.0,
            price: None,
            reduce_only: true,
            post_only: false,
            meta: ChildMeta::default(),
        };
        let out = apply_guardrails(&risk, None, bundle_with_child(child), &GuardrailConfig::default());
        assert!(out.after.children.is_empty());
    }
}
