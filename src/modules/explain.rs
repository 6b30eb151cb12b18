//! Explainability Reporter (spec §4.N component N).
//!
//! Reconstructs a "why chosen" card from the memory the other components
//! already publish: feasibility scores, the risk sentinel, the last emitted
//! action bundle, and the operator's dialog result. No component calls this
//! one directly — it builds its memory by subscribing to the same bus
//! topics everything else does, then answers `explain(corrId)` from that
//! memory. Cards are idempotent by `corrId`: once built, a card is never
//! recomputed, only replayed from cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::audit::AuditSink;
use crate::bus::topics::{DialogComplete, ExplainCard, ExplainExecSummary, ExplainScore};
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};
use crate::models::{ActionBundle, Feasibility, FindingType, PlanId, Recommend, RiskState, Severity};

/// Latest known facts for one `corrId`, accumulated from the bus (spec
/// §4.N "Given corrId, read latest: memory snapshot, variants, feasibility,
/// operator result, last emitted action bundle").
#[derive(Debug, Clone, Default)]
struct CorrMemory {
    feasibility: Option<Feasibility>,
    action_bundle: Option<ActionBundle>,
    operator_result: Option<DialogComplete>,
}

pub struct ExplainabilityReporter {
    memory: parking_lot::RwLock<HashMap<String, CorrMemory>>,
    global_risk: parking_lot::RwLock<RiskState>,
    cards: parking_lot::Mutex<HashMap<String, ExplainCard>>,
    bus: parking_lot::RwLock<Option<Arc<EventBus>>>,
    audit: Arc<AuditSink>,
}

impl ExplainabilityReporter {
    pub fn new(audit: Arc<AuditSink>) -> Arc<Self> {
        Arc::new(Self {
            memory: parking_lot::RwLock::new(HashMap::new()),
            global_risk: parking_lot::RwLock::new(RiskState::default()),
            cards: parking_lot::Mutex::new(HashMap::new()),
            bus: parking_lot::RwLock::new(None),
            audit,
        })
    }

    fn record_feasibility(&self, corr_id: &str, feasibility: Feasibility) {
        self.memory.write().entry(corr_id.to_string()).or_default().feasibility = Some(feasibility);
    }

    fn record_bundle(&self, corr_id: &str, bundle: ActionBundle) {
        self.memory.write().entry(corr_id.to_string()).or_default().action_bundle = Some(bundle);
    }

    /// `DialogComplete.sessionId` is the dialog's handle on the same
    /// decision's `corrId` (the orchestrator opens a session per bundle it
    /// puts to the operator, naming it after that bundle's `corrId`).
    fn record_dialog(&self, result: DialogComplete) {
        let corr_id = result.session_id.clone();
        self.memory.write().entry(corr_id).or_default().operator_result = Some(result);
    }

    fn record_risk_state(&self, state: RiskState) {
        *self.global_risk.write() = state;
    }

    /// Build (or replay) the explain card for `corrId` (spec §4.N
    /// "Idempotent by corrId").
    pub async fn explain(&self, corr_id: &str) -> Option<ExplainCard> {
        if let Some(card) = self.cards.lock().get(corr_id).cloned() {
            return Some(card);
        }
        let snapshot = self.memory.read().get(corr_id).cloned()?;
        let risk = *self.global_risk.read();

        let selected_plan = snapshot
            .operator_result
            .as_ref()
            .and_then(|r| r.selected_plan)
            .or_else(|| best_plan(snapshot.feasibility.as_ref()));

        let decided_by = if snapshot.operator_result.as_ref().and_then(|r| r.selected_plan).is_some() {
            "operator".to_string()
        } else if selected_plan.is_some() {
            "auto".to_string()
        } else {
            "none".to_string()
        };

        let weights = snapshot
            .feasibility
            .as_ref()
            .map(plan_weights)
            .unwrap_or_default();

        let selected_score = selected_plan
            .and_then(|id| snapshot.feasibility.as_ref().and_then(|f| f.plan(id)))
            .map(|p| p.score);

        let alt_scores = snapshot
            .feasibility
            .as_ref()
            .map(|f| top_alternative_scores(f, selected_plan))
            .unwrap_or_default();

        let top_findings = selected_plan
            .and_then(|id| snapshot.feasibility.as_ref().and_then(|f| f.plan(id)))
            .map(top_six_findings)
            .unwrap_or_default();

        let policy_compliance = selected_plan
            .and_then(|id| snapshot.feasibility.as_ref().and_then(|f| f.plan(id)))
            .map(policy_compliance_summary)
            .unwrap_or_default();

        let exec_summary = snapshot.action_bundle.as_ref().map(exec_summary_of);

        let mut why_tree = Vec::new();
        why_tree.push(format!("risk.sentinel={:?} level={:?}", risk.sentinel, risk.level));
        if let Some(plan) = selected_plan {
            why_tree.push(format!("selected plan {plan:?} via {decided_by}"));
        }
        if let Some(score) = selected_score {
            why_tree.push(format!("selected plan score={score:.3}"));
        }
        if let Some(exec) = &exec_summary {
            why_tree.push(format!(
                "final bundle: {} children, reduceOnlyRatio={:.2}, postOnly={}, notional={:.2}",
                exec.child_count, exec.reduce_only_ratio, exec.post_only_count, exec.notional
            ));
        }

        let next_steps = next_steps_for(
            selected_plan
                .and_then(|id| snapshot.feasibility.as_ref().and_then(|f| f.plan(id))),
        );

        let card = ExplainCard {
            corr_id: corr_id.to_string(),
            posture: format!("{:?}", risk.level),
            sentinel: risk.sentinel,
            decided_by,
            selected_plan,
            weights,
            selected_score,
            alt_scores,
            top_findings,
            policy_compliance,
            exec_summary,
            why_tree,
            next_steps,
        };

        self.cards.lock().insert(corr_id.to_string(), card.clone());
        Some(card)
    }

    async fn publish(&self, card: &ExplainCard) {
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::with_correlation(
                Topic::VivoExplainCard,
                "explain_reporter",
                Payload::ExplainCard(card.clone()),
                card.corr_id.clone(),
            );
            bus.publish(Topic::VivoExplainCard, envelope).await;
        }
        self.audit
            .record("explain_reporter", Some(&card.corr_id), "card_built", &card.decided_by)
            .await;
    }
}

fn best_plan(feasibility: Option<&Feasibility>) -> Option<PlanId> {
    feasibility?
        .plans
        .iter()
        .filter(|p| p.recommend == Recommend::Ok)
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        .map(|p| p.plan_id)
}

fn plan_weights(feasibility: &Feasibility) -> HashMap<String, f64> {
    let total: f64 = feasibility.plans.iter().map(|p| p.score.max(0.0)).sum();
    feasibility
        .plans
        .iter()
        .map(|p| {
            let w = if total > 0.0 { p.score.max(0.0) / total } else { 0.0 };
            (format!("{:?}", p.plan_id), w)
        })
        .collect()
}

fn top_alternative_scores(feasibility: &Feasibility, selected: Option<PlanId>) -> Vec<ExplainScore> {
    let mut rest: Vec<_> = feasibility
        .plans
        .iter()
        .filter(|p| Some(p.plan_id) != selected)
        .collect();
    rest.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    rest.into_iter()
        .take(4)
        .map(|p| ExplainScore { plan_id: p.plan_id, variant: p.variant.clone(), score: p.score })
        .collect()
}

/// Top-6 findings across all symbols of a plan, ERROR > WARN > INFO (spec
/// §4.N).
fn top_six_findings(plan: &crate::models::PlanFeasibility) -> Vec<String> {
    let mut all: Vec<(Severity, String)> = plan
        .symbols
        .iter()
        .flat_map(|s| {
            s.findings
                .iter()
                .map(move |f| (f.severity, format!("{}: {:?}", s.symbol, f.kind)))
        })
        .collect();
    all.sort_by(|a, b| b.0.cmp(&a.0));
    all.into_iter().take(6).map(|(_, text)| text).collect()
}

fn policy_compliance_summary(plan: &crate::models::PlanFeasibility) -> Vec<String> {
    plan.symbols
        .iter()
        .filter(|s| {
            s.findings
                .iter()
                .any(|f| matches!(f.kind, FindingType::Whitelist | FindingType::TargetPct))
        })
        .map(|s| {
            let violated = s
                .findings
                .iter()
                .any(|f| f.kind.is_hard());
            format!("{}: {}", s.symbol, if violated { "violation" } else { "eligible" })
        })
        .collect()
}

fn exec_summary_of(bundle: &ActionBundle) -> ExplainExecSummary {
    let child_count = bundle.children.len();
    let reduce_only = bundle.children.iter().filter(|c| c.reduce_only).count();
    let post_only_count = bundle.children.iter().filter(|c| c.post_only).count();
    let notional = bundle
        .children
        .iter()
        .map(|c| c.qty * c.price.unwrap_or(0.0))
        .sum();
    ExplainExecSummary {
        child_count,
        reduce_only_ratio: if child_count > 0 { reduce_only as f64 / child_count as f64 } else { 0.0 },
        post_only_count,
        notional,
    }
}

/// At most 6 suggested next steps, derived from the selected plan's hard
/// findings (spec §4.N "≤6 suggested next steps").
fn next_steps_for(plan: Option<&crate::models::PlanFeasibility>) -> Vec<String> {
    let Some(plan) = plan else {
        return vec!["No plan selected; review feasibility inputs.".to_string()];
    };
    let mut steps: Vec<String> = plan
        .symbols
        .iter()
        .flat_map(|s| {
            s.findings
                .iter()
                .filter(|f| f.kind.is_hard())
                .map(move |f| {
                    f.quick_fix
                        .clone()
                        .unwrap_or_else(|| format!("Resolve {:?} on {}", f.kind, s.symbol))
                })
        })
        .collect();
    if steps.is_empty() {
        steps.push("No blocking findings; monitor execution.".to_string());
    }
    steps.truncate(6);
    steps
}

#[async_trait]
impl Module for Arc<ExplainabilityReporter> {
    fn name(&self) -> &'static str {
        "explain_reporter"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, _config: &serde_json::Value) -> OpsResult<()> {
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::VivoFeasibility,
            "explain_reporter.feasibility",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::Feasibility(feasibility) = envelope.payload {
                        this.record_feasibility(&envelope.correlation_id, feasibility);
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::RiskState,
            "explain_reporter.risk_state",
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
            Topic::VivoDialogComplete,
            "explain_reporter.dialog",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::DialogComplete(result) = envelope.payload {
                        this.record_dialog(result);
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::OpsActions,
            "explain_reporter.actions",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    let corr_id = envelope.correlation_id.clone();
                    if let Payload::Actions(bundle) = envelope.payload {
                        this.record_bundle(&corr_id, bundle);
                        if let Some(card) = this.explain(&corr_id).await {
                            info!(corr_id = %card.corr_id, decided_by = %card.decided_by, "explain card built");
                            this.publish(&card).await;
                        }
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
            detail: format!("cards_cached={}", self.cards.lock().len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Finding, PlanFeasibility, Side, SymbolFeasibility};

    async fn test_reporter() -> Arc<ExplainabilityReporter> {
        let audit = Arc::new(
            AuditSink::open(std::env::temp_dir().join("opsctl_test_audit_explain.jsonl"))
                .await
                .unwrap(),
        );
        ExplainabilityReporter::new(audit)
    }

    fn feasibility() -> Feasibility {
        Feasibility {
            overall_score: 0.8,
            plans: vec![
                PlanFeasibility {
                    plan_id: PlanId::A,
                    variant: "aggressive".into(),
                    score: 0.9,
                    symbols: vec![SymbolFeasibility {
                        symbol: "BTCUSDT".into(),
                        findings: vec![Finding {
                            kind: FindingType::Trim,
                            severity: Severity::Warn,
                            quick_fix: Some("Reduce notional by 10%".into()),
                        }],
                    }],
                    recommend: Recommend::Ok,
                },
                PlanFeasibility {
                    plan_id: PlanId::B,
                    variant: "conservative".into(),
                    score: 0.5,
                    symbols: vec![],
                    recommend: Recommend::Ok,
                },
            ],
        }
    }

    #[tokio::test]
    async fn builds_card_from_feasibility_and_bundle_without_operator_choice() {
        let reporter = test_reporter().await;
        reporter.record_feasibility("c1", feasibility());
        reporter.record_bundle(
            "c1",
            ActionBundle {
                plan_id: PlanId::A,
                corr_id: "c1".into(),
                children: vec![crate::models::ActionChild {
                    symbol: "BTCUSDT".into(),
                    side: Side::Buy,
                    order_type: crate::models::OrderType::Limit,
                    qty: 1.0,
                    price: Some(50_000.0),
                    reduce_only: false,
                    post_only: false,
                    meta: Default::default(),
                }],
            },
        );
        let card = reporter.explain("c1").await.expect("card");
        assert_eq!(card.selected_plan, Some(PlanId::A));
        assert_eq!(card.decided_by, "auto");
        assert_eq!(card.exec_summary.as_ref().unwrap().child_count, 1);
        assert!(!card.next_steps.is_empty());
    }

    #[tokio::test]
    async fn card_is_idempotent_by_corr_id() {
        let reporter = test_reporter().await;
        reporter.record_feasibility("c2", feasibility());
        let first = reporter.explain("c2").await.unwrap();
        reporter.record_feasibility("c2", {
            let mut f = feasibility();
            f.plans[0].score = 0.1;
            f
        });
        let second = reporter.explain("c2").await.unwrap();
        assert_eq!(first.selected_score, second.selected_score);
    }

    #[tokio::test]
    async fn operator_choice_overrides_auto_selection() {
        let reporter = test_reporter().await;
        reporter.record_feasibility("c3", feasibility());
        reporter.record_dialog(DialogComplete {
            session_id: "c3".into(),
            selected_plan: Some(PlanId::B),
            user_response: Some("approve".into()),
            fallback_reason: None,
            total_duration_ms: 1200,
            halted: false,
        });
        let card = reporter.explain("c3").await.unwrap();
        assert_eq!(card.selected_plan, Some(PlanId::B));
        assert_eq!(card.decided_by, "operator");
    }
}
