//! Session Pacing Planner (spec §4.I, component I).
//!
//! Recomputes a multi-factor quota plan on every relevant input event and on
//! `clock.tick1m` (spec §4.I "Cadence"). All factors are clamped to `[0,1]`
//! so the plan is monotone in its inputs (spec §8 property 7).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::AuditSink;
use crate::bus::topics::PacingPlan;
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};
use crate::models::{RiskLevel, RiskState, Sentinel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub weight: f64,
}

impl SessionWindow {
    /// Crossing-midnight windows are allowed (spec §4.I "fSession").
    fn contains(&self, now: NaiveTime) -> bool {
        if self.start <= self.end {
            now >= self.start && now < self.end
        } else {
            now >= self.start || now < self.end
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquiditySnapshot {
    pub spread_factor: f64,
    pub depth_factor: f64,
    pub ws_lag_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcaSnapshot {
    pub slip_bp: f64,
    pub mark_out_bp: f64,
    pub slip_hard_bp: f64,
    pub slip_soft_bp: f64,
    pub mark_out_hard_bp: f64,
    pub mark_out_soft_bp: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBudget {
    pub request_weight_per_min: f64,
    pub orders_per_10s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingPolicy {
    pub windows: Vec<SessionWindow>,
    pub base_max_new_positions: u32,
    pub base_child_per_min: u32,
    pub base_risk_budget_usd: f64,
    pub slip_bp_soft: f64,
}

impl Default for PacingPolicy {
    fn default() -> Self {
        Self {
            windows: vec![SessionWindow {
                start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
                weight: 1.0,
            }],
            base_max_new_positions: 10,
            base_child_per_min: 120,
            base_risk_budget_usd: 5_000.0,
            slip_bp_soft: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PacingInputs {
    pub risk: RiskState,
    pub liquidity: Option<LiquiditySnapshot>,
    pub tca: Option<TcaSnapshot>,
    pub rate_limit: Option<RateLimitBudget>,
}

/// `fSession`: weight of the highest-weight window containing `now`.
fn f_session(policy: &PacingPolicy, now: NaiveTime) -> f64 {
    policy
        .windows
        .iter()
        .filter(|w| w.contains(now))
        .map(|w| w.weight)
        .fold(0.0_f64, f64::max)
        .clamp(0.0, 1.0)
}

/// `fLiq`: product of spread/depth/ws-lag factors, clamped `[0.4, 1]`.
fn f_liq(liq: &Option<LiquiditySnapshot>) -> f64 {
    match liq {
        Some(l) => (l.spread_factor * l.depth_factor * l.ws_lag_factor).clamp(0.4, 1.0),
        None => 1.0,
    }
}

/// `fRisk`: 0 if sentinel != NORMAL (reduceOnly), else by risk level.
fn f_risk(risk: &RiskState) -> (f64, bool) {
    if risk.sentinel != Sentinel::Normal {
        return (0.0, true);
    }
    let f = match risk.level {
        RiskLevel::Red => 0.4,
        RiskLevel::Amber => 0.7,
        RiskLevel::Green => 1.0,
    };
    (f, false)
}

/// `fTca`: thresholds on slippage/mark-out.
fn f_tca(tca: &Option<TcaSnapshot>) -> f64 {
    match tca {
        Some(t) => {
            let hard = t.slip_bp > t.slip_hard_bp || t.mark_out_bp > t.mark_out_hard_bp;
            let soft = t.slip_bp > t.slip_soft_bp || t.mark_out_bp > t.mark_out_soft_bp;
            if hard {
                0.2
            } else if soft {
                0.6
            } else {
                1.0
            }
        }
        None => 1.0,
    }
}

/// `rateCap = min(requestWeightPerMin*0.9, ordersPer10s*6*0.9)` (spec §4.I,
/// §8 scenario S5).
fn rate_cap(budget: &Option<RateLimitBudget>) -> f64 {
    match budget {
        Some(b) => (b.request_weight_per_min * 0.9).min(b.orders_per_10s * 6.0 * 0.9),
        None => f64::INFINITY,
    }
}

/// Compute the pacing plan (spec §4.I "Plan").
pub fn compute_plan(policy: &PacingPolicy, now: chrono::DateTime<Utc>, inputs: &PacingInputs) -> PacingPlan {
    let f_sess = f_session(policy, now.time());
    let f_liq_v = f_liq(&inputs.liquidity);
    let (f_risk_v, reduce_only) = f_risk(&inputs.risk);
    let f_tca_v = f_tca(&inputs.tca);

    let factor = (f_sess * f_liq_v * f_risk_v * f_tca_v).clamp(0.0, 1.0);

    let max_new_positions = if reduce_only {
        0
    } else {
        (policy.base_max_new_positions as f64 * factor).floor() as u32
    };

    let cap = rate_cap(&inputs.rate_limit);
    let raw_child_per_min = (policy.base_child_per_min as f64 * factor).floor();
    let max_child_per_min = raw_child_per_min.min(cap) as u32;

    let risk_budget_usd = if reduce_only {
        (policy.base_risk_budget_usd * 0.25).floor()
    } else {
        (policy.base_risk_budget_usd * factor).floor()
    };

    let slip_soft_bp = if f_tca_v > 0.0 {
        (policy.slip_bp_soft * (1.0 / f_tca_v)).round()
    } else {
        policy.slip_bp_soft
    };

    PacingPlan {
        max_new_positions,
        max_child_per_min,
        risk_budget_usd,
        slip_soft_bp,
        reduce_only,
    }
}

pub struct PacingPlanner {
    policy: parking_lot::RwLock<PacingPolicy>,
    inputs: parking_lot::RwLock<PacingInputs>,
    bus: parking_lot::RwLock<Option<Arc<EventBus>>>,
    audit: Arc<AuditSink>,
}

impl PacingPlanner {
    pub fn new(audit: Arc<AuditSink>, policy: PacingPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy: parking_lot::RwLock::new(policy),
            inputs: parking_lot::RwLock::new(PacingInputs::default()),
            bus: parking_lot::RwLock::new(None),
            audit,
        })
    }

    pub async fn recompute_and_publish(&self) {
        let policy = self.policy.read().clone();
        let inputs = self.inputs.read().clone();
        let plan = compute_plan(&policy, Utc::now(), &inputs);
        debug!(?plan, "pacing plan recomputed");
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::new(Topic::VivoPacingPlan, "pacing_planner", Payload::PacingPlan(plan));
            bus.publish(Topic::VivoPacingPlan, envelope).await;
        }
    }

    pub fn update_risk(&self, risk: RiskState) {
        self.inputs.write().risk = risk;
    }

    pub fn update_liquidity(&self, liq: LiquiditySnapshot) {
        self.inputs.write().liquidity = Some(liq);
    }

    pub fn update_tca(&self, tca: TcaSnapshot) {
        self.inputs.write().tca = Some(tca);
    }

    pub fn update_rate_limit(&self, budget: RateLimitBudget) {
        self.inputs.write().rate_limit = Some(budget);
    }
}

impl Clone for PacingPolicy {
    fn clone(&self) -> Self {
        Self {
            windows: self.windows.clone(),
            base_max_new_positions: self.base_max_new_positions,
            base_child_per_min: self.base_child_per_min,
            base_risk_budget_usd: self.base_risk_budget_usd,
            slip_bp_soft: self.slip_bp_soft,
        }
    }
}

#[async_trait]
impl Module for Arc<PacingPlanner> {
    fn name(&self) -> &'static str {
        "pacing_planner"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(policy) = serde_json::from_value::<PacingPolicy>(config.clone()) {
            *self.policy.write() = policy;
        }
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::RiskState,
            "pacing_planner.risk",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::RiskState(risk) = envelope.payload {
                        this.update_risk(risk);
                        this.recompute_and_publish().await;
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::ClockTick1m,
            "pacing_planner.tick",
            Arc::new(move |_envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    this.recompute_and_publish().await;
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

    #[test]
    fn s5_pacing_rate_cap() {
        let budget = Some(RateLimitBudget {
            request_weight_per_min: 4800.0,
            orders_per_10s: 20.0,
        });
        let cap = rate_cap(&budget);
        assert!((cap - 108.0).abs() < 1e-9);

        let policy = PacingPolicy {
            base_child_per_min: 120,
            ..PacingPolicy::default()
        };
        let raw = (policy.base_child_per_min as f64 * 0.5).floor();
        let result = raw.min(cap) as u32;
        assert_eq!(result, 60);
    }

    #[test]
    fn property7_pacing_monotone_in_factors() {
        let policy = PacingPolicy::default();
        let now = Utc::now();
        let high = PacingInputs {
            risk: RiskState::default(),
            liquidity: Some(LiquiditySnapshot {
                spread_factor: 1.0,
                depth_factor: 1.0,
                ws_lag_factor: 1.0,
            }),
            tca: None,
            rate_limit: None,
        };
        let low = PacingInputs {
            risk: RiskState {
                level: RiskLevel::Amber,
                sentinel: Sentinel::Normal,
            },
            liquidity: Some(LiquiditySnapshot {
                spread_factor: 0.5,
                depth_factor: 0.9,
                ws_lag_factor: 0.9,
            }),
            tca: None,
            rate_limit: None,
        };
        let plan_high = compute_plan(&policy, now, &high);
        let plan_low = compute_plan(&policy, now, &low);
        assert!(plan_low.max_new_positions <= plan_high.max_new_positions);
        assert!(plan_low.max_child_per_min <= plan_high.max_child_per_min);
        assert!(plan_low.risk_budget_usd <= plan_high.risk_budget_usd);
    }

    #[test]
    fn reduce_only_zeroes_new_positions() {
        let policy = PacingPolicy::default();
        let inputs = PacingInputs {
            risk: RiskState {
                level: RiskLevel::Green,
                sentinel: Sentinel::Slowdown,
            },
            ..Default::default()
        };
        let plan = compute_plan(&policy, Utc::now(), &inputs);
        assert_eq!(plan.max_new_positions, 0);
        assert!(plan.reduce_only);
    }
}
