//! Spot Cash Allocator (spec §4.K, component K).
//!
//! Computes a target spot USD holding from equity, diffs it against current
//! non-stable holdings, and generates BUY/SELL legs subject to the eligible
//! symbol pool, `minNotional`, and sentinel gating (spec §4.K "Legs").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::AuditSink;
use crate::bus::topics::{RebalanceLeg, RebalanceSide, SpotBalance, SpotRebalance};
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};
use crate::models::Sentinel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibleSymbol {
    pub symbol: String,
    pub dominance_tilt: f64,
    pub expected_move_pct: f64,
    pub r_multiple: f64,
    pub min_notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorPolicy {
    pub threshold_equity: f64,
    pub base_pct: f64,
    pub min_target_pct: f64,
    pub eligible: Vec<EligibleSymbol>,
}

impl Default for AllocatorPolicy {
    fn default() -> Self {
        Self {
            threshold_equity: 10_000.0,
            base_pct: 0.2,
            min_target_pct: 2.0,
            eligible: Vec::new(),
        }
    }
}

/// `targetSpotUsd = round(equity * (equity >= threshold ? basePct : basePct/2))`
/// (spec §4.K "Target").
fn target_spot_usd(policy: &AllocatorPolicy, equity: f64) -> f64 {
    let pct = if equity >= policy.threshold_equity {
        policy.base_pct
    } else {
        policy.base_pct / 2.0
    };
    (equity * pct).round()
}

fn current_spot_usd(balances: &[SpotBalance]) -> f64 {
    balances
        .iter()
        .filter(|b| !b.is_stable)
        .map(|b| b.qty * b.mid_or_last)
        .sum()
}

/// Generate BUY legs weighted by `dominanceTilt`, honoring per-symbol
/// eligibility thresholds (spec §4.K "If diff > 0 and sentinel = NORMAL").
fn buy_legs(policy: &AllocatorPolicy, diff: f64, amber: bool) -> Vec<RebalanceLeg> {
    let eligible: Vec<_> = policy
        .eligible
        .iter()
        .filter(|e| e.expected_move_pct >= policy.min_target_pct && e.r_multiple >= 1.2)
        .collect();
    if eligible.is_empty() {
        return Vec::new();
    }
    let total_tilt: f64 = eligible.iter().map(|e| e.dominance_tilt).sum();
    let total_tilt = if total_tilt <= 0.0 { eligible.len() as f64 } else { total_tilt };

    let mut legs = Vec::new();
    for e in eligible {
        let weight = if total_tilt == eligible.len() as f64 && e.dominance_tilt <= 0.0 {
            1.0 / eligible.len() as f64
        } else {
            e.dominance_tilt / total_tilt
        };
        let usd = diff * weight;
        if usd < e.min_notional {
            continue;
        }
        legs.push(RebalanceLeg {
            symbol: e.symbol.clone(),
            side: RebalanceSide::Buy,
            usd,
            reduce_only: false,
            post_only: true,
            twap_ms: if amber { Some(5_000) } else { None },
            iceberg: if amber { Some(0.15) } else { None },
        });
    }
    legs
}

/// SELL legs from largest-USD holdings first until `|diff|` absorbed (spec
/// §4.K "If diff < 0").
fn sell_legs(balances: &[SpotBalance], mut need: f64, amber: bool) -> Vec<RebalanceLeg> {
    let mut holdings: Vec<_> = balances
        .iter()
        .filter(|b| !b.is_stable)
        .map(|b| (b.symbol.clone(), b.qty * b.mid_or_last))
        .collect();
    holdings.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut legs = Vec::new();
    for (symbol, usd_value) in holdings {
        if need <= 0.0 {
            break;
        }
        let take = usd_value.min(need);
        if take <= 0.0 {
            continue;
        }
        legs.push(RebalanceLeg {
            symbol,
            side: RebalanceSide::Sell,
            usd: take,
            reduce_only: true,
            post_only: false,
            twap_ms: if amber { Some(5_000) } else { None },
            iceberg: if amber { Some(0.15) } else { None },
        });
        need -= take;
    }
    legs
}

/// Full leg-generation pipeline (spec §4.K).
pub fn build_rebalance(
    policy: &AllocatorPolicy,
    equity: f64,
    balances: &[SpotBalance],
    sentinel: Sentinel,
    amber: bool,
) -> SpotRebalance {
    let target = target_spot_usd(policy, equity);
    let current = current_spot_usd(balances);
    let diff = target - current;

    let legs = if diff > 0.0 && sentinel == Sentinel::Normal {
        buy_legs(policy, diff, amber)
    } else if diff < 0.0 {
        sell_legs(balances, diff.abs(), amber)
    } else {
        Vec::new()
    };

    SpotRebalance {
        target_spot_usd: target,
        current_spot_usd: current,
        legs,
    }
}

pub struct SpotAllocator {
    policy: parking_lot::RwLock<AllocatorPolicy>,
    bus: parking_lot::RwLock<Option<Arc<EventBus>>>,
    sentinel: parking_lot::RwLock<Sentinel>,
    audit: Arc<AuditSink>,
}

impl SpotAllocator {
    pub fn new(audit: Arc<AuditSink>, policy: AllocatorPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy: parking_lot::RwLock::new(policy),
            bus: parking_lot::RwLock::new(None),
            sentinel: parking_lot::RwLock::new(Sentinel::Normal),
            audit,
        })
    }

    pub async fn evaluate(&self, equity: f64, balances: Vec<SpotBalance>) {
        let policy = self.policy.read().clone();
        let sentinel = *self.sentinel.read();
        let amber = matches!(sentinel, Sentinel::Slowdown);
        let rebalance = build_rebalance(&policy, equity, &balances, sentinel, amber);
        info!(
            target = rebalance.target_spot_usd,
            current = rebalance.current_spot_usd,
            legs = rebalance.legs.len(),
            "spot allocator rebalance computed"
        );
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::new(
                Topic::VivoSpotRebalance,
                "spot_allocator",
                Payload::SpotRebalance(rebalance),
            );
            bus.publish(Topic::VivoSpotRebalance, envelope).await;
        }
    }
}

impl Clone for AllocatorPolicy {
    fn clone(&self) -> Self {
        Self {
            threshold_equity: self.threshold_equity,
            base_pct: self.base_pct,
            min_target_pct: self.min_target_pct,
            eligible: self.eligible.clone(),
        }
    }
}

#[async_trait]
impl Module for Arc<SpotAllocator> {
    fn name(&self) -> &'static str {
        "spot_allocator"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(policy) = serde_json::from_value::<AllocatorPolicy>(config.clone()) {
            *self.policy.write() = policy;
        }
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::RiskState,
            "spot_allocator.risk",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::RiskState(risk) = envelope.payload {
                        *this.sentinel.write() = risk.sentinel;
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::AccountExposure,
            "spot_allocator.exposure",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::AccountExposure(snapshot) = envelope.payload {
                        let equity: f64 = snapshot.balances.iter().map(|b| b.qty * b.mid_or_last).sum();
                        this.evaluate(equity, snapshot.balances).await;
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

    #[test]
    fn buy_legs_drop_below_min_notional() {
        let policy = AllocatorPolicy {
            eligible: vec![EligibleSymbol {
                symbol: "AVAX".into(),
                dominance_tilt: 1.0,
                expected_move_pct: 3.0,
                r_multiple: 1.5,
                min_notional: 1_000.0,
            }],
            ..AllocatorPolicy::default()
        };
        let legs = buy_legs(&policy, 500.0, false);
        assert!(legs.is_empty());
    }

    #[test]
    fn sell_legs_are_reduce_only_and_largest_first() {
        let balances = vec![
            SpotBalance { symbol: "ETH".into(), is_stable: false, qty: 1.0, mid_or_last: 2000.0 },
            SpotBalance { symbol: "BTC".into(), is_stable: false, qty: 0.1, mid_or_last: 40000.0 },
        ];
        let legs = sell_legs(&balances, 3000.0, false);
        assert_eq!(legs[0].symbol, "BTC");
        assert!(legs.iter().all(|l| l.reduce_only));
    }

    #[test]
    fn target_halves_under_equity_threshold() {
        let policy = AllocatorPolicy {
            threshold_equity: 10_000.0,
            base_pct: 0.2,
            ..AllocatorPolicy::default()
        };
        assert_eq!(target_spot_usd(&policy, 5_000.0), 500.0);
        assert_eq!(target_spot_usd(&policy, 20_000.0), 4_000.0);
    }
}
