//! Drawdown Monitor (spec §4.G, component G).
//!
//! Tracks the rolling equity curve, maintains a watermark peak, and drives a
//! three-tier cool-off state machine (WARN/ERROR/EMERGENCY) that emits
//! governance recommendations and suppresses repeat alerts while a cool-off
//! is active.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::bus::topics::{DrawdownAlert, RiskGovernanceRecommendation};
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::{OpsError, OpsResult};
use crate::lifecycle::{Health, HealthState, Module};
use crate::models::{EquitySnapshot, EquitySource, RiskLevel, RiskState, Sentinel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoolOffLevel {
    Warn,
    Error,
    Emergency,
}

impl CoolOffLevel {
    fn min_duration(self) -> Duration {
        match self {
            CoolOffLevel::Warn => Duration::from_secs(2 * 3600),
            CoolOffLevel::Error => Duration::from_secs(24 * 3600),
            CoolOffLevel::Emergency => Duration::from_secs(72 * 3600),
        }
    }

    fn name(self) -> &'static str {
        match self {
            CoolOffLevel::Warn => "warn",
            CoolOffLevel::Error => "error",
            CoolOffLevel::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownThresholds {
    pub warn_pct: f64,
    pub error_pct: f64,
    pub emergency_pct: f64,
    pub lookback_days: i64,
    pub recovery_buffer_pct: f64,
}

impl Default for DrawdownThresholds {
    fn default() -> Self {
        Self {
            warn_pct: 2.0,
            error_pct: 3.5,
            emergency_pct: 5.0,
            lookback_days: 60,
            recovery_buffer_pct: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
struct PnlRow {
    ts: DateTime<Utc>,
    pnl: f64,
    win: bool,
}

struct DrawdownState {
    equity_history: VecDeque<EquitySnapshot>,
    pnl_history: VecDeque<PnlRow>,
    peak: f64,
    cool_off_expiry: HashMap<CoolOffLevel, DateTime<Utc>>,
    segment_start: Option<f64>,
}

impl DrawdownState {
    fn new() -> Self {
        Self {
            equity_history: VecDeque::new(),
            pnl_history: VecDeque::new(),
            peak: 0.0,
            cool_off_expiry: HashMap::new(),
            segment_start: None,
        }
    }

    fn prune(&mut self, lookback_days: i64, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(lookback_days);
        while self
            .equity_history
            .front()
            .map(|s| s.ts < cutoff)
            .unwrap_or(false)
        {
            self.equity_history.pop_front();
        }
        self.cool_off_expiry.retain(|_, expiry| *expiry > now);
    }

    fn ingest(&mut self, snapshot: EquitySnapshot, buffer_pct: f64) {
        self.peak = self.peak.max(snapshot.value);
        if self.segment_start.is_none() {
            self.segment_start = Some(snapshot.value);
        }
        if let Some(start) = self.segment_start {
            if snapshot.value >= start * (1.0 + buffer_pct / 100.0) {
                self.segment_start = Some(snapshot.value);
            }
        }
        self.equity_history.push_back(snapshot);
    }

    /// `currentDD% = 100*(peak-current)/peak`, clamped to >= 0 (spec §3).
    fn current_dd_pct(&self) -> f64 {
        let current = match self.equity_history.back() {
            Some(s) => s.value,
            None => return 0.0,
        };
        if self.peak <= 0.0 {
            return 0.0;
        }
        (100.0 * (self.peak - current) / self.peak).max(0.0)
    }

    /// Maximum of the running `(runningPeak - value)/runningPeak` over
    /// history (spec §4.G "Computation").
    fn max_dd_pct(&self) -> f64 {
        let mut running_peak = 0.0_f64;
        let mut max_dd = 0.0_f64;
        for snap in &self.equity_history {
            running_peak = running_peak.max(snap.value);
            if running_peak > 0.0 {
                let dd = 100.0 * (running_peak - snap.value) / running_peak;
                max_dd = max_dd.max(dd);
            }
        }
        max_dd
    }

    fn active(&self, level: CoolOffLevel, now: DateTime<Utc>) -> bool {
        self.cool_off_expiry
            .get(&level)
            .map(|expiry| *expiry > now)
            .unwrap_or(false)
    }

    fn set_cool_off(&mut self, level: CoolOffLevel, now: DateTime<Utc>, at_least: Duration) {
        let dur = level.min_duration().max(at_least);
        let expiry = now + chrono::Duration::from_std(dur).unwrap_or_default();
        self.cool_off_expiry.insert(level, expiry);
    }

    fn record_pnl(&mut self, ts: DateTime<Utc>, pnl: f64) {
        self.pnl_history.push_back(PnlRow {
            ts,
            pnl,
            win: pnl > 0.0,
        });
        while self.pnl_history.len() > 10_000 {
            self.pnl_history.pop_front();
        }
    }

    /// Recovery estimate (spec §4.G, Open Question #1: dividing by *current*
    /// equity per the binding resolution in `DESIGN.md`).
    fn recovery_estimate(&self) -> Option<(f64, f64)> {
        if self.pnl_history.len() < 10 {
            return None;
        }
        let current = self.equity_history.back()?.value;
        if current <= 0.0 {
            return None;
        }
        let n = self.pnl_history.len() as f64;
        let avg_daily_return: f64 =
            self.pnl_history.iter().map(|r| r.pnl).sum::<f64>() / n / current;
        let wins = self.pnl_history.iter().filter(|r| r.win).count() as f64;
        let win_rate = wins / n;

        let mean = self.pnl_history.iter().map(|r| r.pnl).sum::<f64>() / n;
        let variance = self
            .pnl_history
            .iter()
            .map(|r| (r.pnl - mean).powi(2))
            .sum::<f64>()
            / n;
        let stdev = variance.sqrt();
        let sharpe = if stdev > 0.0 { mean / stdev } else { 0.0 };

        let expected_days = if avg_daily_return > 0.0 {
            (self.peak - current) / (current * avg_daily_return)
        } else {
            f64::INFINITY
        };

        let probability = (0.3 + 0.4 * win_rate + 0.2 * sharpe.tanh()).clamp(0.05, 0.95);
        Some((expected_days, probability))
    }
}

pub struct DrawdownMonitor {
    state: Arc<RwLock<DrawdownState>>,
    thresholds: Arc<RwLock<DrawdownThresholds>>,
    bus: Arc<RwLock<Option<Arc<EventBus>>>>,
    audit: Arc<AuditSink>,
}

impl DrawdownMonitor {
    pub fn new(audit: Arc<AuditSink>, thresholds: DrawdownThresholds) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(RwLock::new(DrawdownState::new())),
            thresholds: Arc::new(RwLock::new(thresholds)),
            bus: Arc::new(RwLock::new(None)),
            audit,
        })
    }

    /// Evaluate the state machine after a new equity snapshot and, at most
    /// once per active level, emit recommendations + alert (spec §4.G state
    /// machine table, §8 scenario S1).
    pub async fn ingest_equity(&self, snapshot: EquitySnapshot) -> OpsResult<()> {
        if snapshot.value <= 0.0 {
            return Err(OpsError::Validation("equity value must be > 0".into()));
        }
        let thresholds = self.thresholds.read().clone();
        let now = snapshot.ts;

        let (current_dd, max_dd, transition) = {
            let mut state = self.state.write();
            state.prune(thresholds.lookback_days, now);
            state.ingest(snapshot, thresholds.recovery_buffer_pct);
            let current_dd = state.current_dd_pct();
            let max_dd = state.max_dd_pct();

            let transition = if current_dd >= thresholds.emergency_pct
                && !state.active(CoolOffLevel::Emergency, now)
            {
                state.set_cool_off(CoolOffLevel::Emergency, now, Duration::from_secs(72 * 3600));
                Some(CoolOffLevel::Emergency)
            } else if current_dd >= thresholds.error_pct && !state.active(CoolOffLevel::Error, now)
            {
                state.set_cool_off(CoolOffLevel::Error, now, Duration::from_secs(24 * 3600));
                Some(CoolOffLevel::Error)
            } else if current_dd >= thresholds.warn_pct && !state.active(CoolOffLevel::Warn, now) {
                state.set_cool_off(CoolOffLevel::Warn, now, Duration::from_secs(2 * 3600));
                Some(CoolOffLevel::Warn)
            } else {
                None
            };
            (current_dd, max_dd, transition)
        };

        let Some(level) = transition else {
            return Ok(());
        };

        let (actions, sentinel, cool_off_until) = self.actions_for(level, now);
        info!(level = level.name(), current_dd, max_dd, "drawdown cool-off engaged");

        if let Some(bus) = self.bus.read().clone() {
            let risk_state = RiskState {
                level: match level {
                    CoolOffLevel::Emergency => RiskLevel::Red,
                    CoolOffLevel::Error => RiskLevel::Red,
                    CoolOffLevel::Warn => RiskLevel::Amber,
                },
                sentinel,
            };
            for action in &actions {
                let rec = RiskGovernanceRecommendation {
                    action: action.clone(),
                    target: None,
                    duration_secs: None,
                };
                let envelope = Envelope::new(
                    Topic::RiskGovernanceRecommendation,
                    "drawdown_monitor",
                    Payload::RiskGovernanceRecommendation(rec),
                );
                bus.publish(Topic::RiskGovernanceRecommendation, envelope).await;
            }
            let alert = DrawdownAlert {
                level: level.name().to_string(),
                current_dd_pct: current_dd,
                max_dd_pct: max_dd,
                actions: actions.clone(),
                cool_off_until,
            };
            let envelope = Envelope::new(Topic::DrawdownAlert, "drawdown_monitor", Payload::DrawdownAlert(alert));
            bus.publish(Topic::DrawdownAlert, envelope).await;

            let envelope = Envelope::new(Topic::RiskState, "drawdown_monitor", Payload::RiskState(risk_state));
            bus.publish(Topic::RiskState, envelope).await;
        }

        self.audit
            .record(
                "drawdown_monitor",
                None,
                "drawdown_cool_off",
                &format!("level={} dd={:.2}%", level.name(), current_dd),
            )
            .await;
        Ok(())
    }

    fn actions_for(
        &self,
        level: CoolOffLevel,
        now: DateTime<Utc>,
    ) -> (Vec<String>, Sentinel, DateTime<Utc>) {
        match level {
            CoolOffLevel::Emergency => (
                vec!["emergency_close".to_string()],
                Sentinel::CircuitBreaker,
                now + chrono::Duration::hours(72),
            ),
            CoolOffLevel::Error => (
                vec![
                    "reduce_total_risk:1.2%".to_string(),
                    "disable_aggressive_variant:4h".to_string(),
                ],
                Sentinel::HaltPartial,
                now + chrono::Duration::hours(24),
            ),
            CoolOffLevel::Warn => (
                vec![
                    "reduce_total_risk:1.8%".to_string(),
                    "halt_new_intents:20m".to_string(),
                ],
                Sentinel::Slowdown,
                now + chrono::Duration::hours(2),
            ),
        }
    }

    pub fn record_trade(&self, ts: DateTime<Utc>, pnl: f64) {
        self.state.write().record_pnl(ts, pnl);
    }

    pub fn recovery_estimate(&self) -> Option<(f64, f64)> {
        self.state.read().recovery_estimate()
    }
}

#[async_trait]
impl Module for Arc<DrawdownMonitor> {
    fn name(&self) -> &'static str {
        "drawdown_monitor"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(thresholds) = serde_json::from_value::<DrawdownThresholds>(config.clone()) {
            *self.thresholds.write() = thresholds;
        }
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::TradeSummaryClosed,
            "drawdown_monitor.trade_summary",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::TradeSummary(summary) = envelope.payload {
                        this.record_trade(summary.ts, summary.pnl);
                    }
                    Ok(())
                })
            }),
            SubscribeOptions::default(),
        );

        let this = self.clone();
        bus.subscribe(
            Topic::AccountExposure,
            "drawdown_monitor.equity",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    // Equity snapshots arrive piggybacked on account.exposure in this
                    // deployment; `ingest_equity` remains directly callable for
                    // producers with a dedicated equity feed.
                    if let Payload::AccountExposure(snapshot) = envelope.payload {
                        let equity: f64 = snapshot
                            .balances
                            .iter()
                            .map(|b| b.qty * b.mid_or_last)
                            .sum();
                        if equity > 0.0 {
                            this.ingest_equity(EquitySnapshot {
                                value: equity,
                                ts: snapshot.ts,
                                source: EquitySource::Real,
                            })
                            .await?;
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
            detail: format!("peak={:.2}", self.state.read().peak),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EquitySource;

    fn snap(value: f64, ts: DateTime<Utc>) -> EquitySnapshot {
        EquitySnapshot {
            value,
            ts,
            source: EquitySource::Real,
        }
    }

    #[tokio::test]
    async fn s1_drawdown_to_emergency_cool_off() {
        let audit = Arc::new(
            AuditSink::open(std::env::temp_dir().join("opsctl_test_audit_drawdown.jsonl"))
                .await
                .unwrap(),
        );
        let monitor = DrawdownMonitor::new(audit, DrawdownThresholds::default());
        let base = Utc::now();
        let values = [100.0, 100.0, 97.0, 96.5, 95.0];
        for (i, v) in values.iter().enumerate() {
            monitor
                .ingest_equity(snap(*v, base + chrono::Duration::minutes(i as i64)))
                .await
                .unwrap();
        }
        let dd = monitor.state.read().current_dd_pct();
        assert!((dd - 5.0).abs() < 1e-9, "expected 5.00% dd, got {dd}");
        assert!(monitor
            .state
            .read()
            .active(CoolOffLevel::Emergency, base + chrono::Duration::minutes(10)));

        // A later ingest within cool-off must not re-trigger a transition.
        let before = monitor.state.read().cool_off_expiry.clone();
        monitor
            .ingest_equity(snap(95.0, base + chrono::Duration::minutes(11)))
            .await
            .unwrap();
        let after = monitor.state.read().cool_off_expiry.clone();
        assert_eq!(before.get(&CoolOffLevel::Emergency), after.get(&CoolOffLevel::Emergency));
    }

    #[test]
    fn peak_is_monotonic_watermark() {
        let mut state = DrawdownState::new();
        state.ingest(snap(100.0, Utc::now()), 0.5);
        state.ingest(snap(90.0, Utc::now()), 0.5);
        state.ingest(snap(95.0, Utc::now()), 0.5);
        assert_eq!(state.peak, 100.0);
    }
}
