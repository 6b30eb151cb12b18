//! Shared domain data model (spec §3).
//!
//! Types here are owned by no single component — they are the payloads that
//! travel on the bus and the cross-cutting vocabulary (`Classification`,
//! `Sentinel`, `RiskLevel`) that every decision module reads or writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sensitivity classification carried by every event envelope and by PII
/// Guard results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    Public,
    SensitiveLow,
    SensitiveHigh,
}

impl Classification {
    /// Combine two classifications, keeping the more sensitive one.
    pub fn max(self, other: Self) -> Self {
        use Classification::*;
        match (self, other) {
            (SensitiveHigh, _) | (_, SensitiveHigh) => SensitiveHigh,
            (SensitiveLow, _) | (_, SensitiveLow) => SensitiveLow,
            _ => Public,
        }
    }
}

/// Equity snapshot source (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquitySource {
    Real,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub value: f64,
    pub ts: DateTime<Utc>,
    pub source: EquitySource,
}

/// Endpoint operational status (spec §3, §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub id: String,
    pub score: f64,
    pub rtt_ms: f64,
    pub failures: u32,
    pub consecutive_failures: u32,
    pub status: EndpointStatus,
    pub last_probe: DateTime<Utc>,
}

/// Order side / type vocabulary shared by the guardrail bridge and the spot
/// allocator (spec §3 Action bundle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    PostOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChildMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twap_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iceberg: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionChild {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub post_only: bool,
    #[serde(default)]
    pub meta: ChildMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanId {
    A,
    B,
    C,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionBundle {
    pub plan_id: PlanId,
    pub corr_id: String,
    pub children: Vec<ActionChild>,
}

/// Finding severity used by feasibility plans (spec §4.L, §4.N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingType {
    Deny,
    Whitelist,
    TargetPct,
    SymbolStatus,
    ReduceOnly,
    Trim,
    PercentPrice,
    MinNotional,
}

impl FindingType {
    /// Hard findings force a symbol's non-reduce-only children to zero.
    pub fn is_hard(self) -> bool {
        matches!(
            self,
            FindingType::Deny
                | FindingType::Whitelist
                | FindingType::TargetPct
                | FindingType::SymbolStatus
                | FindingType::ReduceOnly
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "type")]
    pub kind: FindingType,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommend {
    Ok,
    Adjust,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolFeasibility {
    pub symbol: String,
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFeasibility {
    pub plan_id: PlanId,
    pub variant: String,
    pub score: f64,
    pub symbols: Vec<SymbolFeasibility>,
    pub recommend: Recommend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feasibility {
    pub overall_score: f64,
    pub plans: Vec<PlanFeasibility>,
}

impl Feasibility {
    pub fn plan(&self, id: PlanId) -> Option<&PlanFeasibility> {
        self.plans.iter().find(|p| p.plan_id == id)
    }
}

/// Risk governance vocabulary (spec §3, §4.G Open Question resolution #3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Green,
    Amber,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentinel {
    Normal,
    Slowdown,
    HaltPartial,
    CircuitBreaker,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskState {
    pub level: RiskLevel,
    pub sentinel: Sentinel,
}

impl Default for RiskState {
    fn default() -> Self {
        Self {
            level: RiskLevel::Green,
            sentinel: Sentinel::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_max_picks_most_sensitive() {
        assert_eq!(
            Classification::Public.max(Classification::SensitiveHigh),
            Classification::SensitiveHigh
        );
        assert_eq!(
            Classification::SensitiveLow.max(Classification::Public),
            Classification::SensitiveLow
        );
    }

    #[test]
    fn hard_findings_classified_correctly() {
        assert!(FindingType::Deny.is_hard());
        assert!(!FindingType::Trim.is_hard());
    }
}
