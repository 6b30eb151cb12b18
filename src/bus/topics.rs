//! Fixed topic registry and per-topic payload vocabulary (spec §6, Design
//! Notes: "replace dynamic event-bus emit strings with a registry of topic
//! descriptors keyed by enum/tag").
//!
//! Every topic name in spec §6 has exactly one variant here and exactly one
//! payload type in [`Payload`]. Unknown payloads cannot be constructed, so
//! malformed data is rejected at compile time rather than at the bus
//! boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    ActionBundle, EndpointHealth, EquitySnapshot, Feasibility, PlanId, RiskState, Sentinel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    // Inputs
    MarketTick,
    AccountExposure,
    PortfolioPolicy,
    ExecutionIntentAccepted,
    VivoFeasibility,
    RiskState,
    OpsActionsProposed,
    OperatorChoiceLog,
    TradeSummaryClosed,
    SessionActivity,
    DialogMetrics,
    ClockTick1m,
    EndpointCatalog,
    EndpointProbeResult,
    TelemetryMetrics,
    LogRaw,
    RedactRequest,
    RedactDictionaryUpdate,
    // Outputs
    RiskGovernanceRecommendation,
    DrawdownAlert,
    EndpointSwitchPlan,
    EndpointSwitched,
    EndpointHealthSnapshot,
    EndpointBrownoutStep,
    OpsActions,
    OpsGuardrailReport,
    VivoPacingPlan,
    PortfolioIntentApproved,
    PortfolioIntentAdjusted,
    PortfolioIntentRejected,
    PortfolioIntentDeferred,
    VivoSpotRebalance,
    VivoDialogComplete,
    VivoExplainCard,
    TelemetryAnomalySignal,
    TelemetryAlert,
    TelemetryAnomalyMetrics,
    LogSinkBatch,
    LogRouterMetrics,
    RedactReady,
    AuditLog,
}

impl Topic {
    /// The fixed wire name from spec §6 (used for config keys, log lines).
    pub fn name(self) -> &'static str {
        match self {
            Topic::MarketTick => "market.tick",
            Topic::AccountExposure => "account.exposure",
            Topic::PortfolioPolicy => "portfolio.policy",
            Topic::ExecutionIntentAccepted => "execution.intent.accepted",
            Topic::VivoFeasibility => "vivo.feasibility",
            Topic::RiskState => "risk.state",
            Topic::OpsActionsProposed => "ops.actions.proposed",
            Topic::OperatorChoiceLog => "operator.choice.log",
            Topic::TradeSummaryClosed => "trade.summary.closed",
            Topic::SessionActivity => "session.activity",
            Topic::DialogMetrics => "dialog.metrics",
            Topic::ClockTick1m => "clock.tick1m",
            Topic::EndpointCatalog => "endpoint.catalog",
            Topic::EndpointProbeResult => "endpoint.probe.result",
            Topic::TelemetryMetrics => "telemetry.metrics",
            Topic::LogRaw => "log.raw",
            Topic::RedactRequest => "redact.request",
            Topic::RedactDictionaryUpdate => "redact.dictionary.update",
            Topic::RiskGovernanceRecommendation => "risk.governance.recommendation",
            Topic::DrawdownAlert => "drawdown.alert",
            Topic::EndpointSwitchPlan => "endpoint.switch.plan",
            Topic::EndpointSwitched => "endpoint.switched",
            Topic::EndpointHealthSnapshot => "endpoint.health.snapshot",
            Topic::EndpointBrownoutStep => "endpoint.brownout.step",
            Topic::OpsActions => "ops.actions",
            Topic::OpsGuardrailReport => "ops.guardrail.report",
            Topic::VivoPacingPlan => "vivo.pacing.plan",
            Topic::PortfolioIntentApproved => "portfolio.intent.approved",
            Topic::PortfolioIntentAdjusted => "portfolio.intent.adjusted",
            Topic::PortfolioIntentRejected => "portfolio.intent.rejected",
            Topic::PortfolioIntentDeferred => "portfolio.intent.deferred",
            Topic::VivoSpotRebalance => "vivo.spot.rebalance",
            Topic::VivoDialogComplete => "vivo.dialog_complete",
            Topic::VivoExplainCard => "vivo.explain.card",
            Topic::TelemetryAnomalySignal => "telemetry.anomaly.signal",
            Topic::TelemetryAlert => "telemetry.alert",
            Topic::TelemetryAnomalyMetrics => "telemetry.anomaly.metrics",
            Topic::LogSinkBatch => "log.sink.batch",
            Topic::LogRouterMetrics => "log.router.metrics",
            Topic::RedactReady => "redact.ready",
            Topic::AuditLog => "audit.log",
        }
    }

    /// Default subscriber concurrency (spec §4.A: "default 1 for stateful
    /// handlers").
    pub fn default_concurrency(self) -> usize {
        match self {
            Topic::MarketTick | Topic::TelemetryMetrics | Topic::LogRaw => 8,
            _ => 1,
        }
    }
}

/// Sensitivity classification carried by every envelope (spec §3).
pub use crate::models::Classification;

/// Sampled market tick (opaque to the core beyond price/symbol/ts; strategy
/// detectors are out of scope per spec §1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketTick {
    pub symbol: String,
    pub price: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountExposureSnapshot {
    pub ts: DateTime<Utc>,
    pub total_risk_pct: f64,
    pub per_symbol_pct: std::collections::HashMap<String, f64>,
    pub per_cluster_pct: std::collections::HashMap<String, f64>,
    pub per_factor_beta: std::collections::HashMap<String, f64>,
    pub long_short_imbalance_pct: f64,
    pub balances: Vec<SpotBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotBalance {
    pub symbol: String,
    pub is_stable: bool,
    pub qty: f64,
    pub mid_or_last: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionIntent {
    pub symbol: String,
    pub side: crate::models::Side,
    pub variant: String,
    pub confidence: f64,
    pub corr_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSummary {
    pub ts: DateTime<Utc>,
    pub pnl: f64,
    pub win: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionActivity {
    pub ts: DateTime<Utc>,
    pub symbol: Option<String>,
    pub orders_last_10s: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub series: String,
    pub v: f64,
    pub t: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub ts: Option<DateTime<Utc>>,
    pub source: String,
    pub level: String,
    pub message: String,
    pub kv: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactRequest {
    pub request_id: String,
    pub profile: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownAlert {
    pub level: String,
    pub current_dd_pct: f64,
    pub max_dd_pct: f64,
    pub actions: Vec<String>,
    pub cool_off_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSwitchPlan {
    pub from: String,
    pub to: String,
    pub reason_codes: Vec<String>,
    pub planned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSwitched {
    pub from: String,
    pub to: String,
    pub reason_codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrownoutStep {
    pub from: String,
    pub to: String,
    pub pct_shifted: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailReport {
    pub mode: String,
    pub changes: Vec<String>,
    pub blocked_symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingPlan {
    pub max_new_positions: u32,
    pub max_child_per_min: u32,
    pub risk_budget_usd: f64,
    pub slip_soft_bp: f64,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioOutcome {
    Approved,
    Adjusted,
    Rejected,
    Deferred,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioIntentResult {
    pub symbol: String,
    pub outcome: PortfolioOutcome,
    pub approved_risk_pct: f64,
    pub scale_factor: f64,
    pub reason: Option<String>,
    pub defer_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceLeg {
    pub symbol: String,
    pub side: RebalanceSide,
    pub usd: f64,
    pub reduce_only: bool,
    pub post_only: bool,
    pub twap_ms: Option<u64>,
    pub iceberg: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotRebalance {
    pub target_spot_usd: f64,
    pub current_spot_usd: f64,
    pub legs: Vec<RebalanceLeg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogComplete {
    pub session_id: String,
    pub selected_plan: Option<PlanId>,
    pub user_response: Option<String>,
    pub fallback_reason: Option<String>,
    pub total_duration_ms: u64,
    pub halted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainScore {
    pub plan_id: PlanId,
    pub variant: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainExecSummary {
    pub child_count: usize,
    pub reduce_only_ratio: f64,
    pub post_only_count: usize,
    pub notional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainCard {
    pub corr_id: String,
    pub posture: String,
    pub sentinel: Sentinel,
    pub decided_by: String,
    pub selected_plan: Option<PlanId>,
    pub weights: std::collections::HashMap<String, f64>,
    pub selected_score: Option<f64>,
    pub alt_scores: Vec<ExplainScore>,
    pub top_findings: Vec<String>,
    pub policy_compliance: Vec<String>,
    pub exec_summary: Option<ExplainExecSummary>,
    pub why_tree: Vec<String>,
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    Flatline,
    Gap,
    Spike,
    Drop,
    Drift,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySignal {
    pub series: String,
    pub window: String,
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyMetrics {
    pub evaluated: u64,
    pub flagged: u64,
    pub flatlines: u64,
    pub gaps: u64,
    pub by_level: std::collections::HashMap<String, u64>,
    pub window_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSinkBatch {
    pub sink: String,
    pub codec: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRouterMetrics {
    pub received: u64,
    pub dropped: u64,
    pub sampled_out: u64,
    pub by_sink: std::collections::HashMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactReady {
    pub request_id: String,
    pub classification: Classification,
    pub masked_content: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub ver: u32,
    pub src: String,
    pub corr_id: Option<String>,
    pub code: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskGovernanceRecommendation {
    pub action: String,
    pub target: Option<f64>,
    pub duration_secs: Option<u64>,
}

/// The closed set of payloads any topic can carry. Exactly one variant maps
/// to each [`Topic`] (enforced by `Payload::topic`); subscribers match on
/// this enum rather than on a dynamic string+`Any` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    MarketTick(MarketTick),
    AccountExposure(AccountExposureSnapshot),
    ExecutionIntentAccepted(ExecutionIntent),
    Feasibility(Feasibility),
    RiskState(RiskState),
    ActionsProposed(ActionBundle),
    TradeSummary(TradeSummary),
    SessionActivity(SessionActivity),
    ClockTick(DateTime<Utc>),
    EndpointCatalog(Vec<String>),
    EndpointProbeResult(EndpointHealth),
    TelemetryPoint(TelemetryPoint),
    LogRecord(LogRecord),
    RedactRequest(RedactRequest),
    RiskGovernanceRecommendation(RiskGovernanceRecommendation),
    DrawdownAlert(DrawdownAlert),
    EndpointSwitchPlan(EndpointSwitchPlan),
    EndpointSwitched(EndpointSwitched),
    EndpointHealthSnapshot(EndpointHealth),
    EndpointBrownoutStep(BrownoutStep),
    Actions(ActionBundle),
    GuardrailReport(GuardrailReport),
    PacingPlan(PacingPlan),
    PortfolioIntentResult(PortfolioIntentResult),
    SpotRebalance(SpotRebalance),
    DialogComplete(DialogComplete),
    ExplainCard(ExplainCard),
    AnomalySignal(AnomalySignal),
    AnomalyMetrics(AnomalyMetrics),
    LogSinkBatch(LogSinkBatch),
    LogRouterMetrics(LogRouterMetrics),
    RedactReady(RedactReady),
    AuditLogEntry(AuditLogEntry),
    Empty,
}
