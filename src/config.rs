//! Configuration (spec §6 "Configuration").
//!
//! File-backed TOML with environment overrides, mirroring the teacher's
//! `models::Config::from_env` convention. Hot-reloadable sections (routing
//! rules, privacy rules, endpoint catalog, policy caps) are stored behind
//! `ArcSwap` so a `reload` CLI command replaces the table atomically without
//! taking a lock across a suspension point (spec §5).

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::modules::balancer::PolicyCaps;
use crate::modules::dialog::DialogConfig;
use crate::modules::drawdown::DrawdownThresholds;
use crate::modules::failover::config::EndpointCatalogConfig;
use crate::modules::log_router::rules::RoutingRule;
use crate::modules::pacing::PacingPolicy;
use crate::modules::pii::PrivacyRules;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusConfig {
    pub default_queue_size: usize,
    pub default_backpressure: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClockConfig {
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub drawdown: DrawdownThresholds,
    #[serde(default)]
    pub endpoints: EndpointCatalogConfig,
    #[serde(default)]
    pub pacing: PacingPolicy,
    #[serde(default)]
    pub balancer: PolicyCaps,
    #[serde(default)]
    pub dialog: DialogConfig,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRule>,
    #[serde(default)]
    pub privacy: PrivacyRules,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let cfg: FileConfig = toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(cfg)
    }

    /// Apply `OPSCTL_*` environment overrides for a handful of scalar knobs,
    /// matching the teacher's `env::var` override pattern in `main.rs`.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("OPSCTL_BUS_QUEUE_SIZE") {
            if let Ok(n) = v.parse() {
                self.bus.default_queue_size = n;
            }
        }
        self
    }
}

/// The subset of configuration that supports `reload <section>` without a
/// process restart (spec §6 "Hot-reload supported only for: routing rules,
/// privacy rules, endpoint catalog, policy caps").
pub struct HotReloadable {
    pub routing_rules: ArcSwap<Vec<RoutingRule>>,
    pub privacy: ArcSwap<PrivacyRules>,
    pub endpoints: ArcSwap<EndpointCatalogConfig>,
    pub policy_caps: ArcSwap<PolicyCaps>,
}

impl HotReloadable {
    pub fn from_file(cfg: &FileConfig) -> Arc<Self> {
        Arc::new(Self {
            routing_rules: ArcSwap::from_pointee(cfg.routing_rules.clone()),
            privacy: ArcSwap::from_pointee(cfg.privacy.clone()),
            endpoints: ArcSwap::from_pointee(cfg.endpoints.clone()),
            policy_caps: ArcSwap::from_pointee(cfg.balancer.clone()),
        })
    }

    pub fn reload_routes(&self, rules: Vec<RoutingRule>) {
        self.routing_rules.store(Arc::new(rules));
    }

    pub fn reload_privacy(&self, rules: PrivacyRules) {
        self.privacy.store(Arc::new(rules));
    }

    pub fn reload_endpoints(&self, catalog: EndpointCatalogConfig) {
        self.endpoints.store(Arc::new(catalog));
    }

    pub fn reload_policy(&self, caps: PolicyCaps) {
        self.policy_caps.store(Arc::new(caps));
    }

    /// Re-read `path` and atomically swap the named section (`start`'s
    /// `reload <routes|privacy|policy|endpoints>` CLI command).
    pub fn reload_from_file(&self, section: &str, path: &Path) -> anyhow::Result<()> {
        let cfg = FileConfig::load(path)?;
        match section {
            "routes" => self.reload_routes(cfg.routing_rules),
            "privacy" => self.reload_privacy(cfg.privacy),
            "endpoints" => self.reload_endpoints(cfg.endpoints),
            "policy" => self.reload_policy(cfg.balancer),
            other => anyhow::bail!("unknown reload section: {other}"),
        }
        Ok(())
    }
}
