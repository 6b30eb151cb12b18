//! Module Lifecycle (spec §4.A component B).
//!
//! Replaces the teacher's class-inheritance base (`GrafikBeyniModuleBase` in
//! the source system) with a small capability trait plus composition: every
//! component implements [`Module`] and is driven by a [`Registry`] that
//! owns init order, health probing, and coordinated shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::audit::AuditSink;
use crate::bus::EventBus;
use crate::error::OpsResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Health {
    pub state: HealthState,
    pub detail: String,
}

impl Health {
    pub fn healthy() -> Self {
        Self {
            state: HealthState::Healthy,
            detail: String::new(),
        }
    }
}

/// Capability set every decision module exposes (spec Design Notes:
/// "replace inheritance with a small Module capability set plus
/// composition").
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inject config and wire subscriptions; called once before `start`.
    async fn initialize(&self, bus: &Arc<EventBus>, config: &Value) -> OpsResult<()>;

    /// Release timers, flush batches, stop accepting work (spec §4.A).
    async fn shutdown(&self, grace: Duration) -> OpsResult<()>;

    async fn health_snapshot(&self) -> Health;
}

/// Owns registration order, coordinated startup, and coordinated shutdown
/// for every module in the process (spec §4.A `register`/`startAll`/
/// `shutdownAll`/`healthSnapshot`).
pub struct Registry {
    bus: Arc<EventBus>,
    audit: Arc<AuditSink>,
    modules: parking_lot::Mutex<Vec<Arc<dyn Module>>>,
}

impl Registry {
    pub fn new(bus: Arc<EventBus>, audit: Arc<AuditSink>) -> Self {
        Self {
            bus,
            audit,
            modules: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, module: Arc<dyn Module>) {
        info!(module = module.name(), "registering module");
        self.modules.lock().push(module);
    }

    pub async fn start_all(&self, configs: &HashMap<String, Value>) -> OpsResult<()> {
        let modules: Vec<_> = self.modules.lock().clone();
        let empty = Value::Null;
        for module in modules {
            let cfg = configs.get(module.name()).unwrap_or(&empty);
            match module.initialize(&self.bus, cfg).await {
                Ok(()) => info!(module = module.name(), "initialized"),
                Err(e) => {
                    error!(module = module.name(), error = %e, "init failed");
                    self.audit
                        .record("lifecycle", None, e.code(), &e.to_string())
                        .await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn shutdown_all(&self, grace_ms: u64) {
        let modules: Vec<_> = self.modules.lock().clone();
        let grace = Duration::from_millis(grace_ms);
        self.bus.shutdown_all(grace).await;
        for module in modules {
            if let Err(e) = module.shutdown(grace).await {
                warn!(module = module.name(), error = %e, "shutdown reported error");
            }
        }
    }

    pub async fn health_snapshot(&self) -> HashMap<String, Health> {
        let modules: Vec<_> = self.modules.lock().clone();
        let mut out = HashMap::new();
        for module in modules {
            out.insert(module.name().to_string(), module.health_snapshot().await);
        }
        out
    }
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            bus: self.bus.clone(),
            audit: self.audit.clone(),
            modules: parking_lot::Mutex::new(self.modules.lock().clone()),
        }
    }
}
