//! Audit log sink (spec §6 Persistence, §7 "every failure produces an
//! `audit.log` event").
//!
//! Append-only JSONL, one line per event: `{ts, ver, src, corrId?, payload}`.
//! Writes are serialized through a single mutex guarding the file handle
//! (spec §5 "file sinks: append-only, guarded by a per-file write mutex").

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::bus::topics::AuditLogEntry;
use crate::bus::{Envelope, EventBus, Payload, Topic};

const AUDIT_VERSION: u32 = 1;

pub struct AuditSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
    bus: Option<Arc<EventBus>>,
}

impl AuditSink {
    pub async fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
            bus: None,
        })
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Append a structured record and, if wired to a bus, publish
    /// `audit.log` for explainability consumers (spec §2 "N reconstructs
    /// the explanation graph from the audit log").
    pub async fn record(&self, src: &str, corr_id: Option<&str>, code: &str, detail: &str) {
        let line = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "ver": AUDIT_VERSION,
            "src": src,
            "corrId": corr_id,
            "code": code,
            "detail": detail,
        });
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            let mut bytes = serde_json::to_vec(&line).unwrap_or_default();
            bytes.push(b'\n');
            if let Err(e) = file.write_all(&bytes).await {
                error!(path = %self.path.display(), error = %e, "audit write failed");
            }
        }
        drop(guard);

        if let Some(bus) = &self.bus {
            let payload = Payload::AuditLogEntry(AuditLogEntry {
                ver: AUDIT_VERSION,
                src: src.to_string(),
                corr_id: corr_id.map(|s| s.to_string()),
                code: code.to_string(),
                detail: detail.to_string(),
            });
            let envelope = match corr_id {
                Some(id) => Envelope::with_correlation(Topic::AuditLog, src, payload, id.to_string()),
                None => Envelope::new(Topic::AuditLog, src, payload),
            };
            bus.publish(Topic::AuditLog, envelope).await;
        }
    }
}
