//! PII Guard & Redactor (spec §4.D, component D).
//!
//! Streaming entity detection and masking with code-fence preservation.
//! Classification is a pure function of what's found: `SENSITIVE_HIGH` if
//! any sensitive entity survives the allowlist, `PUBLIC` if only preserved
//! tokens were found, else `SENSITIVE_LOW`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::AuditSink;
use crate::bus::topics::RedactReady;
use crate::bus::{Envelope, EventBus, Payload, SubscribeOptions, Topic};
use crate::error::OpsResult;
use crate::lifecycle::{Health, HealthState, Module};
use crate::models::Classification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    Digest,
    Postmortem,
    Notes,
    Cards,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRules {
    pub preserve_code_blocks: bool,
    pub preserve_paths: bool,
    pub preserve_tickers: bool,
    pub aggressive: bool,
}

impl Default for ProfileRules {
    fn default() -> Self {
        Self {
            preserve_code_blocks: false,
            preserve_paths: true,
            preserve_tickers: true,
            aggressive: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyRules {
    pub ticker_allowlist: HashSet<String>,
    pub domain_allowlist: HashSet<String>,
    pub max_bytes: usize,
    pub overlap_bytes: usize,
}

impl Default for PrivacyRules {
    fn default() -> Self {
        Self {
            ticker_allowlist: [
                "AVAX", "BTC", "ETH", "SOL", "USDT", "USDC", "BNB", "XRP", "DOGE", "TRX",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            domain_allowlist: HashSet::new(),
            max_bytes: 262_144,
            overlap_bytes: 128,
        }
    }
}

impl Clone for PrivacyRules {
    fn clone(&self) -> Self {
        Self {
            ticker_allowlist: self.ticker_allowlist.clone(),
            domain_allowlist: self.domain_allowlist.clone(),
            max_bytes: self.max_bytes,
            overlap_bytes: self.overlap_bytes,
        }
    }
}

fn profile_rules(profile: Profile) -> ProfileRules {
    match profile {
        Profile::Digest => ProfileRules {
            preserve_code_blocks: true,
            preserve_paths: true,
            preserve_tickers: true,
            aggressive: false,
        },
        Profile::Postmortem => ProfileRules {
            preserve_code_blocks: true,
            preserve_paths: true,
            preserve_tickers: true,
            aggressive: true,
        },
        Profile::Notes => ProfileRules::default(),
        Profile::Cards => ProfileRules {
            aggressive: true,
            ..ProfileRules::default()
        },
        Profile::Generic => ProfileRules::default(),
    }
}

static RE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static RE_EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").unwrap());
static RE_PHONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\+?\d{1,3}[\s.\-]?\(?\d{2,4}\)?[\s.\-]?\d{3,4}[\s.\-]?\d{3,4}").unwrap()
});
static RE_IBAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b").unwrap());
static RE_GOV_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static RE_ETH_WALLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b0x[a-fA-F0-9]{40}\b").unwrap());
static RE_BTC_WALLET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(bc1|[13])[a-km-zA-HJ-NP-Z1-9]{25,39}\b").unwrap());
static RE_TRON_WALLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bT[A-Za-z1-9]{33}\b").unwrap());
static RE_NAME_LIKE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+\s[A-Z][a-z]+\b").unwrap());
static RE_TICKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,6}\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityKind {
    Email,
    Phone,
    Iban,
    GovId,
    Wallet,
    NameLike,
}

#[derive(Debug, Clone)]
struct Hit {
    kind: EntityKind,
    start: usize,
    end: usize,
    text: String,
}

fn daily_salt(now: chrono::DateTime<Utc>) -> String {
    format!("opsctl-pii-salt-{}", now.format("%Y-%m-%d"))
}

fn hash_name(text: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..6].to_string()
}

fn mask_for(hit: &Hit, salt: &str) -> String {
    match hit.kind {
        EntityKind::Email => {
            let (local, domain) = hit.text.split_once('@').unwrap_or((&hit.text, ""));
            let prefix: String = local.chars().take(2).collect();
            let tld = domain.rsplit('.').next().unwrap_or("com");
            format!("{prefix}***@***.{tld}")
        }
        EntityKind::Phone => "+**-***-****".to_string(),
        EntityKind::Iban => "**IBAN_MASKED**".to_string(),
        EntityKind::GovId => "***-**-****".to_string(),
        EntityKind::Wallet => "0x***masked***".to_string(),
        EntityKind::NameLike => format!("[[NAME:{}]]", hash_name(&hit.text, salt)),
    }
}

fn is_sensitive(kind: EntityKind) -> bool {
    !matches!(kind, EntityKind::NameLike)
        || true // name-like is still sensitive, pseudonymized rather than dropped
}

fn find_entities(text: &str) -> Vec<Hit> {
    let mut hits = Vec::new();
    let scans: [(EntityKind, &Regex); 7] = [
        (EntityKind::Email, &RE_EMAIL),
        (EntityKind::Wallet, &RE_ETH_WALLET),
        (EntityKind::Wallet, &RE_BTC_WALLET),
        (EntityKind::Wallet, &RE_TRON_WALLET),
        (EntityKind::Iban, &RE_IBAN),
        (EntityKind::GovId, &RE_GOV_ID),
        (EntityKind::Phone, &RE_PHONE),
    ];
    for (kind, re) in scans {
        for m in re.find_iter(text) {
            hits.push(Hit { kind, start: m.start(), end: m.end(), text: m.as_str().to_string() });
        }
    }
    for m in RE_NAME_LIKE.find_iter(text) {
        hits.push(Hit {
            kind: EntityKind::NameLike,
            start: m.start(),
            end: m.end(),
            text: m.as_str().to_string(),
        });
    }
    hits.sort_by_key(|h| h.start);
    // Drop overlapping hits, keeping the first (longest scans run first).
    let mut kept: Vec<Hit> = Vec::new();
    for hit in hits {
        if kept.last().map(|last: &Hit| hit.start < last.end).unwrap_or(false) {
            continue;
        }
        kept.push(hit);
    }
    kept
}

#[derive(Debug, Clone, Default)]
pub struct RedactStats {
    pub entities_found: u64,
    pub false_positive_avoided: u64,
    pub bytes_in: usize,
    pub bytes_out: usize,
}

#[derive(Debug, Clone)]
pub struct RedactResult {
    pub classification: Classification,
    pub masked_content: String,
    pub stats: RedactStats,
    pub hash: String,
    pub truncated: bool,
}

/// Full redaction pipeline (spec §4.D "Pipeline"; §8 scenario S6).
pub fn redact(
    content: &str,
    profile: Profile,
    rules: &PrivacyRules,
    now: chrono::DateTime<Utc>,
) -> RedactResult {
    let bytes_in = content.len();
    let (content, truncated) = if content.len() > rules.max_bytes {
        (&content[..rules.max_bytes], true)
    } else {
        (content, false)
    };
    let prof = profile_rules(profile);
    let salt = daily_salt(now);

    // Code fences are carried through untouched when the profile preserves
    // them; track their byte ranges so entity detection skips inside.
    let fence_ranges: Vec<(usize, usize)> = if prof.preserve_code_blocks {
        RE_FENCE.find_iter(content).map(|m| (m.start(), m.end())).collect()
    } else {
        Vec::new()
    };
    let in_fence = |pos: usize| fence_ranges.iter().any(|&(s, e)| pos >= s && pos < e);

    let mut stats = RedactStats { bytes_in, ..Default::default() };
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0usize;
    let mut any_sensitive = false;
    let mut any_preserved = false;

    let hits = find_entities(content);
    for hit in hits {
        if hit.start < cursor {
            continue;
        }
        if in_fence(hit.start) && hit.kind != EntityKind::Wallet {
            // Non-wallet entities inside fences are preserved verbatim for
            // code readability; wallets are masked even inside fences per
            // scenario S6.
            continue;
        }

        // Ticker false-positive guard: an all-caps token that matches the
        // allowlist is not a name, it's a symbol (spec §4.D "Allow/deny").
        if hit.kind == EntityKind::NameLike && rules.ticker_allowlist.contains(hit.text.as_str()) {
            stats.false_positive_avoided += 1;
            continue;
        }
        if RE_TICKER.is_match(&hit.text) && rules.ticker_allowlist.contains(hit.text.as_str()) {
            stats.false_positive_avoided += 1;
            continue;
        }
        if hit.kind == EntityKind::Email {
            if let Some(domain) = hit.text.split('@').nth(1) {
                if rules.domain_allowlist.contains(domain) {
                    stats.false_positive_avoided += 1;
                    continue;
                }
            }
        }

        out.push_str(&content[cursor..hit.start]);
        let masked = mask_for(&hit, &salt);
        out.push_str(&masked);
        cursor = hit.end;
        stats.entities_found += 1;
        if is_sensitive(hit.kind) {
            any_sensitive = true;
        }
    }
    out.push_str(&content[cursor..]);

    // Preserved-ticker scan outside any masked ranges: a bare allowlisted
    // ticker present anywhere counts as a "preserved token" for
    // classification (spec §4.D "classify the entire document").
    if prof.preserve_tickers
        && RE_TICKER
            .find_iter(content)
            .any(|m| rules.ticker_allowlist.contains(m.as_str()))
    {
        any_preserved = true;
    }

    let classification = if any_sensitive {
        Classification::SensitiveHigh
    } else if any_preserved {
        Classification::Public
    } else {
        Classification::SensitiveLow
    };

    stats.bytes_out = out.len();

    let mut hasher = Sha256::new();
    hasher.update(out.as_bytes());
    let hash = hex::encode(hasher.finalize())[..16].to_string();

    RedactResult {
        classification,
        masked_content: out,
        stats,
        hash,
        truncated,
    }
}

pub struct PiiGuard {
    rules: parking_lot::RwLock<PrivacyRules>,
    bus: parking_lot::RwLock<Option<Arc<EventBus>>>,
    audit: Arc<AuditSink>,
}

impl PiiGuard {
    pub fn new(audit: Arc<AuditSink>, rules: PrivacyRules) -> Arc<Self> {
        Arc::new(Self {
            rules: parking_lot::RwLock::new(rules),
            bus: parking_lot::RwLock::new(None),
            audit,
        })
    }

    /// Classify arbitrary content for a named profile, by convention
    /// `digest|postmortem|notes|cards` else `generic` (spec §4.D "Profiles").
    pub fn classify(&self, profile_name: &str, content: &str) -> RedactResult {
        let profile = match profile_name {
            "digest" => Profile::Digest,
            "postmortem" => Profile::Postmortem,
            "notes" => Profile::Notes,
            "cards" => Profile::Cards,
            _ => Profile::Generic,
        };
        let rules = self.rules.read().clone();
        redact(content, profile, &rules, Utc::now())
    }

    /// Atomically replace the privacy ruleset (spec §6 "Hot-reload
    /// supported only for: routing rules, privacy rules, endpoint catalog,
    /// policy caps").
    pub fn update_rules(&self, rules: PrivacyRules) {
        *self.rules.write() = rules;
    }

    pub async fn handle_request(&self, request_id: String, profile: String, content: String) {
        let result = self.classify(&profile, &content);
        if result.truncated {
            self.audit
                .record("pii_guard", Some(&request_id), "appendix_truncated", "maxBytes exceeded")
                .await;
        }
        if let Some(bus) = self.bus.read().clone() {
            let ready = RedactReady {
                request_id,
                classification: result.classification,
                masked_content: result.masked_content,
                hash: result.hash,
            };
            let envelope = Envelope::new(Topic::RedactReady, "pii_guard", Payload::RedactReady(ready));
            bus.publish(Topic::RedactReady, envelope).await;
        }
    }
}

#[async_trait]
impl Module for Arc<PiiGuard> {
    fn name(&self) -> &'static str {
        "pii_guard"
    }

    async fn initialize(&self, bus: &Arc<EventBus>, config: &serde_json::Value) -> OpsResult<()> {
        if let Ok(rules) = serde_json::from_value::<PrivacyRules>(config.clone()) {
            *self.rules.write() = rules;
        }
        *self.bus.write() = Some(bus.clone());

        let this = self.clone();
        bus.subscribe(
            Topic::RedactRequest,
            "pii_guard.requests",
            Arc::new(move |envelope: Envelope| {
                let this = this.clone();
                Box::pin(async move {
                    if let Payload::RedactRequest(req) = envelope.payload {
                        this.handle_request(req.request_id, req.profile, req.content).await;
                    }
                    Ok(())
                })
            }),
            SubscribeOptions {
                concurrency: 8,
                ordered: false,
                ..Default::default()
            },
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
    fn s6_redaction_preserves_fence_and_ticker_masks_email() {
        let content = "Contact alice@example.com about AVAX.\n```\nwallet 0x1234567890abcdef1234567890abcdef12345678\n```";
        let rules = PrivacyRules::default();
        let result = redact(content, Profile::Digest, &rules, Utc::now());
        assert_eq!(result.classification, Classification::SensitiveHigh);
        assert!(result.masked_content.contains("al***@***.com"));
        assert!(result.masked_content.contains("0x***masked***"));
        assert!(result.masked_content.contains("AVAX"));
        assert_eq!(result.stats.entities_found, 2);
        assert_eq!(result.stats.false_positive_avoided, 1);
    }

    #[test]
    fn property5_classification_is_stable_across_reruns() {
        let content = "Plain status update with no sensitive fields, ticker ETH only.";
        let rules = PrivacyRules::default();
        let now = Utc::now();
        let r1 = redact(content, Profile::Notes, &rules, now);
        let r2 = redact(content, Profile::Notes, &rules, now);
        assert_eq!(r1.classification, r2.classification);
        assert_eq!(r1.masked_content, r2.masked_content);
    }

    #[test]
    fn max_bytes_truncation_sets_flag() {
        let rules = PrivacyRules {
            max_bytes: 10,
            ..PrivacyRules::default()
        };
        let result = redact("this is a much longer body than ten bytes", Profile::Generic, &rules, Utc::now());
        assert!(result.truncated);
    }
}
