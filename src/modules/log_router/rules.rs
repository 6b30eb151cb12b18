//! Routing rule evaluation (spec §3 "Routing rule", §4.E "Decision
//! pipeline" step 1).
//!
//! Rules are evaluated in declared order. `drop=true` short-circuits the
//! rest of the chain; otherwise later matching rules augment additive
//! fields (`addTags`, `sink`) and override scalar fields (`samplePct`).

use serde::{Deserialize, Serialize};

use crate::bus::topics::LogRecord;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MatchClause {
    pub source: Option<String>,
    pub level: Option<String>,
    pub contains: Option<String>,
}

impl MatchClause {
    fn matches(&self, record: &LogRecord) -> bool {
        if let Some(source) = &self.source {
            if &record.source != source {
                return false;
            }
        }
        if let Some(level) = &self.level {
            if !record.level.eq_ignore_ascii_case(level) {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            if !record.message.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ActionClause {
    pub drop: Option<bool>,
    pub sample_pct: Option<f64>,
    pub add_tags: Option<Vec<String>>,
    pub sink: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "match")]
    pub match_clause: MatchClause,
    pub action: ActionClause,
}

/// Accumulated effect of every matching rule (spec §4.E step 1).
#[derive(Debug, Clone, Default)]
pub struct RuleOutcome {
    pub dropped: bool,
    pub sample_pct_override: Option<f64>,
    pub tags: Vec<String>,
    pub sinks: Vec<String>,
}

/// Evaluate `rules` against `record` in order (spec §3 "Ordered evaluation;
/// later matching rules augment additive fields ... and override scalar
/// fields ... except drop=true short-circuits").
pub fn evaluate_rules(rules: &[RoutingRule], record: &LogRecord) -> RuleOutcome {
    let mut out = RuleOutcome::default();
    for rule in rules {
        if !rule.match_clause.matches(record) {
            continue;
        }
        if rule.action.drop.unwrap_or(false) {
            out.dropped = true;
            return out;
        }
        if let Some(pct) = rule.action.sample_pct {
            out.sample_pct_override = Some(pct);
        }
        if let Some(tags) = &rule.action.add_tags {
            for t in tags {
                if !out.tags.contains(t) {
                    out.tags.push(t.clone());
                }
            }
        }
        if let Some(sinks) = &rule.action.sink {
            for s in sinks {
                if !out.sinks.contains(s) {
                    out.sinks.push(s.clone());
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(source: &str, level: &str, message: &str) -> LogRecord {
        LogRecord {
            ts: None,
            source: source.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            kv: HashMap::new(),
        }
    }

    #[test]
    fn drop_rule_short_circuits_later_rules() {
        let rules = vec![
            RoutingRule {
                match_clause: MatchClause { level: Some("debug".into()), ..Default::default() },
                action: ActionClause { drop: Some(true), ..Default::default() },
            },
            RoutingRule {
                match_clause: MatchClause::default(),
                action: ActionClause {
                    add_tags: Some(vec!["should-not-apply".into()]),
                    ..Default::default()
                },
            },
        ];
        let outcome = evaluate_rules(&rules, &record("api", "debug", "hello"));
        assert!(outcome.dropped);
        assert!(outcome.tags.is_empty());
    }

    #[test]
    fn later_rule_overrides_sample_pct_but_tags_accumulate() {
        let rules = vec![
            RoutingRule {
                match_clause: MatchClause::default(),
                action: ActionClause {
                    sample_pct: Some(50.0),
                    add_tags: Some(vec!["a".into()]),
                    ..Default::default()
                },
            },
            RoutingRule {
                match_clause: MatchClause::default(),
                action: ActionClause {
                    sample_pct: Some(10.0),
                    add_tags: Some(vec!["b".into()]),
                    ..Default::default()
                },
            },
        ];
        let outcome = evaluate_rules(&rules, &record("api", "info", "hello"));
        assert_eq!(outcome.sample_pct_override, Some(10.0));
        assert_eq!(outcome.tags, vec!["a".to_string(), "b".to_string()]);
    }
}
