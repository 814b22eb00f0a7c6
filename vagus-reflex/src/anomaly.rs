//! Anomaly Engine - rule-based detection, healing and quarantine
//!
//! Domain teams plug in rules against opaque JSON entities:
//! - `scan` runs every rule targeting the entity kind, in registration
//!   order; several rules may fire for one entity
//! - `heal` re-scans and applies each rule's heal function in place;
//!   an unhealed threat at High severity or above quarantines a deep
//!   snapshot of the entity and broadcasts a high-intensity pain signal
//! - quarantine release is manual only, by index
//! - `investigate_pain` matches free-text pain details against a fixed
//!   pattern set to bump counters; an extension point, not a learner

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use vagus_core::{intensity, Component, ComponentError, Dispatcher, Signal, SignalPayload, Vital};

/// Threat severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Result of one heal attempt.
#[derive(Debug, Clone)]
pub struct HealOutcome {
    pub healed: bool,
    pub note: Option<String>,
}

impl HealOutcome {
    pub fn healed() -> Self {
        Self {
            healed: true,
            note: None,
        }
    }

    pub fn failed(note: &str) -> Self {
        Self {
            healed: false,
            note: Some(note.to_string()),
        }
    }
}

type DetectFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type HealFn = Arc<dyn Fn(&mut Value) -> HealOutcome + Send + Sync>;

/// A pluggable detection rule, optionally able to heal what it finds.
#[derive(Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Entity kind this rule targets.
    pub kind: String,
    pub severity: Severity,
    detect: DetectFn,
    heal: Option<HealFn>,
}

impl Rule {
    pub fn new<D>(id: &str, name: &str, kind: &str, severity: Severity, detect: D) -> Self
    where
        D: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: kind.to_string(),
            severity,
            detect: Arc::new(detect),
            heal: None,
        }
    }

    pub fn with_heal<H>(mut self, heal: H) -> Self
    where
        H: Fn(&mut Value) -> HealOutcome + Send + Sync + 'static,
    {
        self.heal = Some(Arc::new(heal));
        self
    }
}

/// One rule firing against an entity.
#[derive(Debug, Clone)]
pub struct Threat {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub can_heal: bool,
    /// Short content signature for tallying.
    pub signature: String,
}

/// A threat plus what healing did about it.
#[derive(Debug, Clone)]
pub struct ThreatReport {
    pub threat: Threat,
    pub healed: bool,
    pub note: Option<String>,
}

/// Outcome of a scan-and-heal pass.
#[derive(Debug, Clone)]
pub struct HealReport {
    pub healthy: bool,
    pub quarantined: bool,
    pub threats: Vec<ThreatReport>,
    pub healed_count: usize,
}

/// A deep snapshot of an entity that failed healing.
#[derive(Debug, Clone)]
pub struct QuarantineEntry {
    pub snapshot: Value,
    pub kind: String,
    pub threats: Vec<Threat>,
    pub quarantined_at: DateTime<Utc>,
}

/// Snapshot exposed through vitals
#[derive(Debug, Clone, serde::Serialize)]
pub struct AnomalySnapshot {
    pub rules: usize,
    pub quarantined: usize,
    pub tallies: HashMap<String, u64>,
    pub investigations: HashMap<String, u64>,
}

// Fixed pattern set for pain investigation.
static PAIN_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("timeout", Regex::new(r"(?i)\btime[d\s]*out\b|\btimeout\b").unwrap()),
        (
            "connection",
            Regex::new(r"(?i)\bconnection\b|\brefused\b|\bunreachable\b").unwrap(),
        ),
        (
            "parse",
            Regex::new(r"(?i)\bparse\b|\binvalid\b|\bmalformed\b").unwrap(),
        ),
        (
            "missing-data",
            Regex::new(r"(?i)\bmissing\b|\bnot found\b|\babsent\b").unwrap(),
        ),
        (
            "stale",
            Regex::new(r"(?i)\bstale\b|\bexpired\b|\boutdated\b").unwrap(),
        ),
    ]
});

fn threat_signature(rule_id: &str, kind: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

/// Rule-based detector and healer with quarantine
pub struct AnomalyEngine {
    vital: Vital,
    rules: RwLock<Vec<Rule>>,
    quarantine: Mutex<Vec<QuarantineEntry>>,
    tally: DashMap<String, u64>,
    investigations: DashMap<String, u64>,
}

impl AnomalyEngine {
    pub fn new(hub: Arc<Dispatcher>) -> Self {
        Self {
            vital: Vital::new("anomaly-engine", hub),
            rules: RwLock::new(Vec::new()),
            quarantine: Mutex::new(Vec::new()),
            tally: DashMap::new(),
            investigations: DashMap::new(),
        }
    }

    /// Append a rule; rules evaluate in registration order.
    pub fn add_rule(&self, rule: Rule) {
        self.rules.write().push(rule);
    }

    fn matching_rules(&self, entity: &Value, kind: &str) -> Vec<Rule> {
        self.rules
            .read()
            .iter()
            .filter(|r| r.kind == kind && (r.detect)(entity))
            .cloned()
            .collect()
    }

    /// Run every rule targeting `kind`; tally signatures of what fires.
    pub fn scan(&self, entity: &Value, kind: &str) -> Vec<Threat> {
        self.matching_rules(entity, kind)
            .into_iter()
            .map(|rule| {
                let signature = threat_signature(&rule.id, kind);
                *self.tally.entry(signature.clone()).or_insert(0) += 1;
                Threat {
                    can_heal: rule.heal.is_some(),
                    rule_id: rule.id,
                    rule_name: rule.name,
                    severity: rule.severity,
                    signature,
                }
            })
            .collect()
    }

    /// Re-scan and heal in place. Unhealed threats at High severity or
    /// above quarantine the entity (deep snapshot) and broadcast pain;
    /// partial healing of low-severity threats still counts as healthy.
    pub async fn heal(&self, entity: &mut Value, kind: &str) -> HealReport {
        let rules = self.matching_rules(entity, kind);
        let mut reports = Vec::with_capacity(rules.len());
        let mut healed_count = 0;

        for rule in &rules {
            let signature = threat_signature(&rule.id, kind);
            *self.tally.entry(signature.clone()).or_insert(0) += 1;
            let threat = Threat {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                severity: rule.severity,
                can_heal: rule.heal.is_some(),
                signature,
            };

            let (healed, note) = match &rule.heal {
                Some(heal) => {
                    let outcome = heal(entity);
                    if outcome.healed {
                        healed_count += 1;
                        debug!(rule = %rule.id, kind, "healed");
                    }
                    (outcome.healed, outcome.note)
                }
                None => (false, None),
            };

            reports.push(ThreatReport {
                threat,
                healed,
                note,
            });
        }

        let unresolved: Vec<Threat> = reports
            .iter()
            .filter(|r| !r.healed && r.threat.severity >= Severity::High)
            .map(|r| r.threat.clone())
            .collect();

        if unresolved.is_empty() {
            return HealReport {
                healthy: true,
                quarantined: false,
                threats: reports,
                healed_count,
            };
        }

        let unresolved_count = unresolved.len();
        self.quarantine.lock().push(QuarantineEntry {
            snapshot: entity.clone(),
            kind: kind.to_string(),
            threats: unresolved,
            quarantined_at: Utc::now(),
        });
        info!(kind, unresolved = unresolved_count, "entity quarantined");

        let name = self.vital.name().to_string();
        let pain = Signal::pain(
            &name,
            &format!("{kind} entity quarantined with {unresolved_count} unresolved threats"),
            intensity::HIGH,
            &name,
        );
        if let Err(e) = self.vital.hub().broadcast(pain).await {
            warn!(error = %e, "quarantine pain dropped");
        }

        HealReport {
            healthy: false,
            quarantined: true,
            threats: reports,
            healed_count,
        }
    }

    /// Manual release by index; `None` when the index is out of range.
    pub fn release_from_quarantine(&self, index: usize) -> Option<QuarantineEntry> {
        let mut quarantine = self.quarantine.lock();
        if index < quarantine.len() {
            Some(quarantine.remove(index))
        } else {
            None
        }
    }

    pub fn quarantine_len(&self) -> usize {
        self.quarantine.lock().len()
    }

    /// Match a pain signal's free text against the fixed pattern set,
    /// bumping a counter per matched class.
    pub fn investigate_pain(&self, signal: &Signal) -> Option<String> {
        let SignalPayload::Pain { detail, .. } = &signal.payload else {
            return None;
        };

        let matched: Vec<&str> = PAIN_PATTERNS
            .iter()
            .filter(|(_, regex)| regex.is_match(detail))
            .map(|(label, _)| *label)
            .collect();

        if matched.is_empty() {
            return None;
        }

        for label in &matched {
            *self.investigations.entry(label.to_string()).or_insert(0) += 1;
        }
        Some(matched.join(","))
    }

    pub fn snapshot(&self) -> AnomalySnapshot {
        AnomalySnapshot {
            rules: self.rules.read().len(),
            quarantined: self.quarantine_len(),
            tallies: self
                .tally
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            investigations: self
                .investigations
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

#[async_trait]
impl Component for AnomalyEngine {
    fn name(&self) -> &str {
        self.vital.name()
    }

    async fn feel(&self, signal: &Signal) -> Result<Option<String>, ComponentError> {
        match &signal.payload {
            SignalPayload::Pain { .. } => Ok(self
                .investigate_pain(signal)
                .map(|classes| format!("investigated: {classes}"))),
            _ => Ok(self.vital.absorb(signal)),
        }
    }

    async fn pulse(&self) -> f64 {
        let held = self.quarantine_len() as f64;
        (100.0 - 10.0 * held).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vagus_core::{DispatcherConfig, SignalKind};

    fn engine() -> (Arc<Dispatcher>, AnomalyEngine) {
        let hub = Arc::new(Dispatcher::new(DispatcherConfig::default()));
        let engine = AnomalyEngine::new(hub.clone());
        (hub, engine)
    }

    fn missing_name_rule() -> Rule {
        Rule::new(
            "recipe-name",
            "recipe must have a name",
            "recipe",
            Severity::Medium,
            |entity| entity.get("name").map_or(true, |n| n.is_null()),
        )
        .with_heal(|entity| {
            entity["name"] = json!("untitled recipe");
            HealOutcome::healed()
        })
    }

    fn negative_stock_rule() -> Rule {
        Rule::new(
            "stock-negative",
            "stock cannot be negative",
            "inventory",
            Severity::High,
            |entity| entity["stock"].as_f64().is_some_and(|s| s < 0.0),
        )
    }

    #[test]
    fn test_scan_runs_matching_rules_in_order() {
        let (_hub, engine) = engine();
        engine.add_rule(missing_name_rule());
        engine.add_rule(Rule::new(
            "recipe-steps",
            "recipe must have steps",
            "recipe",
            Severity::Low,
            |entity| entity.get("steps").is_none(),
        ));
        engine.add_rule(negative_stock_rule());

        let entity = json!({});
        let threats = engine.scan(&entity, "recipe");

        assert_eq!(threats.len(), 2);
        assert_eq!(threats[0].rule_id, "recipe-name");
        assert_eq!(threats[1].rule_id, "recipe-steps");
        assert_eq!(engine.snapshot().tallies.len(), 2);
    }

    #[tokio::test]
    async fn test_heal_mutates_entity() {
        let (_hub, engine) = engine();
        engine.add_rule(missing_name_rule());

        let mut entity = json!({ "servings": 4 });
        let report = engine.heal(&mut entity, "recipe").await;

        assert!(report.healthy);
        assert!(!report.quarantined);
        assert_eq!(report.healed_count, 1);
        assert_eq!(entity["name"], json!("untitled recipe"));
    }

    #[tokio::test]
    async fn test_unhealable_high_threat_quarantines() {
        let (hub, engine) = engine();
        engine.add_rule(negative_stock_rule());

        let mut entity = json!({ "stock": -3.0 });
        let report = engine.heal(&mut entity, "inventory").await;

        assert!(!report.healthy);
        assert!(report.quarantined);
        assert_eq!(engine.quarantine_len(), 1);

        let pains = hub.recent(SignalKind::Pain, chrono::Duration::seconds(5));
        assert_eq!(pains.len(), 1);
        assert_eq!(pains[0].intensity, intensity::HIGH);
    }

    #[tokio::test]
    async fn test_low_severity_unhealed_is_still_healthy() {
        let (_hub, engine) = engine();
        engine.add_rule(Rule::new(
            "recipe-notes",
            "recipe should have notes",
            "recipe",
            Severity::Low,
            |_| true,
        ));

        let mut entity = json!({ "name": "stew" });
        let report = engine.heal(&mut entity, "recipe").await;

        assert!(report.healthy);
        assert!(!report.quarantined);
        assert_eq!(report.healed_count, 0);
    }

    #[tokio::test]
    async fn test_quarantine_release_by_index() {
        let (_hub, engine) = engine();
        engine.add_rule(negative_stock_rule());

        let mut entity = json!({ "stock": -1.0 });
        engine.heal(&mut entity, "inventory").await;
        assert_eq!(engine.quarantine_len(), 1);

        let released = engine.release_from_quarantine(0);
        assert!(released.is_some());
        assert_eq!(released.unwrap().kind, "inventory");
        assert_eq!(engine.quarantine_len(), 0);

        // releasing from an empty quarantine returns nothing
        assert!(engine.release_from_quarantine(0).is_none());
    }

    #[test]
    fn test_investigate_pain_bumps_counters() {
        let (_hub, engine) = engine();

        let pain = Signal::pain("scraper", "request timed out after 30s", 0.7, "scraper");
        let classes = engine.investigate_pain(&pain);
        assert_eq!(classes.as_deref(), Some("timeout"));

        let pain = Signal::pain("parser", "invalid quantity: 'a pinch'", 0.5, "parser");
        engine.investigate_pain(&pain);

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.investigations["timeout"], 1);
        assert_eq!(snapshot.investigations["parse"], 1);
    }

    #[test]
    fn test_unmatched_pain_is_ignored() {
        let (_hub, engine) = engine();
        let pain = Signal::pain("x", "a perfectly novel failure", 0.5, "x");
        assert!(engine.investigate_pain(&pain).is_none());
        assert!(engine.snapshot().investigations.is_empty());
    }
}
