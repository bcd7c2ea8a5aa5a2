#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use orch_gate_domain::hash_bytes;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Parsed shape of the tool policy document.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PolicyDocument {
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub intents: Vec<IntentConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct PolicySection {
    #[serde(default)]
    pub intent_router: IntentRouterSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct IntentRouterSection {
    #[serde(default)]
    pub tier0: Tier0Patterns,
    #[serde(default)]
    pub hitl: HitlSection,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Tier0Patterns {
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    #[serde(default)]
    pub allow_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct HitlSection {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    /// Regex matched case-insensitively against the tool name.
    #[serde(rename = "match")]
    pub match_pattern: String,
    pub action: RuleAction,
    #[serde(default = "default_rule_reason")]
    pub reason: String,
    #[serde(default)]
    pub require_safe: Option<bool>,
    #[serde(default)]
    pub conditions: Option<RuleConditions>,
}

fn default_rule_reason() -> String {
    "policy_rule".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleConditions {
    #[serde(default)]
    pub input_param: Option<String>,
    #[serde(default)]
    pub max_input_len: Option<usize>,
    #[serde(default)]
    pub required_flags: Vec<String>,
}

/// Per-intent routing configuration consumed by the intent router.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IntentConfig {
    pub id: String,
    #[serde(default)]
    pub tier3_required: bool,
    #[serde(default)]
    pub min_confidence_tier2: Option<f64>,
    #[serde(default)]
    pub min_gap_tier2: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub matched_rule: Option<String>,
    pub rule_index: Option<usize>,
    pub policy_hash: Option<String>,
}

#[derive(Debug)]
struct CompiledRule {
    matcher: Regex,
    rule: PolicyRule,
}

/// One consistent view of the rules; readers hold the `Arc` they captured.
#[derive(Debug)]
pub struct PolicySnapshot {
    pub document: PolicyDocument,
    pub policy_hash: Option<String>,
    compiled: Vec<CompiledRule>,
}

impl PolicySnapshot {
    fn empty() -> Self {
        Self { document: PolicyDocument::default(), policy_hash: None, compiled: Vec::new() }
    }

    fn from_raw(raw: &[u8]) -> Result<Self> {
        let document: PolicyDocument =
            serde_yaml::from_slice(raw).map_err(|err| anyhow!("invalid policy document: {err}"))?;
        let mut compiled = Vec::with_capacity(document.rules.len());
        for rule in &document.rules {
            let matcher = Regex::new(&format!("(?i){}", rule.match_pattern)).with_context(|| {
                format!("invalid policy rule pattern '{}'", rule.match_pattern)
            })?;
            compiled.push(CompiledRule { matcher, rule: rule.clone() });
        }
        Ok(Self { document, policy_hash: Some(hash_bytes(raw)), compiled })
    }

    #[must_use]
    pub fn intent_config(&self, intent_id: &str) -> Option<&IntentConfig> {
        self.document.intents.iter().find(|intent| intent.id == intent_id)
    }

    #[must_use]
    pub fn tier0(&self) -> &Tier0Patterns {
        &self.document.policy.intent_router.tier0
    }

    #[must_use]
    pub fn hitl_message(&self) -> &str {
        self.document
            .policy
            .intent_router
            .hitl
            .message
            .as_deref()
            .unwrap_or("Ambiguous intent detected. Human review required.")
    }
}

/// Ordered allow/deny rule evaluation with a content-addressed policy hash.
///
/// Reloads publish a fresh snapshot through read-copy-update; decisions made
/// against an older snapshot keep the hash they captured.
pub struct PolicyEngine {
    enforce: bool,
    policy_path: Option<PathBuf>,
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyEngine {
    /// Load the policy document from disk. A missing file yields an empty
    /// rule set (deny-by-default when enforcement is on).
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read or parsed.
    pub fn from_path(path: &Path, enforce: bool) -> Result<Self> {
        let snapshot = if path.exists() {
            let raw = std::fs::read(path)
                .with_context(|| format!("failed to read policy document {}", path.display()))?;
            PolicySnapshot::from_raw(&raw)?
        } else {
            warn!(path = %path.display(), "tool policy document missing; rule set is empty");
            PolicySnapshot::empty()
        };
        Ok(Self {
            enforce,
            policy_path: Some(path.to_path_buf()),
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Build an engine from an inline YAML document.
    ///
    /// # Errors
    /// Returns an error when the document cannot be parsed.
    pub fn from_yaml_str(raw: &str, enforce: bool) -> Result<Self> {
        Ok(Self {
            enforce,
            policy_path: None,
            snapshot: RwLock::new(Arc::new(PolicySnapshot::from_raw(raw.as_bytes())?)),
        })
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enforce: false,
            policy_path: None,
            snapshot: RwLock::new(Arc::new(PolicySnapshot::empty())),
        }
    }

    #[must_use]
    pub fn enforced(&self) -> bool {
        self.enforce
    }

    /// The currently published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.read().map(|guard| Arc::clone(&guard)).unwrap_or_else(|poisoned| {
            Arc::clone(&poisoned.into_inner())
        })
    }

    #[must_use]
    pub fn policy_hash(&self) -> Option<String> {
        self.snapshot().policy_hash.clone()
    }

    /// Re-read the policy document and atomically publish a new snapshot.
    /// Returns `true` when the policy hash changed (callers flush the intent
    /// cache on change).
    ///
    /// # Errors
    /// Returns an error when the document cannot be read or parsed; the
    /// previous snapshot stays published.
    pub fn reload(&self) -> Result<bool> {
        let Some(path) = &self.policy_path else {
            return Ok(false);
        };
        let next = if path.exists() {
            let raw = std::fs::read(path)
                .with_context(|| format!("failed to read policy document {}", path.display()))?;
            PolicySnapshot::from_raw(&raw)?
        } else {
            PolicySnapshot::empty()
        };
        let changed = next.policy_hash != self.snapshot().policy_hash;
        if let Ok(mut guard) = self.snapshot.write() {
            *guard = Arc::new(next);
        }
        Ok(changed)
    }

    /// Evaluate the ordered rules for one tool invocation. Rules whose
    /// conditions do not hold are skipped, not converted into denials.
    #[must_use]
    pub fn check(&self, tool_name: &str, args: &Value, safe: bool) -> PolicyDecision {
        let snapshot = self.snapshot();
        if !self.enforce {
            return PolicyDecision {
                allowed: true,
                reason: "policy_disabled".to_string(),
                matched_rule: None,
                rule_index: None,
                policy_hash: snapshot.policy_hash.clone(),
            };
        }
        if snapshot.compiled.is_empty() {
            return PolicyDecision {
                allowed: false,
                reason: "policy_missing".to_string(),
                matched_rule: None,
                rule_index: None,
                policy_hash: snapshot.policy_hash.clone(),
            };
        }

        for (index, compiled) in snapshot.compiled.iter().enumerate() {
            if !compiled.matcher.is_match(tool_name) {
                continue;
            }
            if compiled.rule.require_safe == Some(true) && !safe {
                return PolicyDecision {
                    allowed: false,
                    reason: "policy_requires_safe".to_string(),
                    matched_rule: Some(compiled.rule.match_pattern.clone()),
                    rule_index: Some(index),
                    policy_hash: snapshot.policy_hash.clone(),
                };
            }
            if let Some(conditions) = &compiled.rule.conditions {
                if !conditions_hold(conditions, args) {
                    continue;
                }
            }
            return PolicyDecision {
                allowed: compiled.rule.action == RuleAction::Allow,
                reason: compiled.rule.reason.clone(),
                matched_rule: Some(compiled.rule.match_pattern.clone()),
                rule_index: Some(index),
                policy_hash: snapshot.policy_hash.clone(),
            };
        }

        PolicyDecision {
            allowed: false,
            reason: "policy_default_deny".to_string(),
            matched_rule: None,
            rule_index: None,
            policy_hash: snapshot.policy_hash.clone(),
        }
    }
}

fn conditions_hold(conditions: &RuleConditions, args: &Value) -> bool {
    if let Some(param) = &conditions.input_param {
        let Some(raw) = args.get(param).and_then(Value::as_str) else {
            return false;
        };
        if let Some(max_len) = conditions.max_input_len {
            if raw.chars().count() > max_len {
                return false;
            }
        }
    }
    for flag in &conditions.required_flags {
        let truthy = match args.get(flag) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            _ => false,
        };
        if !truthy {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::PolicyEngine;

    const POLICY_DOC: &str = r#"
policy:
  intent_router:
    tier0:
      deny_patterns:
        - "(?i)drop\\s+table"
      allow_patterns:
        - "^help$"
    hitl:
      message: "Operator review needed."
rules:
  - match: "^python_exec$"
    action: allow
    reason: allow_short_code
    conditions:
      input_param: code
      max_input_len: 5
  - match: "^echo$"
    action: allow
    reason: echo_is_safe
  - match: ".*"
    action: deny
    reason: default_deny
intents:
  - id: python_exec
    tier3_required: true
    min_confidence_tier2: 0.9
"#;

    fn engine(enforce: bool) -> PolicyEngine {
        PolicyEngine::from_yaml_str(POLICY_DOC, enforce)
            .unwrap_or_else(|err| panic!("policy parse failed: {err:#}"))
    }

    #[test]
    fn allows_when_rule_and_conditions_match() {
        let decision = engine(true).check("python_exec", &json!({"code": "12345"}), false);
        assert!(decision.allowed);
        assert_eq!(decision.reason, "allow_short_code");
        assert_eq!(decision.rule_index, Some(0));
        assert!(decision.policy_hash.is_some());
    }

    #[test]
    fn failed_conditions_skip_the_rule_and_fall_through() {
        let decision = engine(true).check("python_exec", &json!({"code": "123456"}), false);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "default_deny");
        assert_eq!(decision.rule_index, Some(2));
    }

    #[test]
    fn missing_condition_param_also_falls_through() {
        let decision = engine(true).check("python_exec", &json!({}), false);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "default_deny");
    }

    #[test]
    fn required_flags_must_be_truthy() {
        let doc = r#"
rules:
  - match: "^web_search$"
    action: allow
    reason: flagged_ok
    conditions:
      required_flags: ["confirmed"]
  - match: ".*"
    action: deny
    reason: default_deny
"#;
        let engine = PolicyEngine::from_yaml_str(doc, true)
            .unwrap_or_else(|err| panic!("policy parse failed: {err:#}"));
        assert!(engine.check("web_search", &json!({"confirmed": true}), true).allowed);
        assert!(!engine.check("web_search", &json!({"confirmed": false}), true).allowed);
        assert!(!engine.check("web_search", &json!({}), true).allowed);
    }

    #[test]
    fn require_safe_denies_unsafe_tools() {
        let doc = r#"
rules:
  - match: ".*"
    action: allow
    reason: blanket
    require_safe: true
"#;
        let engine = PolicyEngine::from_yaml_str(doc, true)
            .unwrap_or_else(|err| panic!("policy parse failed: {err:#}"));
        assert!(engine.check("echo", &json!({}), true).allowed);
        let decision = engine.check("python_exec", &json!({}), false);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "policy_requires_safe");
    }

    #[test]
    fn enforcement_off_allows_everything() {
        let decision = engine(false).check("anything", &json!({}), false);
        assert!(decision.allowed);
        assert_eq!(decision.reason, "policy_disabled");
    }

    #[test]
    fn empty_rules_deny_when_enforcing() {
        let engine = PolicyEngine::from_yaml_str("rules: []", true)
            .unwrap_or_else(|err| panic!("policy parse failed: {err:#}"));
        let decision = engine.check("echo", &json!({}), true);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "policy_missing");
    }

    #[test]
    fn policy_hash_is_stable_for_identical_documents() {
        let a = engine(true).policy_hash();
        let b = engine(true).policy_hash();
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn decisions_carry_the_hash_of_the_rules_that_made_them() {
        let engine = engine(true);
        let decision = engine.check("echo", &json!({}), true);
        assert_eq!(decision.policy_hash, engine.policy_hash());
    }

    #[test]
    fn reload_reports_hash_changes() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("orch-gate-policy-{}.yaml", ulid::Ulid::new()));
        std::fs::write(&path, "rules:\n  - match: \".*\"\n    action: allow\n    reason: first\n")
            .unwrap_or_else(|err| panic!("write failed: {err}"));

        let engine = PolicyEngine::from_path(&path, true)
            .unwrap_or_else(|err| panic!("load failed: {err:#}"));
        let initial = engine.policy_hash();

        let unchanged = engine.reload().unwrap_or_else(|err| panic!("reload failed: {err:#}"));
        assert!(!unchanged);

        std::fs::write(&path, "rules:\n  - match: \".*\"\n    action: deny\n    reason: second\n")
            .unwrap_or_else(|err| panic!("write failed: {err}"));
        let changed = engine.reload().unwrap_or_else(|err| panic!("reload failed: {err:#}"));
        assert!(changed);
        assert_ne!(engine.policy_hash(), initial);
        assert!(!engine.check("echo", &json!({}), true).allowed);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn intent_and_tier0_sections_are_exposed() {
        let engine = engine(true);
        let snapshot = engine.snapshot();
        let intent = snapshot.intent_config("python_exec");
        assert!(intent.is_some_and(|cfg| cfg.tier3_required));
        assert_eq!(snapshot.tier0().deny_patterns.len(), 1);
        assert_eq!(snapshot.hitl_message(), "Operator review needed.");
    }
}
