#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use orch_gate_domain::{hash_bytes, now_utc, rfc3339, DecisionId, HitlRequestId};
use orch_gate_policy::PolicySnapshot;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.85;
pub const DEFAULT_MIN_GAP: f64 = 0.05;
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 600;

// ---------------------------------------------------------------------------
// Tier 0: ordered rule router

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteDecision {
    pub tool: Option<String>,
    pub params: Map<String, Value>,
    pub confidence: f64,
    pub reason: String,
}

impl RouteDecision {
    #[must_use]
    pub fn no_match() -> Self {
        Self { tool: None, params: Map::new(), confidence: 0.0, reason: "no_match".to_string() }
    }
}

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;
type ParamBuilder = Box<dyn Fn(&str) -> Map<String, Value> + Send + Sync>;

pub struct RouteRule {
    pub tool: String,
    predicate: Predicate,
    param_builder: ParamBuilder,
    pub confidence: f64,
    pub reason: String,
}

impl RouteRule {
    #[must_use]
    pub fn new(
        tool: impl Into<String>,
        predicate: Predicate,
        param_builder: ParamBuilder,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            predicate,
            param_builder,
            confidence,
            reason: reason.into(),
        }
    }

    /// The common keyword rule: matches when the keyword appears anywhere in
    /// the lowered input and binds the remainder to one parameter.
    #[must_use]
    pub fn keyword(
        tool: impl Into<String>,
        keyword: &str,
        param_key: &str,
        confidence: f64,
        reason: impl Into<String>,
    ) -> Self {
        let needle = keyword.to_ascii_lowercase();
        let matcher = needle.clone();
        let key = param_key.to_string();
        Self::new(
            tool,
            Box::new(move |text: &str| text.to_ascii_lowercase().contains(&matcher)),
            Box::new(move |text: &str| {
                let stripped =
                    text.to_ascii_lowercase().replacen(&needle, "", 1).trim().to_string();
                let mut params = Map::new();
                params.insert(key.clone(), Value::String(stripped));
                params
            }),
            confidence,
            reason,
        )
    }
}

/// Deterministic, explainable first-match-wins router.
#[derive(Default)]
pub struct RuleRouter {
    rules: Vec<RouteRule>,
}

impl RuleRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: RouteRule) {
        self.rules.push(rule);
    }

    #[must_use]
    pub fn route(&self, user_input: &str) -> RouteDecision {
        for rule in &self.rules {
            if (rule.predicate)(user_input) {
                return RouteDecision {
                    tool: Some(rule.tool.clone()),
                    params: (rule.param_builder)(user_input),
                    confidence: rule.confidence,
                    reason: rule.reason.clone(),
                };
            }
        }
        RouteDecision::no_match()
    }
}

// ---------------------------------------------------------------------------
// Tier 2: embedding-backed semantic ranking

pub trait Embedder: Send + Sync {
    /// `Ok(None)` means the embedder is reachable but produced nothing usable;
    /// transport failures also degrade to `Ok(None)` so routing falls through.
    #[allow(clippy::missing_errors_doc)]
    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>>;
}

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaEmbedder {
    #[must_use]
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self { base_url: base_url.into(), model: model.into(), timeout }
    }
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let response = agent
            .request("POST", &url)
            .set("content-type", "application/json")
            .send_json(json!({"model": self.model, "prompt": text}));
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "embedding request failed; semantic tier degrades to no_match");
                return Ok(None);
            }
        };
        let body: Value = response.into_json().context("invalid embedding response")?;
        let embedding = body.get("embedding").and_then(Value::as_array).map(|values| {
            values
                .iter()
                .filter_map(Value::as_f64)
                .map(|v| v as f32)
                .collect::<Vec<f32>>()
        });
        Ok(embedding.filter(|values| !values.is_empty()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SemanticMatch {
    pub tool: String,
    pub score: f64,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Ranks registered tool descriptions against the input embedding.
/// Tool-description embeddings are computed once and cached.
pub struct SemanticRouter {
    enabled: bool,
    embedder: Option<Arc<dyn Embedder>>,
    tool_prompts: Vec<(String, String)>,
    embeddings: Mutex<std::collections::BTreeMap<String, Vec<f32>>>,
}

impl SemanticRouter {
    #[must_use]
    pub fn new(
        tools: Vec<(String, String)>,
        embedder: Option<Arc<dyn Embedder>>,
        enabled: bool,
    ) -> Self {
        let tool_prompts = tools
            .into_iter()
            .map(|(name, description)| {
                let prompt = format!("{name}: {}", description.trim());
                (name, prompt)
            })
            .collect();
        Self {
            enabled: enabled && embedder.is_some(),
            embedder,
            tool_prompts,
            embeddings: Mutex::new(std::collections::BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Vec::new(), None, false)
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Candidates sorted by descending score; empty when disabled or the
    /// embedder yields nothing.
    #[must_use]
    pub fn rank(&self, user_input: &str) -> Vec<SemanticMatch> {
        if !self.enabled || user_input.trim().is_empty() {
            return Vec::new();
        }
        let Some(embedder) = &self.embedder else {
            return Vec::new();
        };
        let input_embedding = match embedder.embed(user_input) {
            Ok(Some(embedding)) => embedding,
            Ok(None) => return Vec::new(),
            Err(err) => {
                warn!(error = %err, "input embedding failed");
                return Vec::new();
            }
        };

        let mut candidates = Vec::new();
        for (name, prompt) in &self.tool_prompts {
            let Some(tool_embedding) = self.tool_embedding(embedder.as_ref(), name, prompt) else {
                continue;
            };
            candidates.push(SemanticMatch {
                tool: name.clone(),
                score: cosine_similarity(&input_embedding, &tool_embedding),
            });
        }
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }

    fn tool_embedding(&self, embedder: &dyn Embedder, name: &str, prompt: &str) -> Option<Vec<f32>> {
        if let Ok(cache) = self.embeddings.lock() {
            if let Some(found) = cache.get(name) {
                return Some(found.clone());
            }
        }
        let embedding = match embedder.embed(prompt) {
            Ok(Some(embedding)) => embedding,
            _ => return None,
        };
        if let Ok(mut cache) = self.embeddings.lock() {
            cache.insert(name.to_string(), embedding.clone());
        }
        Some(embedding)
    }
}

// ---------------------------------------------------------------------------
// Tier 1: signature-keyed decision cache

const CACHE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS intent_cache (
  policy_hash TEXT NOT NULL,
  signature TEXT NOT NULL,
  decision_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  PRIMARY KEY (policy_hash, signature)
);

CREATE INDEX IF NOT EXISTS idx_intent_cache_expires ON intent_cache(expires_at);
";

#[derive(Debug, Clone)]
pub struct IntentCache {
    db_path: PathBuf,
    ttl_seconds: u64,
}

impl IntentCache {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, ttl_seconds: u64) -> Self {
        Self { db_path: db_path.into(), ttl_seconds: ttl_seconds.max(1) }
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create cache db directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("failed to open intent cache at {}", self.db_path.display())
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure cache pragmas")?;
        conn.execute_batch(CACHE_SCHEMA).context("failed to apply cache schema")?;
        Ok(conn)
    }

    /// TTL-valid lookup; expired rows are invisible (and swept lazily).
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub fn get(&self, policy_hash: &str, signature: &str) -> Result<Option<IntentDecision>> {
        let conn = self.open()?;
        let row: Option<String> = conn
            .query_row(
                "SELECT decision_json FROM intent_cache
                 WHERE policy_hash = ?1 AND signature = ?2 AND expires_at > ?3",
                params![policy_hash, signature, rfc3339(now_utc())?],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read intent cache")?;
        Ok(row.and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// # Errors
    /// Returns an error on backend failure.
    pub fn set(&self, policy_hash: &str, signature: &str, decision: &IntentDecision) -> Result<()> {
        let created_at = now_utc();
        let expires_at = created_at
            + time::Duration::seconds(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX));
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO intent_cache
                (policy_hash, signature, decision_json, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                policy_hash,
                signature,
                serde_json::to_string(decision)?,
                rfc3339(created_at)?,
                rfc3339(expires_at)?,
            ],
        )
        .context("failed to write intent cache")?;
        Ok(())
    }

    /// Drop every entry bound to one policy hash.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub fn invalidate_policy(&self, policy_hash: &str) -> Result<usize> {
        let conn = self.open()?;
        let removed = conn
            .execute("DELETE FROM intent_cache WHERE policy_hash = ?1", params![policy_hash])
            .context("failed to invalidate intent cache")?;
        Ok(removed)
    }

    /// Flush the whole cache; used when the policy hash changes.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.open()?;
        let removed = conn
            .execute("DELETE FROM intent_cache", [])
            .context("failed to clear intent cache")?;
        Ok(removed)
    }

    /// # Errors
    /// Returns an error on backend failure.
    pub fn prune_expired(&self) -> Result<usize> {
        let conn = self.open()?;
        let removed = conn
            .execute(
                "DELETE FROM intent_cache WHERE expires_at <= ?1",
                params![rfc3339(now_utc())?],
            )
            .context("failed to prune intent cache")?;
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// Tier 3: human-in-the-loop queue

const HITL_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS hitl_queue (
  request_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('queued','approved','rejected','expired')),
  payload_json TEXT NOT NULL
);
";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HitlRequest {
    pub request_id: String,
    pub created_at: String,
    pub status: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct HitlQueue {
    db_path: PathBuf,
}

impl HitlQueue {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create hitl db directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open hitl queue at {}", self.db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure hitl pragmas")?;
        conn.execute_batch(HITL_SCHEMA).context("failed to apply hitl schema")?;
        Ok(conn)
    }

    /// # Errors
    /// Returns an error on backend failure.
    pub fn enqueue(&self, payload: &Value) -> Result<HitlRequest> {
        let request = HitlRequest {
            request_id: HitlRequestId::new().to_string(),
            created_at: rfc3339(now_utc())?,
            status: "queued".to_string(),
            payload: payload.clone(),
        };
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO hitl_queue(request_id, created_at, status, payload_json)
             VALUES (?1, ?2, 'queued', ?3)",
            params![request.request_id, request.created_at, serde_json::to_string(payload)?],
        )
        .context("failed to enqueue hitl request")?;
        Ok(request)
    }

    /// # Errors
    /// Returns an error on backend failure.
    pub fn get(&self, request_id: &str) -> Result<Option<HitlRequest>> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT request_id, created_at, status, payload_json
             FROM hitl_queue WHERE request_id = ?1",
            params![request_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .context("failed to read hitl request")?
        .map(|(request_id, created_at, status, payload_json)| {
            Ok(HitlRequest {
                request_id,
                created_at,
                status,
                payload: serde_json::from_str(&payload_json)
                    .unwrap_or_else(|_| Value::Object(Map::new())),
            })
        })
        .transpose()
    }

    /// Resolve a queued request. Returns false when the request is unknown
    /// or already terminal.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub fn resolve(&self, request_id: &str, approved: bool) -> Result<bool> {
        let conn = self.open()?;
        let status = if approved { "approved" } else { "rejected" };
        let changed = conn
            .execute(
                "UPDATE hitl_queue SET status = ?2 WHERE request_id = ?1 AND status = 'queued'",
                params![request_id, status],
            )
            .context("failed to resolve hitl request")?;
        Ok(changed > 0)
    }

    /// Mark queued requests created before the cutoff as expired.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub fn expire_stale(&self, cutoff: orch_gate_domain::DateTimeUtc) -> Result<usize> {
        let conn = self.open()?;
        let changed = conn
            .execute(
                "UPDATE hitl_queue SET status = 'expired'
                 WHERE status = 'queued' AND created_at <= ?1",
                params![rfc3339(cutoff)?],
            )
            .context("failed to expire hitl requests")?;
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// The tiered router

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentDecision {
    pub decision_id: String,
    pub policy_hash: Option<String>,
    pub tier_used: u8,
    pub intent_id: Option<String>,
    pub tool_params: Map<String, Value>,
    pub requires_hitl: bool,
    pub confidence: f64,
    pub gap: Option<f64>,
    pub deny_reason: Option<String>,
    pub evidence: Value,
    pub cacheable: bool,
}

impl IntentDecision {
    /// The step payload recorded for every routing decision.
    #[must_use]
    pub fn trace_payload(&self) -> Value {
        json!({
            "decision_id": self.decision_id,
            "policy_hash": self.policy_hash,
            "tier_used": self.tier_used,
            "intent_id": self.intent_id,
            "tool_params": self.tool_params,
            "requires_hitl": self.requires_hitl,
            "confidence": self.confidence,
            "gap": self.gap,
            "deny_reason": self.deny_reason,
            "evidence": self.evidence,
            "cacheable": self.cacheable,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IntentRouterConfig {
    pub enabled: bool,
    pub min_confidence: f64,
    pub min_gap: f64,
    pub default_tool: Option<String>,
}

impl Default for IntentRouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_gap: DEFAULT_MIN_GAP,
            default_tool: None,
        }
    }
}

fn control_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]+").expect("control char regex is static")
    })
}

fn whitespace() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("whitespace regex is static"))
}

/// Normalized form used for the cache signature: control characters dropped,
/// secret-shaped substrings masked, whitespace collapsed, lowercased.
#[must_use]
pub fn normalize_input(text: &str) -> String {
    let no_control = control_chars().replace_all(text, " ");
    let (scrubbed, _) = orch_gate_domain::scrub_text(
        &no_control,
        orch_gate_domain::RedactionProfile { max_value_chars: 0 },
    );
    whitespace().replace_all(&scrubbed, " ").trim().to_ascii_lowercase()
}

#[must_use]
pub fn cache_signature(policy_hash: &str, normalized_input: &str) -> String {
    let digest = hash_bytes(format!("{policy_hash}{normalized_input}").as_bytes());
    digest.chars().take(32).collect()
}

/// Four-tier decision pipeline: rule gate, cache, semantic ranking, HITL.
/// The rule and semantic routers are shared so a shadow-mode caller can
/// drive its legacy path over the same tables.
pub struct IntentRouter {
    rule_router: Arc<RuleRouter>,
    semantic: Arc<SemanticRouter>,
    cache: Option<IntentCache>,
    hitl: Option<HitlQueue>,
    config: IntentRouterConfig,
}

impl IntentRouter {
    #[must_use]
    pub fn new(
        rule_router: Arc<RuleRouter>,
        semantic: Arc<SemanticRouter>,
        cache: Option<IntentCache>,
        hitl: Option<HitlQueue>,
        config: IntentRouterConfig,
    ) -> Self {
        Self { rule_router, semantic, cache, hitl, config }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Flush cached decisions; called when the policy hash changes.
    pub fn flush_cache(&self) {
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.clear() {
                warn!(error = %err, "failed to flush intent cache");
            }
        }
    }

    /// Route one input against the supplied policy snapshot. The caller
    /// records the returned decision as an `intent_router` trace step.
    #[must_use]
    pub fn route(&self, user_input: &str, policy: &PolicySnapshot) -> IntentDecision {
        if !self.config.enabled {
            return self.decision(DecisionArgs {
                tier: 0,
                intent_id: None,
                confidence: 0.0,
                deny_reason: Some("intent_router_disabled".to_string()),
                evidence: json!({"note": "intent_router_disabled"}),
                cacheable: false,
                requires_hitl: false,
                policy_hash: policy.policy_hash.clone(),
                ..DecisionArgs::default()
            });
        }

        let policy_hash = policy.policy_hash.clone();
        let normalized = normalize_input(user_input);

        if let Some(decision) = self.tier0_rule(policy, &policy_hash, user_input) {
            return decision;
        }

        if normalized.is_empty() {
            return self.empty_input_decision(policy_hash);
        }

        if let (Some(cache), Some(hash)) = (&self.cache, &policy_hash) {
            let signature = cache_signature(hash, &normalized);
            match cache.get(hash, &signature) {
                Ok(Some(mut cached)) => {
                    cached.tier_used = 1;
                    let mut evidence = cached.evidence.as_object().cloned().unwrap_or_default();
                    evidence.insert("cache_hit".to_string(), Value::Bool(true));
                    cached.evidence = Value::Object(evidence);
                    return cached;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "intent cache lookup failed"),
            }
        }

        let decision = self.tier2_semantic(policy, &policy_hash, user_input);
        let decision = self.maybe_enqueue_hitl(policy, decision);

        if decision.cacheable && !decision.requires_hitl {
            if let (Some(cache), Some(hash)) = (&self.cache, &decision.policy_hash) {
                let signature = cache_signature(hash, &normalized);
                if let Err(err) = cache.set(hash, &signature, &decision) {
                    warn!(error = %err, "intent cache write failed");
                }
            }
        }
        decision
    }

    fn tier0_rule(
        &self,
        policy: &PolicySnapshot,
        policy_hash: &Option<String>,
        user_input: &str,
    ) -> Option<IntentDecision> {
        for pattern in &policy.tier0().deny_patterns {
            let Ok(matcher) = Regex::new(&format!("(?i){pattern}")) else {
                warn!(pattern = %pattern, "invalid tier0 deny pattern skipped");
                continue;
            };
            if matcher.is_match(user_input) {
                return Some(self.decision(DecisionArgs {
                    tier: 0,
                    confidence: 1.0,
                    deny_reason: Some("tier0_deny".to_string()),
                    evidence: json!({"rules_matched": [pattern]}),
                    policy_hash: policy_hash.clone(),
                    ..DecisionArgs::default()
                }));
            }
        }

        let routed = self.rule_router.route(user_input);
        if let Some(tool) = routed.tool {
            let tier3_required = policy
                .intent_config(&tool)
                .is_some_and(|intent| intent.tier3_required);
            let decision = self.decision(DecisionArgs {
                tier: 0,
                intent_id: Some(tool),
                tool_params: routed.params,
                confidence: routed.confidence,
                deny_reason: tier3_required.then(|| "tier3_required".to_string()),
                evidence: json!({
                    "rules_matched": [routed.reason],
                    "hitl_message": policy.hitl_message(),
                }),
                requires_hitl: tier3_required,
                policy_hash: policy_hash.clone(),
                ..DecisionArgs::default()
            });
            return Some(self.maybe_enqueue_hitl(policy, decision));
        }

        for pattern in &policy.tier0().allow_patterns {
            let Ok(matcher) = Regex::new(&format!("(?i){pattern}")) else {
                warn!(pattern = %pattern, "invalid tier0 allow pattern skipped");
                continue;
            };
            if matcher.is_match(user_input) {
                return Some(self.decision(DecisionArgs {
                    tier: 0,
                    intent_id: Some("allow_pattern".to_string()),
                    confidence: 0.9,
                    evidence: json!({"rules_matched": [pattern]}),
                    policy_hash: policy_hash.clone(),
                    ..DecisionArgs::default()
                }));
            }
        }

        None
    }

    fn empty_input_decision(&self, policy_hash: Option<String>) -> IntentDecision {
        match &self.config.default_tool {
            Some(tool) => self.decision(DecisionArgs {
                tier: 2,
                intent_id: Some(tool.clone()),
                confidence: 0.0,
                evidence: json!({"empty_input": true, "default_tool": tool}),
                policy_hash,
                ..DecisionArgs::default()
            }),
            None => self.decision(DecisionArgs {
                tier: 2,
                confidence: 0.0,
                deny_reason: Some("no_match".to_string()),
                evidence: json!({"empty_input": true}),
                policy_hash,
                ..DecisionArgs::default()
            }),
        }
    }

    fn tier2_semantic(
        &self,
        policy: &PolicySnapshot,
        policy_hash: &Option<String>,
        user_input: &str,
    ) -> IntentDecision {
        let candidates = self.semantic.rank(user_input);
        let topk: Vec<Value> = candidates
            .iter()
            .take(3)
            .map(|candidate| json!({"tool": candidate.tool, "score": candidate.score}))
            .collect();

        let Some(best) = candidates.first() else {
            return self.decision(DecisionArgs {
                tier: 2,
                confidence: 0.0,
                deny_reason: Some("no_match".to_string()),
                evidence: json!({"semantic_topk": topk, "guard_triggered": false}),
                policy_hash: policy_hash.clone(),
                ..DecisionArgs::default()
            });
        };

        let intent_cfg = policy.intent_config(&best.tool);
        let min_confidence = intent_cfg
            .and_then(|cfg| cfg.min_confidence_tier2)
            .unwrap_or(self.config.min_confidence);
        let min_gap = intent_cfg.and_then(|cfg| cfg.min_gap_tier2).unwrap_or(self.config.min_gap);
        let tier3_required = intent_cfg.is_some_and(|cfg| cfg.tier3_required);

        let runner_up = candidates.get(1);
        let gap = runner_up.map(|second| best.score - second.score);

        if best.score < min_confidence {
            // Below threshold is no_match, not HITL, unless the top
            // candidate explicitly demands review.
            return self.decision(DecisionArgs {
                tier: 2,
                intent_id: tier3_required.then(|| best.tool.clone()),
                confidence: best.score,
                gap,
                deny_reason: Some(if tier3_required {
                    "tier3_required".to_string()
                } else {
                    "no_match".to_string()
                }),
                evidence: json!({"semantic_topk": topk, "guard_triggered": false}),
                requires_hitl: tier3_required,
                policy_hash: policy_hash.clone(),
                ..DecisionArgs::default()
            });
        }

        let exact_tie = runner_up.is_some_and(|second| second.score == best.score);
        let ambiguous = exact_tie || gap.is_some_and(|g| g < min_gap);
        if ambiguous {
            let message = policy.hitl_message().to_string();
            return self.decision(DecisionArgs {
                tier: 2,
                intent_id: Some(best.tool.clone()),
                confidence: best.score,
                gap,
                deny_reason: Some("ambiguous_intent".to_string()),
                evidence: json!({
                    "semantic_topk": topk,
                    "guard_triggered": true,
                    "guard_message": message,
                }),
                requires_hitl: true,
                policy_hash: policy_hash.clone(),
                ..DecisionArgs::default()
            });
        }

        self.decision(DecisionArgs {
            tier: 2,
            intent_id: Some(best.tool.clone()),
            confidence: best.score,
            gap,
            deny_reason: tier3_required.then(|| "tier3_required".to_string()),
            evidence: json!({"semantic_topk": topk, "guard_triggered": false}),
            cacheable: !tier3_required,
            requires_hitl: tier3_required,
            policy_hash: policy_hash.clone(),
            ..DecisionArgs::default()
        })
    }

    fn maybe_enqueue_hitl(&self, policy: &PolicySnapshot, decision: IntentDecision) -> IntentDecision {
        if !decision.requires_hitl {
            return decision;
        }
        let mut evidence = decision.evidence.as_object().cloned().unwrap_or_default();
        evidence.insert(
            "hitl_message".to_string(),
            Value::String(policy.hitl_message().to_string()),
        );
        if let Some(queue) = &self.hitl {
            let payload = json!({
                "decision_id": decision.decision_id,
                "intent_id": decision.intent_id,
                "confidence": decision.confidence,
                "gap": decision.gap,
                "evidence": decision.evidence,
            });
            match queue.enqueue(&payload) {
                Ok(request) => {
                    evidence.insert(
                        "hitl_request_id".to_string(),
                        Value::String(request.request_id),
                    );
                }
                Err(err) => warn!(error = %err, "failed to enqueue hitl request"),
            }
        }
        let deny_reason =
            decision.deny_reason.clone().or_else(|| Some("hitl_required".to_string()));
        IntentDecision { deny_reason, evidence: Value::Object(evidence), cacheable: false, ..decision }
    }

    fn decision(&self, args: DecisionArgs) -> IntentDecision {
        IntentDecision {
            decision_id: DecisionId::new().to_string(),
            policy_hash: args.policy_hash,
            tier_used: args.tier,
            intent_id: args.intent_id,
            tool_params: args.tool_params,
            requires_hitl: args.requires_hitl,
            confidence: args.confidence,
            gap: args.gap,
            deny_reason: args.deny_reason,
            evidence: args.evidence,
            cacheable: args.cacheable,
        }
    }
}

#[derive(Default)]
struct DecisionArgs {
    tier: u8,
    intent_id: Option<String>,
    tool_params: Map<String, Value>,
    confidence: f64,
    gap: Option<f64>,
    deny_reason: Option<String>,
    evidence: Value,
    cacheable: bool,
    requires_hitl: bool,
    policy_hash: Option<String>,
}
