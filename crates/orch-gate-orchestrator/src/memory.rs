use std::path::PathBuf;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use orch_gate_domain::{contains_secret_like, now_utc, rfc3339, scrub_secrets};
use regex::Regex;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{json, Value};
use ulid::Ulid;

fn new_candidate_id() -> String {
    format!("mem_{}", Ulid::new())
}

const INTENT_PREFIXES: &[&str] = &[
    r"remember this",
    r"remember that",
    r"don't forget",
    r"save this",
    r"store this",
    r"keep in mind",
    r"make a note",
];

fn intent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!("(?i)^\\s*(?:{})", INTENT_PREFIXES.join("|")))
            .expect("intent prefix regex is static")
    })
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    Off,
    Capture,
    Strict,
}

impl WritePolicy {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "capture" => Self::Capture,
            "strict" => Self::Strict,
            _ => Self::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub write_policy: WritePolicy,
    pub db_path: PathBuf,
    pub capture_ttl_minutes: u64,
    pub min_scrubbed_chars: usize,
}

impl MemoryConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            write_policy: WritePolicy::Off,
            db_path: PathBuf::from("instance/orchestrator_core.db"),
            capture_ttl_minutes: 180,
            min_scrubbed_chars: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemoryDecision {
    pub decision: &'static str,
    pub reason: &'static str,
    pub candidate_id: Option<String>,
}

impl MemoryDecision {
    fn deny(reason: &'static str) -> Self {
        Self { decision: "deny", reason, candidate_id: None }
    }

    #[must_use]
    pub fn trace_payload(&self) -> Value {
        json!({
            "decision": self.decision,
            "reason": self.reason,
            "candidate_id": self.candidate_id,
        })
    }
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS memory_candidates (
  candidate_id TEXT PRIMARY KEY,
  user_id_hash TEXT NOT NULL,
  conversation_id TEXT,
  text_scrubbed TEXT NOT NULL,
  scope TEXT NOT NULL,
  source TEXT NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memory_candidates_expiry ON memory_candidates(expires_at);
";

/// Candidate-memory capture with an explicit write policy. Nothing here is
/// long-term memory; rows are TTL-bound capture candidates.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    config: MemoryConfig,
}

impl MemoryStore {
    #[must_use]
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create memory db directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&self.config.db_path).with_context(|| {
            format!("failed to open memory database at {}", self.config.db_path.display())
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure memory db pragmas")?;
        conn.execute_batch(SCHEMA).context("failed to apply memory schema")?;
        Ok(conn)
    }

    #[must_use]
    pub fn explicit_intent(user_message: &str) -> bool {
        intent_regex().is_match(user_message)
    }

    /// Decide whether this user message becomes a capture candidate, and
    /// store it when allowed.
    ///
    /// # Errors
    /// Returns an error only on backend failure.
    pub fn evaluate_capture(
        &self,
        user_message: &str,
        conversation_id: Option<&str>,
        user_id_hash: &str,
    ) -> Result<MemoryDecision> {
        if self.config.write_policy == WritePolicy::Off {
            return Ok(MemoryDecision::deny("deny:policy_write_disabled"));
        }
        let explicit = Self::explicit_intent(user_message);
        if self.config.write_policy == WritePolicy::Strict && !explicit {
            return Ok(MemoryDecision::deny("deny:no_explicit_intent"));
        }
        if contains_secret_like(user_message) {
            return Ok(MemoryDecision::deny("deny:sensitive_content"));
        }
        let (scrubbed, _) = scrub_secrets(user_message);
        let scrubbed = scrubbed.trim().to_string();
        if scrubbed.chars().count() < self.config.min_scrubbed_chars {
            return Ok(MemoryDecision::deny("deny:scrubbed_too_short"));
        }

        let candidate_id = new_candidate_id();
        let now = now_utc();
        let ttl_minutes = i64::try_from(self.config.capture_ttl_minutes).unwrap_or(i64::MAX);
        let expires = now + time::Duration::minutes(ttl_minutes);
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO memory_candidates(
                candidate_id, user_id_hash, conversation_id, text_scrubbed,
                scope, source, created_at, expires_at
             ) VALUES (?1, ?2, ?3, ?4, 'global', 'chat', ?5, ?6)",
            params![
                candidate_id,
                user_id_hash,
                conversation_id,
                scrubbed,
                rfc3339(now)?,
                rfc3339(expires)?,
            ],
        )
        .context("failed to insert memory candidate")?;

        Ok(MemoryDecision {
            decision: "allow",
            reason: if self.config.write_policy == WritePolicy::Strict {
                "allow:explicit_intent"
            } else {
                "allow:capture_only"
            },
            candidate_id: Some(candidate_id),
        })
    }

    /// Delete candidates past their TTL; returns the removed count.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub fn prune_expired(&self) -> Result<usize> {
        let conn = self.open()?;
        let removed = conn
            .execute(
                "DELETE FROM memory_candidates WHERE expires_at <= ?1",
                params![rfc3339(now_utc())?],
            )
            .context("failed to prune memory candidates")?;
        Ok(removed)
    }
}
