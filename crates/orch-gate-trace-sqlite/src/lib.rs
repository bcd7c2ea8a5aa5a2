#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use orch_gate_domain::{
    canonical_json, chain_next, hash_bytes, now_utc, rfc3339, sanitize_payload, RedactionProfile,
    TraceId, ZERO_CHAIN,
};
use orch_gate_trace_core::{
    AppendedStep, ChainVerification, StepFilter, TraceRecord, TraceStatus, TraceStepView,
    TraceStore,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;

const TRACE_SCHEMA_VERSION: i64 = 1;

/// Hard ceiling for cross-trace step listings regardless of the caller's ask.
const MAX_RECENT_STEPS: usize = 200;
const DEFAULT_RECENT_STEPS: usize = 50;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS traces (
  trace_id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL,
  parent_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('open','completed','failed')),
  metadata_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trace_steps (
  trace_id TEXT NOT NULL,
  position INTEGER NOT NULL,
  step_type TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  event_hash TEXT NOT NULL,
  chain_hash TEXT NOT NULL,
  PRIMARY KEY (trace_id, position),
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE INDEX IF NOT EXISTS idx_trace_steps_created ON trace_steps(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_trace_steps_type ON trace_steps(step_type, created_at DESC);
";

#[derive(Debug, Clone)]
pub struct SqliteTraceStore {
    db_path: PathBuf,
}

impl SqliteTraceStore {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create trace db directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("failed to open trace database at {}", self.db_path.display())
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure trace db pragmas")?;
        Ok(conn)
    }

    fn row_to_view(
        trace_id: TraceId,
        position: i64,
        step_type: String,
        payload_json: &str,
        created_at: String,
        event_hash: String,
        chain_hash: String,
        profile: RedactionProfile,
    ) -> TraceStepView {
        let payload: Value =
            serde_json::from_str(payload_json).unwrap_or_else(|_| Value::Object(Default::default()));
        let (payload, redactions) = sanitize_payload(&payload, profile);
        TraceStepView {
            trace_id,
            position,
            step_type,
            created_at,
            payload,
            event_hash,
            chain_hash,
            redactions,
        }
    }
}

fn status_to_str(status: &TraceStatus) -> &'static str {
    match status {
        TraceStatus::Open => "open",
        TraceStatus::Completed => "completed",
        TraceStatus::Failed => "failed",
    }
}

fn status_from_str(raw: &str) -> Result<TraceStatus> {
    match raw {
        "open" => Ok(TraceStatus::Open),
        "completed" => Ok(TraceStatus::Completed),
        "failed" => Ok(TraceStatus::Failed),
        other => Err(anyhow!("unknown trace status '{other}'")),
    }
}

fn event_hash_for(step_type: &str, created_at: &str, payload: &Value) -> String {
    hash_bytes(format!("{step_type}{created_at}{}", canonical_json(payload)).as_bytes())
}

impl TraceStore for SqliteTraceStore {
    fn migrate(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(SCHEMA).context("failed to apply trace schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![TRACE_SCHEMA_VERSION, rfc3339(now_utc())?],
        )
        .context("failed to record trace migration")?;
        Ok(())
    }

    fn open_trace(&self, metadata: &Value, parent_id: Option<TraceId>) -> Result<TraceId> {
        let conn = self.open()?;
        let trace_id = TraceId::new();
        conn.execute(
            "INSERT INTO traces(trace_id, created_at, parent_id, status, metadata_json)
             VALUES (?1, ?2, ?3, 'open', ?4)",
            params![
                trace_id.to_string(),
                rfc3339(now_utc())?,
                parent_id.map(|id| id.to_string()),
                serde_json::to_string(metadata)?,
            ],
        )
        .context("failed to insert trace")?;
        Ok(trace_id)
    }

    fn append_step(
        &self,
        trace_id: TraceId,
        step_type: &str,
        payload: &Value,
    ) -> Result<AppendedStep> {
        let mut conn = self.open()?;
        // The IMMEDIATE transaction is the per-trace serialization point:
        // (read previous chain, compute, insert) happens under the write lock.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin trace append transaction")?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM traces WHERE trace_id = ?1",
                params![trace_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read trace status")?;
        match status.as_deref() {
            None => return Err(anyhow!("trace {trace_id} not found")),
            Some("open") => {}
            Some(_) => return Err(anyhow!("trace {trace_id} is closed")),
        }

        let last: Option<(i64, String)> = tx
            .query_row(
                "SELECT position, chain_hash FROM trace_steps
                 WHERE trace_id = ?1 ORDER BY position DESC LIMIT 1",
                params![trace_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to read last trace step")?;

        let (position, prev_chain) = match last {
            Some((pos, chain)) => (pos + 1, chain),
            None => (0, ZERO_CHAIN.to_string()),
        };

        let created_at = rfc3339(now_utc())?;
        let event_hash = event_hash_for(step_type, &created_at, payload);
        let chain_hash = chain_next(&prev_chain, &event_hash);

        tx.execute(
            "INSERT INTO trace_steps(
                trace_id, position, step_type, payload_json, created_at, event_hash, chain_hash
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                trace_id.to_string(),
                position,
                step_type,
                serde_json::to_string(payload)?,
                created_at,
                event_hash,
                chain_hash,
            ],
        )
        .context("failed to append trace step")?;
        tx.commit().context("failed to commit trace step")?;

        Ok(AppendedStep { position, event_hash, chain_hash })
    }

    fn close_trace(&self, trace_id: TraceId, status: TraceStatus) -> Result<()> {
        let conn = self.open()?;
        let changed = conn
            .execute(
                "UPDATE traces SET status = ?2 WHERE trace_id = ?1 AND status = 'open'",
                params![trace_id.to_string(), status_to_str(&status)],
            )
            .context("failed to close trace")?;
        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM traces WHERE trace_id = ?1",
                    params![trace_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(anyhow!("trace {trace_id} not found"));
            }
        }
        Ok(())
    }

    fn get_trace(&self, trace_id: TraceId) -> Result<Option<TraceRecord>> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT trace_id, created_at, parent_id, status, metadata_json
             FROM traces WHERE trace_id = ?1",
            params![trace_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .context("failed to read trace")?
        .map(|(id, created_at, parent, status, metadata_json)| {
            Ok(TraceRecord {
                trace_id: id.parse()?,
                created_at: orch_gate_domain::parse_rfc3339(&created_at)?,
                parent_id: parent.map(|p| p.parse()).transpose()?,
                status: status_from_str(&status)?,
                metadata: serde_json::from_str(&metadata_json)
                    .unwrap_or_else(|_| Value::Object(Default::default())),
            })
        })
        .transpose()
    }

    fn read_steps(
        &self,
        trace_id: TraceId,
        profile: RedactionProfile,
    ) -> Result<Vec<TraceStepView>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT position, step_type, payload_json, created_at, event_hash, chain_hash
                 FROM trace_steps WHERE trace_id = ?1 ORDER BY position ASC",
            )
            .context("failed to prepare trace step query")?;
        let rows = stmt
            .query_map(params![trace_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("failed to query trace steps")?;

        let mut steps = Vec::new();
        for row in rows {
            let (position, step_type, payload_json, created_at, event_hash, chain_hash) = row?;
            steps.push(Self::row_to_view(
                trace_id, position, step_type, &payload_json, created_at, event_hash, chain_hash,
                profile,
            ));
        }
        Ok(steps)
    }

    fn recent_steps(
        &self,
        filter: &StepFilter,
        profile: RedactionProfile,
    ) -> Result<Vec<TraceStepView>> {
        let conn = self.open()?;
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_RECENT_STEPS)
            .clamp(1, MAX_RECENT_STEPS);

        let mut conditions: Vec<String> = Vec::new();
        let mut params_list: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(trace_id) = filter.trace_id {
            conditions.push(format!("trace_id = ?{}", params_list.len() + 1));
            params_list.push(Box::new(trace_id.to_string()));
        }
        if !filter.step_types.is_empty() {
            let placeholders: Vec<String> = filter
                .step_types
                .iter()
                .enumerate()
                .map(|(idx, _)| format!("?{}", params_list.len() + idx + 1))
                .collect();
            conditions.push(format!("step_type IN ({})", placeholders.join(",")));
            for step_type in &filter.step_types {
                params_list.push(Box::new(step_type.clone()));
            }
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        params_list.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
        let query = format!(
            "SELECT trace_id, position, step_type, payload_json, created_at, event_hash, chain_hash
             FROM trace_steps {where_clause}
             ORDER BY created_at DESC, position DESC LIMIT ?{}",
            params_list.len()
        );

        let mut stmt = conn.prepare(&query).context("failed to prepare recent step query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params_list.iter().map(AsRef::as_ref)), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("failed to query recent steps")?;

        let mut steps = Vec::new();
        for row in rows {
            let (trace_id, position, step_type, payload_json, created_at, event_hash, chain_hash) =
                row?;
            steps.push(Self::row_to_view(
                trace_id.parse()?,
                position,
                step_type,
                &payload_json,
                created_at,
                event_hash,
                chain_hash,
                profile,
            ));
        }
        Ok(steps)
    }

    fn verify_chain(&self, trace_id: TraceId, expected: Option<&str>) -> Result<ChainVerification> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT step_type, created_at, payload_json
                 FROM trace_steps WHERE trace_id = ?1 ORDER BY position ASC",
            )
            .context("failed to prepare chain verification query")?;
        let rows = stmt
            .query_map(params![trace_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("failed to query steps for verification")?;

        // Event hashes are recomputed from the raw columns, not trusted from
        // the stored hash column; an edited payload changes the fold.
        let mut chain = ZERO_CHAIN.to_string();
        let mut step_count = 0_usize;
        for row in rows {
            let (step_type, created_at, payload_json) = row?;
            let payload: Value = serde_json::from_str(&payload_json)
                .unwrap_or_else(|_| Value::String(payload_json.clone()));
            let event_hash = event_hash_for(&step_type, &created_at, &payload);
            chain = chain_next(&chain, &event_hash);
            step_count += 1;
        }

        Ok(ChainVerification {
            trace_id,
            ok: expected.map(|hash| hash == chain),
            chain_hash: chain,
            step_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use orch_gate_domain::{RedactionProfile, TraceId};
    use orch_gate_trace_core::{StepFilter, TraceStatus, TraceStore};
    use serde_json::json;

    use super::SqliteTraceStore;

    fn temp_store() -> (SqliteTraceStore, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("orch-gate-trace-{}.sqlite3", ulid::Ulid::new()));
        let store = SqliteTraceStore::new(&path);
        store.migrate().unwrap_or_else(|err| panic!("migrate failed: {err:#}"));
        (store, path)
    }

    #[test]
    fn appended_steps_carry_positions_and_an_evolving_chain() {
        let (store, path) = temp_store();
        let trace_id = store
            .open_trace(&json!({"route": "/v1/chat/completions"}), None)
            .unwrap_or_else(|err| panic!("open_trace failed: {err:#}"));

        let first = store
            .append_step(trace_id, "request_received", &json!({"n": 1}))
            .unwrap_or_else(|err| panic!("append failed: {err:#}"));
        let second = store
            .append_step(trace_id, "intent_router", &json!({"n": 2}))
            .unwrap_or_else(|err| panic!("append failed: {err:#}"));
        let third = store
            .append_step(trace_id, "response_sent", &json!({"n": 3}))
            .unwrap_or_else(|err| panic!("append failed: {err:#}"));

        assert_eq!(first.position, 0);
        assert_eq!(second.position, 1);
        assert_eq!(third.position, 2);
        assert_ne!(first.chain_hash, second.chain_hash);
        assert_ne!(second.chain_hash, third.chain_hash);

        let verification = store
            .verify_chain(trace_id, Some(&third.chain_hash))
            .unwrap_or_else(|err| panic!("verify failed: {err:#}"));
        assert_eq!(verification.chain_hash, third.chain_hash);
        assert_eq!(verification.ok, Some(true));
        assert_eq!(verification.step_count, 3);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn tampered_payload_breaks_the_chain() {
        let (store, path) = temp_store();
        let trace_id = store
            .open_trace(&json!({}), None)
            .unwrap_or_else(|err| panic!("open_trace failed: {err:#}"));
        for n in 0..3 {
            store
                .append_step(trace_id, "tool_execute", &json!({"n": n}))
                .unwrap_or_else(|err| panic!("append failed: {err:#}"));
        }
        let reported = store
            .verify_chain(trace_id, None)
            .unwrap_or_else(|err| panic!("verify failed: {err:#}"))
            .chain_hash;

        // Edit the middle step directly in the backing store.
        let conn = rusqlite::Connection::open(&path)
            .unwrap_or_else(|err| panic!("open failed: {err}"));
        conn.execute(
            "UPDATE trace_steps SET payload_json = ?1 WHERE position = 1",
            rusqlite::params![r#"{"n":99}"#],
        )
        .unwrap_or_else(|err| panic!("tamper failed: {err}"));

        let verification = store
            .verify_chain(trace_id, Some(&reported))
            .unwrap_or_else(|err| panic!("verify failed: {err:#}"));
        assert_eq!(verification.ok, Some(false));
        assert_ne!(verification.chain_hash, reported);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn closed_trace_rejects_further_appends() {
        let (store, path) = temp_store();
        let trace_id = store
            .open_trace(&json!({}), None)
            .unwrap_or_else(|err| panic!("open_trace failed: {err:#}"));
        store
            .close_trace(trace_id, TraceStatus::Completed)
            .unwrap_or_else(|err| panic!("close failed: {err:#}"));

        let result = store.append_step(trace_id, "late", &json!({}));
        assert!(result.is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unknown_trace_fails_append() {
        let (store, path) = temp_store();
        let result = store.append_step(TraceId::new(), "orphan", &json!({}));
        assert!(result.is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn read_steps_applies_the_redaction_profile() {
        let (store, path) = temp_store();
        let trace_id = store
            .open_trace(&json!({}), None)
            .unwrap_or_else(|err| panic!("open_trace failed: {err:#}"));
        store
            .append_step(
                trace_id,
                "request_received",
                &json!({"api_key": "sk-aaaaaaaaaaaaaaaaaaaaaaaa", "note": "x".repeat(600)}),
            )
            .unwrap_or_else(|err| panic!("append failed: {err:#}"));

        let steps = store
            .read_steps(trace_id, RedactionProfile::default())
            .unwrap_or_else(|err| panic!("read failed: {err:#}"));
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].payload["api_key"], "<redacted>");
        let note = steps[0].payload["note"].as_str().unwrap_or_default();
        assert!(note.ends_with("...<truncated>"));
        assert!(steps[0].redactions >= 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recent_steps_filters_by_type_and_honors_the_limit() {
        let (store, path) = temp_store();
        let a = store.open_trace(&json!({}), None).unwrap_or_else(|err| panic!("{err:#}"));
        let b = store.open_trace(&json!({}), None).unwrap_or_else(|err| panic!("{err:#}"));
        for n in 0..4 {
            store
                .append_step(a, "intent_router", &json!({"n": n}))
                .unwrap_or_else(|err| panic!("{err:#}"));
        }
        store
            .append_step(b, "tool_execute", &json!({"n": 0}))
            .unwrap_or_else(|err| panic!("{err:#}"));

        let filter = StepFilter {
            trace_id: None,
            step_types: vec!["intent_router".to_string()],
            limit: Some(3),
        };
        let steps = store
            .recent_steps(&filter, RedactionProfile::default())
            .unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(steps.len(), 3);
        assert!(steps.iter().all(|step| step.step_type == "intent_router"));

        let scoped = StepFilter { trace_id: Some(b), step_types: Vec::new(), limit: None };
        let steps = store
            .recent_steps(&scoped, RedactionProfile::default())
            .unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].trace_id, b);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn chains_are_independent_across_traces() {
        let (store, path) = temp_store();
        let a = store.open_trace(&json!({}), None).unwrap_or_else(|err| panic!("{err:#}"));
        let b = store.open_trace(&json!({}), None).unwrap_or_else(|err| panic!("{err:#}"));

        let step_a = store
            .append_step(a, "request_received", &json!({"k": "a"}))
            .unwrap_or_else(|err| panic!("{err:#}"));
        let step_b = store
            .append_step(b, "request_received", &json!({"k": "b"}))
            .unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(step_a.position, 0);
        assert_eq!(step_b.position, 0);
        assert_ne!(step_a.chain_hash, step_b.chain_hash);

        let _ = std::fs::remove_file(&path);
    }
}
