#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use orch_gate_domain::{
    hash_canonical_json, now_utc, parse_rfc3339, rfc3339, ApprovalId, DateTimeUtc,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_APPROVAL_TTL_SECONDS: u64 = 900;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_approvals (
  approval_id TEXT PRIMARY KEY,
  tool_name TEXT NOT NULL,
  args_hash TEXT NOT NULL,
  created_at TEXT NOT NULL,
  expires_at TEXT NOT NULL,
  consumed_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('pending','consumed','expired'))
);

CREATE INDEX IF NOT EXISTS idx_tool_approvals_status ON tool_approvals(status, expires_at);
";

const APPROVAL_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ApprovalRecord {
    pub approval_id: String,
    pub tool_name: String,
    pub args_hash: String,
    pub created_at: String,
    pub expires_at: String,
    pub consumed_at: Option<String>,
    pub status: ApprovalStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Consumed,
    Expired,
}

impl ApprovalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Consumed => "consumed",
            Self::Expired => "expired",
        }
    }

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "consumed" => Ok(Self::Consumed),
            "expired" => Ok(Self::Expired),
            other => Err(anyhow!("unknown approval status '{other}'")),
        }
    }
}

/// Reasons an approval fails to validate; surfaced verbatim to clients and
/// into the trace.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRejection {
    MissingApproval,
    UnknownApproval,
    AlreadyConsumed,
    ToolMismatch,
    ArgsHashMismatch,
    Expired,
}

impl ApprovalRejection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingApproval => "missing_approval",
            Self::UnknownApproval => "unknown_approval",
            Self::AlreadyConsumed => "already_consumed",
            Self::ToolMismatch => "tool_mismatch",
            Self::ArgsHashMismatch => "args_hash_mismatch",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed(ApprovalRecord),
    Rejected(ApprovalRejection),
}

/// Canonical-args hash shared with the approval-issuing surface.
#[must_use]
pub fn hash_tool_args(args: &Value) -> String {
    hash_canonical_json(args)
}

/// SQLite-backed approval store. Validation and consumption happen inside a
/// single IMMEDIATE transaction so concurrent validators of one approval
/// cannot both succeed.
#[derive(Debug, Clone)]
pub struct SqliteApprovalStore {
    db_path: PathBuf,
}

impl SqliteApprovalStore {
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
                    format!("failed to create approval db directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("failed to open approval database at {}", self.db_path.display())
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure approval db pragmas")?;
        Ok(conn)
    }

    /// Apply the schema; idempotent.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(SCHEMA).context("failed to apply approval schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![APPROVAL_SCHEMA_VERSION, rfc3339(now_utc())?],
        )
        .context("failed to record approval migration")?;
        Ok(())
    }

    /// Issue a pending approval binding the tool name and canonical args hash.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn issue(
        &self,
        tool_name: &str,
        args: &Value,
        ttl_seconds: Option<u64>,
    ) -> Result<ApprovalRecord> {
        let ttl = ttl_seconds.unwrap_or(DEFAULT_APPROVAL_TTL_SECONDS);
        let now = now_utc();
        let expires = now + time::Duration::seconds(i64::try_from(ttl).unwrap_or(i64::MAX));
        let record = ApprovalRecord {
            approval_id: ApprovalId::new().to_string(),
            tool_name: tool_name.to_string(),
            args_hash: hash_tool_args(args),
            created_at: rfc3339(now)?,
            expires_at: rfc3339(expires)?,
            consumed_at: None,
            status: ApprovalStatus::Pending,
        };

        let conn = self.open()?;
        conn.execute(
            "INSERT INTO tool_approvals(
                approval_id, tool_name, args_hash, created_at, expires_at, consumed_at, status
             ) VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'pending')",
            params![
                record.approval_id,
                record.tool_name,
                record.args_hash,
                record.created_at,
                record.expires_at,
            ],
        )
        .context("failed to insert approval")?;
        Ok(record)
    }

    /// Atomically verify (exists, pending, tool matches, args hash matches,
    /// not expired) and transition to consumed. At most one caller can ever
    /// receive `Consumed` for a given approval.
    ///
    /// # Errors
    /// Returns an error only on backend failure; validation failures are
    /// `ConsumeOutcome::Rejected`.
    pub fn validate_and_consume(
        &self,
        approval_id: Option<&str>,
        tool_name: &str,
        args: &Value,
    ) -> Result<ConsumeOutcome> {
        let Some(approval_id) = approval_id.filter(|id| !id.trim().is_empty()) else {
            return Ok(ConsumeOutcome::Rejected(ApprovalRejection::MissingApproval));
        };
        let args_hash = hash_tool_args(args);

        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin approval transaction")?;

        let row: Option<ApprovalRecord> = tx
            .query_row(
                "SELECT approval_id, tool_name, args_hash, created_at, expires_at, consumed_at, status
                 FROM tool_approvals WHERE approval_id = ?1",
                params![approval_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("failed to read approval")?
            .map(|(id, tool, hash, created_at, expires_at, consumed_at, status)| {
                Ok::<_, anyhow::Error>(ApprovalRecord {
                    approval_id: id,
                    tool_name: tool,
                    args_hash: hash,
                    created_at,
                    expires_at,
                    consumed_at,
                    status: ApprovalStatus::from_str(&status)?,
                })
            })
            .transpose()?;

        let Some(record) = row else {
            return Ok(ConsumeOutcome::Rejected(ApprovalRejection::UnknownApproval));
        };

        match record.status {
            ApprovalStatus::Consumed => {
                return Ok(ConsumeOutcome::Rejected(ApprovalRejection::AlreadyConsumed))
            }
            ApprovalStatus::Expired => {
                return Ok(ConsumeOutcome::Rejected(ApprovalRejection::Expired))
            }
            ApprovalStatus::Pending => {}
        }
        if record.tool_name != tool_name {
            return Ok(ConsumeOutcome::Rejected(ApprovalRejection::ToolMismatch));
        }
        if record.args_hash != args_hash {
            return Ok(ConsumeOutcome::Rejected(ApprovalRejection::ArgsHashMismatch));
        }

        let now = now_utc();
        let expires_at: DateTimeUtc = parse_rfc3339(&record.expires_at)?;
        if expires_at <= now {
            tx.execute(
                "UPDATE tool_approvals SET status = 'expired' WHERE approval_id = ?1",
                params![record.approval_id],
            )
            .context("failed to mark approval expired")?;
            tx.commit().context("failed to commit approval expiry")?;
            return Ok(ConsumeOutcome::Rejected(ApprovalRejection::Expired));
        }

        let consumed_at = rfc3339(now)?;
        tx.execute(
            "UPDATE tool_approvals SET status = 'consumed', consumed_at = ?2 WHERE approval_id = ?1",
            params![record.approval_id, consumed_at],
        )
        .context("failed to consume approval")?;
        tx.commit().context("failed to commit approval consumption")?;

        Ok(ConsumeOutcome::Consumed(ApprovalRecord {
            consumed_at: Some(consumed_at),
            status: ApprovalStatus::Consumed,
            ..record
        }))
    }

    /// Lazily mark pending approvals past their expiry; returns how many rows
    /// transitioned.
    ///
    /// # Errors
    /// Returns an error when persistence fails.
    pub fn garbage_collect(&self, now: DateTimeUtc) -> Result<usize> {
        let conn = self.open()?;
        let changed = conn
            .execute(
                "UPDATE tool_approvals SET status = 'expired'
                 WHERE status = 'pending' AND expires_at <= ?1",
                params![rfc3339(now)?],
            )
            .context("failed to garbage collect approvals")?;
        Ok(changed)
    }
}
