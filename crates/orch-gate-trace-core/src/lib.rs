#![forbid(unsafe_code)]

use anyhow::Result;
use orch_gate_domain::{DateTimeUtc, RedactionProfile, TraceId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Open,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub created_at: DateTimeUtc,
    pub parent_id: Option<TraceId>,
    pub status: TraceStatus,
    pub metadata: Value,
}

/// Position, event hash, and running chain hash reported back from an append.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppendedStep {
    pub position: i64,
    pub event_hash: String,
    pub chain_hash: String,
}

/// A step as returned from read paths: payload already passed through the
/// redaction profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceStepView {
    pub trace_id: TraceId,
    pub position: i64,
    pub step_type: String,
    pub created_at: String,
    pub payload: Value,
    pub event_hash: String,
    pub chain_hash: String,
    pub redactions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChainVerification {
    pub trace_id: TraceId,
    pub chain_hash: String,
    pub step_count: usize,
    /// Present only when an expected hash was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct StepFilter {
    pub trace_id: Option<TraceId>,
    pub step_types: Vec<String>,
    pub limit: Option<usize>,
}

pub trait TraceStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn open_trace(&self, metadata: &Value, parent_id: Option<TraceId>) -> Result<TraceId>;

    /// Append one step; the per-trace chain is extended inside a single
    /// transactional section so concurrent appenders serialize per trace.
    #[allow(clippy::missing_errors_doc)]
    fn append_step(&self, trace_id: TraceId, step_type: &str, payload: &Value)
        -> Result<AppendedStep>;

    #[allow(clippy::missing_errors_doc)]
    fn close_trace(&self, trace_id: TraceId, status: TraceStatus) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get_trace(&self, trace_id: TraceId) -> Result<Option<TraceRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn read_steps(&self, trace_id: TraceId, profile: RedactionProfile)
        -> Result<Vec<TraceStepView>>;

    /// Most-recent-first step listing across traces for the trust surface.
    #[allow(clippy::missing_errors_doc)]
    fn recent_steps(&self, filter: &StepFilter, profile: RedactionProfile)
        -> Result<Vec<TraceStepView>>;

    /// Recompute the chain from stored rows; compares against `expected`
    /// when supplied.
    #[allow(clippy::missing_errors_doc)]
    fn verify_chain(&self, trace_id: TraceId, expected: Option<&str>) -> Result<ChainVerification>;
}
