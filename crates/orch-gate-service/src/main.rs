use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{ArgAction, Parser};
use orch_gate_approvals::SqliteApprovalStore;
use orch_gate_domain::{RedactionProfile, TraceId};
use orch_gate_intent::{
    Embedder, HitlQueue, IntentCache, IntentRouter, IntentRouterConfig, OllamaEmbedder, RouteRule,
    RuleRouter, SemanticRouter,
};
use orch_gate_orchestrator::memory::{MemoryConfig, MemoryStore, WritePolicy};
use orch_gate_orchestrator::{ChatRequest, Orchestrator, OrchestratorConfig};
use orch_gate_policy::PolicyEngine;
use orch_gate_provider::{ChatMessage, ChatProvider, OllamaChatProvider, ProviderConfig};
use orch_gate_tools::{
    builtin_registry, DockerSandbox, ExecutorConfig, SandboxConfig, SandboxDriver, ToolExecutor,
};
use orch_gate_trace_core::{StepFilter, TraceStore};
use orch_gate_trace_sqlite::SqliteTraceStore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

const SERVICE_NAME: &str = "orch-gate";

#[derive(Debug, Parser)]
#[command(name = "orch-gate-service")]
#[command(about = "Local HTTP control plane for chat and tool orchestration")]
struct Args {
    #[arg(long, env = "ORCH_BIND", default_value = "127.0.0.1:4080")]
    bind: SocketAddr,

    // Transport safety
    #[arg(long, env = "ORCH_BEARER_TOKEN", default_value = "")]
    bearer_token: String,
    #[arg(long, env = "ORCH_REQUIRE_BEARER", default_value_t = true, action = ArgAction::Set)]
    require_bearer: bool,
    #[arg(long, env = "ORCH_MAX_REQUEST_BYTES", default_value_t = 1_048_576)]
    max_request_bytes: usize,
    #[arg(long, env = "ORCH_RATE_LIMIT_PER_MINUTE", default_value_t = 60)]
    rate_limit_per_minute: u32,
    #[arg(long, env = "ORCH_REQUEST_TIMEOUT_MS", default_value_t = 60_000)]
    request_timeout_ms: u64,

    // Trace ledger
    #[arg(long, env = "ORCH_TRACE_ENABLED", default_value_t = true, action = ArgAction::Set)]
    trace_enabled: bool,
    #[arg(long, env = "ORCH_TRACE_DB_PATH", default_value = "instance/trace.db")]
    trace_db: PathBuf,
    #[arg(long, env = "ORCH_TRUST_PANEL_MAX_VALUE_CHARS", default_value_t = 500)]
    trust_max_value_chars: usize,

    // Tool policy
    #[arg(long, env = "ORCH_TOOL_POLICY_ENFORCE", default_value_t = true, action = ArgAction::Set)]
    policy_enforce: bool,
    #[arg(long, env = "ORCH_TOOL_POLICY_PATH", default_value = "config/tool_policy.yaml")]
    policy_path: PathBuf,

    // Approvals
    #[arg(long, env = "ORCH_TOOL_APPROVAL_ENFORCE", default_value_t = true, action = ArgAction::Set)]
    approvals_enforce: bool,
    #[arg(long, env = "ORCH_TOOL_APPROVAL_TTL_SEC", default_value_t = 900)]
    approval_ttl_sec: u64,
    #[arg(long, env = "ORCH_TOOL_APPROVAL_DB_PATH", default_value = "instance/tool_approvals.db")]
    approvals_db: PathBuf,

    // Intent routing
    #[arg(long, env = "ORCH_INTENT_ROUTER_ENABLED", default_value_t = true, action = ArgAction::Set)]
    intent_enabled: bool,
    #[arg(long, env = "ORCH_INTENT_ROUTER_SHADOW", default_value_t = false, action = ArgAction::Set)]
    intent_shadow: bool,
    #[arg(long, env = "ORCH_INTENT_CACHE_ENABLED", default_value_t = true, action = ArgAction::Set)]
    intent_cache_enabled: bool,
    #[arg(long, env = "ORCH_INTENT_CACHE_DB_PATH", default_value = "instance/intent_cache.db")]
    intent_cache_db: PathBuf,
    #[arg(long, env = "ORCH_INTENT_CACHE_TTL_SEC", default_value_t = 600)]
    intent_cache_ttl_sec: u64,
    #[arg(long, env = "ORCH_INTENT_HITL_ENABLED", default_value_t = true, action = ArgAction::Set)]
    intent_hitl_enabled: bool,
    #[arg(long, env = "ORCH_INTENT_HITL_DB_PATH", default_value = "instance/hitl_queue.db")]
    hitl_db: PathBuf,
    #[arg(long, env = "ORCH_INTENT_MIN_CONFIDENCE", default_value_t = 0.85)]
    intent_min_confidence: f64,
    #[arg(long, env = "ORCH_INTENT_MIN_GAP", default_value_t = 0.05)]
    intent_min_gap: f64,
    #[arg(long, env = "ORCH_INTENT_DECISION_EXPOSE", default_value_t = false, action = ArgAction::Set)]
    intent_expose: bool,

    // Semantic tier
    #[arg(long, env = "ORCH_SEMANTIC_ROUTER_ENABLED", default_value_t = false, action = ArgAction::Set)]
    semantic_enabled: bool,
    #[arg(long, env = "ORCH_SEMANTIC_ROUTER_EMBED_MODEL", default_value = "nomic-embed-text:latest")]
    embed_model: String,
    #[arg(long, env = "ORCH_SEMANTIC_ROUTER_OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    embed_url: String,
    #[arg(long, env = "ORCH_SEMANTIC_ROUTER_TIMEOUT_SEC", default_value_t = 10)]
    embed_timeout_sec: u64,

    // Provider gating
    #[arg(long, env = "ORCH_LLM_ENABLED", default_value_t = false, action = ArgAction::Set)]
    llm_enabled: bool,
    #[arg(long, env = "ORCH_LLM_NETWORK_ENABLED", default_value_t = false, action = ArgAction::Set)]
    llm_network_enabled: bool,
    #[arg(long, env = "ORCH_OLLAMA_URL", default_value = "http://127.0.0.1:11434")]
    ollama_url: String,
    #[arg(long, env = "ORCH_MODEL_CHAT", default_value = "qwen2.5:3b")]
    model_chat: String,
    #[arg(long, env = "ORCH_LLM_TIMEOUT_SEC", default_value_t = 30)]
    llm_timeout_sec: u64,
    #[arg(long, env = "ORCH_LLM_HEALTH_TIMEOUT_SEC", default_value_t = 5)]
    llm_health_timeout_sec: u64,
    #[arg(long, env = "ORCH_LLM_MAX_OUTPUT_CHARS", default_value_t = 4000)]
    llm_max_output_chars: usize,
    #[arg(long, env = "ORCH_LLM_RETRY_COUNT", default_value_t = 0)]
    llm_retry_count: u32,
    #[arg(long, env = "ORCH_LLM_RETRY_BACKOFF_MS", default_value_t = 500)]
    llm_retry_backoff_ms: u64,
    #[arg(long, env = "ORCH_LLM_CIRCUIT_MAX_FAILURES", default_value_t = 3)]
    llm_circuit_max_failures: u32,
    #[arg(long, env = "ORCH_LLM_CIRCUIT_RESET_SEC", default_value_t = 30)]
    llm_circuit_reset_sec: u64,
    /// Comma-separated allowlist; empty means any model.
    #[arg(long, env = "ORCH_LLM_MODEL_ALLOWLIST", default_value = "")]
    llm_model_allowlist: String,

    // Sandbox
    #[arg(long, env = "ORCH_TOOL_SANDBOX_ENABLED", default_value_t = false, action = ArgAction::Set)]
    sandbox_enabled: bool,
    #[arg(long, env = "ORCH_TOOL_SANDBOX_REQUIRED", default_value_t = true, action = ArgAction::Set)]
    sandbox_required: bool,
    #[arg(long, env = "ORCH_TOOL_SANDBOX_FALLBACK", default_value_t = false, action = ArgAction::Set)]
    sandbox_fallback: bool,
    #[arg(long, env = "ORCH_SANDBOX_IMAGE", default_value = "python:3.12-slim")]
    sandbox_image: String,
    #[arg(long, env = "ORCH_SANDBOX_CPU", default_value = "0.5")]
    sandbox_cpu: String,
    #[arg(long, env = "ORCH_SANDBOX_MEMORY_MB", default_value_t = 256)]
    sandbox_memory_mb: u64,
    #[arg(long, env = "ORCH_SANDBOX_TIMEOUT_SEC", default_value_t = 10)]
    sandbox_timeout_sec: u64,
    #[arg(long, env = "ORCH_SANDBOX_TOOL_DIR", default_value = "sandbox_tools")]
    sandbox_tool_dir: String,
    #[arg(long, env = "ORCH_TOOL_MAX_OUTPUT_CHARS", default_value_t = 4000)]
    tool_max_output_chars: usize,

    // Memory capture
    #[arg(long, env = "ORCH_MEMORY_WRITE_POLICY", default_value = "off")]
    memory_write_policy: String,
    #[arg(long, env = "ORCH_MEMORY_DB_PATH", default_value = "instance/orchestrator_core.db")]
    memory_db: PathBuf,
    #[arg(long, env = "ORCH_MEMORY_CAPTURE_TTL_MINUTES", default_value_t = 180)]
    memory_ttl_minutes: u64,
}

/// Fixed-window request counter keyed by caller identity.
struct RateLimiter {
    limit: u32,
    windows: Mutex<HashMap<String, (u64, u32)>>,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self { limit, windows: Mutex::new(HashMap::new()) }
    }

    fn check(&self, key: &str) -> bool {
        if self.limit == 0 {
            return true;
        }
        let minute = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() / 60)
            .unwrap_or(0);
        let Ok(mut windows) = self.windows.lock() else {
            return true;
        };
        let entry = windows.entry(key.to_string()).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        entry.1 += 1;
        entry.1 <= self.limit
    }
}

#[derive(Clone)]
struct ServiceState {
    orchestrator: Arc<Orchestrator>,
    trace: Option<Arc<dyn TraceStore>>,
    require_bearer: bool,
    bearer_token: String,
    expose_intent: bool,
    llm_enabled: bool,
    request_timeout: Duration,
    rate: Arc<RateLimiter>,
    redaction: RedactionProfile,
    max_request_bytes: usize,
    approval_ttl_sec: u64,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    error_type: &'static str,
    message: String,
    trace_id: Option<String>,
}

impl ServiceFailure {
    fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self { status, error_type, message: message.into(), trace_id: None }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "auth_error", "Unauthorized")
    }
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let (message, _) = orch_gate_domain::scrub_secrets(&self.message);
        let body = json!({
            "error": {
                "message": message,
                "type": self.error_type,
                "code": self.status.as_u16(),
            }
        });
        let mut response = (self.status, Json(body)).into_response();
        attach_trace_header(&mut response, self.trace_id.as_deref());
        response
    }
}

fn invalid_payload(rejection: &JsonRejection) -> ServiceFailure {
    let status = rejection.status();
    let error_type = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "request_too_large"
    } else {
        "invalid_request"
    };
    ServiceFailure::new(status, error_type, rejection.body_text())
}

fn attach_trace_header(response: &mut Response, trace_id: Option<&str>) {
    if let Some(trace_id) = trace_id {
        if let Ok(value) = HeaderValue::from_str(trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
    }
}

async fn disclose(mut response: Response) -> Response {
    response.headers_mut().insert("x-ai-generated", HeaderValue::from_static("true"));
    response
}

fn caller_key(headers: &HeaderMap) -> String {
    match headers.get("authorization").and_then(|value| value.to_str().ok()) {
        Some(auth) if !auth.is_empty() => {
            let mut hasher = Sha256::new();
            hasher.update(auth.as_bytes());
            hex::encode(hasher.finalize()).chars().take(16).collect()
        }
        _ => "anonymous".to_string(),
    }
}

impl ServiceState {
    fn require_bearer(&self, headers: &HeaderMap) -> Result<(), ServiceFailure> {
        if !self.require_bearer {
            return Ok(());
        }
        let supplied = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if self.bearer_token.is_empty() || supplied != format!("Bearer {}", self.bearer_token) {
            return Err(ServiceFailure::unauthorized());
        }
        Ok(())
    }

    fn check_rate(&self, headers: &HeaderMap) -> Result<(), ServiceFailure> {
        if self.rate.check(&caller_key(headers)) {
            Ok(())
        } else {
            Err(ServiceFailure::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "rate limit exceeded",
            ))
        }
    }

    async fn run_blocking<T, F>(&self, label: &'static str, op: F) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Orchestrator>) -> Result<T> + Send + 'static,
    {
        let orchestrator = Arc::clone(&self.orchestrator);
        let handle = tokio::task::spawn_blocking(move || op(orchestrator));
        let joined = tokio::time::timeout(self.request_timeout, handle).await.map_err(|_| {
            ServiceFailure::new(
                StatusCode::GATEWAY_TIMEOUT,
                "deadline_exceeded",
                format!("{label} timed out after {} ms", self.request_timeout.as_millis()),
            )
        })?;
        let result = joined.map_err(|err| {
            ServiceFailure::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{label} join failure: {err}"),
            )
        })?;
        result.map_err(|err| {
            let diagnostic = format!("{err:#}");
            let error_type = if diagnostic.contains("trace backend") {
                "trace_backend_error"
            } else if diagnostic.contains("approval backend") {
                "approval_backend_error"
            } else {
                "internal_error"
            };
            ServiceFailure::new(StatusCode::INTERNAL_SERVER_ERROR, error_type, diagnostic)
        })
    }
}

fn app(state: ServiceState) -> Router {
    let body_limit = state.max_request_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/tools/approve", post(tools_approve))
        .route("/v1/tools/execute", post(tools_execute))
        .route("/v1/trust/events", get(trust_events))
        .route("/v1/trust/trace/:trace_id", get(trust_trace))
        .route("/v1/trust/verify/:trace_id", get(trust_verify))
        .layer(axum::middleware::map_response(disclose))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": SERVICE_NAME}))
}

async fn ready(State(state): State<ServiceState>) -> Result<Json<Value>, ServiceFailure> {
    let llm_enabled = state.llm_enabled;
    let redaction = state.redaction;
    let checks = state
        .run_blocking("ready", move |orchestrator| {
            if let Some(trace) = orchestrator.trace_store() {
                let filter = StepFilter { trace_id: None, step_types: Vec::new(), limit: Some(1) };
                trace.recent_steps(&filter, redaction).context("trace ledger unavailable")?;
            }
            if llm_enabled {
                let (healthy, reason) = orchestrator.provider_health();
                if !healthy {
                    anyhow::bail!("provider unready: {reason}");
                }
            }
            Ok(())
        })
        .await;
    match checks {
        Ok(()) => Ok(Json(json!({"status": "ready", "service": SERVICE_NAME}))),
        Err(failure) => Err(ServiceFailure::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            failure.message,
        )),
    }
}

fn parse_messages(payload: &Value) -> Vec<ChatMessage> {
    payload
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|message| {
                    let role = message.get("role").and_then(Value::as_str)?;
                    let content = message.get("content").and_then(Value::as_str)?;
                    Some(ChatMessage::new(role, content))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn chat_error_status(kind: &str) -> StatusCode {
    match kind {
        "policy_denied" | "approval_required" | "intent_denied" => StatusCode::FORBIDDEN,
        "network_disabled" | "timeout" | "network" | "protocol" | "model_rejected"
        | "circuit_open" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn chat_completions(
    State(state): State<ServiceState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ServiceFailure> {
    state.require_bearer(&headers)?;
    state.check_rate(&headers)?;
    let Json(payload) = payload.map_err(|rejection| invalid_payload(&rejection))?;

    let request = ChatRequest {
        messages: parse_messages(&payload),
        conversation_id: headers
            .get("x-conversation-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
        user_id_hash: Some(caller_key(&headers)),
    };

    let reply = state
        .run_blocking("chat_completions", move |orchestrator| orchestrator.handle_chat(&request))
        .await?;

    let trace_id = reply.trace_id.clone();
    if let Some(error) = &reply.error {
        let body = json!({
            "error": {
                "message": error.message,
                "type": error.kind,
                "code": chat_error_status(&error.kind).as_u16(),
            },
            "request_id": trace_id,
            "memory_decision": reply.memory_decision,
        });
        let mut response = (chat_error_status(&error.kind), Json(body)).into_response();
        attach_trace_header(&mut response, trace_id.as_deref());
        return Ok(response);
    }

    let expose_intent =
        state.expose_intent || query.get("debug").map(String::as_str) == Some("1");
    let mut body = json!({
        "id": "orch_gate",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": reply.content},
            "finish_reason": "stop",
        }],
        "request_id": trace_id,
        "memory_decision": reply.memory_decision,
        "route_decision": reply.route_decision,
        "provider": reply.provider_summary,
        "tool_result": reply.tool_result,
    });
    if expose_intent {
        if let Value::Object(map) = &mut body {
            map.insert(
                "intent_decision".to_string(),
                serde_json::to_value(&reply.intent_decision).unwrap_or(Value::Null),
            );
        }
    }
    let mut response = (StatusCode::OK, Json(body)).into_response();
    attach_trace_header(&mut response, trace_id.as_deref());
    Ok(response)
}

async fn tools_approve(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ServiceFailure> {
    state.require_bearer(&headers)?;
    state.check_rate(&headers)?;
    let Json(payload) = payload.map_err(|rejection| invalid_payload(&rejection))?;
    let Some(tool_name) = payload.get("name").and_then(Value::as_str).map(str::to_string) else {
        return Err(ServiceFailure::new(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Tool name required",
        ));
    };
    let args = payload.get("args").cloned().unwrap_or_else(|| json!({}));
    let ttl_seconds =
        Some(payload.get("ttl_seconds").and_then(Value::as_u64).unwrap_or(state.approval_ttl_sec));

    let approval = state
        .run_blocking("tools_approve", move |orchestrator| {
            orchestrator.handle_approve(&tool_name, &args, ttl_seconds)
        })
        .await?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "approval_id": approval.approval_id,
            "tool": approval.tool_name,
            "args_hash": approval.args_hash,
            "created_at": approval.created_at,
            "expires_at": approval.expires_at,
            "status": approval.status,
        })),
    )
        .into_response())
}

async fn tools_execute(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ServiceFailure> {
    state.require_bearer(&headers)?;
    state.check_rate(&headers)?;
    let Json(payload) = payload.map_err(|rejection| invalid_payload(&rejection))?;
    let Some(tool_name) = payload.get("name").and_then(Value::as_str).map(str::to_string) else {
        return Err(ServiceFailure::new(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "Tool name required",
        ));
    };
    let args = payload
        .get("args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let approval_token = payload
        .get("approval_token")
        .and_then(Value::as_str)
        .map(str::to_string);

    let reply = state
        .run_blocking("tools_execute", move |orchestrator| {
            orchestrator.handle_execute(&tool_name, &args, approval_token.as_deref())
        })
        .await?;

    let trace_id = reply.trace_id.clone();
    let (status, body) = if let Some(error) = &reply.error {
        (
            StatusCode::FORBIDDEN,
            json!({
                "status": "error",
                "tool": reply.tool,
                "error": error,
                "reason": reply.reason,
                "approval_reason": reply.approval_reason,
                "request_id": trace_id,
            }),
        )
    } else {
        let ok = reply.report.as_ref().is_some_and(|report| report.ok);
        (
            StatusCode::OK,
            json!({
                "status": (if ok { "ok" } else { "error" }),
                "tool": reply.tool,
                "result": reply.report,
                "request_id": trace_id,
            }),
        )
    };
    let mut response = (status, Json(body)).into_response();
    attach_trace_header(&mut response, trace_id.as_deref());
    Ok(response)
}

async fn trust_events(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ServiceFailure> {
    state.require_bearer(&headers)?;
    state.check_rate(&headers)?;
    if state.trace.is_none() {
        return Err(ServiceFailure::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "Trace ledger disabled",
        ));
    }

    let limit = query.get("limit").and_then(|raw| raw.parse::<usize>().ok());
    let step_types = query
        .get("step_type")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|step| !step.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let trace_id = match query.get("trace_id") {
        Some(raw) => Some(raw.parse::<TraceId>().map_err(|err| {
            ServiceFailure::new(StatusCode::BAD_REQUEST, "validation_error", format!("{err:#}"))
        })?),
        None => None,
    };

    let filter = StepFilter { trace_id, step_types, limit };
    let redaction = state.redaction;
    let events = state
        .run_blocking("trust_events", move |orchestrator| {
            let Some(trace) = orchestrator.trace_store() else {
                anyhow::bail!("trace backend unavailable");
            };
            trace.recent_steps(&filter, redaction).context("trace backend failure")
        })
        .await?;

    let requested = limit.unwrap_or(50);
    Ok(Json(json!({
        "events": events,
        "count": events.len(),
        "limit": requested,
        "truncated": events.len() >= requested,
    })))
}

async fn trust_trace(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    AxumPath(trace_id): AxumPath<String>,
) -> Result<Response, ServiceFailure> {
    state.require_bearer(&headers)?;
    state.check_rate(&headers)?;
    if state.trace.is_none() {
        return Err(ServiceFailure::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "Trace ledger disabled",
        ));
    }
    let trace_id: TraceId = trace_id.parse().map_err(|err: anyhow::Error| {
        ServiceFailure::new(StatusCode::BAD_REQUEST, "validation_error", format!("{err:#}"))
    })?;

    let redaction = state.redaction;
    let report = state
        .run_blocking("trust_trace", move |orchestrator| {
            let Some(trace) = orchestrator.trace_store() else {
                anyhow::bail!("trace backend unavailable");
            };
            let Some(record) = trace.get_trace(trace_id).context("trace backend failure")? else {
                return Ok(None);
            };
            let steps = trace.read_steps(trace_id, redaction).context("trace backend failure")?;
            let verification =
                trace.verify_chain(trace_id, None).context("trace backend failure")?;
            Ok(Some((record, steps, verification)))
        })
        .await?;
    let Some((record, steps, verification)) = report else {
        return Err(ServiceFailure::new(StatusCode::NOT_FOUND, "not_found", "Trace not found"));
    };
    let (metadata, metadata_redactions) =
        orch_gate_domain::sanitize_payload(&record.metadata, state.redaction);

    let mut response = (
        StatusCode::OK,
        Json(json!({
            "trace_id": trace_id.to_string(),
            "status": record.status,
            "metadata": metadata,
            "metadata_redactions": metadata_redactions,
            "steps": steps,
            "step_count": steps.len(),
            "chain_hash": verification.chain_hash,
        })),
    )
        .into_response();
    attach_trace_header(&mut response, Some(&trace_id.to_string()));
    Ok(response)
}

async fn trust_verify(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    AxumPath(trace_id): AxumPath<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ServiceFailure> {
    state.require_bearer(&headers)?;
    state.check_rate(&headers)?;
    if state.trace.is_none() {
        return Err(ServiceFailure::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "Trace ledger disabled",
        ));
    }
    let trace_id: TraceId = trace_id.parse().map_err(|err: anyhow::Error| {
        ServiceFailure::new(StatusCode::BAD_REQUEST, "validation_error", format!("{err:#}"))
    })?;
    let expected = query.get("expected_hash").cloned();

    let verification = state
        .run_blocking("trust_verify", move |orchestrator| {
            let Some(trace) = orchestrator.trace_store() else {
                anyhow::bail!("trace backend unavailable");
            };
            trace
                .verify_chain(trace_id, expected.as_deref())
                .context("trace backend failure")
        })
        .await?;

    let mut response = (StatusCode::OK, Json(serde_json::to_value(&verification).unwrap_or(Value::Null))).into_response();
    attach_trace_header(&mut response, Some(&trace_id.to_string()));
    Ok(response)
}

fn parse_allowlist(raw: &str) -> Option<std::collections::BTreeSet<String>> {
    let allowlist: std::collections::BTreeSet<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(str::to_string)
        .collect();
    (!allowlist.is_empty()).then_some(allowlist)
}

fn build_state(args: &Args) -> Result<ServiceState> {
    let policy = Arc::new(
        PolicyEngine::from_path(Path::new(&args.policy_path), args.policy_enforce)
            .context("failed to load tool policy")?,
    );

    let trace: Option<Arc<dyn TraceStore>> = if args.trace_enabled {
        let store = SqliteTraceStore::new(&args.trace_db);
        store.migrate().context("failed to migrate trace ledger")?;
        Some(Arc::new(store))
    } else {
        None
    };

    let approvals = SqliteApprovalStore::new(&args.approvals_db);
    approvals.migrate().context("failed to migrate approval store")?;

    let registry = builtin_registry().context("failed to build tool registry")?;
    let tool_prompts: Vec<(String, String)> = registry
        .list()
        .iter()
        .map(|spec| (spec.name.clone(), spec.description.clone()))
        .collect();

    let mut rules = RuleRouter::new();
    rules.add_rule(RouteRule::keyword("safe_calc", "calc", "expression", 0.8, "keyword_calc"));
    rules.add_rule(RouteRule::keyword("echo", "echo", "message", 0.6, "keyword_echo"));
    let rules = Arc::new(rules);

    let embedder: Option<Arc<dyn Embedder>> = args.semantic_enabled.then(|| {
        Arc::new(OllamaEmbedder::new(
            args.embed_url.clone(),
            args.embed_model.clone(),
            Duration::from_secs(args.embed_timeout_sec),
        )) as Arc<dyn Embedder>
    });
    let semantic = Arc::new(SemanticRouter::new(tool_prompts, embedder, args.semantic_enabled));

    let cache = args
        .intent_cache_enabled
        .then(|| IntentCache::new(&args.intent_cache_db, args.intent_cache_ttl_sec));
    let hitl = args.intent_hitl_enabled.then(|| HitlQueue::new(&args.hitl_db));
    let intent = IntentRouter::new(
        Arc::clone(&rules),
        Arc::clone(&semantic),
        cache,
        hitl,
        IntentRouterConfig {
            enabled: args.intent_enabled,
            min_confidence: args.intent_min_confidence,
            min_gap: args.intent_min_gap,
            default_tool: None,
        },
    );

    let sandbox: Option<Arc<dyn SandboxDriver>> = args.sandbox_enabled.then(|| {
        Arc::new(DockerSandbox::new(SandboxConfig {
            enabled: true,
            image: args.sandbox_image.clone(),
            cpu_quota: args.sandbox_cpu.clone(),
            memory_mb: args.sandbox_memory_mb,
            timeout: Duration::from_secs(args.sandbox_timeout_sec),
            tool_dir: args.sandbox_tool_dir.clone(),
        })) as Arc<dyn SandboxDriver>
    });
    let executor = ToolExecutor::new(
        registry,
        sandbox,
        ExecutorConfig {
            max_output_chars: args.tool_max_output_chars,
            sandbox_required: args.sandbox_required,
            sandbox_fallback: args.sandbox_fallback,
        },
    );

    let provider: Option<Arc<dyn ChatProvider>> = args.llm_enabled.then(|| {
        Arc::new(OllamaChatProvider::new(ProviderConfig {
            base_url: args.ollama_url.clone(),
            model: args.model_chat.clone(),
            network_enabled: args.llm_network_enabled,
            timeout: Duration::from_secs(args.llm_timeout_sec),
            health_timeout: Duration::from_secs(args.llm_health_timeout_sec),
            max_output_chars: args.llm_max_output_chars,
            retry_count: args.llm_retry_count,
            retry_backoff: Duration::from_millis(args.llm_retry_backoff_ms),
            circuit_max_failures: args.llm_circuit_max_failures,
            circuit_reset: Duration::from_secs(args.llm_circuit_reset_sec),
            model_allowlist: parse_allowlist(&args.llm_model_allowlist),
        })) as Arc<dyn ChatProvider>
    });

    let write_policy = WritePolicy::parse(&args.memory_write_policy);
    let memory = (write_policy != WritePolicy::Off).then(|| {
        MemoryStore::new(MemoryConfig {
            write_policy,
            db_path: args.memory_db.clone(),
            capture_ttl_minutes: args.memory_ttl_minutes,
            min_scrubbed_chars: 8,
        })
    });

    let orchestrator = Orchestrator::new(
        trace.clone(),
        policy,
        approvals,
        executor,
        provider,
        intent,
        rules,
        semantic,
        memory,
        OrchestratorConfig {
            approvals_enforced: args.approvals_enforce,
            intent_shadow: args.intent_shadow,
            provider_label: "ollama".to_string(),
            model_label: args.model_chat.clone(),
            network_enabled: args.llm_network_enabled,
        },
    );

    Ok(ServiceState {
        orchestrator: Arc::new(orchestrator),
        trace,
        require_bearer: args.require_bearer,
        bearer_token: args.bearer_token.clone(),
        expose_intent: args.intent_expose,
        llm_enabled: args.llm_enabled,
        request_timeout: Duration::from_millis(args.request_timeout_ms),
        rate: Arc::new(RateLimiter::new(args.rate_limit_per_minute)),
        redaction: RedactionProfile { max_value_chars: args.trust_max_value_chars },
        max_request_bytes: args.max_request_bytes,
        approval_ttl_sec: args.approval_ttl_sec,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let bind = args.bind;
    let state = build_state(&args)?;
    info!(%bind, service = SERVICE_NAME, "starting");

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use http::Request;
    use orch_gate_approvals::SqliteApprovalStore;
    use orch_gate_domain::RedactionProfile;
    use orch_gate_intent::{IntentRouter, IntentRouterConfig, RouteRule, RuleRouter, SemanticRouter};
    use orch_gate_policy::PolicyEngine;
    use orch_gate_tools::{
        builtin_registry, ExecutorConfig, SandboxDriver, SandboxResult, ToolExecutor,
    };
    use orch_gate_trace_core::TraceStore;
    use orch_gate_trace_sqlite::SqliteTraceStore;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{app, Orchestrator, OrchestratorConfig, RateLimiter, ServiceState};

    const TEST_TOKEN: &str = "test-token";

    const POLICY_DOC: &str = r#"
rules:
  - match: "^(echo|safe_calc|summarize_text)$"
    action: allow
    reason: safe_builtins
  - match: "^python_(exec|eval)$"
    action: allow
    reason: sandboxed_python
  - match: ".*"
    action: deny
    reason: default_deny
"#;

    struct OkSandbox;

    impl SandboxDriver for OkSandbox {
        fn available(&self) -> bool {
            true
        }

        fn run(&self, _command: &[String], _payload: &Value) -> anyhow::Result<SandboxResult> {
            Ok(SandboxResult {
                ok: true,
                stdout: "1".to_string(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    struct TestHarness {
        state: ServiceState,
        trace_path: std::path::PathBuf,
        approvals_path: std::path::PathBuf,
    }

    impl TestHarness {
        fn cleanup(&self) {
            let _ = std::fs::remove_file(&self.trace_path);
            let _ = std::fs::remove_file(&self.approvals_path);
        }
    }

    fn temp_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("orch-gate-svc-{label}-{}.sqlite3", ulid::Ulid::new()))
    }

    fn harness(rate_limit: u32) -> TestHarness {
        let trace_path = temp_path("trace");
        let approvals_path = temp_path("approvals");

        let trace_store = SqliteTraceStore::new(&trace_path);
        trace_store.migrate().unwrap_or_else(|err| panic!("trace migrate failed: {err:#}"));
        let trace: Option<Arc<dyn TraceStore>> = Some(Arc::new(trace_store));
        let approvals = SqliteApprovalStore::new(&approvals_path);
        approvals.migrate().unwrap_or_else(|err| panic!("approvals migrate failed: {err:#}"));

        let policy = Arc::new(
            PolicyEngine::from_yaml_str(POLICY_DOC, true)
                .unwrap_or_else(|err| panic!("policy parse failed: {err:#}")),
        );

        let mut rules = RuleRouter::new();
        rules.add_rule(RouteRule::keyword("safe_calc", "calc", "expression", 0.8, "keyword_calc"));
        rules.add_rule(RouteRule::keyword("echo", "echo", "message", 0.6, "keyword_echo"));
        let rules = Arc::new(rules);
        let semantic = Arc::new(SemanticRouter::disabled());

        let intent = IntentRouter::new(
            Arc::clone(&rules),
            Arc::clone(&semantic),
            None,
            None,
            IntentRouterConfig::default(),
        );

        let registry = builtin_registry().unwrap_or_else(|err| panic!("registry failed: {err:#}"));
        let executor = ToolExecutor::new(
            registry,
            Some(Arc::new(OkSandbox) as Arc<dyn SandboxDriver>),
            ExecutorConfig::default(),
        );

        let orchestrator = Orchestrator::new(
            trace.clone(),
            policy,
            approvals,
            executor,
            None,
            intent,
            rules,
            semantic,
            None,
            OrchestratorConfig::default(),
        );

        let state = ServiceState {
            orchestrator: Arc::new(orchestrator),
            trace,
            require_bearer: true,
            bearer_token: TEST_TOKEN.to_string(),
            expose_intent: false,
            llm_enabled: false,
            request_timeout: Duration::from_millis(5000),
            rate: Arc::new(RateLimiter::new(rate_limit)),
            redaction: RedactionProfile::default(),
            max_request_bytes: 1_048_576,
            approval_ttl_sec: 900,
        };

        TestHarness { state, trace_path, approvals_path }
    }

    fn authed(request: http::request::Builder) -> http::request::Builder {
        request.header("authorization", format!("Bearer {TEST_TOKEN}"))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}"),
        }
    }

    async fn post_json(
        router: axum::Router,
        path: &str,
        payload: Value,
    ) -> axum::response::Response {
        let request = authed(Request::builder().uri(path).method("POST"))
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    #[tokio::test]
    async fn health_is_open_and_discloses_ai() {
        let harness = harness(60);
        let router = app(harness.state.clone());
        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .method("GET")
                    .body(Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(
            response.headers().get("x-ai-generated").and_then(|value| value.to_str().ok()),
            Some("true")
        );
        let value = body_json(response).await;
        assert_eq!(value["status"], json!("ok"));
        harness.cleanup();
    }

    #[tokio::test]
    async fn bearer_is_required_on_v1_routes() {
        let harness = harness(60);
        let router = app(harness.state.clone());
        let request = Request::builder()
            .uri("/v1/chat/completions")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), http::StatusCode::UNAUTHORIZED);
        let value = body_json(response).await;
        assert_eq!(value["error"]["type"], json!("auth_error"));
        harness.cleanup();
    }

    #[tokio::test]
    async fn chat_echo_returns_tool_result_and_trace_header() {
        let harness = harness(60);
        let router = app(harness.state.clone());
        let response = post_json(
            router,
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "echo hello world"}]}),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        let trace_header = response
            .headers()
            .get("x-trace-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        assert!(trace_header.is_some());

        let value = body_json(response).await;
        assert_eq!(
            value["choices"][0]["message"]["content"],
            json!("Tool [echo] result: Echo: hello world")
        );
        assert_eq!(value["tool_result"]["ok"], json!(true));
        assert_eq!(value["request_id"].as_str(), trace_header.as_deref());
        harness.cleanup();
    }

    #[tokio::test]
    async fn approval_lifecycle_over_http() {
        let harness = harness(60);

        // Execute without an approval token.
        let response = post_json(
            app(harness.state.clone()),
            "/v1/tools/execute",
            json!({"name": "python_exec", "args": {"code": "print(1)"}}),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::FORBIDDEN);
        let value = body_json(response).await;
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["error"], json!("approval_required"));
        assert_eq!(value["approval_reason"], json!("missing_approval"));

        // Approve the same body.
        let response = post_json(
            app(harness.state.clone()),
            "/v1/tools/approve",
            json!({"name": "python_exec", "args": {"code": "print(1)"}}),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        let approval = body_json(response).await;
        assert_eq!(approval["status"], json!("pending"));
        assert_eq!(approval["tool"], json!("python_exec"));
        let approval_id = approval["approval_id"]
            .as_str()
            .unwrap_or_else(|| panic!("missing approval_id"))
            .to_string();

        // Execute with the token: sandboxed success.
        let response = post_json(
            app(harness.state.clone()),
            "/v1/tools/execute",
            json!({
                "name": "python_exec",
                "args": {"code": "print(1)"},
                "approval_token": approval_id,
            }),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        let value = body_json(response).await;
        assert_eq!(value["status"], json!("ok"));
        assert_eq!(value["result"]["sandbox_used"], json!(true));

        // Replay the consumed token.
        let response = post_json(
            app(harness.state.clone()),
            "/v1/tools/execute",
            json!({
                "name": "python_exec",
                "args": {"code": "print(1)"},
                "approval_token": approval["approval_id"],
            }),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::FORBIDDEN);
        let value = body_json(response).await;
        assert_eq!(value["approval_reason"], json!("already_consumed"));

        harness.cleanup();
    }

    #[tokio::test]
    async fn approval_binds_args_hash_over_http() {
        let harness = harness(60);
        let response = post_json(
            app(harness.state.clone()),
            "/v1/tools/approve",
            json!({"name": "python_exec", "args": {"code": "print(1)"}}),
        )
        .await;
        let approval = body_json(response).await;

        let response = post_json(
            app(harness.state.clone()),
            "/v1/tools/execute",
            json!({
                "name": "python_exec",
                "args": {"code": "print(2)"},
                "approval_token": approval["approval_id"],
            }),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::FORBIDDEN);
        let value = body_json(response).await;
        assert_eq!(value["approval_reason"], json!("args_hash_mismatch"));
        harness.cleanup();
    }

    #[tokio::test]
    async fn missing_tool_name_is_a_validation_error() {
        let harness = harness(60);
        let response =
            post_json(app(harness.state.clone()), "/v1/tools/execute", json!({"args": {}})).await;
        assert_eq!(response.status(), http::StatusCode::BAD_REQUEST);
        let value = body_json(response).await;
        assert_eq!(value["error"]["type"], json!("validation_error"));
        harness.cleanup();
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_requests() {
        let harness = harness(2);
        for _ in 0..2 {
            let response = post_json(
                app(harness.state.clone()),
                "/v1/chat/completions",
                json!({"messages": [{"role": "user", "content": "echo hi"}]}),
            )
            .await;
            assert_eq!(response.status(), http::StatusCode::OK);
        }
        let response = post_json(
            app(harness.state.clone()),
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "echo hi"}]}),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::TOO_MANY_REQUESTS);
        let value = body_json(response).await;
        assert_eq!(value["error"]["type"], json!("rate_limited"));
        harness.cleanup();
    }

    #[tokio::test]
    async fn trust_surface_lists_and_verifies_chains() {
        let harness = harness(60);

        let response = post_json(
            app(harness.state.clone()),
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": "echo receipts"}]}),
        )
        .await;
        let trace_id = response
            .headers()
            .get("x-trace-id")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(!trace_id.is_empty());

        // Events listing, filtered to the execution step.
        let request = authed(
            Request::builder()
                .uri("/v1/trust/events?step_type=tool_execute&limit=10")
                .method("GET"),
        )
        .body(Body::empty())
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match app(harness.state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), http::StatusCode::OK);
        let value = body_json(response).await;
        assert!(value["count"].as_u64().unwrap_or(0) >= 1);

        // Full trace report.
        let request = authed(
            Request::builder().uri(format!("/v1/trust/trace/{trace_id}")).method("GET"),
        )
        .body(Body::empty())
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match app(harness.state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), http::StatusCode::OK);
        let report = body_json(response).await;
        let chain_hash = report["chain_hash"].as_str().unwrap_or_default().to_string();
        assert_eq!(chain_hash.len(), 64);
        assert!(report["step_count"].as_u64().unwrap_or(0) >= 3);

        // Verification against the reported hash.
        let request = authed(
            Request::builder()
                .uri(format!("/v1/trust/verify/{trace_id}?expected_hash={chain_hash}"))
                .method("GET"),
        )
        .body(Body::empty())
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match app(harness.state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), http::StatusCode::OK);
        let verification = body_json(response).await;
        assert_eq!(verification["ok"], json!(true));
        assert_eq!(verification["chain_hash"], json!(chain_hash));

        harness.cleanup();
    }

    #[tokio::test]
    async fn unknown_trace_is_not_found() {
        let harness = harness(60);
        let request = authed(
            Request::builder()
                .uri(format!("/v1/trust/trace/{}", ulid::Ulid::new()))
                .method("GET"),
        )
        .body(Body::empty())
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));
        let response = match app(harness.state.clone()).oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
        harness.cleanup();
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected_before_work() {
        let mut harness = harness(60);
        harness.state.max_request_bytes = 256;
        let router = app(harness.state.clone());
        let big = "x".repeat(4096);
        let response = post_json(
            router,
            "/v1/chat/completions",
            json!({"messages": [{"role": "user", "content": big}]}),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::PAYLOAD_TOO_LARGE);
        harness.cleanup();
    }

    #[tokio::test]
    async fn demo_mode_answers_generative_requests() {
        let harness = harness(60);
        let response = post_json(
            app(harness.state.clone()),
            "/v1/chat/completions?debug=1",
            json!({"messages": [{"role": "user", "content": "what time is it"}]}),
        )
        .await;
        assert_eq!(response.status(), http::StatusCode::OK);
        let value = body_json(response).await;
        let content = value["choices"][0]["message"]["content"].as_str().unwrap_or_default();
        assert!(content.contains("demo mode"));
        assert!(value.get("intent_decision").is_some());
        harness.cleanup();
    }
}
