#![forbid(unsafe_code)]

pub mod demo;
pub mod memory;

use std::sync::Arc;

use anyhow::{Context, Result};
use orch_gate_approvals::{ApprovalRecord, ConsumeOutcome, SqliteApprovalStore};
use orch_gate_domain::{sanitize_payload, scrub_secrets, RedactionProfile, TraceId};
use orch_gate_intent::{IntentDecision, IntentRouter, RouteDecision, RuleRouter, SemanticRouter};
use orch_gate_policy::PolicyEngine;
use orch_gate_provider::{ChatMessage, ChatProvider};
use orch_gate_tools::{Safety, ToolExecutor};
use orch_gate_trace_core::{TraceStatus, TraceStore};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use memory::{MemoryDecision, MemoryStore};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub approvals_enforced: bool,
    pub intent_shadow: bool,
    /// Labels surfaced by the demo banner when no provider is configured.
    pub provider_label: String,
    pub model_label: String,
    pub network_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            approvals_enforced: true,
            intent_shadow: false,
            provider_label: "ollama".to_string(),
            model_label: "qwen2.5:3b".to_string(),
            network_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub conversation_id: Option<String>,
    pub user_id_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderSummary {
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub attempts: u32,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatReply {
    pub trace_id: Option<String>,
    pub content: String,
    pub route_decision: Option<RouteDecision>,
    pub intent_decision: Option<IntentDecision>,
    pub tool_result: Option<orch_gate_tools::ExecutionReport>,
    pub memory_decision: Option<MemoryDecision>,
    pub provider_summary: Option<ProviderSummary>,
    pub error: Option<ChatError>,
}

impl ChatReply {
    fn empty() -> Self {
        Self {
            trace_id: None,
            content: String::new(),
            route_decision: None,
            intent_decision: None,
            tool_result: None,
            memory_decision: None,
            provider_summary: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecuteReply {
    pub trace_id: Option<String>,
    pub tool: String,
    pub report: Option<orch_gate_tools::ExecutionReport>,
    /// Gate-level rejection (`policy_denied` / `approval_required`), distinct
    /// from execution errors reported inside `report`.
    pub error: Option<String>,
    pub reason: Option<String>,
    pub approval_reason: Option<String>,
}

impl ExecuteReply {
    fn gated(tool: &str, error: &str, reason: Option<String>, approval_reason: Option<String>) -> Self {
        Self {
            trace_id: None,
            tool: tool.to_string(),
            report: None,
            error: Some(error.to_string()),
            reason,
            approval_reason,
        }
    }
}

/// One request's handle on the ledger. Backend failures on append propagate;
/// the close is best effort.
struct TraceSession<'a> {
    store: Option<&'a dyn TraceStore>,
    trace_id: Option<TraceId>,
}

impl<'a> TraceSession<'a> {
    fn open(store: Option<&'a dyn TraceStore>, metadata: Value) -> Result<Self> {
        match store {
            Some(store) => {
                let trace_id = store
                    .open_trace(&metadata, None)
                    .context("trace backend failed to open trace")?;
                Ok(Self { store: Some(store), trace_id: Some(trace_id) })
            }
            None => Ok(Self { store: None, trace_id: None }),
        }
    }

    fn step(&self, step_type: &str, payload: Value) -> Result<()> {
        if let (Some(store), Some(trace_id)) = (self.store, self.trace_id) {
            store
                .append_step(trace_id, step_type, &payload)
                .with_context(|| format!("trace backend failed to append '{step_type}'"))?;
        }
        Ok(())
    }

    fn close(&self, status: TraceStatus) {
        if let (Some(store), Some(trace_id)) = (self.store, self.trace_id) {
            if let Err(err) = store.close_trace(trace_id, status) {
                warn!(error = %err, %trace_id, "failed to close trace");
            }
        }
    }

    fn id_string(&self) -> Option<String> {
        self.trace_id.map(|id| id.to_string())
    }
}

#[must_use]
pub fn last_user_message(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.clone())
        .unwrap_or_default()
}

fn render_tool_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Top-level glue: drives the intent router, enforces policy and approvals,
/// dispatches tools or the provider, and chains every decision into the
/// trace ledger.
pub struct Orchestrator {
    trace: Option<Arc<dyn TraceStore>>,
    policy: Arc<PolicyEngine>,
    approvals: SqliteApprovalStore,
    executor: ToolExecutor,
    provider: Option<Arc<dyn ChatProvider>>,
    intent: IntentRouter,
    rule_router: Arc<RuleRouter>,
    semantic: Arc<SemanticRouter>,
    memory: Option<MemoryStore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        trace: Option<Arc<dyn TraceStore>>,
        policy: Arc<PolicyEngine>,
        approvals: SqliteApprovalStore,
        executor: ToolExecutor,
        provider: Option<Arc<dyn ChatProvider>>,
        intent: IntentRouter,
        rule_router: Arc<RuleRouter>,
        semantic: Arc<SemanticRouter>,
        memory: Option<MemoryStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            trace,
            policy,
            approvals,
            executor,
            provider,
            intent,
            rule_router,
            semantic,
            memory,
            config,
        }
    }

    #[must_use]
    pub fn trace_store(&self) -> Option<Arc<dyn TraceStore>> {
        self.trace.clone()
    }

    #[must_use]
    pub fn provider_health(&self) -> (bool, String) {
        match &self.provider {
            Some(provider) => provider.health_check(),
            None => (true, "llm_disabled".to_string()),
        }
    }

    /// Re-read the policy document; a hash change flushes the intent cache.
    ///
    /// # Errors
    /// Returns an error when the reload fails; the old snapshot stays live.
    pub fn reload_policy(&self) -> Result<bool> {
        let changed = self.policy.reload()?;
        if changed {
            self.intent.flush_cache();
        }
        Ok(changed)
    }

    /// # Errors
    /// Returns an error on approval backend failure.
    pub fn handle_approve(
        &self,
        tool_name: &str,
        args: &Value,
        ttl_seconds: Option<u64>,
    ) -> Result<ApprovalRecord> {
        self.approvals.issue(tool_name, args, ttl_seconds)
    }

    /// The full chat pipeline (§ trace: request_received → intent_router →
    /// policy/approval gates → tool_execute | llm_provider → response_sent).
    ///
    /// # Errors
    /// Returns an error on trace-backend failure; every client-visible
    /// failure is reported inside the reply instead.
    pub fn handle_chat(&self, request: &ChatRequest) -> Result<ChatReply> {
        let user_input = last_user_message(&request.messages);
        let trace = TraceSession::open(
            self.trace.as_deref(),
            json!({"route": "/v1/chat/completions"}),
        )?;
        trace.step(
            "request_received",
            json!({
                "message_count": request.messages.len(),
                "content_chars": user_input.chars().count(),
            }),
        )?;

        let mut reply = ChatReply::empty();

        if let Some(memory) = &self.memory {
            let user_id_hash = request.user_id_hash.as_deref().unwrap_or("anonymous");
            match memory.evaluate_capture(
                &user_input,
                request.conversation_id.as_deref(),
                user_id_hash,
            ) {
                Ok(decision) => {
                    trace.step("memory_write_decision", decision.trace_payload())?;
                    reply.memory_decision = Some(decision);
                }
                Err(err) => warn!(error = %err, "memory capture failed"),
            }
        }

        let route = match self.resolve_route(&user_input, &trace, &mut reply)? {
            Resolved::Route(route) => route,
            Resolved::Finished(reply) => return Ok(reply),
        };

        if let Some(tool_name) = route.tool.clone() {
            reply.route_decision = Some(route.clone());
            return self.run_chat_tool(&tool_name, &route, trace, reply);
        }
        reply.route_decision = Some(route);

        if let Some(provider) = &self.provider {
            match provider.generate(&request.messages) {
                Ok(outcome) => {
                    trace.step(
                        "llm_provider",
                        json!({
                            "provider": outcome.provider,
                            "model": outcome.model,
                            "latency_ms": outcome.latency_ms,
                            "output_chars": outcome.content.chars().count(),
                            "attempts": outcome.attempts,
                            "truncated": outcome.truncated,
                        }),
                    )?;
                    reply.provider_summary = Some(ProviderSummary {
                        provider: outcome.provider,
                        model: outcome.model,
                        latency_ms: outcome.latency_ms,
                        attempts: outcome.attempts,
                        truncated: outcome.truncated,
                    });
                    reply.content = outcome.content;
                }
                Err(err) => {
                    let (message, _) = scrub_secrets(&err.message);
                    trace.step(
                        "llm_provider_error",
                        json!({"kind": err.kind.as_str(), "attempts": err.attempts}),
                    )?;
                    reply.content = format!("LLM provider error: {message}");
                    reply.error =
                        Some(ChatError { kind: err.kind.as_str().to_string(), message });
                    return self.finalize(&trace, reply);
                }
            }
        } else {
            reply.content = demo::build_demo_response(
                &user_input,
                None,
                reply.intent_decision.as_ref(),
                &self.config.provider_label,
                &self.config.model_label,
                self.config.network_enabled,
            );
        }

        self.finalize(&trace, reply)
    }

    /// Explicit guarded execution: policy gate, approval gate for unsafe
    /// tools, then the executor. No intent routing.
    ///
    /// # Errors
    /// Returns an error on trace-backend failure.
    pub fn handle_execute(
        &self,
        tool_name: &str,
        args: &Map<String, Value>,
        approval_token: Option<&str>,
    ) -> Result<ExecuteReply> {
        let trace = TraceSession::open(
            self.trace.as_deref(),
            json!({"route": "/v1/tools/execute", "tool": tool_name}),
        )?;
        let args_value = Value::Object(args.clone());
        let (sanitized_args, _) = sanitize_payload(&args_value, RedactionProfile::default());
        trace.step(
            "request_received",
            json!({"tool": tool_name, "args": sanitized_args, "has_approval_token": approval_token.is_some()}),
        )?;

        let spec = self.executor.registry().lookup(tool_name);
        let safe = spec.as_ref().map_or(true, |spec| spec.safety == Safety::Safe);

        let policy_decision = self.policy.check(tool_name, &args_value, safe);
        trace.step(
            "policy_decision",
            json!({
                "tool": tool_name,
                "allowed": policy_decision.allowed,
                "reason": policy_decision.reason,
                "matched_rule": policy_decision.matched_rule,
                "policy_hash": policy_decision.policy_hash,
            }),
        )?;
        if !policy_decision.allowed {
            let mut reply = ExecuteReply::gated(
                tool_name,
                "policy_denied",
                Some(policy_decision.reason),
                None,
            );
            trace.step("response_sent", json!({"status": "error", "error": "policy_denied"}))?;
            trace.close(TraceStatus::Failed);
            reply.trace_id = trace.id_string();
            return Ok(reply);
        }

        if !safe && self.config.approvals_enforced {
            match self
                .approvals
                .validate_and_consume(approval_token, tool_name, &args_value)
                .context("approval backend failure")?
            {
                ConsumeOutcome::Consumed(record) => {
                    trace.step(
                        "approval_consumed",
                        json!({
                            "tool": tool_name,
                            "approval_id": record.approval_id,
                            "args_hash": record.args_hash,
                        }),
                    )?;
                }
                ConsumeOutcome::Rejected(rejection) => {
                    trace.step(
                        "approval_denied",
                        json!({"tool": tool_name, "approval_reason": rejection.as_str()}),
                    )?;
                    let mut reply = ExecuteReply::gated(
                        tool_name,
                        "approval_required",
                        None,
                        Some(rejection.as_str().to_string()),
                    );
                    trace.step(
                        "response_sent",
                        json!({"status": "error", "error": "approval_required"}),
                    )?;
                    trace.close(TraceStatus::Failed);
                    reply.trace_id = trace.id_string();
                    return Ok(reply);
                }
            }
        }

        let report = self.executor.execute(tool_name, args);
        trace.step(
            "tool_execute",
            json!({
                "name": tool_name,
                "args": sanitized_args,
                "status": (if report.ok { "ok" } else { "error" }),
                "error_kind": report.error_kind,
                "truncated": report.truncated,
                "sandbox_used": report.sandbox_used,
                "latency_ms": report.latency_ms,
            }),
        )?;
        trace.step(
            "response_sent",
            json!({"status": (if report.ok { "ok" } else { "error" })}),
        )?;
        trace.close(if report.ok { TraceStatus::Completed } else { TraceStatus::Failed });

        Ok(ExecuteReply {
            trace_id: trace.id_string(),
            tool: tool_name.to_string(),
            report: Some(report),
            error: None,
            reason: None,
            approval_reason: None,
        })
    }

    fn resolve_route(
        &self,
        user_input: &str,
        trace: &TraceSession<'_>,
        reply: &mut ChatReply,
    ) -> Result<Resolved> {
        if self.intent.enabled() && !self.config.intent_shadow {
            let decision = self.intent.route(user_input, &self.policy.snapshot());
            trace.step("intent_router", decision.trace_payload())?;

            if decision.deny_reason.as_deref() == Some("tier0_deny") {
                reply.intent_decision = Some(decision);
                reply.content = "Request denied by routing policy.".to_string();
                reply.error = Some(ChatError {
                    kind: "intent_denied".to_string(),
                    message: "tier0_deny".to_string(),
                });
                return Ok(Resolved::Finished(self.finalize(trace, std::mem::replace(
                    reply,
                    ChatReply::empty(),
                ))?));
            }

            if decision.requires_hitl {
                let message = decision
                    .evidence
                    .get("hitl_message")
                    .and_then(Value::as_str)
                    .unwrap_or("Human review required.")
                    .to_string();
                reply.route_decision = Some(RouteDecision {
                    tool: None,
                    params: Map::new(),
                    confidence: decision.confidence,
                    reason: decision
                        .deny_reason
                        .clone()
                        .unwrap_or_else(|| "hitl_required".to_string()),
                });
                reply.intent_decision = Some(decision);
                reply.content = message;
                return Ok(Resolved::Finished(self.finalize(trace, std::mem::replace(
                    reply,
                    ChatReply::empty(),
                ))?));
            }

            let route = match &decision.intent_id {
                Some(intent_id) if self.executor.registry().lookup(intent_id).is_some() => {
                    RouteDecision {
                        tool: Some(intent_id.clone()),
                        params: decision.tool_params.clone(),
                        confidence: decision.confidence,
                        reason: "intent_router".to_string(),
                    }
                }
                _ => RouteDecision {
                    tool: None,
                    params: Map::new(),
                    confidence: decision.confidence,
                    reason: "intent_router_no_match".to_string(),
                },
            };
            reply.intent_decision = Some(decision);
            return Ok(Resolved::Route(route));
        }

        if self.intent.enabled() && self.config.intent_shadow {
            // Shadow decisions are recorded for comparison but never bind.
            let shadow = self.intent.route(user_input, &self.policy.snapshot());
            trace.step("intent_router_shadow", shadow.trace_payload())?;
            reply.intent_decision = Some(shadow);
        }

        let (route, candidates, hitl_message) = self.legacy_route(user_input);
        if !candidates.is_empty() {
            trace.step(
                "semantic_router",
                json!({
                    "candidates": candidates
                        .iter()
                        .map(|candidate| json!({"tool": candidate.tool, "score": candidate.score}))
                        .collect::<Vec<_>>(),
                    "decision": route,
                }),
            )?;
        }
        if let Some(message) = hitl_message {
            reply.route_decision = Some(route);
            reply.content = message;
            return Ok(Resolved::Finished(self.finalize(trace, std::mem::replace(
                reply,
                ChatReply::empty(),
            ))?));
        }
        Ok(Resolved::Route(route))
    }

    /// The pre-tiered routing path: ordered rules, then unguarded semantic
    /// ranking with an ambiguity guard.
    fn legacy_route(
        &self,
        user_input: &str,
    ) -> (RouteDecision, Vec<orch_gate_intent::SemanticMatch>, Option<String>) {
        let decision = self.rule_router.route(user_input);
        if decision.tool.is_some() {
            return (decision, Vec::new(), None);
        }
        if !self.semantic.enabled() {
            return (decision, Vec::new(), None);
        }
        let candidates = self.semantic.rank(user_input);
        let Some(best) = candidates.first() else {
            return (decision, candidates, None);
        };
        let runner_up = candidates.get(1);
        let ambiguous = runner_up.is_some_and(|second| {
            second.score == best.score
                || (best.score - second.score) < orch_gate_intent::DEFAULT_MIN_GAP
        });
        if ambiguous {
            let guard = RouteDecision {
                tool: None,
                params: Map::new(),
                confidence: best.score,
                reason: "ambiguous_intent".to_string(),
            };
            return (guard, candidates, Some("Human review required.".to_string()));
        }
        if best.score >= orch_gate_intent::DEFAULT_MIN_CONFIDENCE {
            let accepted = RouteDecision {
                tool: Some(best.tool.clone()),
                params: Map::new(),
                confidence: best.score,
                reason: "semantic_match".to_string(),
            };
            return (accepted, candidates, None);
        }
        (RouteDecision::no_match(), candidates, None)
    }

    fn run_chat_tool(
        &self,
        tool_name: &str,
        route: &RouteDecision,
        trace: TraceSession<'_>,
        mut reply: ChatReply,
    ) -> Result<ChatReply> {
        let args_value = Value::Object(route.params.clone());
        let spec = self.executor.registry().lookup(tool_name);
        let safe = spec.as_ref().map_or(true, |spec| spec.safety == Safety::Safe);

        let policy_decision = self.policy.check(tool_name, &args_value, safe);
        trace.step(
            "policy_decision",
            json!({
                "tool": tool_name,
                "allowed": policy_decision.allowed,
                "reason": policy_decision.reason,
                "matched_rule": policy_decision.matched_rule,
                "policy_hash": policy_decision.policy_hash,
            }),
        )?;
        if !policy_decision.allowed {
            reply.content = format!("Tool '{tool_name}' denied by policy.");
            reply.error = Some(ChatError {
                kind: "policy_denied".to_string(),
                message: policy_decision.reason,
            });
            return self.finalize(&trace, reply);
        }

        if !safe && self.config.approvals_enforced {
            // Chat requests carry no approval token; unsafe tools must go
            // through the explicit execute path.
            trace.step(
                "approval_denied",
                json!({"tool": tool_name, "approval_reason": "missing_approval"}),
            )?;
            reply.content = format!(
                "Tool '{tool_name}' requires an approval token; use the tools execute endpoint."
            );
            reply.error = Some(ChatError {
                kind: "approval_required".to_string(),
                message: "missing_approval".to_string(),
            });
            return self.finalize(&trace, reply);
        }

        let report = self.executor.execute(tool_name, &route.params);
        let (sanitized_args, _) = sanitize_payload(&args_value, RedactionProfile::default());
        trace.step(
            "tool_execute",
            json!({
                "name": tool_name,
                "args": sanitized_args,
                "status": (if report.ok { "ok" } else { "error" }),
                "error_kind": report.error_kind,
                "truncated": report.truncated,
                "sandbox_used": report.sandbox_used,
                "latency_ms": report.latency_ms,
            }),
        )?;

        reply.content = if report.ok {
            format!("Tool [{tool_name}] result: {}", render_tool_value(report.value.as_ref()))
        } else {
            format!(
                "Tool error ({tool_name}): {}",
                report.error.clone().unwrap_or_else(|| "unknown".to_string())
            )
        };
        reply.tool_result = Some(report);
        self.finalize(&trace, reply)
    }

    fn finalize(&self, trace: &TraceSession<'_>, mut reply: ChatReply) -> Result<ChatReply> {
        let status = if reply.error.is_some() { "error" } else { "ok" };
        trace.step(
            "response_sent",
            json!({
                "status": status,
                "content_chars": reply.content.chars().count(),
                "error_kind": reply.error.as_ref().map(|error| error.kind.clone()),
            }),
        )?;
        trace.close(if reply.error.is_some() {
            TraceStatus::Failed
        } else {
            TraceStatus::Completed
        });
        reply.trace_id = trace.id_string();
        Ok(reply)
    }
}

enum Resolved {
    Route(RouteDecision),
    Finished(ChatReply),
}
