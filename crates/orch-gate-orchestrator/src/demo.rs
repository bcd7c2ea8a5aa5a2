use orch_gate_intent::IntentDecision;

fn heuristic_intent(text: &str) -> &'static str {
    let lowered = text.to_ascii_lowercase();
    if lowered.contains("calc") {
        "safe_calc"
    } else if lowered.contains("echo") {
        "echo"
    } else if !lowered.trim().is_empty() {
        "chat"
    } else {
        "unknown"
    }
}

/// Deterministic chat content used when no provider is configured and no
/// tool matched; keeps local demos observable without a model.
#[must_use]
pub fn build_demo_response(
    user_input: &str,
    routed_tool: Option<&str>,
    intent_decision: Option<&IntentDecision>,
    provider: &str,
    model: &str,
    network_enabled: bool,
) -> String {
    let intent = intent_decision
        .and_then(|decision| decision.intent_id.as_deref())
        .unwrap_or_else(|| heuristic_intent(user_input));
    let tool = routed_tool.unwrap_or("none");

    [
        "[orch-gate demo mode]".to_string(),
        "LLM enabled: false".to_string(),
        format!("Intent (heuristic): {intent}"),
        format!("Route (heuristic): {tool}"),
        "Tool execution requires the guarded execute path; unsafe tools require approval."
            .to_string(),
        format!("If LLM enabled: provider={provider}, model={model}, network_enabled={network_enabled}"),
        "Receipts: enable tracing to emit trace steps.".to_string(),
    ]
    .join("\n")
}
