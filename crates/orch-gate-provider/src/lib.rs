#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatOutcome {
    pub content: String,
    pub model: String,
    pub provider: String,
    pub latency_ms: u64,
    pub attempts: u32,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    NetworkDisabled,
    Timeout,
    Network,
    Protocol,
    ModelRejected,
    CircuitOpen,
}

impl ProviderErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetworkDisabled => "network_disabled",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::ModelRejected => "model_rejected",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub attempts: u32,
}

impl ProviderError {
    fn new(kind: ProviderErrorKind, message: impl Into<String>, attempts: u32) -> Self {
        Self { kind, message: message.into(), attempts }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "provider {} error (attempt {}): {}", self.kind.as_str(), self.attempts, self.message)
    }
}

impl std::error::Error for ProviderError {}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub model: String,
    pub network_enabled: bool,
    pub timeout: Duration,
    pub health_timeout: Duration,
    pub max_output_chars: usize,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub circuit_max_failures: u32,
    pub circuit_reset: Duration,
    pub model_allowlist: Option<BTreeSet<String>>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:11434".to_string(),
            model: "qwen2.5:3b".to_string(),
            network_enabled: false,
            timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(5),
            max_output_chars: 4000,
            retry_count: 0,
            retry_backoff: Duration::from_millis(500),
            circuit_max_failures: 3,
            circuit_reset: Duration::from_secs(30),
            model_allowlist: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probing: bool,
}

/// Three-state failure gate. Closed until `max_failures` consecutive
/// transport failures; open fails fast inside the reset window; half-open
/// admits exactly one probe whose outcome closes or reopens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(max_failures: u32, reset: Duration) -> Self {
        Self { max_failures, reset, inner: Mutex::new(BreakerInner::default()) }
    }

    /// Gate one call attempt. `Err(())` means the circuit is open and no
    /// transport call may be issued.
    #[allow(clippy::result_unit_err)]
    pub fn acquire(&self) -> Result<(), ()> {
        let Ok(mut inner) = self.inner.lock() else {
            return Err(());
        };
        match inner.opened_at {
            None => Ok(()),
            Some(opened_at) => {
                if opened_at.elapsed() < self.reset {
                    return Err(());
                }
                if inner.probing {
                    return Err(());
                }
                inner.probing = true;
                Ok(())
            }
        }
    }

    pub fn record_success(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.consecutive_failures = 0;
            inner.opened_at = None;
            inner.probing = false;
        }
    }

    pub fn record_failure(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.probing {
                // Failed half-open probe: reopen with a fresh window.
                inner.probing = false;
                inner.opened_at = Some(Instant::now());
                return;
            }
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.max_failures && inner.opened_at.is_none() {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> CircuitState {
        let Ok(inner) = self.inner.lock() else {
            return CircuitState::Open;
        };
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) => {
                if opened_at.elapsed() < self.reset {
                    CircuitState::Open
                } else {
                    CircuitState::HalfOpen
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TransportErrorKind {
    Timeout,
    Network,
    Protocol,
}

#[derive(Debug, Clone)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

/// The wire seam beneath the provider: one chat POST, one health probe.
pub trait ChatTransport: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn post_chat(
        &self,
        base_url: &str,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<Value, TransportError>;

    #[allow(clippy::missing_errors_doc)]
    fn probe(&self, base_url: &str, timeout: Duration) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
pub struct UreqChatTransport;

fn classify_ureq(err: &ureq::Error) -> TransportError {
    match err {
        ureq::Error::Status(code, _) => TransportError {
            kind: TransportErrorKind::Protocol,
            message: format!("provider returned HTTP {code}"),
        },
        ureq::Error::Transport(transport) => {
            let message = transport.to_string();
            let lowered = message.to_ascii_lowercase();
            let kind = if lowered.contains("timed out") || lowered.contains("timeout") {
                TransportErrorKind::Timeout
            } else {
                TransportErrorKind::Network
            };
            TransportError { kind, message }
        }
    }
}

impl ChatTransport for UreqChatTransport {
    fn post_chat(
        &self,
        base_url: &str,
        model: &str,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let payload = json!({
            "model": model,
            "messages": messages,
            "stream": false,
        });
        let response = agent
            .request("POST", &format!("{}/api/chat", base_url.trim_end_matches('/')))
            .set("content-type", "application/json")
            .send_json(payload)
            .map_err(|err| classify_ureq(&err))?;
        response.into_json::<Value>().map_err(|err| TransportError {
            kind: TransportErrorKind::Protocol,
            message: format!("invalid provider JSON: {err}"),
        })
    }

    fn probe(&self, base_url: &str, timeout: Duration) -> Result<(), TransportError> {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        agent
            .request("GET", &format!("{}/api/tags", base_url.trim_end_matches('/')))
            .call()
            .map_err(|err| classify_ureq(&err))?;
        Ok(())
    }
}

pub trait ChatProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn generate(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, ProviderError>;

    /// (healthy, reason) for the readiness surface.
    fn health_check(&self) -> (bool, String);
}

/// Hardened Ollama chat provider: network gate, model allowlist, per-call
/// timeout, constant-backoff retry budget, output cap, circuit breaker.
pub struct OllamaChatProvider {
    config: ProviderConfig,
    transport: Arc<dyn ChatTransport>,
    breaker: CircuitBreaker,
}

impl OllamaChatProvider {
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self::with_transport(config, Arc::new(UreqChatTransport))
    }

    #[must_use]
    pub fn with_transport(config: ProviderConfig, transport: Arc<dyn ChatTransport>) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_max_failures, config.circuit_reset);
        Self { config, transport, breaker }
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    fn ensure_model_allowed(&self) -> Result<(), ProviderError> {
        if let Some(allowlist) = &self.config.model_allowlist {
            if !allowlist.contains(&self.config.model) {
                return Err(ProviderError::new(
                    ProviderErrorKind::ModelRejected,
                    format!("model '{}' is not allowlisted", self.config.model),
                    0,
                ));
            }
        }
        Ok(())
    }

    fn cap_output(&self, content: String) -> (String, bool) {
        if self.config.max_output_chars == 0 {
            return (content, false);
        }
        let total = content.chars().count();
        if total <= self.config.max_output_chars {
            return (content, false);
        }
        (content.chars().take(self.config.max_output_chars).collect(), true)
    }
}

impl ChatProvider for OllamaChatProvider {
    fn provider_name(&self) -> &'static str {
        "ollama"
    }

    fn generate(&self, messages: &[ChatMessage]) -> Result<ChatOutcome, ProviderError> {
        if !self.config.network_enabled {
            return Err(ProviderError::new(
                ProviderErrorKind::NetworkDisabled,
                "outbound provider calls are disabled",
                0,
            ));
        }
        self.ensure_model_allowed()?;
        if self.breaker.acquire().is_err() {
            return Err(ProviderError::new(
                ProviderErrorKind::CircuitOpen,
                "provider temporarily unavailable",
                0,
            ));
        }

        let start = Instant::now();
        let max_attempts = self.config.retry_count + 1;
        let mut attempts = 0;
        let mut last: Option<TransportError> = None;

        while attempts < max_attempts {
            attempts += 1;
            match self.transport.post_chat(
                &self.config.base_url,
                &self.config.model,
                messages,
                self.config.timeout,
            ) {
                Ok(data) => {
                    self.breaker.record_success();
                    let content = data
                        .get("message")
                        .and_then(|message| message.get("content"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let (content, truncated) = self.cap_output(content);
                    let latency_ms =
                        u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                    return Ok(ChatOutcome {
                        content,
                        model: self.config.model.clone(),
                        provider: self.provider_name().to_string(),
                        latency_ms,
                        attempts,
                        truncated,
                    });
                }
                Err(err) => {
                    let retryable = matches!(
                        err.kind,
                        TransportErrorKind::Timeout | TransportErrorKind::Network
                    );
                    last = Some(err);
                    if retryable && attempts < max_attempts {
                        std::thread::sleep(self.config.retry_backoff);
                        continue;
                    }
                    break;
                }
            }
        }

        let failure = last.unwrap_or(TransportError {
            kind: TransportErrorKind::Network,
            message: "no transport attempt completed".to_string(),
        });
        let kind = match failure.kind {
            TransportErrorKind::Timeout => {
                self.breaker.record_failure();
                ProviderErrorKind::Timeout
            }
            TransportErrorKind::Network => {
                self.breaker.record_failure();
                ProviderErrorKind::Network
            }
            TransportErrorKind::Protocol => {
                // A protocol-level reply still proves the transport is
                // healthy; it resolves a half-open probe without counting
                // toward the failure threshold.
                self.breaker.record_success();
                ProviderErrorKind::Protocol
            }
        };
        Err(ProviderError::new(kind, failure.message, attempts))
    }

    fn health_check(&self) -> (bool, String) {
        if !self.config.network_enabled {
            return (false, "network_disabled".to_string());
        }
        if self.breaker.acquire().is_err() {
            return (false, "circuit_open".to_string());
        }
        match self.transport.probe(&self.config.base_url, self.config.health_timeout) {
            Ok(()) => {
                self.breaker.record_success();
                (true, "ok".to_string())
            }
            Err(err) => {
                match err.kind {
                    TransportErrorKind::Timeout | TransportErrorKind::Network => {
                        self.breaker.record_failure();
                    }
                    TransportErrorKind::Protocol => self.breaker.record_success(),
                }
                (false, format!("provider error: {}", err.message))
            }
        }
    }
}
