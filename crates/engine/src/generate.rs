//! Generation loop: validate, prefill, decode, finalize
//!
//! A request moves through a fixed state machine. Validation refuses
//! before any state change, so a rejected request emits no events and
//! leaves the cache untouched. Prefill pushes the unseen prompt suffix
//! through the stack in one batch. Decode then alternates sample/forward,
//! committing the cache watermark only after each step survives the
//! cancellation and deadline checks, and emits one `Token` event per
//! decoded token. Exactly one terminal event closes every request.

use crate::forward::ForwardPass;
use crate::kernels::KernelDispatch;
use crate::sampler::Sampler;
use crate::scratch::ScratchPool;
use crate::session::{BusyGuard, Session};
use emberlm_common::config::{GenerationOptions, OutputConstraint};
use emberlm_common::metrics::METRICS;
use emberlm_common::telemetry::TelemetrySink;
use emberlm_common::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Cooperative cancellation flag shared between host and decoder
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    /// Create an unsignalled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next check point
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Maps token ids to text. Tokenizers live outside the core; the loop
/// only needs this one direction for stop matching and event text.
pub trait TokenDecoder: Send + Sync {
    /// Text of one token id
    fn decode(&self, token_id: u32) -> String;
}

/// A chat completion request over already-tokenized input
#[derive(Clone)]
pub struct GenerationRequest {
    /// Input token ids for this turn
    pub tokens: Vec<u32>,

    /// Sampling and budget options
    pub options: GenerationOptions,

    /// Optional cooperative cancellation signal
    pub cancel: Option<CancelSignal>,

    /// Optional token-to-text decoder for stop matching and event text
    pub decoder: Option<Arc<dyn TokenDecoder>>,
}

impl GenerationRequest {
    /// Request with default options
    pub fn new(tokens: Vec<u32>) -> Self {
        Self {
            tokens,
            options: GenerationOptions::default(),
            cancel: None,
            decoder: None,
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a cancellation signal
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Attach a token decoder
    pub fn with_decoder(mut self, decoder: Arc<dyn TokenDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }
}

impl std::fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("tokens", &self.tokens.len())
            .field("options", &self.options)
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// `max_new_tokens` produced
    Length,

    /// A stop sequence suffix-matched the output text
    Stop,

    /// The request deadline elapsed
    Timeout,

    /// The host's cancellation signal fired
    Cancelled,

    /// The context-token budget was consumed mid-decode
    Budget,

    /// A mid-decode error terminated the request
    Error,
}

impl FinishReason {
    /// Stable label for telemetry and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Length => "length",
            FinishReason::Stop => "stop",
            FinishReason::Timeout => "timeout",
            FinishReason::Cancelled => "cancelled",
            FinishReason::Budget => "budget",
            FinishReason::Error => "error",
        }
    }
}

/// Per-request usage accounting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    /// Tokens in the request input
    pub prompt_tokens: usize,

    /// Tokens emitted
    pub completion_tokens: usize,

    /// Wall-clock milliseconds from request entry to the first token
    pub ttft_ms: u64,

    /// Emitted tokens per second of decode time
    pub tokens_per_second: f64,
}

/// Streamed generation events; exactly one terminal event per request
#[derive(Debug, Clone)]
pub enum TokenEvent {
    /// The request passed validation and decoding begins
    Started { request_id: String },

    /// One decoded token
    Token {
        text: String,
        token_id: u32,
        generated: usize,
        is_final: bool,
    },

    /// Terminal: the request ran to a non-error stop condition
    Completed {
        reason: FinishReason,
        usage: UsageStats,
    },

    /// Terminal: the cancellation signal was observed
    Cancelled { usage: UsageStats },

    /// Terminal: a mid-decode error; output up to this point is usable
    Error {
        kind: &'static str,
        message: String,
        usage: UsageStats,
    },
}

impl TokenEvent {
    /// Whether this event closes the request
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TokenEvent::Completed { .. } | TokenEvent::Cancelled { .. } | TokenEvent::Error { .. }
        )
    }
}

/// Result of a non-streaming generation
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub request_id: String,
    pub tokens: Vec<u32>,
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: UsageStats,
    /// Error kind and message when `finish_reason` is `Error`; the partial
    /// output above remains usable
    pub error: Option<String>,
}

/// Pre-flight validation: options, context fit, session capacity.
///
/// Returns the index into `request.tokens` where the unseen suffix starts
/// (shared-prefix reuse). Pure with respect to session state.
pub(crate) fn validate_request(session: &Session, request: &GenerationRequest) -> Result<usize> {
    request.options.validate()?;
    if request.tokens.is_empty() {
        return Err(EmberError::invalid_input("request has no input tokens"));
    }

    let params = session.model().hyperparams();
    let effective_context = params
        .context_length
        .min(request.options.max_context_tokens);
    if request.tokens.len() > effective_context {
        return Err(EmberError::ContextLimitExceeded {
            prompt_tokens: request.tokens.len(),
            max_new_tokens: request.options.max_new_tokens,
            context_length: effective_context,
        });
    }

    let state = session.state();

    // Shared-prefix reuse: a prompt that repeats the session's cached
    // tokens prefills only its unseen tail. Anything else is a
    // continuation of the conversation and is appended whole.
    let suffix_start = if request.tokens.starts_with(&state.history) {
        state.history.len()
    } else {
        0
    };
    if suffix_start == request.tokens.len() {
        return Err(EmberError::invalid_input(
            "prompt is already fully cached; include at least one new token",
        ));
    }

    let new_tokens = request.tokens.len() - suffix_start;
    if state.cache.seq_len() + new_tokens > state.cache.max_seq_len() {
        return Err(EmberError::Capacity {
            seq_len: state.cache.seq_len(),
            max_seq_len: state.cache.max_seq_len(),
        });
    }

    Ok(suffix_start)
}

/// Everything the decode thread needs, bundled for `spawn_blocking`
pub(crate) struct GenerationWorker {
    pub dispatch: KernelDispatch,
    pub pool: Arc<ScratchPool>,
    pub telemetry: TelemetrySink,
    pub thread_pool: Option<Arc<rayon::ThreadPool>>,
    pub session: Arc<Session>,
    pub request: GenerationRequest,
    pub request_id: String,
    pub suffix_start: usize,
}

impl GenerationWorker {
    /// Drive the request to its terminal event.
    ///
    /// `emit` returns false when the consumer is gone, which stops the
    /// decode the same way a cancellation does (minus the event).
    pub(crate) fn run(self, busy: BusyGuard, emit: &mut (dyn FnMut(TokenEvent) -> bool + Send)) {
        let _busy = busy;
        let started = Instant::now();

        METRICS.inference.requests_total.inc();
        METRICS.inference.active_requests.inc();

        let session_id = self.session.id().to_string();
        let request_id = self.request_id.clone();
        self.telemetry.emit(|h| {
            h.on_request_start(&session_id, &request_id, self.request.tokens.len())
        });

        if !emit(TokenEvent::Started {
            request_id: request_id.clone(),
        }) {
            METRICS.inference.active_requests.dec();
            return;
        }

        let outcome = match &self.thread_pool {
            Some(pool) => {
                let pool = pool.clone();
                pool.install(|| self.decode(started, &mut *emit))
            }
            None => self.decode(started, emit),
        };

        let elapsed = started.elapsed();
        METRICS.inference.active_requests.dec();
        METRICS.inference.request_duration.observe(elapsed.as_secs_f64());

        let (terminal, reason_label, usage) = match outcome {
            Outcome::Finished { reason, usage } => {
                METRICS.inference.requests_success.inc();
                (
                    TokenEvent::Completed {
                        reason,
                        usage: usage.clone(),
                    },
                    reason.as_str(),
                    usage,
                )
            }
            Outcome::Cancelled { usage } => {
                METRICS.inference.requests_cancelled.inc();
                (
                    TokenEvent::Cancelled {
                        usage: usage.clone(),
                    },
                    FinishReason::Cancelled.as_str(),
                    usage,
                )
            }
            Outcome::Failed { error, usage } => {
                METRICS.inference.requests_failed.inc();
                (
                    TokenEvent::Error {
                        kind: error.kind(),
                        message: error.to_string(),
                        usage: usage.clone(),
                    },
                    FinishReason::Error.as_str(),
                    usage,
                )
            }
        };

        emit(terminal);
        self.telemetry.emit(|h| {
            h.on_request_complete(&session_id, &request_id, reason_label, usage.completion_tokens)
        });
        debug!(
            request_id = %request_id,
            reason = reason_label,
            tokens = usage.completion_tokens,
            elapsed_ms = elapsed.as_millis() as u64,
            "generation finished"
        );
    }

    fn decode(&self, started: Instant, emit: &mut (dyn FnMut(TokenEvent) -> bool + Send)) -> Outcome {
        let session = &self.session;
        let params = session.model().hyperparams().clone();
        let weights = session.model().weights().clone();
        let options = &self.request.options;
        let deadline = options.timeout().map(|t| started + t);

        let mut usage = UsageStats {
            prompt_tokens: self.request.tokens.len(),
            ..Default::default()
        };

        let fp = ForwardPass::new(&self.dispatch, &params, weights.as_ref(), &self.pool);
        let mut state = session.state();
        let mut logits = vec![0.0f32; params.vocab_size];

        // Prefill the unseen suffix in one batch.
        let suffix = &self.request.tokens[self.suffix_start..];
        if self.suffix_start > 0 {
            let session_id = session.id().to_string();
            let reused = self.suffix_start;
            self.telemetry
                .emit(|h| h.on_context_policy_applied(&session_id, "prefix_reuse", reused));
        }
        if let Err(error) = fp.forward(suffix, &mut state.cache, &mut logits) {
            return Outcome::Failed { error, usage };
        }
        if let Err(error) = state.cache.advance(suffix.len()) {
            return Outcome::Failed { error, usage };
        }
        state.history.extend_from_slice(suffix);
        let seq = state.cache.seq_len();
        let session_id = session.id().to_string();
        self.telemetry.emit(|h| h.on_kv_cache_access(&session_id, seq));

        let effective_context = params.context_length.min(options.max_context_tokens);
        let mut sampler = Sampler::from_options(options);
        let mut generated: Vec<u32> = Vec::with_capacity(options.max_new_tokens);
        let mut text = String::new();
        let mut first_token_at: Option<Instant> = None;
        let decode_started = Instant::now();

        let reason = loop {
            // Top-of-step checks: cancellation, deadline, token budget.
            if self.is_cancelled() {
                break FinishReason::Cancelled;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break FinishReason::Timeout;
                }
            }
            if state.cache.seq_len() >= effective_context {
                break FinishReason::Budget;
            }

            let token = sampler.sample(&logits);

            // Checked again immediately before the cache is touched, so a
            // cancelled partial step is discarded without advancing.
            if self.is_cancelled() {
                break FinishReason::Cancelled;
            }
            if let Err(error) = fp.forward(&[token], &mut state.cache, &mut logits) {
                usage.completion_tokens = generated.len();
                return Outcome::Failed { error, usage };
            }
            if let Err(error) = state.cache.advance(1) {
                usage.completion_tokens = generated.len();
                return Outcome::Failed { error, usage };
            }
            state.history.push(token);
            generated.push(token);
            let seq = state.cache.seq_len();
            self.telemetry.emit(|h| h.on_kv_cache_access(&session_id, seq));

            let piece = match &self.request.decoder {
                Some(decoder) => decoder.decode(token),
                None => String::new(),
            };
            text.push_str(&piece);

            // Stop sequences suffix-match the emitted text; the matching
            // token is withheld.
            if let Some(stop) = options.stop.iter().find(|s| text.ends_with(s.as_str())) {
                trace!(stop = %stop, "stop sequence matched");
                text.truncate(text.len() - piece.len());
                generated.pop();
                // The withheld token stays in cache and history; the next
                // turn continues from it.
                break FinishReason::Stop;
            }

            if first_token_at.is_none() {
                let now = Instant::now();
                first_token_at = Some(now);
                let ttft = now.duration_since(started);
                usage.ttft_ms = ttft.as_millis() as u64;
                METRICS.inference.ttft_seconds.observe(ttft.as_secs_f64());
                let ttft_ms = usage.ttft_ms;
                self.telemetry
                    .emit(|h| h.on_first_token(&session_id, &self.request_id, ttft_ms));
            }

            let is_final = generated.len() >= options.max_new_tokens;
            let delivered = emit(TokenEvent::Token {
                text: piece,
                token_id: token,
                generated: generated.len(),
                is_final,
            });
            METRICS.inference.tokens_generated_total.inc();
            if !delivered {
                break FinishReason::Cancelled;
            }
            if is_final {
                break FinishReason::Length;
            }
        };

        usage.completion_tokens = generated.len();
        let decode_secs = decode_started.elapsed().as_secs_f64();
        if decode_secs > 0.0 {
            usage.tokens_per_second = generated.len() as f64 / decode_secs;
            METRICS
                .inference
                .tokens_per_second
                .observe(usage.tokens_per_second);
        }
        drop(state);
        session.note_turn();

        if reason == FinishReason::Cancelled {
            return Outcome::Cancelled { usage };
        }

        // Optional post-decode output shape check.
        if matches!(reason, FinishReason::Length | FinishReason::Stop) {
            if let Err(error) = check_constraints(options, &text) {
                return Outcome::Failed { error, usage };
            }
        }

        Outcome::Finished { reason, usage }
    }

    fn is_cancelled(&self) -> bool {
        self.request
            .cancel
            .as_ref()
            .map(CancelSignal::is_cancelled)
            .unwrap_or(false)
    }
}

enum Outcome {
    Finished {
        reason: FinishReason,
        usage: UsageStats,
    },
    Cancelled {
        usage: UsageStats,
    },
    Failed {
        error: EmberError,
        usage: UsageStats,
    },
}

/// Validate the decoded text against the request's output constraint
fn check_constraints(options: &GenerationOptions, text: &str) -> Result<()> {
    let Some(constraint) = &options.constraints else {
        return Ok(());
    };

    match constraint {
        OutputConstraint::Regex(pattern) => {
            let re = regex::Regex::new(pattern).map_err(|e| {
                EmberError::invalid_input(format!("invalid constraint regex: {e}"))
            })?;
            if !re.is_match(text) {
                return Err(EmberError::SecurityViolation {
                    policy: "output_constraint".to_string(),
                    detail: format!("output does not match /{pattern}/"),
                });
            }
        }
        OutputConstraint::JsonSchema(schema) => {
            let value: serde_json::Value = serde_json::from_str(text).map_err(|_| {
                EmberError::SecurityViolation {
                    policy: "output_constraint".to_string(),
                    detail: "output is not valid JSON".to_string(),
                }
            })?;
            if let Some(expected) = schema.get("type").and_then(|t| t.as_str()) {
                let actual = match &value {
                    serde_json::Value::Null => "null",
                    serde_json::Value::Bool(_) => "boolean",
                    serde_json::Value::Number(_) => "number",
                    serde_json::Value::String(_) => "string",
                    serde_json::Value::Array(_) => "array",
                    serde_json::Value::Object(_) => "object",
                };
                if expected != actual {
                    return Err(EmberError::SecurityViolation {
                        policy: "output_constraint".to_string(),
                        detail: format!("output is JSON {actual}, schema requires {expected}"),
                    });
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cancel_signal() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        let clone = signal.clone();
        clone.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn test_finish_reason_labels() {
        assert_eq!(FinishReason::Length.as_str(), "length");
        assert_eq!(FinishReason::Budget.as_str(), "budget");
    }

    #[test]
    fn test_terminal_events() {
        assert!(TokenEvent::Completed {
            reason: FinishReason::Length,
            usage: UsageStats::default()
        }
        .is_terminal());
        assert!(!TokenEvent::Started {
            request_id: "r".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_regex_constraint() {
        let mut options = GenerationOptions::default();
        options.constraints = Some(OutputConstraint::Regex("^[a-z]+$".into()));

        assert!(check_constraints(&options, "hello").is_ok());
        let err = check_constraints(&options, "Hello!").unwrap_err();
        assert_eq!(err.kind(), "security_violation");
    }

    #[test]
    fn test_json_schema_constraint() {
        let mut options = GenerationOptions::default();
        options.constraints = Some(OutputConstraint::JsonSchema(json!({"type": "object"})));

        assert!(check_constraints(&options, r#"{"a": 1}"#).is_ok());
        assert!(check_constraints(&options, "[1, 2]").is_err());
        assert!(check_constraints(&options, "not json").is_err());
    }

    #[test]
    fn test_no_constraint_accepts_anything() {
        let options = GenerationOptions::default();
        assert!(check_constraints(&options, "anything at all").is_ok());
    }
}
