//! Telemetry hooks for EmberLM
//!
//! Hosts observe engine activity by implementing [`TelemetryHooks`]. The
//! default implementation is a no-op so call sites never branch on the
//! presence of a sink. Hook failures are isolated: a panicking host callback
//! is caught and logged, never propagated into the decode path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Observer interface for engine activity.
///
/// All methods take `&self` and cheap by-value arguments; session and
/// request identifiers are passed as strings, never as references into
/// engine state. Implementations must not block: these are called in-band
/// with decoding.
pub trait TelemetryHooks: Send + Sync {
    /// A generation request entered the engine
    fn on_request_start(&self, session_id: &str, request_id: &str, prompt_tokens: usize) {
        let _ = (session_id, request_id, prompt_tokens);
    }

    /// The first token of a request was emitted; `ttft_ms` is wall-clock
    /// from request entry
    fn on_first_token(&self, session_id: &str, request_id: &str, ttft_ms: u64) {
        let _ = (session_id, request_id, ttft_ms);
    }

    /// A request reached its terminal event
    fn on_request_complete(
        &self,
        session_id: &str,
        request_id: &str,
        finish_reason: &str,
        completion_tokens: usize,
    ) {
        let _ = (session_id, request_id, finish_reason, completion_tokens);
    }

    /// A context policy (truncation, prefix reuse) was applied to a prompt
    fn on_context_policy_applied(&self, session_id: &str, policy: &str, tokens_affected: usize) {
        let _ = (session_id, policy, tokens_affected);
    }

    /// The KV cache was read or appended for a decode step
    fn on_kv_cache_access(&self, session_id: &str, seq_len: usize) {
        let _ = (session_id, seq_len);
    }

    /// The model requested a tool invocation
    fn on_tool_call(&self, session_id: &str, request_id: &str, tool_name: &str) {
        let _ = (session_id, request_id, tool_name);
    }

    /// The KV cache outgrew its configured budget
    fn on_kv_cache_budget_exceeded(&self, session_id: &str, bytes: u64, budget_bytes: u64) {
        let _ = (session_id, bytes, budget_bytes);
    }

    /// Cache entries were evicted to stay within budget
    fn on_kv_cache_eviction(&self, session_id: &str, positions_evicted: usize) {
        let _ = (session_id, positions_evicted);
    }
}

/// Default no-op telemetry implementation
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetryHooks for NullTelemetry {}

/// Shared handle to a telemetry implementation with panic isolation.
///
/// Every dispatch goes through [`TelemetrySink::emit`], which catches
/// panics from the host callback and logs them.
#[derive(Clone)]
pub struct TelemetrySink {
    hooks: Arc<dyn TelemetryHooks>,
}

impl TelemetrySink {
    /// Wrap a host-provided hook implementation
    pub fn new(hooks: Arc<dyn TelemetryHooks>) -> Self {
        Self { hooks }
    }

    /// A sink that drops everything
    pub fn null() -> Self {
        Self {
            hooks: Arc::new(NullTelemetry),
        }
    }

    /// Invoke a hook, swallowing panics from the host implementation
    pub fn emit(&self, hook: impl FnOnce(&dyn TelemetryHooks)) {
        let hooks = &*self.hooks;
        if catch_unwind(AssertUnwindSafe(|| hook(hooks))).is_err() {
            warn!("telemetry hook panicked; continuing");
        }
    }
}

impl std::fmt::Debug for TelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TelemetrySink")
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::null()
    }
}
