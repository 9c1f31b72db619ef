//! Memory budget estimation and enforcement
//!
//! Estimation is a pure function of hyperparameters and request shape; the
//! same inputs always produce the same record. Enforcement has two modes:
//! advisory (compare against 80% of detected available memory, warn only)
//! and strict (compare against an explicit hard limit with a safety margin
//! applied, refuse with a structured error).
//!
//! Live accounting tracks registered sessions under a fine-grained lock
//! touched only at session create/destroy and generation start/end.

use crate::model::{Hyperparams, WeightKind};
use emberlm_common::config::{BudgetConfig, BudgetMode};
use emberlm_common::{EmberError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::warn;

/// Fraction of detected available memory usable in advisory mode
const ADVISORY_FRACTION: f64 = 0.8;

/// Overhead applied on top of the component sum
const OVERHEAD_FRACTION: f64 = 0.1;

/// Detailed memory estimate for one model + request shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRecord {
    /// Bytes for model parameters
    pub model_param_bytes: u64,

    /// Bytes for transient activations
    pub activation_bytes: u64,

    /// Bytes for the KV cache
    pub kv_cache_bytes: u64,

    /// Bytes for gradients (zero for inference)
    pub gradient_bytes: u64,

    /// Bytes for optimizer state (zero for inference)
    pub optimizer_bytes: u64,

    /// Fixed-fraction overhead on top of the components
    pub overhead_bytes: u64,

    /// Sum of all components plus overhead
    pub total_bytes: u64,

    /// Hard limit in force, 0 when none
    pub hard_limit: u64,

    /// Per-session limit in force, 0 when none
    pub session_limit: u64,

    /// Safety margin applied to the hard limit
    pub safety_margin_percent: u8,

    /// Enforcement mode the record was checked under
    pub mode: BudgetMode,
}

impl BudgetRecord {
    /// Sum of the six components (without overhead)
    pub fn component_sum(&self) -> u64 {
        self.model_param_bytes
            + self.activation_bytes
            + self.kv_cache_bytes
            + self.gradient_bytes
            + self.optimizer_bytes
    }
}

/// Request shape for an estimate
#[derive(Debug, Clone, Copy)]
pub struct EstimateRequest {
    /// Concurrent sequences
    pub batch: usize,

    /// Positions the KV cache must hold
    pub seq_len: usize,

    /// Weight encoding of the bulk of the parameters
    pub weights: WeightKind,

    /// Include training terms (gradients, optimizer state, checkpointed
    /// activations)
    pub training: bool,
}

/// Outcome of a pre-flight check
#[derive(Debug, Clone)]
pub struct CanProceed {
    /// Whether the operation may proceed
    pub allowed: bool,

    /// The estimate the decision was made from
    pub record: BudgetRecord,

    /// Limit the estimate was compared against
    pub effective_limit: u64,
}

/// Pure estimator: hyperparameters + request shape -> record.
///
/// Idempotent; calling twice with the same inputs yields identical records.
pub fn estimate(params: &Hyperparams, request: &EstimateRequest, config: &BudgetConfig) -> BudgetRecord {
    let param_count = params.param_count();
    let model_param_bytes = (param_count as f64 * request.weights.bytes_per_element()) as u64;

    // Inference runs one layer at a time: embeddings for the batch plus a
    // few working buffers of ffn width. Training keeps every layer's
    // activations with a checkpointing discount.
    let per_token = (params.embed_dim + params.ffn_dim) as u64 * 4;
    let tokens = (request.batch * request.seq_len) as u64;
    let activation_bytes = if request.training {
        // sqrt-style checkpointing: one full layer plus a checkpoint per
        // sqrt(layers).
        let checkpoints = (params.num_layers as f64).sqrt().ceil() as u64 + 1;
        per_token * tokens * checkpoints
    } else {
        per_token * tokens * 2
    };

    let kv_cache_bytes = 2
        * (params.num_layers as u64)
        * (params.kv_heads as u64)
        * (params.head_dim as u64)
        * (request.seq_len as u64)
        * (request.batch as u64)
        * 4;

    let (gradient_bytes, optimizer_bytes) = if request.training {
        // Gradients in f32, Adam-style optimizer with two moments.
        let f32_params = param_count as u64 * 4;
        (f32_params, 2 * f32_params)
    } else {
        (0, 0)
    };

    let component_sum =
        model_param_bytes + activation_bytes + kv_cache_bytes + gradient_bytes + optimizer_bytes;
    let overhead_bytes = (component_sum as f64 * OVERHEAD_FRACTION) as u64;

    BudgetRecord {
        model_param_bytes,
        activation_bytes,
        kv_cache_bytes,
        gradient_bytes,
        optimizer_bytes,
        overhead_bytes,
        total_bytes: component_sum + overhead_bytes,
        hard_limit: config.hard_limit_bytes,
        session_limit: config.session_limit_bytes,
        safety_margin_percent: (config.safety_margin * 100.0).round() as u8,
        mode: config.mode,
    }
}

/// Budget checker plus live session ledger
pub struct BudgetLedger {
    config: BudgetConfig,
    registered: Mutex<RegisteredBytes>,
}

#[derive(Debug, Default)]
struct RegisteredBytes {
    model_bytes: u64,
    session_bytes: u64,
    sessions: usize,
}

impl BudgetLedger {
    /// Create a ledger for the configured mode and limits
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            registered: Mutex::new(RegisteredBytes::default()),
        }
    }

    /// Enforcement configuration
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Pure pre-flight check for a prospective allocation.
    ///
    /// Advisory failures warn and allow; strict failures refuse. The check
    /// mutates nothing and may be repeated freely.
    pub fn check_before_run(&self, params: &Hyperparams, request: &EstimateRequest) -> CanProceed {
        let record = estimate(params, request, &self.config);

        let effective_limit = match self.config.mode {
            BudgetMode::Advisory => (detect_available_bytes() as f64 * ADVISORY_FRACTION) as u64,
            BudgetMode::Strict => {
                (self.config.hard_limit_bytes as f64 * (1.0 - self.config.safety_margin)) as u64
            }
        };

        let allowed = match self.config.mode {
            BudgetMode::Advisory => {
                if record.total_bytes > effective_limit {
                    warn!(
                        total_bytes = record.total_bytes,
                        advisory_limit = effective_limit,
                        "estimated memory exceeds advisory limit; proceeding"
                    );
                }
                true
            }
            BudgetMode::Strict => record.total_bytes <= effective_limit,
        };

        CanProceed {
            allowed,
            record,
            effective_limit,
        }
    }

    /// Check and refuse with [`EmberError::InsufficientMemory`] when the
    /// strict budget says no.
    pub fn require(&self, params: &Hyperparams, request: &EstimateRequest) -> Result<BudgetRecord> {
        let decision = self.check_before_run(params, request);
        if !decision.allowed {
            return Err(EmberError::InsufficientMemory {
                required_bytes: decision.record.total_bytes,
                limit_bytes: decision.effective_limit,
            });
        }

        if self.config.session_limit_bytes > 0 {
            let session_bytes =
                decision.record.kv_cache_bytes + decision.record.activation_bytes;
            if session_bytes > self.config.session_limit_bytes {
                return Err(EmberError::InsufficientMemory {
                    required_bytes: session_bytes,
                    limit_bytes: self.config.session_limit_bytes,
                });
            }
        }

        Ok(decision.record)
    }

    /// Record a loaded model's parameter bytes
    pub fn register_model(&self, bytes: u64) {
        self.registered.lock().model_bytes += bytes;
    }

    /// Release a dropped model's parameter bytes
    pub fn release_model(&self, bytes: u64) {
        let mut reg = self.registered.lock();
        reg.model_bytes = reg.model_bytes.saturating_sub(bytes);
    }

    /// Record a created session's cache bytes
    pub fn register_session(&self, bytes: u64) {
        let mut reg = self.registered.lock();
        reg.session_bytes += bytes;
        reg.sessions += 1;
    }

    /// Release a destroyed session's cache bytes
    pub fn release_session(&self, bytes: u64) {
        let mut reg = self.registered.lock();
        reg.session_bytes = reg.session_bytes.saturating_sub(bytes);
        reg.sessions = reg.sessions.saturating_sub(1);
    }

    /// Currently registered bytes (models + sessions)
    pub fn registered_bytes(&self) -> u64 {
        let reg = self.registered.lock();
        reg.model_bytes + reg.session_bytes
    }

    /// Currently registered sessions
    pub fn active_sessions(&self) -> usize {
        self.registered.lock().sessions
    }
}

/// Best-effort available-memory probe
fn detect_available_bytes() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    if available > 0 {
        available
    } else {
        system.total_memory()
    }
}
