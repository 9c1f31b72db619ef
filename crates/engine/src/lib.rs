//! EmberLM inference engine
//!
//! CPU-only, in-process LLM inference: deterministic, memory-budgeted
//! chat completion for host applications on commodity hardware. The engine
//! composes tensor storage, block-quantized weights, hand-written kernels
//! with runtime CPU dispatch, a per-session KV cache, a strict/advisory
//! memory budget, and a streaming, cancellable generation loop.

pub mod budget;
pub mod engine;
pub mod forward;
pub mod generate;
pub mod kernels;
pub mod kv_cache;
pub mod model;
pub mod sampler;
pub mod scratch;
pub mod session;
pub mod tensor;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use budget::{BudgetLedger, BudgetRecord, CanProceed, EstimateRequest};
pub use engine::{Capabilities, EmberEngine, ModelLoadRequest, ModelSource};
pub use generate::{
    CancelSignal, FinishReason, GenerationRequest, GenerationResponse, TokenDecoder, TokenEvent,
    UsageStats,
};
pub use kernels::{KernelDispatch, KernelKind};
pub use kv_cache::{CacheState, KvCache, StridedView};
pub use model::{
    Activation, Hyperparams, ModelHandle, NormType, StoragePolicy, WeightKind, WeightMatrix,
};
pub use sampler::Sampler;
pub use scratch::{ScratchGuard, ScratchPool};
pub use session::Session;
pub use tensor::{Q4Tensor, Q8Tensor, Tensor, TensorStorage, TensorView};

// The shared error type and request options live in emberlm-common.
pub use emberlm_common::config::{
    BudgetMode, EngineConfig, GenerationMode, GenerationOptions, OutputConstraint,
};
pub use emberlm_common::{EmberError, NullTelemetry, Result, TelemetryHooks};
