//! Common error types for EmberLM
//!
//! This module defines all error types used across the EmberLM runtime.
//! Every failure kind carries structured fields so hosts can dispatch on
//! the variant and remediate programmatically without string parsing.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for EmberLM
#[derive(Error, Debug)]
pub enum EmberError {
    /// Model file has the wrong magic or an unsupported version
    #[error("Unsupported model file {path:?}: magic={magic:#010x}, version={version}")]
    UnsupportedModel {
        path: PathBuf,
        magic: u32,
        version: u32,
    },

    /// Unknown weight block encoding
    #[error("Unsupported quantization type: code={code}")]
    UnsupportedQuantType { code: u32 },

    /// Prompt plus requested completion does not fit the context window
    #[error(
        "Context limit exceeded: {prompt_tokens} prompt tokens + {max_new_tokens} requested > {context_length}"
    )]
    ContextLimitExceeded {
        prompt_tokens: usize,
        max_new_tokens: usize,
        context_length: usize,
    },

    /// Per-request token budget consumed mid-decode
    #[error("Token budget exceeded: {consumed_tokens} consumed of {budget_tokens}")]
    BudgetExceeded {
        consumed_tokens: usize,
        budget_tokens: usize,
    },

    /// Strict memory budget refused the operation
    #[error("Insufficient memory: {required_bytes} bytes required, limit {limit_bytes}")]
    InsufficientMemory {
        required_bytes: u64,
        limit_bytes: u64,
    },

    /// KV cache is full
    #[error("KV cache capacity exhausted: seq_len={seq_len}, max_seq_len={max_seq_len}")]
    Capacity { seq_len: usize, max_seq_len: usize },

    /// A generation is already in flight on this session
    #[error("Session {session_id} is busy with another generation")]
    SessionBusy { session_id: String },

    /// Input failed a configured security policy
    #[error("Security policy '{policy}' violated: {detail}")]
    SecurityViolation { policy: String, detail: String },

    /// File I/O or memory-mapping failure
    #[error("Storage error: {detail}")]
    Storage {
        path: Option<PathBuf>,
        detail: String,
    },

    /// Cooperative cancellation observed
    #[error("Generation cancelled after {generated_tokens} tokens")]
    Cancelled { generated_tokens: usize },

    /// Request deadline elapsed
    #[error("Generation timed out after {elapsed_ms} ms (limit {timeout_ms} ms)")]
    Timeout { elapsed_ms: u64, timeout_ms: u64 },

    /// Tensor or kernel shape mismatch
    #[error("Shape error: {0}")]
    Shape(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model container errors other than format rejection
    #[error("Model error: {0}")]
    Model(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EmberError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        EmberError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        EmberError::Model(msg.into())
    }

    /// Create a shape error
    pub fn shape(msg: impl Into<String>) -> Self {
        EmberError::Shape(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        EmberError::InvalidInput(msg.into())
    }

    /// Create a storage error without an associated path
    pub fn storage(detail: impl Into<String>) -> Self {
        EmberError::Storage {
            path: None,
            detail: detail.into(),
        }
    }

    /// Create a storage error for a specific file
    pub fn storage_at(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        EmberError::Storage {
            path: Some(path.into()),
            detail: detail.into(),
        }
    }

    /// Stable kind label, used for metrics and telemetry
    pub fn kind(&self) -> &'static str {
        match self {
            EmberError::UnsupportedModel { .. } => "unsupported_model",
            EmberError::UnsupportedQuantType { .. } => "unsupported_quant_type",
            EmberError::ContextLimitExceeded { .. } => "context_limit_exceeded",
            EmberError::BudgetExceeded { .. } => "budget_exceeded",
            EmberError::InsufficientMemory { .. } => "insufficient_memory",
            EmberError::Capacity { .. } => "capacity",
            EmberError::SessionBusy { .. } => "session_busy",
            EmberError::SecurityViolation { .. } => "security_violation",
            EmberError::Storage { .. } => "storage",
            EmberError::Cancelled { .. } => "cancelled",
            EmberError::Timeout { .. } => "timeout",
            EmberError::Shape(_) => "shape",
            EmberError::Config(_) => "config",
            EmberError::Model(_) => "model",
            EmberError::InvalidInput(_) => "invalid_input",
            EmberError::Io(_) => "io",
            EmberError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias for EmberLM operations
pub type Result<T> = std::result::Result<T, EmberError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_limit_fields_survive() {
        let err = EmberError::ContextLimitExceeded {
            prompt_tokens: 5000,
            max_new_tokens: 100,
            context_length: 4096,
        };

        match err {
            EmberError::ContextLimitExceeded {
                prompt_tokens,
                context_length,
                ..
            } => {
                assert_eq!(prompt_tokens, 5000);
                assert_eq!(context_length, 4096);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(
            EmberError::Capacity {
                seq_len: 100,
                max_seq_len: 100
            }
            .kind(),
            "capacity"
        );
        assert_eq!(EmberError::config("x").kind(), "config");
        assert_eq!(EmberError::storage("mmap failed").kind(), "storage");
    }
}
