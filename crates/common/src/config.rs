//! Configuration structures for EmberLM
//!
//! This module defines the engine configuration and per-request generation
//! options. Configurations are loaded from YAML files and validated before
//! the engine starts.

use crate::error::{EmberError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the EmberLM engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of kernel worker threads (0 = logical core count)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Enable SIMD kernel paths when the CPU supports them
    #[serde(default = "default_simd")]
    pub enable_simd: bool,

    /// Memory budget configuration
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Scratch buffer pool configuration
    #[serde(default)]
    pub scratch: ScratchConfig,

    /// KV cache configuration
    #[serde(default)]
    pub kv_cache: KvCacheConfig,

    /// Default generation options applied when a request leaves fields unset
    #[serde(default)]
    pub generation: GenerationOptions,

    /// Directory for transcoded model imports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub import_cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            enable_simd: default_simd(),
            budget: BudgetConfig::default(),
            scratch: ScratchConfig::default(),
            kv_cache: KvCacheConfig::default(),
            generation: GenerationOptions::default(),
            import_cache_dir: None,
        }
    }
}

/// Memory budget enforcement mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BudgetMode {
    /// Compare against 80% of detected available memory; failures warn only
    Advisory,

    /// Compare against an explicit hard limit; failures refuse the operation
    Strict,
}

impl Default for BudgetMode {
    fn default() -> Self {
        BudgetMode::Advisory
    }
}

/// Memory budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Enforcement mode
    #[serde(default)]
    pub mode: BudgetMode,

    /// Hard memory limit in bytes (strict mode only, 0 = detect)
    #[serde(default)]
    pub hard_limit_bytes: u64,

    /// Per-session memory limit in bytes (0 = no per-session limit)
    #[serde(default)]
    pub session_limit_bytes: u64,

    /// Fraction of the hard limit held back as headroom
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            mode: BudgetMode::default(),
            hard_limit_bytes: 0,
            session_limit_bytes: 0,
            safety_margin: default_safety_margin(),
        }
    }
}

/// Scratch buffer pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScratchConfig {
    /// Maximum pooled buffers retained per size bucket
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: usize,

    /// Zero buffers when they are returned to the pool
    #[serde(default)]
    pub zero_on_return: bool,
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: default_bucket_capacity(),
            zero_on_return: false,
        }
    }
}

/// KV cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvCacheConfig {
    /// Grow the cache page by page instead of reserving max_seq_len up front
    #[serde(default)]
    pub paged: bool,

    /// Positions per page when paged growth is enabled
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            paged: false,
            page_size: default_page_size(),
        }
    }
}

/// Sampling mode for a generation request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GenerationMode {
    /// Seeded RNG; identical inputs yield identical token sequences
    Deterministic,

    /// Entropy-seeded RNG
    Exploratory,
}

impl Default for GenerationMode {
    fn default() -> Self {
        GenerationMode::Deterministic
    }
}

/// Post-decode output shape constraint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputConstraint {
    /// Output must match this regular expression
    Regex(String),

    /// Output must parse as JSON conforming to this schema
    JsonSchema(serde_json::Value),
}

/// Per-request generation options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum number of tokens to generate
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,

    /// Per-request cap on total context (prompt + generated)
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Request deadline in milliseconds (0 = no deadline)
    #[serde(default)]
    pub timeout_ms: u64,

    /// Sampling mode
    #[serde(default)]
    pub mode: GenerationMode,

    /// RNG seed, used in Deterministic mode or when temperature > 0
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Sampling temperature (0.0 = greedy argmax)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Restrict sampling to the k most likely tokens (0 = off)
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Nucleus sampling cumulative probability threshold (1.0 = off)
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Stop sequences matched against decoded output text
    #[serde(default)]
    pub stop: Vec<String>,

    /// Optional post-decode output shape constraint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<OutputConstraint>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            max_context_tokens: default_max_context_tokens(),
            timeout_ms: 0,
            mode: GenerationMode::default(),
            seed: default_seed(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            stop: Vec::new(),
            constraints: None,
        }
    }
}

impl GenerationOptions {
    /// Greedy decoding: temperature 0 with filtering disabled
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            ..Self::default()
        }
    }

    /// Whether sampling degenerates to pure argmax
    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0 || self.top_k == 1
    }

    /// Request deadline as a Duration, if one is set
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_ms))
        }
    }

    /// Validate option consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_new_tokens == 0 {
            return Err(EmberError::invalid_input("max_new_tokens must be > 0"));
        }
        if self.max_context_tokens == 0 {
            return Err(EmberError::invalid_input("max_context_tokens must be > 0"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(EmberError::invalid_input(format!(
                "temperature must be finite and >= 0, got {}",
                self.temperature
            )));
        }
        if !self.top_p.is_finite() || self.top_p <= 0.0 || self.top_p > 1.0 {
            return Err(EmberError::invalid_input(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Default value functions
fn default_worker_threads() -> usize {
    0 // Means use logical core count
}

fn default_simd() -> bool {
    true
}

fn default_safety_margin() -> f64 {
    0.1
}

fn default_bucket_capacity() -> usize {
    16
}

fn default_page_size() -> usize {
    64
}

fn default_max_new_tokens() -> usize {
    100
}

fn default_max_context_tokens() -> usize {
    4096
}

fn default_seed() -> u64 {
    42
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> usize {
    40
}

fn default_top_p() -> f32 {
    0.95
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            EmberError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: EngineConfig = serde_yaml::from_str(&content).map_err(|e| {
            EmberError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.budget.safety_margin) {
            return Err(EmberError::config(format!(
                "budget.safety_margin must be in [0, 1), got {}",
                self.budget.safety_margin
            )));
        }
        if self.budget.mode == BudgetMode::Strict && self.budget.hard_limit_bytes == 0 {
            return Err(EmberError::config(
                "strict budget mode requires budget.hard_limit_bytes",
            ));
        }
        if self.kv_cache.page_size == 0 {
            return Err(EmberError::config("kv_cache.page_size must be > 0"));
        }
        if self.scratch.bucket_capacity == 0 {
            return Err(EmberError::config("scratch.bucket_capacity must be > 0"));
        }
        self.generation.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_generation_options() {
        let opts = GenerationOptions::default();
        assert_eq!(opts.max_new_tokens, 100);
        assert_eq!(opts.max_context_tokens, 4096);
        assert_eq!(opts.seed, 42);
        assert_eq!(opts.top_k, 40);
        assert!((opts.temperature - 0.8).abs() < f32::EPSILON);
        assert!((opts.top_p - 0.95).abs() < f32::EPSILON);
        assert!(opts.timeout().is_none());
    }

    #[test]
    fn test_greedy_detection() {
        assert!(GenerationOptions::greedy().is_greedy());
        assert!(!GenerationOptions::default().is_greedy());

        let top_k_one = GenerationOptions {
            top_k: 1,
            ..Default::default()
        };
        assert!(top_k_one.is_greedy());
    }

    #[test]
    fn test_options_validation() {
        let mut opts = GenerationOptions::default();
        assert!(opts.validate().is_ok());

        opts.temperature = -1.0;
        assert!(opts.validate().is_err());

        opts.temperature = 0.8;
        opts.top_p = 0.0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.budget.mode = BudgetMode::Strict;
        assert!(config.validate().is_err());

        config.budget.hard_limit_bytes = 1 << 30;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let yaml = r#"
worker_threads: 4
enable_simd: false
budget:
  mode: strict
  hard_limit_bytes: 1073741824
generation:
  max_new_tokens: 16
  temperature: 0.0
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.worker_threads, 4);
        assert!(!config.enable_simd);
        assert_eq!(config.budget.mode, BudgetMode::Strict);
        assert_eq!(config.generation.max_new_tokens, 16);
        // Unset fields keep their documented defaults.
        assert_eq!(config.generation.top_k, 40);
        assert!(config.validate().is_ok());
    }
}
