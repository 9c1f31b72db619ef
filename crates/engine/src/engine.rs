//! Engine façade: model lifecycle, sessions, request dispatch
//!
//! The engine owns the services the rest of the core needs: the kernel
//! dispatch selected once at init, the scratch pool, the budget ledger,
//! and the telemetry sink. Models load under the budget check, sessions
//! bind one KV cache to one model, and requests stream token events
//! through a bounded channel so a slow consumer back-pressures the
//! decoder.

use crate::budget::{BudgetLedger, EstimateRequest};
use crate::generate::{
    validate_request, FinishReason, GenerationRequest, GenerationResponse, GenerationWorker,
    TokenEvent,
};
use crate::kernels::{KernelDispatch, KernelKind};
use crate::kv_cache::KvCache;
use crate::model::format::{ModelFile, TensorDType};
use crate::model::import::import_model;
use crate::model::{ModelHandle, StoragePolicy, WeightKind};
use crate::scratch::ScratchPool;
use crate::session::Session;
use emberlm_common::config::EngineConfig;
use emberlm_common::metrics::METRICS;
use emberlm_common::telemetry::{TelemetryHooks, TelemetrySink};
use emberlm_common::{EmberError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Events buffered before the decoder blocks on the consumer. One slot
/// keeps the decoder at most one token ahead, so cancellation observed
/// after token `n` stops the stream by token `n + 1`.
const STREAM_BUFFER: usize = 1;

/// Where a model comes from
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// A file already in the native format
    Native(PathBuf),

    /// A foreign container, transcoded and cached on first load
    Import(PathBuf),
}

/// Model load parameters
#[derive(Debug, Clone)]
pub struct ModelLoadRequest {
    pub source: ModelSource,
    pub policy: StoragePolicy,

    /// Weight encoding applied when transcoding an import
    pub import_quant: WeightKind,
}

impl ModelLoadRequest {
    /// Load a native-format file, memory-mapped
    pub fn native(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ModelSource::Native(path.into()),
            policy: StoragePolicy::MemoryMap,
            import_quant: WeightKind::F32,
        }
    }

    /// Import a foreign container
    pub fn import(path: impl Into<PathBuf>) -> Self {
        Self {
            source: ModelSource::Import(path.into()),
            policy: StoragePolicy::MemoryMap,
            import_quant: WeightKind::Q4,
        }
    }

    /// Override the storage policy
    pub fn with_policy(mut self, policy: StoragePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the import weight encoding
    pub fn with_import_quant(mut self, quant: WeightKind) -> Self {
        self.import_quant = quant;
        self
    }
}

/// What this engine build can do
#[derive(Debug, Clone)]
pub struct Capabilities {
    /// Selected kernel implementation
    pub kernel: &'static str,

    /// Supported weight encodings
    pub weight_kinds: Vec<WeightKind>,

    /// Streaming generation supported
    pub streaming: bool,

    /// MQA/GQA attention supported
    pub grouped_query_attention: bool,

    /// Memory-mapped model loading supported
    pub memory_mapped_models: bool,
}

/// The inference engine
pub struct EmberEngine {
    config: EngineConfig,
    dispatch: KernelDispatch,
    pool: Arc<ScratchPool>,
    ledger: Arc<BudgetLedger>,
    telemetry: TelemetrySink,
    thread_pool: Option<Arc<rayon::ThreadPool>>,

    // Declared before models so sessions drop first.
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    models: Mutex<HashMap<String, ModelHandle>>,
}

impl EmberEngine {
    /// Build an engine with the default (null) telemetry sink
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_telemetry(config, TelemetrySink::null())
    }

    /// Build an engine with host telemetry hooks
    pub fn with_hooks(config: EngineConfig, hooks: Arc<dyn TelemetryHooks>) -> Result<Self> {
        Self::with_telemetry(config, TelemetrySink::new(hooks))
    }

    fn with_telemetry(config: EngineConfig, telemetry: TelemetrySink) -> Result<Self> {
        config.validate()?;

        let dispatch = KernelDispatch::select(config.enable_simd);
        let thread_pool = if config.worker_threads > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.worker_threads)
                .build()
                .map_err(|e| EmberError::config(format!("worker pool: {e}")))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        info!(
            kernel = ?dispatch.kind(),
            worker_threads = config.worker_threads,
            budget_mode = ?config.budget.mode,
            "engine initialized"
        );

        Ok(Self {
            pool: Arc::new(ScratchPool::new(&config.scratch)),
            ledger: Arc::new(BudgetLedger::new(config.budget.clone())),
            dispatch,
            telemetry,
            thread_pool,
            sessions: Mutex::new(HashMap::new()),
            models: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Selected kernel dispatch
    pub fn dispatch(&self) -> &KernelDispatch {
        &self.dispatch
    }

    /// Budget ledger (estimates and live accounting)
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    /// Engine-level default generation options from configuration
    pub fn default_options(&self) -> emberlm_common::config::GenerationOptions {
        self.config.generation.clone()
    }

    /// What this engine can do
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            kernel: match self.dispatch.kind() {
                KernelKind::Scalar => "scalar",
                #[cfg(target_arch = "x86_64")]
                KernelKind::Avx2 => "avx2",
            },
            weight_kinds: vec![WeightKind::F32, WeightKind::Q4, WeightKind::Q8],
            streaming: true,
            grouped_query_attention: true,
            memory_mapped_models: true,
        }
    }

    /// Load a model under the budget check.
    ///
    /// Imports are transcoded into the native format and cached by content
    /// hash; subsequent loads of the same source reuse the cache.
    pub fn load_model(&self, request: ModelLoadRequest) -> Result<ModelHandle> {
        let native_path = match &request.source {
            ModelSource::Native(path) => path.clone(),
            ModelSource::Import(path) => {
                let cache_dir = self
                    .config
                    .import_cache_dir
                    .clone()
                    .unwrap_or_else(|| std::env::temp_dir().join("emberlm-imports"));
                import_model(path, &cache_dir, request.import_quant)?
            }
        };

        let file = ModelFile::open(&native_path)?;
        let params = file.hyperparams().clone();
        let weight_kind = dominant_weight_kind(&file)?;

        let budget = self.ledger.require(
            &params,
            &EstimateRequest {
                batch: 1,
                seq_len: params.context_length,
                weights: weight_kind,
                training: false,
            },
        )?;

        let weights = Arc::new(file.load_weights(request.policy)?);
        let param_bytes = weights.param_bytes();
        self.ledger.register_model(param_bytes);
        METRICS.resources.model_bytes.add(param_bytes as i64);

        let handle = ModelHandle {
            model_id: Uuid::new_v4().to_string(),
            params,
            weights,
            policy: request.policy,
            budget,
        };

        info!(
            model_id = %handle.id(),
            path = %native_path.display(),
            param_bytes,
            policy = ?request.policy,
            "model loaded"
        );
        self.models
            .lock()
            .insert(handle.id().to_string(), handle.clone());
        Ok(handle)
    }

    /// Unload a model, releasing its budget registration.
    ///
    /// Sessions still holding the handle keep their weights alive through
    /// the shared `Arc`.
    pub fn unload_model(&self, model_id: &str) -> bool {
        match self.models.lock().remove(model_id) {
            Some(handle) => {
                let bytes = handle.weights().param_bytes();
                self.ledger.release_model(bytes);
                METRICS.resources.model_bytes.sub(bytes as i64);
                info!(model_id, "model unloaded");
                true
            }
            None => false,
        }
    }

    /// Create a session holding one KV cache shaped for the model
    pub fn create_session(&self, model: &ModelHandle) -> Result<Arc<Session>> {
        let params = model.hyperparams();

        let budget = self.ledger.require(
            params,
            &EstimateRequest {
                batch: 1,
                seq_len: params.context_length,
                weights: WeightKind::F32,
                training: false,
            },
        )?;

        let cache = KvCache::with_paging(
            params.num_layers,
            params.num_heads,
            params.kv_heads,
            params.head_dim,
            params.context_length,
            self.config.kv_cache.paged,
            self.config.kv_cache.page_size,
        )?;

        let session = Arc::new(Session::new(
            Uuid::new_v4().to_string(),
            model.clone(),
            cache,
            budget,
            self.ledger.clone(),
        ));
        info!(session_id = %session.id(), model_id = %model.id(), "session created");
        self.sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    /// Look up a live session
    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Destroy a session; its KV cache is released when the last handle
    /// drops
    pub fn close_session(&self, session_id: &str) -> bool {
        self.sessions.lock().remove(session_id).is_some()
    }

    /// Streaming generation: a lazy sequence of token events terminated by
    /// exactly one of `Completed`, `Error`, or `Cancelled`.
    ///
    /// Pre-flight failures refuse before any state change: no event is
    /// produced and the KV cache is untouched.
    pub fn generate_streaming(
        &self,
        session: &Arc<Session>,
        request: GenerationRequest,
    ) -> Result<ReceiverStream<TokenEvent>> {
        // Claim the session before validation: the state lock is held by an
        // in-flight decode, so a busy session must fail fast instead of
        // queueing behind it.
        let busy = session.try_begin()?;
        let suffix_start = validate_request(session, &request)?;

        let worker = GenerationWorker {
            dispatch: self.dispatch,
            pool: self.pool.clone(),
            telemetry: self.telemetry.clone(),
            thread_pool: self.thread_pool.clone(),
            session: session.clone(),
            request,
            request_id: Uuid::new_v4().to_string(),
            suffix_start,
        };

        let (tx, rx) = mpsc::channel::<TokenEvent>(STREAM_BUFFER);
        tokio::task::spawn_blocking(move || {
            let mut emit = move |event: TokenEvent| tx.blocking_send(event).is_ok();
            worker.run(busy, &mut emit);
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Non-streaming generation: drains the event stream and returns the
    /// assembled response
    pub async fn generate(
        &self,
        session: &Arc<Session>,
        request: GenerationRequest,
    ) -> Result<GenerationResponse> {
        let mut stream = self.generate_streaming(session, request)?;

        let mut request_id = String::new();
        let mut tokens = Vec::new();
        let mut text = String::new();

        while let Some(event) = stream.next().await {
            match event {
                TokenEvent::Started { request_id: id } => request_id = id,
                TokenEvent::Token { text: piece, token_id, .. } => {
                    tokens.push(token_id);
                    text.push_str(&piece);
                }
                TokenEvent::Completed { reason, usage } => {
                    return Ok(GenerationResponse {
                        request_id,
                        tokens,
                        text,
                        finish_reason: reason,
                        usage,
                        error: None,
                    });
                }
                TokenEvent::Cancelled { usage } => {
                    return Ok(GenerationResponse {
                        request_id,
                        tokens,
                        text,
                        finish_reason: FinishReason::Cancelled,
                        usage,
                        error: None,
                    });
                }
                TokenEvent::Error { kind, message, usage } => {
                    warn!(request_id = %request_id, kind, %message, "generation failed");
                    return Ok(GenerationResponse {
                        request_id,
                        tokens,
                        text,
                        finish_reason: FinishReason::Error,
                        usage,
                        error: Some(format!("{kind}: {message}")),
                    });
                }
            }
        }

        Err(EmberError::model(
            "event stream ended without a terminal event",
        ))
    }
}

impl Drop for EmberEngine {
    fn drop(&mut self) {
        // Sessions first, then model registrations.
        self.sessions.lock().clear();
        let mut models = self.models.lock();
        for (_, handle) in models.drain() {
            let bytes = handle.weights().param_bytes();
            self.ledger.release_model(bytes);
            METRICS.resources.model_bytes.sub(bytes as i64);
        }
    }
}

impl std::fmt::Debug for EmberEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmberEngine")
            .field("kernel", &self.dispatch.kind())
            .field("models", &self.models.lock().len())
            .field("sessions", &self.sessions.lock().len())
            .finish()
    }
}

/// Weight encoding used for the budget estimate: the encoding of the bulk
/// of the 2-D tensors in the file
fn dominant_weight_kind(file: &ModelFile) -> Result<WeightKind> {
    // The first attention projection is representative of the bulk.
    let probe = crate::model::format::layer_tensor(0, "attn.wq");
    let entry = file.entry(&probe)?;
    Ok(match entry.dtype {
        TensorDType::F32 => WeightKind::F32,
        TensorDType::Q4 => WeightKind::Q4,
        TensorDType::Q8 => WeightKind::Q8,
    })
}
