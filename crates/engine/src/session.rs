//! Chat sessions
//!
//! A session owns exactly one KV cache and belongs to exactly one model.
//! Generations on a session are strictly serialized: a busy flag rejects a
//! second in-flight request instead of queueing it. Dropping a session
//! releases its cache bytes from the budget ledger.

use crate::budget::{BudgetLedger, BudgetRecord};
use crate::kv_cache::KvCache;
use crate::model::ModelHandle;
use emberlm_common::metrics::METRICS;
use emberlm_common::{EmberError, Result};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Cache plus the token ids it currently represents
pub(crate) struct SessionState {
    pub cache: KvCache,
    pub history: Vec<u32>,
}

/// One conversation bound to one model
pub struct Session {
    session_id: String,
    model: ModelHandle,
    state: Mutex<SessionState>,
    busy: AtomicBool,
    created_at: SystemTime,
    turn_count: AtomicU64,
    budget: BudgetRecord,
    ledger: Arc<BudgetLedger>,
    kv_bytes: u64,
}

impl Session {
    pub(crate) fn new(
        session_id: String,
        model: ModelHandle,
        cache: KvCache,
        budget: BudgetRecord,
        ledger: Arc<BudgetLedger>,
    ) -> Self {
        let kv_bytes = cache.allocated_bytes();
        ledger.register_session(kv_bytes);
        METRICS.resources.active_sessions.inc();
        METRICS
            .resources
            .kv_cache_bytes
            .add(kv_bytes as i64);

        Self {
            session_id,
            model,
            state: Mutex::new(SessionState {
                cache,
                history: Vec::new(),
            }),
            busy: AtomicBool::new(false),
            created_at: SystemTime::now(),
            turn_count: AtomicU64::new(0),
            budget,
            ledger,
            kv_bytes,
        }
    }

    /// Session identifier
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// The model this session belongs to
    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    /// Wall-clock creation time
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Completed generation turns
    pub fn turn_count(&self) -> u64 {
        self.turn_count.load(Ordering::Relaxed)
    }

    /// Memory estimate recorded at creation
    pub fn budget_record(&self) -> &BudgetRecord {
        &self.budget
    }

    /// Committed cache length
    pub fn seq_len(&self) -> usize {
        self.state.lock().cache.seq_len()
    }

    /// Reset the cache and history without freeing buffers
    pub fn reset(&self) -> Result<()> {
        let _busy = self.try_begin_ref()?;
        let mut state = self.state.lock();
        state.cache.clear();
        state.history.clear();
        Ok(())
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock()
    }

    pub(crate) fn note_turn(&self) {
        self.turn_count.fetch_add(1, Ordering::Relaxed);
    }

    fn try_begin_ref(&self) -> Result<RefBusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(EmberError::SessionBusy {
                session_id: self.session_id.clone(),
            });
        }
        Ok(RefBusyGuard { session: self })
    }

    /// Claim the session for one generation; fails with `SessionBusy` when
    /// another generation is in flight.
    pub(crate) fn try_begin(self: &Arc<Self>) -> Result<BusyGuard> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(EmberError::SessionBusy {
                session_id: self.session_id.clone(),
            });
        }
        Ok(BusyGuard {
            session: self.clone(),
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.ledger.release_session(self.kv_bytes);
        METRICS.resources.active_sessions.dec();
        METRICS
            .resources
            .kv_cache_bytes
            .sub(self.kv_bytes as i64);
        debug!(session_id = %self.session_id, "session dropped");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("model_id", &self.model.id())
            .field("turn_count", &self.turn_count())
            .finish()
    }
}

/// Releases the session's busy flag when the generation finishes
pub(crate) struct BusyGuard {
    session: Arc<Session>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.session.busy.store(false, Ordering::Release);
    }
}

struct RefBusyGuard<'a> {
    session: &'a Session,
}

impl Drop for RefBusyGuard<'_> {
    fn drop(&mut self) {
        self.session.busy.store(false, Ordering::Release);
    }
}
