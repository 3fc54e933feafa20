use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flare_dsl::Signal;

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("signal {0} not found")]
    NotFound(String),
    #[error("store backend: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// SignalStore — the persistence contract the core reads and writes
// ---------------------------------------------------------------------------

/// The exact persistence surface the evaluation core requires.
///
/// Per cycle the core performs: one `active_signal_ids` per scheduler tick,
/// one `load` per job, and one timestamp write per job — `mark_triggered`
/// when the signal fired (both columns, atomically, *before* webhook
/// dispatch), otherwise `mark_evaluated`. Definition CRUD belongs to the
/// admin surface and is not part of this contract.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Ids of all signals with `is_active = true`.
    async fn active_signal_ids(&self) -> StoreResult<Vec<String>>;

    /// Full signal record by id.
    async fn load(&self, id: &str) -> StoreResult<Option<Signal>>;

    /// Set `last_triggered_at` and `last_evaluated_at` to `at` in one write.
    ///
    /// `last_triggered_at` is monotonic: a write older than the stored value
    /// is ignored, so cooldown gating can never move backward.
    async fn mark_triggered(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Set `last_evaluated_at` only.
    async fn mark_evaluated(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// MemSignalStore — in-process implementation
// ---------------------------------------------------------------------------

/// In-memory store backing a single-process deployment. Signal definitions
/// are loaded from files at bootstrap; the worker only ever touches the two
/// timestamp columns.
#[derive(Default)]
pub struct MemSignalStore {
    inner: RwLock<HashMap<String, Signal>>,
}

impl MemSignalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signals(signals: impl IntoIterator<Item = Signal>) -> Self {
        let store = Self::new();
        {
            let mut map = store.inner.write().expect("store lock poisoned");
            for signal in signals {
                map.insert(signal.id.clone(), signal);
            }
        }
        store
    }

    pub fn insert(&self, signal: Signal) {
        let mut map = self.inner.write().expect("store lock poisoned");
        map.insert(signal.id.clone(), signal);
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SignalStore for MemSignalStore {
    async fn active_signal_ids(&self) -> StoreResult<Vec<String>> {
        let map = self.inner.read().expect("store lock poisoned");
        let mut ids: Vec<String> = map
            .values()
            .filter(|s| s.is_active)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn load(&self, id: &str) -> StoreResult<Option<Signal>> {
        let map = self.inner.read().expect("store lock poisoned");
        Ok(map.get(id).cloned())
    }

    async fn mark_triggered(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut map = self.inner.write().expect("store lock poisoned");
        let signal = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if signal.last_triggered_at.is_none_or(|prev| prev <= at) {
            signal.last_triggered_at = Some(at);
        }
        signal.last_evaluated_at = Some(at);
        Ok(())
    }

    async fn mark_evaluated(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut map = self.inner.write().expect("store lock poisoned");
        let signal = map
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        signal.last_evaluated_at = Some(at);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
