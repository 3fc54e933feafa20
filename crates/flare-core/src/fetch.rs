use async_trait::async_trait;
use chrono::{DateTime, Utc};

use flare_dsl::{Aggregation, Filter};

// ---------------------------------------------------------------------------
// FetchError
// ---------------------------------------------------------------------------

/// Failure resolving a leaf reference against chain data.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// Transport-level failure (RPC unreachable, timeout, malformed reply).
    /// `retryable` distinguishes transient faults from terminal RPC errors.
    #[error("transport: {message}")]
    Transport { retryable: bool, message: String },
    /// The filters identify no entity (unknown market, missing position).
    #[error("not found: {what}")]
    NotFound { what: String },
    /// The requested field does not exist on the entity or event.
    #[error("schema: {what}")]
    Schema { what: String },
}

impl FetchError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Transport {
            retryable: false,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn schema(what: impl Into<String>) -> Self {
        Self::Schema { what: what.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }
}

// ---------------------------------------------------------------------------
// DataFetcher — the contract the evaluator resolves leaves through
// ---------------------------------------------------------------------------

/// Turns state and event references into scalar readings.
///
/// Implementations are keyed by chain and point in time; the evaluator never
/// sees blocks. The reference binding is the Morpho fetcher in `flare-chain`.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    /// Scalar reading of `field` on the entity identified by `filters`, as
    /// observed at `at`.
    async fn fetch_state(
        &self,
        chain_id: u64,
        entity_type: &str,
        filters: &[Filter],
        field: &str,
        at: DateTime<Utc>,
    ) -> Result<f64, FetchError>;

    /// Aggregate of `field` over events in `[window_start, window_end]`
    /// matching `filters`.
    ///
    /// An empty event set aggregates to 0 for every aggregation, including
    /// `min`/`max`/`avg`. This zero-default is preserved for compatibility
    /// with deployed signals; a "no data" sentinel would silently change
    /// trigger semantics for conditions like `min > 0`.
    async fn fetch_events(
        &self,
        chain_id: u64,
        event_type: &str,
        filters: &[Filter],
        field: &str,
        aggregation: Aggregation,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<f64, FetchError>;
}
