pub mod error;
pub mod eval;
pub mod fetch;
pub mod notify;
pub mod store;

pub use error::{CoreError, CoreReason, CoreResult};
pub use eval::{ConditionOutcome, EvalContext, EvalError, EvalReport, evaluate_signal};
pub use fetch::{DataFetcher, FetchError};
pub use notify::{DispatchOutcome, Notifier, NotifierConfig, Scope, WebhookPayload};
pub use store::{MemSignalStore, SignalStore, StoreError, StoreResult};
