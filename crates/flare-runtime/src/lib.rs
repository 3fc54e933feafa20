#[macro_use]
mod log_macros;

pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod scheduler;
pub mod tracing_init;
pub mod worker;

pub use error::{RuntimeError, RuntimeReason, RuntimeResult};
pub use lifecycle::{Runtime, wait_for_signal};
pub use queue::{Job, JobQueue};
