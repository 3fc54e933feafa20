pub mod chains;
pub mod flare;
pub mod logging;
pub mod scheduler;
pub mod webhook;

pub use chains::{CHAIN_DEFAULTS, ChainConfig, chain_defaults};
pub use flare::{FlareConfig, SignalsConfig};
pub use logging::{LogFormat, LoggingConfig};
pub use scheduler::SchedulerConfig;
pub use webhook::WebhookConfig;
