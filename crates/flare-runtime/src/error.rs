use derive_more::From;
use flare_core::CoreReason;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum RuntimeReason {
    /// A signal definition file failed to parse, validate, or compile.
    /// Distinct from [`RuntimeReason::Bootstrap`] so operators can tell a
    /// bad `signals/*.json` edit apart from broken infrastructure wiring.
    #[error("signal definition load error")]
    SignalLoad,
    /// Chain bindings, notifier, or task wiring failed to come up.
    #[error("bootstrap error")]
    Bootstrap,
    #[error("shutdown error")]
    Shutdown,
    #[error("{0}")]
    Core(CoreReason),
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for RuntimeReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::SignalLoad => 2001,
            Self::Bootstrap => 2002,
            Self::Shutdown => 2003,
            Self::Core(c) => c.error_code(),
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type RuntimeError = StructError<RuntimeReason>;
pub type RuntimeResult<T> = Result<T, RuntimeError>;
