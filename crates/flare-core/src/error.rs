use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    #[error("signal evaluation error")]
    Eval,
    #[error("chain fetch error")]
    Fetch,
    #[error("signal store error")]
    Store,
    #[error("webhook dispatch error")]
    Notify,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Eval => 1001,
            Self::Fetch => 1002,
            Self::Store => 1003,
            Self::Notify => 1004,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;
