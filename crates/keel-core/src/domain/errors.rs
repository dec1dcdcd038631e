//! Errors - エラー型と分類
//!
//! ErrorKind は運用上の分類です。HTTP ハンドラは code/message に畳み込みます。

use thiserror::Error;

use super::lease::LeaseId;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（呼び出し側がリトライしてよい）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: coordination service / transport の障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failures reported by a coordination-service implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    #[error("{0} not found or expired")]
    LeaseNotFound(LeaseId),

    #[error("coordination client closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("startup: {0}")]
    StartupFatal(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("duplicate creation: {0}")]
    DuplicateTask(String),

    #[error("transaction conflict on {0}")]
    TransactionConflict(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("register {node}: {source}")]
    Registration {
        node: String,
        #[source]
        source: CoordError,
    },

    #[error("transport: {0}")]
    Transport(String),

    #[error("lock {0} is held elsewhere")]
    LockContention(String),

    #[error(transparent)]
    Coordination(#[from] CoordError),

    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

impl GateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GateError::TransactionConflict(_) | GateError::LockContention(_) => {
                ErrorKind::Transient
            }
            GateError::StartupFatal(_)
            | GateError::Registration { .. }
            | GateError::Transport(_)
            | GateError::Coordination(_) => ErrorKind::Infrastructure,
            GateError::Validation(_)
            | GateError::DuplicateTask(_)
            | GateError::NotFound(_)
            | GateError::Codec(_) => ErrorKind::Permanent,
        }
    }

    /// Stable numeric code for the `{code, message}` response body.
    pub fn code(&self) -> u32 {
        match self {
            GateError::StartupFatal(_) => 1000,
            GateError::Validation(_) => 1001,
            GateError::DuplicateTask(_) => 1002,
            GateError::TransactionConflict(_) => 1003,
            GateError::NotFound(_) => 1004,
            GateError::Registration { .. } => 1005,
            GateError::Transport(_) => 1006,
            GateError::LockContention(_) => 1007,
            GateError::Coordination(_) => 1008,
            GateError::Codec(_) => 1009,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_message_names_the_task() {
        let err = GateError::DuplicateTask("/scheduler/task/global/build-1".into());
        assert_eq!(
            err.to_string(),
            "duplicate creation: /scheduler/task/global/build-1"
        );
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflicts_are_retryable() {
        let err = GateError::TransactionConflict("x".into());
        assert!(err.is_retryable());
        assert_eq!(err.code(), 1003);
    }

    #[test]
    fn coordination_errors_convert() {
        let err: GateError = CoordError::LeaseNotFound(LeaseId(7)).into();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert_eq!(err.to_string(), "lease-7 not found or expired");
    }
}
