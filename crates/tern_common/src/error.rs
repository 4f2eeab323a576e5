use thiserror::Error;

/// Convenience alias for `Result<T, TxnError>`.
pub type TxnResult<T> = Result<T, TxnError>;

/// Error classification for retry/escalation decisions.
///
/// - `Misuse`    — API called in a state that forbids it; not retryable
/// - `Retryable` — the whole transaction should be retried from the start
/// - `Transient` — timeout or transport failure; the same request MAY be retried
/// - `Expired`   — the status tablet no longer considers the transaction alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Misuse,
    Retryable,
    Transient,
    Expired,
}

/// Errors surfaced by the client transaction coordinator.
///
/// Clonable: the first error of a transaction is retained in its error slot
/// and handed back to every later caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Operation should be retried: {0}")]
    TryAgain(String),

    #[error("Transaction expired by status tablet")]
    Expired,

    #[error("RPC timed out: {0}")]
    TimedOut(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl TxnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TxnError::IllegalState(_) => ErrorKind::Misuse,
            TxnError::TryAgain(_) => ErrorKind::Retryable,
            TxnError::Expired => ErrorKind::Expired,
            TxnError::TimedOut(_) => ErrorKind::Transient,
            TxnError::Network(_) => ErrorKind::Transient,
        }
    }

    /// True for batch failures that abort the transaction but are safe to
    /// retry with a fresh transaction.
    pub fn is_try_again(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.kind(), ErrorKind::Expired)
    }

    /// True for timeouts and transport failures.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        TxnError::IllegalState(msg.into())
    }

    pub fn try_again(msg: impl Into<String>) -> Self {
        TxnError::TryAgain(msg.into())
    }
}
