use super::RetryableKind;

/// Exposes the database error underneath a unit of work's own error type, so
/// the transaction manager can classify it.
pub trait SqlxSource {
    fn sqlx_error(&self) -> Option<&sqlx::Error>;
}

impl SqlxSource for sqlx::Error {
    fn sqlx_error(&self) -> Option<&sqlx::Error> {
        Some(self)
    }
}

/// The failure that ended a transaction.
#[derive(thiserror::Error, Debug)]
pub enum TxFailure<E> {
    /// Begin, preamble or commit failed
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),

    /// The unit of work returned an error
    #[error(transparent)]
    Work(E),
}

impl<E: SqlxSource> TxFailure<E> {
    fn sqlx_error(&self) -> Option<&sqlx::Error> {
        match self {
            TxFailure::Database(error) => Some(error),
            TxFailure::Work(error) => error.sqlx_error(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TxError<E> {
    #[error("Transaction failed with a retryable {kind}")]
    Retryable {
        kind: RetryableKind,
        #[source]
        source: TxFailure<E>,
    },

    #[error(transparent)]
    Failed(TxFailure<E>),

    #[error("Transaction exceeded its deadline and was rolled back")]
    DeadlineExceeded,
}

impl<E> TxError<E> {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxError::Retryable { .. })
    }

    pub fn retryable_kind(&self) -> Option<RetryableKind> {
        match self {
            TxError::Retryable { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The unit of work's own error, if that is what ended the transaction.
    pub fn into_work(self) -> Option<E> {
        match self {
            TxError::Retryable {
                source: TxFailure::Work(error),
                ..
            }
            | TxError::Failed(TxFailure::Work(error)) => Some(error),
            _ => None,
        }
    }
}

impl<E: SqlxSource> TxError<E> {
    /// The database error underneath this failure, if any.
    pub fn sqlx_error(&self) -> Option<&sqlx::Error> {
        match self {
            TxError::Retryable { source, .. } | TxError::Failed(source) => {
                source.sqlx_error()
            }
            TxError::DeadlineExceeded => None,
        }
    }
}
