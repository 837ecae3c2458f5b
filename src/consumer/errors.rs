use crate::transaction::{SqlxSource, TxError};
use uuid::Uuid;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Failed to deserialize payload: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("Unexpected event type {actual}, expected {expected}")]
    UnexpectedType {
        expected: &'static str,
        actual: String,
    },
}

/// Returned by inbox handlers. Either way the handler's writes are rolled
/// back and the delivery is retried. Retryable database errors re-run the
/// whole inbox transaction first.
#[derive(thiserror::Error, Debug)]
pub enum HandlingError {
    #[error("Business logic error: {0}")]
    BusinessLogic(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Failures of the inbox bookkeeping itself.
#[derive(thiserror::Error, Debug)]
pub enum InboxTxError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("Inbox record {0} is missing after it was recorded")]
    Vanished(Uuid),
}

impl SqlxSource for InboxTxError {
    fn sqlx_error(&self) -> Option<&sqlx::Error> {
        match self {
            InboxTxError::Database(error) => Some(error),
            InboxTxError::Vanished(_) => None,
        }
    }
}

/// Why a delivery was not acknowledged.
#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error("Missing message attribute {0}")]
    MissingAttribute(&'static str),

    #[error("Invalid message attribute {name}: {value:?}")]
    InvalidAttribute {
        name: &'static str,
        value: String,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Handler failed: {0}")]
    Handler(#[from] HandlingError),

    #[error("Inbox transaction failed: {0}")]
    Transaction(#[from] TxError<InboxTxError>),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Delivered through the callback of a run that has ended
    #[error("The subscription has ended")]
    Closed,
}

impl ConsumeError {
    /// `true` when redelivering the same message can never succeed.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ConsumeError::MissingAttribute(_)
                | ConsumeError::InvalidAttribute { .. }
        )
    }
}
