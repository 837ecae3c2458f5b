use crate::bus::BusError;

/// Why a single event could not be delivered. Logged, never fatal.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("The bus rejected the event: {0}")]
    Bus(#[from] BusError),

    #[error("The outbox could not be updated: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Publishing panicked: {0}")]
    Panicked(String),
}
