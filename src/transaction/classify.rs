use std::fmt;

/// Transient contention failures worth retrying the whole unit of work for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableKind {
    Deadlock,
    SerializationFailure,
    LockNotAvailable,
}

impl fmt::Display for RetryableKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(match self {
            RetryableKind::Deadlock => "deadlock",
            RetryableKind::SerializationFailure => "serialization failure",
            RetryableKind::LockNotAvailable => "lock not available",
        })
    }
}

/// Maps a database error to a retryable kind, `None` passes it through.
pub type Classifier = fn(&sqlx::Error) -> Option<RetryableKind>;

/// PostgreSQL SQLSTATE mapping.
pub fn classify_postgres(error: &sqlx::Error) -> Option<RetryableKind> {
    let code = error.as_database_error()?.code()?;
    match code.as_ref() {
        "40P01" => Some(RetryableKind::Deadlock),
        "40001" => Some(RetryableKind::SerializationFailure),
        "55P03" => Some(RetryableKind::LockNotAvailable),
        _ => None,
    }
}
