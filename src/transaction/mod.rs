pub mod classify;
pub mod errors;
pub mod manager;
pub mod options;

pub use classify::{classify_postgres, Classifier, RetryableKind};
pub use errors::{SqlxSource, TxError, TxFailure};
pub use manager::TransactionManager;
pub use options::{AccessMode, InvalidSchema, IsolationLevel, TxConfig, TxOptions};
