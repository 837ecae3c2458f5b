use super::{
    classify::{classify_postgres, Classifier},
    errors::{SqlxSource, TxError, TxFailure},
    options::{AccessMode, InvalidSchema, TxConfig, TxOptions, TxSettings},
};
use crate::{backoff, metrics::TxMetrics};
use futures::{future::BoxFuture, FutureExt};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::{panic::AssertUnwindSafe, time::Duration};
use tokio::time::Instant;
use tracing::Instrument;

const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(20);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Runs units of work inside PostgreSQL transactions.
///
/// Exactly one of commit or rollback happens for every call, including when
/// the unit of work panics or exceeds its deadline. Errors are classified so
/// that transient contention surfaces as [`TxError::Retryable`].
///
/// Transactions are not reentrant: the unit of work receives the connection
/// and must not open another transaction through the manager.
#[derive(Clone)]
pub struct TransactionManager {
    pool: PgPool,
    config: TxConfig,
    classifier: Classifier,
    metrics: Option<TxMetrics>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    pub fn new(
        pool: PgPool,
        config: TxConfig,
    ) -> Result<Self, InvalidSchema> {
        let config = config.normalized()?;
        let metrics = config.metrics_enabled.then(TxMetrics::new);
        Ok(Self {
            pool,
            config,
            classifier: classify_postgres,
            metrics,
        })
    }

    /// Replaces the PostgreSQL error code mapping.
    pub fn with_classifier(
        mut self,
        classifier: Classifier,
    ) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn classifier(&self) -> Classifier {
        self.classifier
    }

    /// Runs `work` inside one transaction, committing on `Ok`.
    ///
    /// The returned future is boxed so it stays `Send` for callers that hold
    /// it across their own await points.
    pub fn within_tx<'a, T, E, F>(
        &'a self,
        options: TxOptions,
        work: F,
    ) -> BoxFuture<'a, Result<T, TxError<E>>>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>
            + Send
            + 'a,
        T: Send + 'a,
        E: SqlxSource + Send + 'a,
    {
        let settings = self.config.resolve(options, Instant::now());
        let span = tracing::info_span!(
            "transaction",
            tx.name = %settings.name,
            tx.isolation = %settings.isolation,
            tx.read_only = settings.read_only(),
        );
        self.execute(settings, work).instrument(span).boxed()
    }

    /// Like [`Self::within_tx`], but always read only.
    pub fn within_read_only_tx<'a, T, E, F>(
        &'a self,
        options: TxOptions,
        work: F,
    ) -> BoxFuture<'a, Result<T, TxError<E>>>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>
            + Send
            + 'a,
        T: Send + 'a,
        E: SqlxSource + Send + 'a,
    {
        self.within_tx(options.with_access_mode(AccessMode::ReadOnly), work)
    }

    /// Re-runs the whole unit of work while it fails with a retryable error,
    /// at most `max_retries` times after the first attempt.
    pub fn within_tx_retrying<'a, T, E, F>(
        &'a self,
        options: TxOptions,
        work: F,
    ) -> BoxFuture<'a, Result<T, TxError<E>>>
    where
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>
            + Send
            + Sync
            + 'a,
        T: Send + 'a,
        E: SqlxSource + Send + 'a,
    {
        async move {
            let mut retries = 0;
            loop {
                match self.within_tx(options.clone(), &work).await {
                    Err(error)
                        if error.is_retryable()
                            && retries < self.config.max_retries =>
                    {
                        let wait = backoff::exponential(
                            RETRY_BACKOFF_INITIAL,
                            RETRY_BACKOFF_MAX,
                            retries,
                        );
                        retries += 1;
                        tracing::debug!(
                            message = "Retrying transaction",
                            kind = ?error.retryable_kind(),
                            retry = retries,
                            wait_ms = wait.as_millis() as u64,
                        );
                        tokio::time::sleep(wait).await;
                    }
                    result => return result,
                }
            }
        }
        .boxed()
    }

    fn execute<'a, T, E, F>(
        &'a self,
        settings: TxSettings,
        work: F,
    ) -> BoxFuture<'a, Result<T, TxError<E>>>
    where
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, E>>
            + Send
            + 'a,
        T: Send + 'a,
        E: SqlxSource + Send + 'a,
    {
        async move {
            let started = Instant::now();

            let mut tx = match tokio::time::timeout_at(
                settings.deadline,
                self.begin(&settings),
            )
            .await
            {
                Ok(Ok(tx)) => tx,
                Ok(Err(error)) => {
                    let error = self.classify(TxFailure::Database(error));
                    self.record(&settings, outcome_of(&error), started);
                    return Err(error);
                }
                Err(_) => {
                    self.record(&settings, "deadline", started);
                    return Err(TxError::DeadlineExceeded);
                }
            };

            let outcome = tokio::time::timeout_at(
                settings.deadline,
                AssertUnwindSafe(work(&mut *tx)).catch_unwind(),
            )
            .await;

            match outcome {
                Ok(Ok(Ok(value))) => match tx.commit().await {
                    Ok(()) => {
                        self.record(&settings, "commit", started);
                        Ok(value)
                    }
                    Err(error) => {
                        tracing::warn!(
                            message = "Transaction commit failed",
                            error = %error,
                        );
                        let error = self.classify(TxFailure::Database(error));
                        self.record(&settings, outcome_of(&error), started);
                        Err(error)
                    }
                },
                Ok(Ok(Err(error))) => {
                    Self::rollback(tx).await;
                    let error = self.classify(TxFailure::Work(error));
                    self.record(&settings, outcome_of(&error), started);
                    Err(error)
                }
                Ok(Err(panic)) => {
                    Self::rollback(tx).await;
                    self.record(&settings, "panic", started);
                    tracing::error!(
                        message = "Unit of work panicked, transaction rolled back"
                    );
                    std::panic::resume_unwind(panic)
                }
                Err(_) => {
                    Self::rollback(tx).await;
                    self.record(&settings, "deadline", started);
                    tracing::warn!(
                        message = "Transaction exceeded its deadline",
                        elapsed_ms = started.elapsed().as_millis() as u64,
                    );
                    Err(TxError::DeadlineExceeded)
                }
            }
        }
        .boxed()
    }

    fn begin<'a>(
        &'a self,
        settings: &TxSettings,
    ) -> BoxFuture<'a, Result<Transaction<'static, Postgres>, sqlx::Error>> {
        let preamble = settings.preamble();
        async move {
            let mut tx = self.pool.begin().await?;
            let conn: &mut sqlx::PgConnection = &mut tx;
            sqlx::Executor::execute(conn, sqlx::raw_sql(&preamble)).await?;
            Ok(tx)
        }
        .boxed()
    }

    async fn rollback(tx: Transaction<'static, Postgres>) {
        if let Err(error) = tx.rollback().await {
            // The connection is discarded by the pool on failure
            tracing::warn!(
                message = "Transaction rollback failed",
                error = %error
            );
        }
    }

    fn classify<E: SqlxSource>(
        &self,
        failure: TxFailure<E>,
    ) -> TxError<E> {
        let kind = match &failure {
            TxFailure::Database(error) => (self.classifier)(error),
            TxFailure::Work(error) => error.sqlx_error().and_then(self.classifier),
        };
        match kind {
            Some(kind) => TxError::Retryable {
                kind,
                source: failure,
            },
            None => TxError::Failed(failure),
        }
    }

    fn record(
        &self,
        settings: &TxSettings,
        outcome: &'static str,
        started: Instant,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record(
                &settings.name,
                outcome,
                started.elapsed().as_secs_f64(),
            );
        }
    }
}

fn outcome_of<E>(error: &TxError<E>) -> &'static str {
    match error {
        TxError::Retryable { .. } => "retryable",
        TxError::Failed(_) => "rollback",
        TxError::DeadlineExceeded => "deadline",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::classify::tests::db_error;
    use crate::transaction::RetryableKind;

    fn lazy_manager() -> TransactionManager {
        TransactionManager::new(
            crate::test_tools::lazy_pool(),
            TxConfig::default().with_metrics(false),
        )
        .expect("valid config")
    }

    #[tokio::test]
    async fn it_classifies_work_errors() {
        let manager = lazy_manager();

        let error = manager.classify(TxFailure::Work(db_error("40001")));
        assert_eq!(
            error.retryable_kind(),
            Some(RetryableKind::SerializationFailure)
        );

        let error = manager.classify(TxFailure::Work(db_error("23505")));
        assert!(matches!(error, TxError::Failed(TxFailure::Work(_))));
    }

    #[tokio::test]
    async fn it_uses_a_custom_classifier() {
        fn everything_retryable(_: &sqlx::Error) -> Option<RetryableKind> {
            Some(RetryableKind::LockNotAvailable)
        }
        let manager = lazy_manager().with_classifier(everything_retryable);

        let error = manager
            .classify(TxFailure::<sqlx::Error>::Database(sqlx::Error::RowNotFound));
        assert_eq!(
            error.retryable_kind(),
            Some(RetryableKind::LockNotAvailable)
        );
    }

    #[tokio::test]
    async fn it_fails_without_running_work_when_begin_fails() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let manager = lazy_manager();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let result: Result<(), TxError<sqlx::Error>> = manager
            .within_tx(TxOptions::named("unreachable"), move |_conn| {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
            .await;

        assert!(matches!(
            result,
            Err(TxError::Failed(TxFailure::Database(_)))
                | Err(TxError::DeadlineExceeded)
        ));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn it_runs_with_an_unbounded_timeout() {
        let manager = TransactionManager::new(
            crate::test_tools::lazy_pool(),
            TxConfig::default()
                .with_timeout(Duration::MAX)
                .with_metrics(false),
        )
        .expect("valid config");

        let result: Result<(), TxError<sqlx::Error>> = manager
            .within_tx(
                TxOptions::named("unbounded").with_timeout(Duration::MAX),
                |_conn| Box::pin(async { Ok(()) }),
            )
            .await;

        // The pool is unreachable, so begin fails instead of the deadline
        assert!(matches!(
            result,
            Err(TxError::Failed(TxFailure::Database(_)))
        ));
    }

    #[tokio::test]
    async fn it_rejects_invalid_configuration() {
        let pool = crate::test_tools::lazy_pool();
        let result = TransactionManager::new(
            pool,
            TxConfig::default().with_schema("bad-schema"),
        );
        assert!(result.is_err());
    }
}
