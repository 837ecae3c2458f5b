use super::{
    ConsumeError, ConsumerConfig, HandlingError, InboxHandler, InboxTxError,
    PayloadDecoder,
};
use crate::{
    bus::{attributes, BusError, BusMessage, MessageCallback, MessageReceiver},
    metrics::ConsumerMetrics,
    models::InboxEvent,
    publisher::publisher::panic_message,
    store::InboxStore,
    transaction::{Classifier, TransactionManager, TxOptions},
};
use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use sqlx::{Connection, PgConnection};
use std::{fmt, panic::AssertUnwindSafe, sync::Arc};
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// How a delivery was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The handler ran and its writes were committed with the inbox record
    Processed,
    /// The event was processed before, the handler was not invoked
    Duplicate,
}

impl Delivery {
    fn as_str(&self) -> &'static str {
        match self {
            Delivery::Processed => "processed",
            Delivery::Duplicate => "duplicate",
        }
    }
}

/// Result of the inbox transaction. Rejections still commit so the error
/// is kept on the inbox row.
enum Outcome {
    Processed,
    Duplicate,
    Rejected(ConsumeError),
}

/// Applies bus deliveries at most once per event id.
///
/// Every delivery is recorded in the inbox inside a transaction that also
/// runs the handler, so a redelivered event is recognised and acknowledged
/// without running the handler again.
pub struct InboxConsumer<D, H> {
    tx: TransactionManager,
    store: Arc<dyn InboxStore>,
    decoder: Arc<D>,
    handler: Arc<H>,
    config: ConsumerConfig,
    gate: Arc<Semaphore>,
    metrics: Option<ConsumerMetrics>,
}

impl<D, H> Clone for InboxConsumer<D, H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            store: self.store.clone(),
            decoder: self.decoder.clone(),
            handler: self.handler.clone(),
            config: self.config.clone(),
            gate: self.gate.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<D, H> fmt::Debug for InboxConsumer<D, H> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("InboxConsumer")
            .field("config", &self.config)
            .field("available_permits", &self.gate.available_permits())
            .finish_non_exhaustive()
    }
}

impl<D, H> InboxConsumer<D, H>
where
    D: PayloadDecoder + 'static,
    H: InboxHandler<D::Output> + 'static,
{
    pub fn new(
        tx: TransactionManager,
        store: Arc<dyn InboxStore>,
        decoder: D,
        handler: H,
        config: ConsumerConfig,
    ) -> Self {
        let config = config.normalized();
        let metrics = config.metrics_enabled.then(ConsumerMetrics::new);
        Self {
            tx,
            store,
            decoder: Arc::new(decoder),
            handler: Arc::new(handler),
            gate: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Subscribes through `receiver` until `cancel` fires or the
    /// subscription fails.
    ///
    /// Each run gets its own concurrency gate, closed when the run ends, so
    /// deliveries arriving afterwards on that subscription are rejected. The
    /// consumer itself can be run again.
    pub async fn run(
        &self,
        receiver: &dyn MessageReceiver,
        cancel: CancellationToken,
    ) -> Result<(), BusError> {
        tracing::info!(
            source_service = %self.config.source_service,
            max_concurrency = self.config.max_concurrency,
            "Inbox consumer started"
        );
        let gate = Arc::new(Semaphore::new(self.config.max_concurrency));
        let result = receiver
            .receive(cancel, self.gated_callback(gate.clone()))
            .await;
        gate.close();
        match &result {
            Ok(()) => tracing::info!("Inbox consumer stopped"),
            Err(error) => {
                tracing::error!(%error, "Inbox consumer subscription failed")
            }
        }
        result
    }

    /// The callback handed to the bus: `Ok` acknowledges, `Err` nacks.
    pub fn callback(&self) -> MessageCallback {
        self.gated_callback(self.gate.clone())
    }

    /// Handles one delivery behind the concurrency gate, turning a panic
    /// into an error.
    pub async fn deliver(
        &self,
        message: BusMessage,
    ) -> Result<Delivery, ConsumeError> {
        self.deliver_through(&self.gate, message).await
    }

    fn gated_callback(
        &self,
        gate: Arc<Semaphore>,
    ) -> MessageCallback {
        let consumer = self.clone();
        Arc::new(move |message: BusMessage| {
            let consumer = consumer.clone();
            let gate = gate.clone();
            async move {
                consumer
                    .deliver_through(&gate, message)
                    .await
                    .map(|_| ())
            }
            .boxed()
        })
    }

    async fn deliver_through(
        &self,
        gate: &Semaphore,
        message: BusMessage,
    ) -> Result<Delivery, ConsumeError> {
        let Ok(_permit) = gate.acquire().await else {
            return Err(ConsumeError::Closed);
        };

        let started = Instant::now();
        match AssertUnwindSafe(self.handle_message(message))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(panic = %message, "Inbox handler panicked");
                self.record("panicked", started);
                Err(ConsumeError::Panicked(message))
            }
        }
    }

    /// Records and applies one delivery without the gate.
    pub async fn handle_message(
        &self,
        message: BusMessage,
    ) -> Result<Delivery, ConsumeError> {
        let started = Instant::now();

        let event = match self.inbox_event(&message) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, "Rejecting malformed delivery");
                self.record("failed", started);
                return Err(error);
            }
        };

        let span = tracing::info_span!(
            "inbox_consume",
            event_id = %event.event_id,
            event_type = %event.event_type,
            source_service = %event.source_service,
        );
        let result = self.consume(event).instrument(span.clone()).await;

        span.in_scope(|| match &result {
            Ok(delivery) => {
                if self.config.log_enabled {
                    match delivery {
                        Delivery::Processed => {
                            tracing::info!("Processed inbox event")
                        }
                        Delivery::Duplicate => {
                            tracing::debug!("Skipped duplicate inbox event")
                        }
                    }
                }
                self.record(delivery.as_str(), started);
            }
            Err(error) => {
                if self.config.log_enabled {
                    tracing::warn!(%error, "Failed to process inbox event");
                }
                self.record("failed", started);
            }
        });
        result
    }

    async fn consume(
        &self,
        event: InboxEvent,
    ) -> Result<Delivery, ConsumeError> {
        let store = self.store.clone();
        let decoder = self.decoder.clone();
        let handler = self.handler.clone();
        let classifier = self.tx.classifier();

        let outcome = self
            .tx
            .within_tx_retrying(
                TxOptions::named("inbox_consume"),
                move |conn| {
                    consume(
                        conn,
                        store.clone(),
                        decoder.clone(),
                        handler.clone(),
                        classifier,
                        event.clone(),
                    )
                },
            )
            .await?;

        match outcome {
            Outcome::Processed => Ok(Delivery::Processed),
            Outcome::Duplicate => Ok(Delivery::Duplicate),
            Outcome::Rejected(error) => Err(error),
        }
    }

    /// Builds the inbox record from the message attributes.
    fn inbox_event(
        &self,
        message: &BusMessage,
    ) -> Result<InboxEvent, ConsumeError> {
        let raw_id = required(message, attributes::EVENT_ID)?;
        let event_id = Uuid::parse_str(raw_id).map_err(|_| {
            ConsumeError::InvalidAttribute {
                name: attributes::EVENT_ID,
                value: raw_id.to_string(),
            }
        })?;
        let event_type = required(message, attributes::EVENT_TYPE)?;

        let aggregate_id = message.attribute(attributes::AGGREGATE_ID).and_then(
            |value| match Uuid::parse_str(value) {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::debug!(
                        value,
                        "Ignoring an aggregate id that is not a UUID"
                    );
                    None
                }
            },
        );

        Ok(InboxEvent {
            event_id,
            source_service: self.config.source_service.clone(),
            event_type: event_type.to_string(),
            aggregate_type: message
                .attribute(attributes::AGGREGATE_TYPE)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            aggregate_id,
            payload: message.data.clone(),
            received_at: Utc::now(),
            processed_at: None,
            last_error: None,
        })
    }

    fn record(
        &self,
        outcome: &'static str,
        started: Instant,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record(
                &self.config.source_service,
                outcome,
                started.elapsed().as_secs_f64(),
            );
        }
    }
}

fn required<'m>(
    message: &'m BusMessage,
    name: &'static str,
) -> Result<&'m str, ConsumeError> {
    message
        .attribute(name)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ConsumeError::MissingAttribute(name))
}

/// The inbox transaction body: record, dedupe, decode, handle.
///
/// Handler failures are recorded on the inbox row and committed, except
/// retryable database errors, which abort the transaction so it is re-run.
fn consume<'c, D, H>(
    conn: &'c mut PgConnection,
    store: Arc<dyn InboxStore>,
    decoder: Arc<D>,
    handler: Arc<H>,
    classifier: Classifier,
    event: InboxEvent,
) -> BoxFuture<'c, Result<Outcome, InboxTxError>>
where
    D: PayloadDecoder + 'static,
    H: InboxHandler<D::Output> + 'static,
{
    async move {
        let inserted = store.record_inbox_event(&mut *conn, &event).await?;
        let canonical = store
            .get_inbox_event(&mut *conn, event.event_id)
            .await?
            .ok_or(InboxTxError::Vanished(event.event_id))?;
        if canonical.is_processed() {
            return Ok(Outcome::Duplicate);
        }
        if !inserted {
            tracing::debug!(
                last_error = ?canonical.last_error,
                "Retrying a previously failed inbox event"
            );
        }

        let payload = match decoder.decode(&canonical) {
            Ok(payload) => payload,
            Err(error) => {
                store
                    .record_inbox_error(
                        &mut *conn,
                        canonical.event_id,
                        &error.to_string(),
                    )
                    .await?;
                return Ok(Outcome::Rejected(error.into()));
            }
        };

        let mut savepoint = conn.begin().await?;
        let handled =
            handler.handle(&mut *savepoint, &canonical, payload).await;
        match handled {
            Ok(()) => {
                savepoint.commit().await?;
                store
                    .mark_inbox_processed(
                        &mut *conn,
                        canonical.event_id,
                        Utc::now(),
                    )
                    .await?;
                Ok(Outcome::Processed)
            }
            Err(HandlingError::Database(error))
                if classifier(&error).is_some() =>
            {
                savepoint.rollback().await?;
                Err(InboxTxError::Database(error))
            }
            Err(error) => {
                savepoint.rollback().await?;
                store
                    .record_inbox_error(
                        &mut *conn,
                        canonical.event_id,
                        &error.to_string(),
                    )
                    .await?;
                Ok(Outcome::Rejected(ConsumeError::Handler(error)))
            }
        }
    }
    .boxed()
}


#[cfg(test)]
mod pg_tests {
    use super::*;
    use crate::{
        consumer::JsonDecoder,
        store::PgOutboxStore,
        test_tools::{init_tracing, OrderPlaced},
        transaction::TxConfig,
    };
    use async_trait::async_trait;
    use sqlx::PgPool;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes a row per handled order, then fails, succeeds or panics.
    struct LedgerHandler {
        calls: AtomicUsize,
        failures: AtomicUsize,
        panics: bool,
    }

    impl LedgerHandler {
        fn failing(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(failures),
                panics: false,
            }
        }

        fn panicking() -> Self {
            Self {
                panics: true,
                ..Self::failing(0)
            }
        }
    }

    #[async_trait]
    impl InboxHandler<OrderPlaced> for LedgerHandler {
        async fn handle(
            &self,
            conn: &mut PgConnection,
            _event: &InboxEvent,
            payload: OrderPlaced,
        ) -> Result<(), HandlingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sqlx::query("INSERT INTO ledger (order_id, total_cents) VALUES ($1, $2)")
                .bind(payload.order_id)
                .bind(payload.total_cents)
                .execute(&mut *conn)
                .await?;
            if self.panics {
                panic!("ledger exploded");
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(HandlingError::BusinessLogic(
                    "ledger closed".to_string(),
                ));
            }
            Ok(())
        }
    }

    async fn setup<H: InboxHandler<OrderPlaced> + 'static>(
        pool: &PgPool,
        handler: H,
    ) -> anyhow::Result<(
        InboxConsumer<JsonDecoder<OrderPlaced>, H>,
        PgOutboxStore,
    )> {
        sqlx::raw_sql(
            "CREATE TABLE ledger (order_id UUID NOT NULL, total_cents BIGINT NOT NULL)",
        )
        .execute(pool)
        .await?;
        let store = PgOutboxStore::new(pool.clone());
        let tx = TransactionManager::new(
            pool.clone(),
            TxConfig::default().with_metrics(false),
        )?;
        let consumer = InboxConsumer::new(
            tx,
            Arc::new(store.clone()),
            JsonDecoder::for_event(),
            handler,
            ConsumerConfig::default()
                .with_source_service("billing")
                .with_metrics(false),
        );
        Ok((consumer, store))
    }

    fn order_message(
        event_id: Uuid,
        order: &OrderPlaced,
    ) -> BusMessage {
        BusMessage::new(serde_json::to_vec(order).expect("serializable"))
            .with_attribute(attributes::EVENT_ID, event_id.to_string())
            .with_attribute(attributes::EVENT_TYPE, "order.placed")
            .with_attribute(attributes::AGGREGATE_TYPE, "order")
            .with_attribute(attributes::AGGREGATE_ID, order.order_id.to_string())
    }

    fn order() -> OrderPlaced {
        OrderPlaced {
            order_id: Uuid::now_v7(),
            total_cents: 4200,
        }
    }

    async fn ledger_rows(pool: &PgPool) -> anyhow::Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM ledger")
            .fetch_one(pool)
            .await?)
    }

    async fn inbox_row(
        pool: &PgPool,
        store: &PgOutboxStore,
        event_id: Uuid,
    ) -> anyhow::Result<Option<InboxEvent>> {
        let mut conn = pool.acquire().await?;
        Ok(store.get_inbox_event(&mut conn, event_id).await?)
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn it_processes_each_event_once(pool: PgPool) -> anyhow::Result<()> {
        init_tracing();
        let (consumer, store) = setup(&pool, LedgerHandler::failing(0)).await?;
        let event_id = Uuid::now_v7();
        let message = order_message(event_id, &order());

        let first = consumer.deliver(message.clone()).await?;
        let second = consumer.deliver(message).await?;

        assert_eq!(first, Delivery::Processed);
        assert_eq!(second, Delivery::Duplicate);
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger_rows(&pool).await?, 1);

        let row = inbox_row(&pool, &store, event_id).await?.expect("recorded");
        assert!(row.is_processed());
        assert_eq!(row.source_service, "billing");
        assert_eq!(row.aggregate_type.as_deref(), Some("order"));
        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn it_handles_concurrent_duplicates_once(
        pool: PgPool
    ) -> anyhow::Result<()> {
        init_tracing();
        let (consumer, _store) = setup(&pool, LedgerHandler::failing(0)).await?;
        let message = order_message(Uuid::now_v7(), &order());
        let callback = consumer.callback();

        let (a, b) = tokio::join!(
            callback(message.clone()),
            callback(message.clone())
        );

        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ledger_rows(&pool).await?, 1);
        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn it_discards_handler_writes_on_failure_and_retries(
        pool: PgPool
    ) -> anyhow::Result<()> {
        init_tracing();
        let (consumer, store) = setup(&pool, LedgerHandler::failing(1)).await?;
        let event_id = Uuid::now_v7();
        let message = order_message(event_id, &order());

        let error = consumer
            .deliver(message.clone())
            .await
            .expect_err("handler fails once");
        assert!(matches!(error, ConsumeError::Handler(_)));
        assert_eq!(ledger_rows(&pool).await?, 0);

        let row = inbox_row(&pool, &store, event_id).await?.expect("kept");
        assert!(!row.is_processed());
        assert!(row
            .last_error
            .as_deref()
            .is_some_and(|error| error.contains("ledger closed")));

        // the bus redelivers
        assert_eq!(consumer.deliver(message).await?, Delivery::Processed);
        assert_eq!(ledger_rows(&pool).await?, 1);
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 2);
        let row = inbox_row(&pool, &store, event_id).await?.expect("kept");
        assert!(row.is_processed());
        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn it_records_decode_failures(pool: PgPool) -> anyhow::Result<()> {
        init_tracing();
        let (consumer, store) = setup(&pool, LedgerHandler::failing(0)).await?;
        let event_id = Uuid::now_v7();
        let message = BusMessage::new(b"not json".to_vec())
            .with_attribute(attributes::EVENT_ID, event_id.to_string())
            .with_attribute(attributes::EVENT_TYPE, "order.placed");

        let error = consumer.deliver(message).await.expect_err("undecodable");

        assert!(matches!(error, ConsumeError::Decode(_)));
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 0);
        let row = inbox_row(&pool, &store, event_id).await?.expect("kept");
        assert!(!row.is_processed());
        assert!(row.last_error.is_some());
        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn it_turns_handler_panics_into_nacks(
        pool: PgPool
    ) -> anyhow::Result<()> {
        init_tracing();
        let (consumer, store) = setup(&pool, LedgerHandler::panicking()).await?;
        let event_id = Uuid::now_v7();

        let error = consumer
            .deliver(order_message(event_id, &order()))
            .await
            .expect_err("panicked");

        assert!(matches!(error, ConsumeError::Panicked(ref message) if message == "ledger exploded"));
        // the whole transaction rolled back
        assert_eq!(ledger_rows(&pool).await?, 0);
        assert!(inbox_row(&pool, &store, event_id).await?.is_none());
        Ok(())
    }

    /// Hits a serialization failure on its first write, then succeeds.
    #[derive(Default)]
    struct ConflictingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InboxHandler<OrderPlaced> for ConflictingHandler {
        async fn handle(
            &self,
            conn: &mut PgConnection,
            _event: &InboxEvent,
            payload: OrderPlaced,
        ) -> Result<(), HandlingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                sqlx::Executor::execute(
                    &mut *conn,
                    sqlx::raw_sql(
                        "DO $$ BEGIN RAISE EXCEPTION 'conflict' \
                         USING ERRCODE = '40001'; END $$",
                    ),
                )
                .await?;
            }
            sqlx::query("INSERT INTO ledger (order_id, total_cents) VALUES ($1, $2)")
                .bind(payload.order_id)
                .bind(payload.total_cents)
                .execute(&mut *conn)
                .await?;
            Ok(())
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn it_reruns_the_transaction_on_handler_conflicts(
        pool: PgPool
    ) -> anyhow::Result<()> {
        init_tracing();
        let (consumer, store) =
            setup(&pool, ConflictingHandler::default()).await?;
        let event_id = Uuid::now_v7();

        let delivery = consumer.deliver(order_message(event_id, &order())).await?;

        assert_eq!(delivery, Delivery::Processed);
        assert_eq!(consumer.handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(ledger_rows(&pool).await?, 1);
        let row = inbox_row(&pool, &store, event_id).await?.expect("recorded");
        assert!(row.is_processed());
        assert_eq!(row.last_error, None);
        Ok(())
    }
}
