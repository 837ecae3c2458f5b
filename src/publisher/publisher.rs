use super::{PublishError, PublisherConfig};
use crate::{
    backoff::{self, PollControl},
    bus::{attributes, BusError, BusMessage, MessagePublisher},
    metrics::PublisherMetrics,
    models::OutboxEvent,
    store::OutboxStore,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tokio::{
    sync::Semaphore,
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// What happened to one claimed event.
#[derive(Debug)]
pub enum Delivery {
    Published,
    /// The bus failed, the row becomes available again after the backoff
    Rescheduled(PublishError),
    /// Another publisher took over the row
    LeaseLost,
    /// The row was not leased to this publisher
    Skipped,
    /// The outcome could not be written back, the lease will go stale
    Failed(PublishError),
}

/// Per cycle tally, mostly for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub published: usize,
    pub rescheduled: usize,
    pub lease_lost: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CycleReport {
    fn record(
        &mut self,
        delivery: &Delivery,
    ) {
        match delivery {
            Delivery::Published => self.published += 1,
            Delivery::Rescheduled(_) => self.rescheduled += 1,
            Delivery::LeaseLost => self.lease_lost += 1,
            Delivery::Skipped => self.skipped += 1,
            Delivery::Failed(_) => self.failed += 1,
        }
    }
}

/// Moves committed outbox rows onto the bus.
///
/// Every instance owns a lease token for its lifetime. Rows are leased in
/// batches, published concurrently and then either marked published or
/// rescheduled with a capped exponential backoff. Rows leased by a publisher
/// that died are picked up again once their lease is older than the TTL.
#[derive(Clone)]
pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn MessagePublisher>,
    config: PublisherConfig,
    lease: Uuid,
    backlog: Arc<AtomicI64>,
    metrics: Option<Arc<PublisherMetrics>>,
}

impl fmt::Debug for OutboxPublisher {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OutboxPublisher")
            .field("config", &self.config)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn MessagePublisher>,
        config: PublisherConfig,
    ) -> Self {
        let config = config.normalized();
        let backlog = Arc::new(AtomicI64::new(0));
        let metrics = config
            .metrics_enabled
            .then(|| Arc::new(PublisherMetrics::new(backlog.clone())));
        if config.lease_ttl < config.publish_timeout {
            tracing::warn!(
                lease_ttl = ?config.lease_ttl,
                publish_timeout = ?config.publish_timeout,
                "Lease TTL is shorter than the publish timeout, in-flight events may be published twice"
            );
        }
        Self {
            store,
            bus,
            config,
            lease: Uuid::now_v7(),
            backlog,
            metrics,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// The token written to every row this publisher leases.
    pub fn lease_token(&self) -> Uuid {
        self.lease
    }

    /// Unpublished rows as of the last cycle.
    pub fn backlog(&self) -> i64 {
        self.backlog.load(Ordering::Relaxed)
    }

    /// Runs cycles on every tick until `cancel` fires.
    ///
    /// Failing claims stretch the wait between cycles, a successful one
    /// resets it. Rows in flight when cancelled keep their lease and are
    /// reclaimed once it goes stale.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_control = PollControl::new(
            self.config.tick_interval,
            self.config.max_backoff,
        );

        tracing::info!(
            lease = %self.lease,
            batch_size = self.config.batch_size,
            workers = self.config.workers,
            "Outbox publisher started"
        );

        loop {
            let wait = poll_control.backoff();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = async {
                    ticker.tick().await;
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                } => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.run_once(&cancel) => result,
            };

            match result {
                Ok(report) => {
                    poll_control.reset_failed_attempts();
                    if report.claimed > 0 && self.config.log_enabled {
                        tracing::debug!(
                            claimed = report.claimed,
                            published = report.published,
                            rescheduled = report.rescheduled,
                            lease_lost = report.lease_lost,
                            failed = report.failed,
                            "Outbox cycle completed"
                        );
                    }
                }
                Err(error) => {
                    poll_control.increment_failed_attempts();
                    tracing::warn!(
                        %error,
                        failed_attempts = poll_control.failed_attempts(),
                        backoff = ?poll_control.backoff(),
                        "Failed to claim outbox events"
                    );
                }
            }
        }

        tracing::info!(lease = %self.lease, "Outbox publisher stopped");
    }

    /// Claims one batch, publishes it and refreshes the backlog.
    ///
    /// Only the claim can fail, per event failures are written back to the
    /// rows and tallied in the report.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, sqlx::Error> {
        let now = Utc::now();
        let stale_before = now
            .checked_sub_signed(backoff::to_chrono(self.config.lease_ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .min(now);

        let events = self
            .store
            .claim_pending(now, stale_before, self.config.batch_size, self.lease)
            .await?;

        let mut report = CycleReport {
            claimed: events.len(),
            ..CycleReport::default()
        };
        if !events.is_empty() {
            self.dispatch(events, cancel, &mut report).await;
        }

        self.refresh_backlog().await;
        Ok(report)
    }

    async fn dispatch(
        &self,
        events: Vec<OutboxEvent>,
        cancel: &CancellationToken,
        report: &mut CycleReport,
    ) {
        if self.config.workers <= 1 {
            for event in events {
                if cancel.is_cancelled() {
                    break;
                }
                report.record(&self.deliver_guarded(event).await);
            }
            return;
        }

        let permits = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();
        for event in events {
            let publisher = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return Delivery::Skipped;
                };
                publisher.deliver_guarded(event).await
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    break;
                }
                next = tasks.join_next() => match next {
                    None => break,
                    Some(Ok(delivery)) => report.record(&delivery),
                    Some(Err(error)) => {
                        tracing::error!(%error, "Outbox publish task failed");
                        report.failed += 1;
                    }
                },
            }
        }
    }

    /// Keeps a panic in one event from taking down the batch.
    async fn deliver_guarded(
        &self,
        event: OutboxEvent,
    ) -> Delivery {
        let event_id = event.event_id;
        let span = tracing::info_span!(
            "outbox_publish",
            event_id = %event.event_id,
            event_type = %event.event_type,
            attempt = event.attempts() + 1,
        );
        AssertUnwindSafe(self.deliver(event).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic);
                tracing::error!(%event_id, panic = %message, "Outbox delivery panicked");
                Delivery::Failed(PublishError::Panicked(message))
            })
    }

    async fn deliver(
        &self,
        event: OutboxEvent,
    ) -> Delivery {
        if event.lock_token != Some(self.lease) {
            tracing::warn!(
                lock_token = ?event.lock_token,
                "Skipping an outbox event leased by someone else"
            );
            return Delivery::Skipped;
        }

        let started = Instant::now();
        let message = bus_message(&event);
        let published = AssertUnwindSafe(tokio::time::timeout(
            self.config.publish_timeout,
            self.bus.publish(message),
        ))
        .catch_unwind()
        .await;
        let latency = started.elapsed().as_secs_f64();

        let error = match published {
            Ok(Ok(Ok(server_id))) => {
                return self.on_published(&event, &server_id, latency).await
            }
            Ok(Ok(Err(error))) => PublishError::Bus(error),
            Ok(Err(_elapsed)) => PublishError::Bus(BusError::Timeout(
                self.config.publish_timeout,
            )),
            Err(panic) => PublishError::Panicked(panic_message(panic)),
        };
        self.on_failed(&event, error, latency).await
    }

    async fn on_published(
        &self,
        event: &OutboxEvent,
        server_id: &str,
        latency: f64,
    ) -> Delivery {
        let published_at = Utc::now();
        match self
            .store
            .mark_published(event.event_id, self.lease, published_at)
            .await
        {
            Ok(true) => {
                let lag = (published_at - event.occurred_at)
                    .to_std()
                    .unwrap_or_default();
                if self.config.log_enabled {
                    tracing::info!(
                        aggregate_id = %event.aggregate_id,
                        server_id,
                        lag_ms = lag.as_millis() as u64,
                        latency_ms = (latency * 1000.0) as u64,
                        "Published outbox event"
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics.published(
                        &event.event_type,
                        latency,
                        lag.as_secs_f64(),
                    );
                }
                Delivery::Published
            }
            Ok(false) => {
                tracing::warn!(
                    "Lost the lease after publishing, the event may be published again"
                );
                Delivery::LeaseLost
            }
            Err(error) => {
                tracing::error!(
                    %error,
                    "Failed to mark outbox event published, it will be retried once the lease is stale"
                );
                Delivery::Failed(PublishError::Store(error))
            }
        }
    }

    async fn on_failed(
        &self,
        event: &OutboxEvent,
        error: PublishError,
        latency: f64,
    ) -> Delivery {
        if let Some(metrics) = &self.metrics {
            metrics.failed(&event.event_type, latency);
        }

        let attempts = event.attempts();
        let delay = backoff::exponential(
            self.config.initial_backoff,
            self.config.max_backoff,
            attempts,
        );
        let now = Utc::now();
        let next_available_at = now
            .checked_add_signed(backoff::to_chrono(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let reason = error.to_string();
        if self.config.log_enabled {
            tracing::warn!(
                error = %reason,
                retry_in = ?delay,
                "Failed to publish outbox event"
            );
        }
        if attempts.saturating_add(1) >= self.config.max_attempts {
            tracing::warn!(
                attempts = attempts + 1,
                max_attempts = self.config.max_attempts,
                "Outbox event exceeded its delivery attempts, retrying anyway"
            );
        }

        match self
            .store
            .reschedule(event.event_id, self.lease, next_available_at, &reason)
            .await
        {
            Ok(true) => Delivery::Rescheduled(error),
            Ok(false) => {
                tracing::warn!("Lost the lease before rescheduling");
                Delivery::LeaseLost
            }
            Err(store_error) => {
                tracing::error!(
                    error = %store_error,
                    "Failed to reschedule outbox event, it will be retried once the lease is stale"
                );
                Delivery::Failed(PublishError::Store(store_error))
            }
        }
    }

    async fn refresh_backlog(&self) {
        match self.store.count_pending().await {
            Ok(pending) => {
                self.backlog.store(pending, Ordering::Relaxed);
                tracing::debug!(backlog = pending, "Outbox backlog refreshed");
            }
            Err(error) => {
                tracing::warn!(%error, "Failed to count pending outbox events")
            }
        }
    }
}

/// The row as a bus message. Headers are sent as attributes alongside the
/// standard ones, which win on conflicts.
fn bus_message(event: &OutboxEvent) -> BusMessage {
    let mut message = BusMessage::new(event.payload.clone());
    message.attributes.extend(event.headers.clone());
    message
        .with_attribute(attributes::EVENT_ID, event.event_id.to_string())
        .with_attribute(attributes::EVENT_TYPE, event.event_type.as_str())
        .with_attribute(attributes::AGGREGATE_TYPE, event.aggregate_type.as_str())
        .with_attribute(attributes::AGGREGATE_ID, event.aggregate_id.to_string())
        .with_attribute(attributes::OCCURRED_AT, event.occurred_at.to_rfc3339())
        .with_ordering_key(event.aggregate_id.to_string())
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
