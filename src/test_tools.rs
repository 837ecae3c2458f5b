use crate::{
    bus::{BusError, BusMessage, MessageCallback, MessagePublisher, MessageReceiver},
    models::{Event, InboxEvent, OutboxEvent, OutboxMessage},
    store::OutboxStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex, Once,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    });
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: Uuid,
    pub total_cents: i64,
}

impl Event for OrderPlaced {
    const NAME: &'static str = "order.placed";
    const AGGREGATE_TYPE: &'static str = "order";

    fn aggregate_id(&self) -> Uuid {
        self.order_id
    }
}

/// A pool that never connects, acquiring fails fast.
pub fn lazy_pool() -> sqlx::PgPool {
    sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_millis(50))
        .connect_lazy("postgres://localhost:1/unreachable")
        .expect("valid url")
}

pub fn message(aggregate_type: &str) -> OutboxMessage {
    OutboxMessage::new(
        aggregate_type,
        Uuid::now_v7(),
        format!("{aggregate_type}.created"),
        br#"{"hello":"world"}"#.to_vec(),
    )
}

pub fn inbox_event() -> InboxEvent {
    InboxEvent {
        event_id: Uuid::now_v7(),
        source_service: "orders".to_string(),
        event_type: OrderPlaced::NAME.to_string(),
        aggregate_type: Some(OrderPlaced::AGGREGATE_TYPE.to_string()),
        aggregate_id: Some(Uuid::now_v7()),
        payload: br#"{"order_id":"00000000-0000-0000-0000-000000000000","total_cents":1}"#
            .to_vec(),
        received_at: Utc::now(),
        processed_at: None,
        last_error: None,
    }
}

/// Outbox rows kept in memory with the same lease rules as the table.
#[derive(Default)]
pub struct MemoryOutboxStore {
    events: Mutex<Vec<OutboxEvent>>,
    fail_claims: AtomicBool,
}

impl MemoryOutboxStore {
    pub fn push(
        &self,
        message: OutboxMessage,
    ) -> Uuid {
        let now = Utc::now();
        let event = OutboxEvent {
            event_id: message.event_id,
            aggregate_type: message.aggregate_type,
            aggregate_id: message.aggregate_id,
            event_type: message.event_type,
            payload: message.payload,
            headers: message.headers,
            occurred_at: message.occurred_at.unwrap_or(now),
            available_at: message.available_at.unwrap_or(now),
            published_at: None,
            delivery_attempts: 0,
            last_error: None,
            lock_token: None,
            locked_at: None,
        };
        let event_id = event.event_id;
        self.events.lock().unwrap().push(event);
        event_id
    }

    pub fn get(
        &self,
        event_id: Uuid,
    ) -> Option<OutboxEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|event| event.event_id == event_id)
            .cloned()
    }

    /// Moves `available_at` into the past, skipping the backoff.
    pub fn make_available(
        &self,
        event_id: Uuid,
    ) {
        self.update(event_id, |event| {
            event.available_at = Utc::now() - chrono::Duration::milliseconds(1)
        });
    }

    /// Leases the row to someone else, as a reclaim would.
    pub fn steal(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
    ) {
        self.update(event_id, |event| {
            event.lock_token = Some(lease_token);
            event.locked_at = Some(Utc::now());
        });
    }

    pub fn fail_claims(
        &self,
        fail: bool,
    ) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| !event.is_published())
            .count()
    }

    fn update(
        &self,
        event_id: Uuid,
        f: impl FnOnce(&mut OutboxEvent),
    ) -> bool {
        let mut events = self.events.lock().unwrap();
        match events.iter_mut().find(|event| event.event_id == event_id) {
            Some(event) => {
                f(event);
                true
            }
            None => false,
        }
    }

    fn update_leased(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
        f: impl FnOnce(&mut OutboxEvent),
    ) -> bool {
        let mut events = self.events.lock().unwrap();
        match events.iter_mut().find(|event| {
            event.event_id == event_id
                && event.lock_token == Some(lease_token)
                && !event.is_published()
        }) {
            Some(event) => {
                f(event);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn claim_pending(
        &self,
        available_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
        lease_token: Uuid,
    ) -> Result<Vec<OutboxEvent>, sqlx::Error> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(sqlx::Error::PoolTimedOut);
        }
        let now = Utc::now();
        let mut events = self.events.lock().unwrap();
        let mut candidates: Vec<&mut OutboxEvent> = events
            .iter_mut()
            .filter(|event| {
                !event.is_published()
                    && event.available_at <= available_before
                    && event
                        .locked_at
                        .map_or(true, |locked_at| locked_at < stale_before)
            })
            .collect();
        candidates.sort_by_key(|event| event.available_at);

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|event| {
                event.lock_token = Some(lease_token);
                event.locked_at = Some(now);
                event.clone()
            })
            .collect())
    }

    async fn mark_published(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        Ok(self.update_leased(event_id, lease_token, |event| {
            event.published_at = Some(published_at);
            event.delivery_attempts += 1;
            event.lock_token = None;
            event.locked_at = None;
        }))
    }

    async fn reschedule(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
        next_available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, sqlx::Error> {
        Ok(self.update_leased(event_id, lease_token, |event| {
            event.available_at = next_available_at;
            event.last_error = Some(last_error.to_string());
            event.delivery_attempts += 1;
            event.lock_token = None;
            event.locked_at = None;
        }))
    }

    async fn count_pending(&self) -> Result<i64, sqlx::Error> {
        Ok(self.pending() as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBehavior {
    Succeed,
    Fail,
    Panic,
    Hang,
}

/// A bus that follows a script, then falls back to one behavior.
pub struct ScriptedBus {
    script: Mutex<VecDeque<BusBehavior>>,
    fallback: BusBehavior,
    published: Mutex<Vec<BusMessage>>,
    calls: AtomicUsize,
}

impl ScriptedBus {
    pub fn scripted(
        script: Vec<BusBehavior>,
        fallback: BusBehavior,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            published: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::scripted(Vec::new(), BusBehavior::Succeed)
    }

    pub fn failing() -> Self {
        Self::scripted(Vec::new(), BusBehavior::Fail)
    }

    /// Messages the bus accepted.
    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagePublisher for ScriptedBus {
    async fn publish(
        &self,
        message: BusMessage,
    ) -> Result<String, BusError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match behavior {
            BusBehavior::Succeed => {
                self.published.lock().unwrap().push(message);
                Ok(format!("server-{call}"))
            }
            BusBehavior::Fail => {
                Err(BusError::Publish("broker unavailable".to_string()))
            }
            BusBehavior::Panic => panic!("bus exploded"),
            BusBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(String::new())
            }
        }
    }
}

/// Delivers a fixed set of messages, then idles until cancelled.
///
/// Callback results are collected in delivery order.
pub struct StaticReceiver {
    messages: Vec<BusMessage>,
    acks: Mutex<Vec<bool>>,
}

impl StaticReceiver {
    pub fn new(messages: Vec<BusMessage>) -> Self {
        Self {
            messages,
            acks: Mutex::new(Vec::new()),
        }
    }

    /// `true` for acknowledged deliveries, `false` for nacks.
    pub fn acks(&self) -> Vec<bool> {
        self.acks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageReceiver for StaticReceiver {
    async fn receive(
        &self,
        cancel: CancellationToken,
        callback: MessageCallback,
    ) -> Result<(), BusError> {
        for message in self.messages.iter().cloned() {
            let acked = callback(message).await.is_ok();
            self.acks.lock().unwrap().push(acked);
        }
        cancel.cancelled().await;
        Ok(())
    }
}

/// A receiver whose subscription breaks right away.
pub struct BrokenReceiver;

#[async_trait]
impl MessageReceiver for BrokenReceiver {
    async fn receive(
        &self,
        _cancel: CancellationToken,
        _callback: MessageCallback,
    ) -> Result<(), BusError> {
        Err(BusError::Subscription("subscription not found".to_string()))
    }
}
