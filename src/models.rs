use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Event trait for type-safe enqueueing and decoding
pub trait Event:
    serde::Serialize + serde::de::DeserializeOwned + Send + 'static
{
    /// The event type written to the outbox and sent as a bus attribute
    const NAME: &'static str;
    /// The aggregate type this event belongs to
    const AGGREGATE_TYPE: &'static str;

    /// The aggregate this event belongs to, also used as the ordering key
    fn aggregate_id(&self) -> Uuid;
}

/// A row of the outbox table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxEvent {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
    #[sqlx(json)]
    pub headers: HashMap<String, String>,
    pub occurred_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub delivery_attempts: i32,
    pub last_error: Option<String>,
    pub lock_token: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    /// Number of completed delivery attempts, never negative.
    pub fn attempts(&self) -> u32 {
        self.delivery_attempts.max(0) as u32
    }
}

/// A row of the inbox table.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct InboxEvent {
    pub event_id: Uuid,
    pub source_service: String,
    pub event_type: String,
    pub aggregate_type: Option<String>,
    pub aggregate_id: Option<Uuid>,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl InboxEvent {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// An event to be written to the outbox by a producer transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    /// Defaults to the enqueue time
    pub occurred_at: Option<DateTime<Utc>>,
    /// Defaults to the enqueue time
    pub available_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        event_type: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            occurred_at: None,
            available_at: None,
        }
    }

    /// Serializes a typed event into a message with a fresh event id.
    pub fn from_event<E: Event>(event: &E) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(event)?;
        Ok(Self::new(
            E::AGGREGATE_TYPE,
            event.aggregate_id(),
            E::NAME,
            payload,
        ))
    }

    pub fn with_event_id(
        mut self,
        event_id: Uuid,
    ) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_occurred_at(
        mut self,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    pub fn with_available_at(
        mut self,
        available_at: DateTime<Utc>,
    ) -> Self {
        self.available_at = Some(available_at);
        self
    }
}
