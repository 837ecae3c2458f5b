//! The message bus as seen by the publisher and the consumer.
//!
//! Flow control, emulators and broker specifics live in the implementations.

use crate::consumer::ConsumeError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// Attribute names shared by the publisher and the consumer.
pub mod attributes {
    pub const EVENT_ID: &str = "event_id";
    pub const EVENT_TYPE: &str = "event_type";
    pub const AGGREGATE_TYPE: &str = "aggregate_type";
    pub const AGGREGATE_ID: &str = "aggregate_id";
    pub const OCCURRED_AT: &str = "occurred_at";
}

/// A message as it travels over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BusMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    /// Messages sharing a key are delivered in order, if the bus supports it
    pub ordering_key: Option<String>,
}

impl BusMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_ordering_key(
        mut self,
        key: impl Into<String>,
    ) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    pub fn attribute(
        &self,
        key: &str,
    ) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subscription failed: {0}")]
    Subscription(String),
}

/// Publishes messages, returning the broker assigned message id.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        message: BusMessage,
    ) -> Result<String, BusError>;
}

/// Invoked once per delivered message. `Ok` acknowledges, `Err` asks the bus
/// to redeliver.
pub type MessageCallback = Arc<
    dyn Fn(BusMessage) -> BoxFuture<'static, Result<(), ConsumeError>>
        + Send
        + Sync,
>;

/// Push based subscription.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Delivers messages to `callback` until `cancel` fires or the
    /// subscription fails.
    async fn receive(
        &self,
        cancel: CancellationToken,
        callback: MessageCallback,
    ) -> Result<(), BusError>;
}
