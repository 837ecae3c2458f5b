//! Transactional outbox and inbox on PostgreSQL.
//!
//! Producers write events to the outbox in the same transaction as their
//! domain changes. An [`OutboxPublisher`] leases committed rows, publishes
//! them to a message bus and marks them published, retrying failures with a
//! capped exponential backoff. Delivery is at least once.
//!
//! On the receiving side an [`InboxConsumer`] records every delivery in the
//! inbox inside the transaction that runs the handler, so redelivered events
//! are acknowledged without being applied twice.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use fx_outbox::*;
//!
//! run_migrations(&pool).await?;
//!
//! // Produce
//! let transactions = TransactionManager::new(pool.clone(), TxConfig::default())?;
//! let store = PgOutboxStore::new(pool.clone());
//! let message = OutboxMessage::from_event(&OrderPlaced { order_id, total_cents })?;
//! transactions
//!     .within_tx(TxOptions::named("place_order"), |conn| {
//!         let store = store.clone();
//!         Box::pin(async move {
//!             // ... domain writes on `conn`
//!             store.enqueue(conn, &message).await
//!         })
//!     })
//!     .await?;
//!
//! // Publish
//! let publisher = PublisherRunner::builder()
//!     .with_store(Arc::new(store.clone()))
//!     .with_bus(bus_publisher)
//!     .build()?;
//! tokio::spawn(async move { publisher.run(cancel).await });
//!
//! // Consume
//! let consumer = ConsumerRunner::builder()
//!     .with_transactions(transactions)
//!     .with_store(Arc::new(store))
//!     .with_decoder(JsonDecoder::<OrderPlaced>::for_event())
//!     .with_handler(OrderPlacedHandler)
//!     .with_receiver(bus_receiver)
//!     .with_config(ConsumerConfig::default().with_source_service("orders"))
//!     .build()?;
//! consumer.run(cancel).await?;
//! ```

pub mod backoff;
pub mod bus;
pub mod consumer;
mod metrics;
mod migrations;
pub mod models;
pub mod publisher;
pub mod runner;
pub mod store;
pub mod transaction;

#[cfg(test)]
mod test_tools;

pub use bus::{BusError, BusMessage, MessageCallback, MessagePublisher, MessageReceiver};
pub use consumer::{
    ConsumeError, ConsumerConfig, DecodeError, HandlingError, InboxConsumer,
    InboxHandler, JsonDecoder, PayloadDecoder,
};
pub use migrations::run_migrations;
pub use models::{Event, InboxEvent, OutboxEvent, OutboxMessage};
pub use publisher::{OutboxPublisher, PublishError, PublisherConfig};
pub use runner::{ConsumerRunner, PublisherRunner, Runner, RunnerError};
pub use store::{InboxStore, OutboxStore, PgOutboxStore};
pub use transaction::{
    IsolationLevel, TransactionManager, TxConfig, TxError, TxOptions,
};
