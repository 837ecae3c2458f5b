//! Exactly once processing of bus deliveries through the inbox table.

pub mod config;
pub mod consumer;
pub mod errors;
pub mod handler;

pub use config::ConsumerConfig;
pub use consumer::{Delivery, InboxConsumer};
pub use errors::{ConsumeError, DecodeError, HandlingError, InboxTxError};
pub use handler::{InboxHandler, JsonDecoder, PayloadDecoder};
