use super::{DecodeError, HandlingError};
use crate::models::{Event, InboxEvent};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::PgConnection;
use std::{fmt, marker::PhantomData};

/// Turns an inbox row's payload into the handler's input.
pub trait PayloadDecoder: Send + Sync {
    type Output: Send + 'static;

    fn decode(
        &self,
        event: &InboxEvent,
    ) -> Result<Self::Output, DecodeError>;
}

/// Decodes JSON payloads into `T`.
pub struct JsonDecoder<T> {
    expected_type: Option<&'static str>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    /// Accepts any event type.
    pub fn new() -> Self {
        Self {
            expected_type: None,
            _marker: PhantomData,
        }
    }
}

impl<T: Event> JsonDecoder<T> {
    /// Only accepts messages whose event type is `T::NAME`.
    pub fn for_event() -> Self {
        Self {
            expected_type: Some(T::NAME),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonDecoder<T> {
    fn clone(&self) -> Self {
        Self {
            expected_type: self.expected_type,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for JsonDecoder<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("JsonDecoder")
            .field("type", &std::any::type_name::<T>())
            .field("expected_type", &self.expected_type)
            .finish()
    }
}

impl<T> PayloadDecoder for JsonDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn decode(
        &self,
        event: &InboxEvent,
    ) -> Result<T, DecodeError> {
        if let Some(expected) = self.expected_type {
            if event.event_type != expected {
                return Err(DecodeError::UnexpectedType {
                    expected,
                    actual: event.event_type.clone(),
                });
            }
        }
        Ok(serde_json::from_slice(&event.payload)?)
    }
}

/// Applies a consumed event.
///
/// `conn` is inside the inbox transaction, under a savepoint. Writes made
/// through it commit together with the inbox record, or are discarded when
/// `handle` fails.
#[async_trait]
pub trait InboxHandler<P: Send + 'static>: Send + Sync {
    async fn handle(
        &self,
        conn: &mut PgConnection,
        event: &InboxEvent,
        payload: P,
    ) -> Result<(), HandlingError>;
}
