//! Storage for outbox and inbox rows.
//!
//! The publisher depends on [`OutboxStore`] and the consumer on
//! [`InboxStore`]; [`PgOutboxStore`] implements both on PostgreSQL.

mod inbox;
mod outbox;
mod statements;

pub use outbox::PgOutboxStore;
pub(crate) use outbox::DEFAULT_SCHEMA;

use crate::models::{InboxEvent, OutboxEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

/// Lease based access to pending outbox rows.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically leases up to `limit` unpublished rows available before
    /// `available_before` that are unlocked or locked before `stale_before`.
    async fn claim_pending(
        &self,
        available_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
        lease_token: Uuid,
    ) -> Result<Vec<OutboxEvent>, sqlx::Error>;

    /// Sets `published_at` if the row is still leased to `lease_token`.
    ///
    /// Returns `false` without error when the lease was lost.
    async fn mark_published(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error>;

    /// Releases the lease and makes the row available again at
    /// `next_available_at`, recording the error.
    async fn reschedule(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
        next_available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, sqlx::Error>;

    async fn count_pending(&self) -> Result<i64, sqlx::Error>;
}

/// Dedupe records for consumed events, written on the caller's connection.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Inserts the record, returns `false` if the id was already known.
    async fn record_inbox_event(
        &self,
        conn: &mut PgConnection,
        event: &InboxEvent,
    ) -> Result<bool, sqlx::Error>;

    async fn get_inbox_event(
        &self,
        conn: &mut PgConnection,
        event_id: Uuid,
    ) -> Result<Option<InboxEvent>, sqlx::Error>;

    async fn mark_inbox_processed(
        &self,
        conn: &mut PgConnection,
        event_id: Uuid,
        processed_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error>;

    /// Overwrites `last_error`, a no-op for unknown ids.
    async fn record_inbox_error(
        &self,
        conn: &mut PgConnection,
        event_id: Uuid,
        error: &str,
    ) -> Result<(), sqlx::Error>;
}
