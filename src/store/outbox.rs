use super::{statements::Statements, OutboxStore};
use crate::{
    models::{OutboxEvent, OutboxMessage},
    transaction::{options::validate_identifier, InvalidSchema},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgConnection, PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use uuid::Uuid;

pub(crate) const DEFAULT_SCHEMA: &str = "fx_outbox";

// 8 binds per row, well below the 65535 parameter limit
const ENQUEUE_CHUNK: usize = 1_000;

/// PostgreSQL implementation of [`OutboxStore`] and
/// [`InboxStore`](super::InboxStore).
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    pub(super) statements: Arc<Statements>,
}

impl PgOutboxStore {
    /// A store over the tables in the `fx_outbox` schema.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            statements: Arc::new(Statements::new(DEFAULT_SCHEMA)),
        }
    }

    /// Uses tables created in another schema.
    pub fn with_schema(
        mut self,
        schema: &str,
    ) -> Result<Self, InvalidSchema> {
        let schema = validate_identifier(schema)?;
        self.statements = Arc::new(Statements::new(&schema));
        Ok(self)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Writes one event on the caller's connection.
    ///
    /// Pass a connection borrowed from the transaction holding the domain
    /// writes, so both commit or roll back together.
    #[tracing::instrument(
        skip(self, conn, message),
        fields(
            event_id = %message.event_id,
            event_type = %message.event_type,
            aggregate_id = %message.aggregate_id,
        ),
        err
    )]
    pub async fn enqueue(
        &self,
        conn: &mut PgConnection,
        message: &OutboxMessage,
    ) -> Result<OutboxEvent, sqlx::Error> {
        let now = Utc::now();
        sqlx::query_as::<_, OutboxEvent>(&self.statements.enqueue)
            .bind(message.event_id)
            .bind(&message.aggregate_type)
            .bind(message.aggregate_id)
            .bind(&message.event_type)
            .bind(&message.payload)
            .bind(Json(&message.headers))
            .bind(message.occurred_at.unwrap_or(now))
            .bind(message.available_at.unwrap_or(now))
            .fetch_one(&mut *conn)
            .await
    }

    /// Writes many events on the caller's connection, returns the row count.
    #[tracing::instrument(
        skip(self, conn, messages),
        fields(count = messages.len()),
        err
    )]
    pub async fn enqueue_many(
        &self,
        conn: &mut PgConnection,
        messages: &[OutboxMessage],
    ) -> Result<u64, sqlx::Error> {
        let now = Utc::now();
        let mut inserted = 0;

        for chunk in messages.chunks(ENQUEUE_CHUNK) {
            let mut query_builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} (
                    event_id, aggregate_type, aggregate_id, event_type,
                    payload, headers, occurred_at, available_at
                ) ",
                self.statements.outbox_table
            ));
            query_builder.push_values(chunk, |mut row, message| {
                row.push_bind(message.event_id)
                    .push_bind(&message.aggregate_type)
                    .push_bind(message.aggregate_id)
                    .push_bind(&message.event_type)
                    .push_bind(&message.payload)
                    .push_bind(Json(&message.headers))
                    .push_bind(message.occurred_at.unwrap_or(now))
                    .push_bind(message.available_at.unwrap_or(now));
            });

            inserted += query_builder
                .build()
                .execute(&mut *conn)
                .await?
                .rows_affected();
        }

        Ok(inserted)
    }

    pub async fn get_outbox_event(
        &self,
        event_id: Uuid,
    ) -> Result<Option<OutboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, OutboxEvent>(&self.statements.get_outbox_event)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    #[tracing::instrument(
        skip(self),
        fields(
            available_before = %available_before,
            stale_before = %stale_before,
        ),
        level = "debug",
        err
    )]
    async fn claim_pending(
        &self,
        available_before: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: usize,
        lease_token: Uuid,
    ) -> Result<Vec<OutboxEvent>, sqlx::Error> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        sqlx::query_as::<_, OutboxEvent>(&self.statements.claim_pending)
            .bind(available_before)
            .bind(stale_before)
            .bind(limit)
            .bind(lease_token)
            .bind(Utc::now())
            .fetch_all(&self.pool)
            .await
    }

    #[tracing::instrument(skip(self), level = "debug", err)]
    async fn mark_published(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
        published_at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(&self.statements.mark_published)
            .bind(event_id)
            .bind(lease_token)
            .bind(published_at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, last_error), level = "debug", err)]
    async fn reschedule(
        &self,
        event_id: Uuid,
        lease_token: Uuid,
        next_available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(&self.statements.reschedule)
            .bind(event_id)
            .bind(lease_token)
            .bind(next_available_at)
            .bind(last_error)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn count_pending(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(&self.statements.count_pending)
            .fetch_one(&self.pool)
            .await
    }
}
