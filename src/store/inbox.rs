use super::{InboxStore, PgOutboxStore};
use crate::models::InboxEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

#[async_trait]
impl InboxStore for PgOutboxStore {
    #[tracing::instrument(
        skip(self, conn, event),
        fields(event_id = %event.event_id, event_type = %event.event_type),
        level = "debug",
        err
    )]
    async fn record_inbox_event(
        &self,
        conn: &mut PgConnection,
        event: &InboxEvent,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(&self.statements.record_inbox_event)
            .bind(event.event_id)
            .bind(&event.source_service)
            .bind(&event.event_type)
            .bind(&event.aggregate_type)
            .bind(event.aggregate_id)
            .bind(&event.payload)
            .bind(event.received_at)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_inbox_event(
        &self,
        conn: &mut PgConnection,
        event_id: Uuid,
    ) -> Result<Option<InboxEvent>, sqlx::Error> {
        sqlx::query_as::<_, InboxEvent>(&self.statements.get_inbox_event)
            .bind(event_id)
            .fetch_optional(&mut *conn)
            .await
    }

    #[tracing::instrument(skip(self, conn), level = "debug", err)]
    async fn mark_inbox_processed(
        &self,
        conn: &mut PgConnection,
        event_id: Uuid,
        processed_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&self.statements.mark_inbox_processed)
            .bind(event_id)
            .bind(processed_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, conn), level = "debug", err)]
    async fn record_inbox_error(
        &self,
        conn: &mut PgConnection,
        event_id: Uuid,
        error: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(&self.statements.record_inbox_error)
            .bind(event_id)
            .bind(error)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
