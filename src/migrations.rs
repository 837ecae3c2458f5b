use crate::store::DEFAULT_SCHEMA;
use sqlx::{migrate::Migrator, Acquire, Postgres};

static MIGRATOR: Migrator = sqlx::migrate!();

/// Creates the outbox and inbox tables in the `fx_outbox` schema.
///
/// Safe to call on every start. The migration history lives in
/// `fx_outbox._sqlx_migrations`, apart from the application's own.
pub async fn run_migrations<'a, A>(conn: A) -> Result<(), sqlx::Error>
where
    A: Acquire<'a, Database = Postgres>,
{
    let mut tx = conn.begin().await?;
    sqlx::raw_sql(&scoped_to(DEFAULT_SCHEMA))
        .execute(&mut *tx)
        .await?;
    MIGRATOR.run(&mut *tx).await?;
    tx.commit().await?;

    tracing::info!(
        schema = DEFAULT_SCHEMA,
        migrations = MIGRATOR.iter().count(),
        "Outbox schema is up to date"
    );
    Ok(())
}

/// Makes `schema` exist and hold the migrator's history table for the rest
/// of the transaction.
fn scoped_to(schema: &str) -> String {
    format!(
        "CREATE SCHEMA IF NOT EXISTS {schema}; \
         SET LOCAL search_path TO {schema};"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_scopes_the_migration_to_the_outbox_schema() {
        assert_eq!(
            scoped_to(DEFAULT_SCHEMA),
            "CREATE SCHEMA IF NOT EXISTS fx_outbox; \
             SET LOCAL search_path TO fx_outbox;"
        );
    }
}
