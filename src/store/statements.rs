const OUTBOX_COLUMNS: &str = "event_id, aggregate_type, aggregate_id, \
     event_type, payload, headers, occurred_at, available_at, published_at, \
     delivery_attempts, last_error, lock_token, locked_at";

const INBOX_COLUMNS: &str = "event_id, source_service, event_type, \
     aggregate_type, aggregate_id, payload, received_at, processed_at, \
     last_error";

/// Schema qualified SQL, rendered once per store.
#[derive(Debug)]
pub(crate) struct Statements {
    pub outbox_table: String,
    pub enqueue: String,
    pub claim_pending: String,
    pub mark_published: String,
    pub reschedule: String,
    pub count_pending: String,
    pub get_outbox_event: String,
    pub record_inbox_event: String,
    pub get_inbox_event: String,
    pub mark_inbox_processed: String,
    pub record_inbox_error: String,
}

impl Statements {
    /// `schema` must already be a validated identifier.
    pub fn new(schema: &str) -> Self {
        let outbox = format!("{schema}.outbox_events");
        let inbox = format!("{schema}.inbox_events");

        Self {
            enqueue: format!(
                "INSERT INTO {outbox} (
                    event_id, aggregate_type, aggregate_id, event_type,
                    payload, headers, occurred_at, available_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING {OUTBOX_COLUMNS}"
            ),
            // One statement: rows locked by a concurrent claim are skipped,
            // so distinct leases never receive the same row
            claim_pending: format!(
                "WITH claimable AS (
                    SELECT event_id
                    FROM {outbox}
                    WHERE published_at IS NULL
                      AND available_at <= $1
                      AND (lock_token IS NULL OR locked_at < $2)
                    ORDER BY available_at ASC, occurred_at ASC
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE {outbox} e
                SET lock_token = $4, locked_at = $5
                FROM claimable
                WHERE e.event_id = claimable.event_id
                RETURNING {}",
                qualified("e", OUTBOX_COLUMNS)
            ),
            mark_published: format!(
                "UPDATE {outbox}
                SET published_at = $3,
                    delivery_attempts = delivery_attempts + 1,
                    lock_token = NULL,
                    locked_at = NULL
                WHERE event_id = $1
                  AND lock_token = $2
                  AND published_at IS NULL"
            ),
            reschedule: format!(
                "UPDATE {outbox}
                SET available_at = $3,
                    last_error = $4,
                    delivery_attempts = delivery_attempts + 1,
                    lock_token = NULL,
                    locked_at = NULL
                WHERE event_id = $1
                  AND lock_token = $2
                  AND published_at IS NULL"
            ),
            count_pending: format!(
                "SELECT COUNT(*) FROM {outbox} WHERE published_at IS NULL"
            ),
            get_outbox_event: format!(
                "SELECT {OUTBOX_COLUMNS} FROM {outbox} WHERE event_id = $1"
            ),
            record_inbox_event: format!(
                "INSERT INTO {inbox} (
                    event_id, source_service, event_type, aggregate_type,
                    aggregate_id, payload, received_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (event_id) DO NOTHING"
            ),
            get_inbox_event: format!(
                "SELECT {INBOX_COLUMNS} FROM {inbox} WHERE event_id = $1"
            ),
            mark_inbox_processed: format!(
                "UPDATE {inbox} SET processed_at = $2 WHERE event_id = $1"
            ),
            record_inbox_error: format!(
                "UPDATE {inbox} SET last_error = $2 WHERE event_id = $1"
            ),
            outbox_table: outbox,
        }
    }
}

fn qualified(
    alias: &str,
    columns: &str,
) -> String {
    columns
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
