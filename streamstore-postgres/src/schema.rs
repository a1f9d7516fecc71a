//! Schema initialization and teardown for the Postgres stream store.
//!
//! Both entry points are idempotent and are typically executed during
//! application startup or via the `streamstore` CLI.
use sqlx::PgPool;

use crate::Error;

/// Creates the tables, constraints, and the notification trigger.
pub async fn init(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(include_str!("store/sql/table_stream.sql"))
        .execute(pool)
        .await?;
    sqlx::query(include_str!("store/sql/table_message.sql"))
        .execute(pool)
        .await?;
    sqlx::query(include_str!("store/sql/fn_notify_messages.sql"))
        .execute(pool)
        .await?;
    sqlx::query(include_str!("store/sql/trigger_notify_messages.sql"))
        .execute(pool)
        .await?;
    Ok(())
}

/// Drops everything [`init`] created. Dropping the tables drops the trigger
/// with them.
pub async fn teardown(pool: &PgPool) -> Result<(), Error> {
    sqlx::query("DROP TABLE IF EXISTS message")
        .execute(pool)
        .await?;
    sqlx::query("DROP TABLE IF EXISTS stream")
        .execute(pool)
        .await?;
    sqlx::query("DROP FUNCTION IF EXISTS streamstore_notify_messages")
        .execute(pool)
        .await?;
    Ok(())
}
