use sqlx::SqliteConnection;

use super::StorageError;

/// Single-row table of process-wide flags. The row is created by schema
/// bootstrap so reads never miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct System {
    pub bootstrap_token_created: bool,
    pub ignore_pipeline_run_events: bool,
}

pub async fn get(conn: &mut SqliteConnection) -> Result<System, StorageError> {
    sqlx::query_as::<_, System>(
        "SELECT bootstrap_token_created, ignore_pipeline_run_events FROM system WHERE id = 1",
    )
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn update(
    conn: &mut SqliteConnection,
    bootstrap_token_created: Option<bool>,
    ignore_pipeline_run_events: Option<bool>,
) -> Result<(), StorageError> {
    sqlx::query(
        "UPDATE system SET \
         bootstrap_token_created = COALESCE(?, bootstrap_token_created), \
         ignore_pipeline_run_events = COALESCE(?, ignore_pipeline_run_events) \
         WHERE id = 1",
    )
    .bind(bootstrap_token_created)
    .bind(ignore_pipeline_run_events)
    .execute(conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::temp_db;

    #[tokio::test]
    async fn flags_default_off_and_persist() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();

        let flags = get(&mut conn).await.unwrap();
        assert!(!flags.bootstrap_token_created);
        assert!(!flags.ignore_pipeline_run_events);

        update(&mut conn, Some(true), None).await.unwrap();
        let flags = get(&mut conn).await.unwrap();
        assert!(flags.bootstrap_token_created);
        assert!(!flags.ignore_pipeline_run_events);
    }
}
