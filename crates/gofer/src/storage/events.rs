use sqlx::SqliteConnection;

use super::{list_limit, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Event {
    pub id: i64,
    pub kind: String,
    pub details: String,
    pub emitted: i64,
}

/// Insert an event and return the id sqlite assigned. The event bus wraps
/// this call in a mutex so assigned ids follow publication order.
pub async fn insert(
    conn: &mut SqliteConnection,
    kind: &str,
    details: &str,
    emitted: i64,
) -> Result<i64, StorageError> {
    let result = sqlx::query("INSERT INTO events (kind, details, emitted) VALUES (?, ?, ?)")
        .bind(kind)
        .bind(details)
        .bind(emitted)
        .execute(conn)
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn get(conn: &mut SqliteConnection, id: i64) -> Result<Event, StorageError> {
    sqlx::query_as::<_, Event>("SELECT id, kind, details, emitted FROM events WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(StorageError::NotFound)
}

pub async fn list(
    conn: &mut SqliteConnection,
    offset: u64,
    limit: u64,
    max_limit: u64,
    reverse: bool,
) -> Result<Vec<Event>, StorageError> {
    let order = if reverse { "DESC" } else { "ASC" };
    let query =
        format!("SELECT id, kind, details, emitted FROM events ORDER BY id {order} LIMIT ? OFFSET ?");

    let events = sqlx::query_as::<_, Event>(&query)
        .bind(list_limit(limit, max_limit))
        .bind(offset as i64)
        .fetch_all(conn)
        .await?;

    Ok(events)
}

/// Page of events with ids at or after `from_id`, oldest first.
pub async fn list_from(
    conn: &mut SqliteConnection,
    from_id: i64,
    limit: u64,
) -> Result<Vec<Event>, StorageError> {
    let events = sqlx::query_as::<_, Event>(
        "SELECT id, kind, details, emitted FROM events WHERE id >= ? ORDER BY id LIMIT ?",
    )
    .bind(from_id)
    .bind(limit as i64)
    .fetch_all(conn)
    .await?;

    Ok(events)
}

/// Remove events emitted before the cutoff; returns how many were deleted.
pub async fn prune_before(
    conn: &mut SqliteConnection,
    emitted_cutoff: i64,
) -> Result<u64, StorageError> {
    let result = sqlx::query("DELETE FROM events WHERE emitted < ?")
        .bind(emitted_cutoff)
        .execute(conn)
        .await?;

    Ok(result.rows_affected())
}
