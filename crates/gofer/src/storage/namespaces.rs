use sqlx::SqliteConnection;

use super::{list_limit, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created: i64,
}

pub async fn insert(conn: &mut SqliteConnection, namespace: &Namespace) -> Result<(), StorageError> {
    sqlx::query("INSERT INTO namespaces (id, name, description, created) VALUES (?, ?, ?, ?)")
        .bind(&namespace.id)
        .bind(&namespace.name)
        .bind(&namespace.description)
        .bind(namespace.created)
        .execute(conn)
        .await?;

    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Namespace, StorageError> {
    sqlx::query_as::<_, Namespace>(
        "SELECT id, name, description, created FROM namespaces WHERE id = ?",
    )
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
) -> Result<Vec<Namespace>, StorageError> {
    let namespaces = sqlx::query_as::<_, Namespace>(
        "SELECT id, name, description, created FROM namespaces ORDER BY id LIMIT ? OFFSET ?",
    )
    .bind(list_limit(limit, max_limit))
    .bind(offset as i64)
    .fetch_all(conn)
    .await?;

    Ok(namespaces)
}

pub async fn update(
    conn: &mut SqliteConnection,
    id: &str,
    name: Option<String>,
    description: Option<String>,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE namespaces SET name = COALESCE(?, name), description = COALESCE(?, description) \
         WHERE id = ?",
    )
    .bind(name)
    .bind(description)
    .bind(id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<(), StorageError> {
    let result = sqlx::query("DELETE FROM namespaces WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}
