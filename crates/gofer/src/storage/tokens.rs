use sqlx::SqliteConnection;

use super::{list_limit, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Token {
    pub id: String,
    pub hash: String,
    pub kind: String,
    pub namespaces: String,
    pub metadata: String,
    pub created: i64,
    pub expires: i64,
    pub disabled: bool,
}

pub async fn insert(conn: &mut SqliteConnection, token: &Token) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO tokens (id, hash, kind, namespaces, metadata, created, expires, disabled) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&token.id)
    .bind(&token.hash)
    .bind(&token.kind)
    .bind(&token.namespaces)
    .bind(&token.metadata)
    .bind(token.created)
    .bind(token.expires)
    .bind(token.disabled)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<Token, StorageError> {
    sqlx::query_as::<_, Token>(
        "SELECT id, hash, kind, namespaces, metadata, created, expires, disabled \
         FROM tokens WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn get_by_hash(conn: &mut SqliteConnection, hash: &str) -> Result<Token, StorageError> {
    sqlx::query_as::<_, Token>(
        "SELECT id, hash, kind, namespaces, metadata, created, expires, disabled \
         FROM tokens WHERE hash = ?",
    )
    .bind(hash)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn list(
    conn: &mut SqliteConnection,
    offset: u64,
    limit: u64,
    max_limit: u64,
) -> Result<Vec<Token>, StorageError> {
    let tokens = sqlx::query_as::<_, Token>(
        "SELECT id, hash, kind, namespaces, metadata, created, expires, disabled \
         FROM tokens ORDER BY created LIMIT ? OFFSET ?",
    )
    .bind(list_limit(limit, max_limit))
    .bind(offset as i64)
    .fetch_all(conn)
    .await?;

    Ok(tokens)
}

pub async fn set_disabled(
    conn: &mut SqliteConnection,
    id: &str,
    disabled: bool,
) -> Result<(), StorageError> {
    let result = sqlx::query("UPDATE tokens SET disabled = ? WHERE id = ?")
        .bind(disabled)
        .bind(id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<(), StorageError> {
    let result = sqlx::query("DELETE FROM tokens WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testutil::temp_db;

    fn sample(id: &str, hash: &str) -> Token {
        Token {
            id: id.into(),
            hash: hash.into(),
            kind: "client".into(),
            namespaces: "[\"default\"]".into(),
            metadata: "{}".into(),
            created: 1,
            expires: 0,
            disabled: false,
        }
    }

    #[tokio::test]
    async fn hash_lookup_and_disable() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();

        insert(&mut conn, &sample("t1", "abc")).await.unwrap();

        // Hash uniqueness is enforced by the table.
        assert!(matches!(
            insert(&mut conn, &sample("t2", "abc")).await,
            Err(StorageError::Exists)
        ));

        let token = get_by_hash(&mut conn, "abc").await.unwrap();
        assert_eq!(token.id, "t1");

        set_disabled(&mut conn, "t1", true).await.unwrap();
        assert!(get(&mut conn, "t1").await.unwrap().disabled);
    }
}
