use sqlx::SqliteConnection;

use super::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ExtensionRegistration {
    pub name: String,
    pub image: String,
    pub registry_auth: Option<String>,
    pub variables: String,
    pub status: String,
    pub key_id: String,
    pub created: i64,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    registration: &ExtensionRegistration,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO extension_registrations \
         (name, image, registry_auth, variables, status, key_id, created) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&registration.name)
    .bind(&registration.image)
    .bind(&registration.registry_auth)
    .bind(&registration.variables)
    .bind(&registration.status)
    .bind(&registration.key_id)
    .bind(registration.created)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<ExtensionRegistration, StorageError> {
    sqlx::query_as::<_, ExtensionRegistration>(
        "SELECT name, image, registry_auth, variables, status, key_id, created \
         FROM extension_registrations WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn list(
    conn: &mut SqliteConnection,
) -> Result<Vec<ExtensionRegistration>, StorageError> {
    let registrations = sqlx::query_as::<_, ExtensionRegistration>(
        "SELECT name, image, registry_auth, variables, status, key_id, created \
         FROM extension_registrations ORDER BY name",
    )
    .fetch_all(conn)
    .await?;

    Ok(registrations)
}

pub async fn update_status(
    conn: &mut SqliteConnection,
    name: &str,
    status: &str,
) -> Result<(), StorageError> {
    let result = sqlx::query("UPDATE extension_registrations SET status = ? WHERE name = ?")
        .bind(status)
        .bind(name)
        .execute(conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, name: &str) -> Result<(), StorageError> {
    let result = sqlx::query("DELETE FROM extension_registrations WHERE name = ?")
        .bind(name)
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

    #[tokio::test]
    async fn registration_lifecycle() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();

        let registration = ExtensionRegistration {
            name: "cron".into(),
            image: "ghcr.io/gofer-run/extensions/cron:latest".into(),
            registry_auth: None,
            variables: "[]".into(),
            status: "enabled".into(),
            key_id: "key_1".into(),
            created: 5,
        };

        insert(&mut conn, &registration).await.unwrap();
        assert!(matches!(
            insert(&mut conn, &registration).await,
            Err(StorageError::Exists)
        ));

        update_status(&mut conn, "cron", "disabled").await.unwrap();
        assert_eq!(get(&mut conn, "cron").await.unwrap().status, "disabled");

        delete(&mut conn, "cron").await.unwrap();
        assert!(matches!(
            get(&mut conn, "cron").await,
            Err(StorageError::NotFound)
        ));
    }
}
