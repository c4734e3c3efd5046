use sqlx::SqliteConnection;

use super::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Subscription {
    pub namespace_id: String,
    pub pipeline_id: String,
    pub extension_name: String,
    pub extension_label: String,
    pub settings: String,
    pub status: String,
}

pub async fn insert(
    conn: &mut SqliteConnection,
    subscription: &Subscription,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO pipeline_subscriptions \
         (namespace_id, pipeline_id, extension_name, extension_label, settings, status) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&subscription.namespace_id)
    .bind(&subscription.pipeline_id)
    .bind(&subscription.extension_name)
    .bind(&subscription.extension_label)
    .bind(&subscription.settings)
    .bind(&subscription.status)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    extension_name: &str,
    extension_label: &str,
) -> Result<Subscription, StorageError> {
    sqlx::query_as::<_, Subscription>(
        "SELECT namespace_id, pipeline_id, extension_name, extension_label, settings, status \
         FROM pipeline_subscriptions \
         WHERE namespace_id = ? AND pipeline_id = ? AND extension_name = ? AND extension_label = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(extension_name)
    .bind(extension_label)
    .fetch_optional(conn)
    .await?
    .ok_or(StorageError::NotFound)
}

pub async fn list(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
) -> Result<Vec<Subscription>, StorageError> {
    let subscriptions = sqlx::query_as::<_, Subscription>(
        "SELECT namespace_id, pipeline_id, extension_name, extension_label, settings, status \
         FROM pipeline_subscriptions WHERE namespace_id = ? AND pipeline_id = ? \
         ORDER BY extension_name, extension_label",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .fetch_all(conn)
    .await?;

    Ok(subscriptions)
}

/// Every subscription pointed at an extension, across all pipelines. Used
/// when an extension is uninstalled or fires an event.
pub async fn list_by_extension(
    conn: &mut SqliteConnection,
    extension_name: &str,
) -> Result<Vec<Subscription>, StorageError> {
    let subscriptions = sqlx::query_as::<_, Subscription>(
        "SELECT namespace_id, pipeline_id, extension_name, extension_label, settings, status \
         FROM pipeline_subscriptions WHERE extension_name = ? \
         ORDER BY namespace_id, pipeline_id, extension_label",
    )
    .bind(extension_name)
    .fetch_all(conn)
    .await?;

    Ok(subscriptions)
}

pub async fn update_status(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    extension_name: &str,
    extension_label: &str,
    status: &str,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE pipeline_subscriptions SET status = ? \
         WHERE namespace_id = ? AND pipeline_id = ? AND extension_name = ? AND extension_label = ?",
    )
    .bind(status)
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(extension_name)
    .bind(extension_label)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StorageError::NotFound);
    }

    Ok(())
}

pub async fn delete(
    conn: &mut SqliteConnection,
    namespace_id: &str,
    pipeline_id: &str,
    extension_name: &str,
    extension_label: &str,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "DELETE FROM pipeline_subscriptions \
         WHERE namespace_id = ? AND pipeline_id = ? AND extension_name = ? AND extension_label = ?",
    )
    .bind(namespace_id)
    .bind(pipeline_id)
    .bind(extension_name)
    .bind(extension_label)
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
    use crate::storage::{namespaces, pipeline_metadata, testutil::temp_db};

    #[tokio::test]
    async fn unique_per_pipeline_and_lookup_by_extension() {
        let (_dir, db) = temp_db().await;
        let mut conn = db.conn().await.unwrap();

        namespaces::insert(
            &mut conn,
            &namespaces::Namespace {
                id: "default".into(),
                name: "Default".into(),
                description: String::new(),
                created: 0,
            },
        )
        .await
        .unwrap();

        pipeline_metadata::insert(
            &mut conn,
            &pipeline_metadata::PipelineMetadata {
                namespace_id: "default".into(),
                pipeline_id: "build".into(),
                state: "active".into(),
                created: 0,
                modified: 0,
            },
        )
        .await
        .unwrap();

        let subscription = Subscription {
            namespace_id: "default".into(),
            pipeline_id: "build".into(),
            extension_name: "cron".into(),
            extension_label: "nightly".into(),
            settings: "{}".into(),
            status: "active".into(),
        };

        insert(&mut conn, &subscription).await.unwrap();
        assert!(matches!(
            insert(&mut conn, &subscription).await,
            Err(StorageError::Exists)
        ));

        let by_extension = list_by_extension(&mut conn, "cron").await.unwrap();
        assert_eq!(by_extension.len(), 1);
        assert_eq!(by_extension[0].extension_label, "nightly");

        update_status(&mut conn, "default", "build", "cron", "nightly", "error")
            .await
            .unwrap();
        let fetched = get(&mut conn, "default", "build", "cron", "nightly")
            .await
            .unwrap();
        assert_eq!(fetched.status, "error");
    }
}
