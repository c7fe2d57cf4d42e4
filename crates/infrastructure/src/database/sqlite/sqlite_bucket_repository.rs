use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskhub_core::models::Bucket;
use taskhub_core::traits::BucketRepository;
use taskhub_core::HubResult;
use tracing::instrument;

use super::sequence::next_id;
use crate::database::Database;

pub struct SqliteBucketRepository {
    db: Database,
}

impl SqliteBucketRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_bucket(row: &SqliteRow) -> HubResult<Bucket> {
        Ok(Bucket {
            id: row.try_get("id")?,
            path: row.try_get("path")?,
            expiration: row.try_get("expiration")?,
            create_user: row.try_get("create_user")?,
            create_time: row.try_get("create_time")?,
        })
    }
}

#[async_trait]
impl BucketRepository for SqliteBucketRepository {
    #[instrument(skip(self, root))]
    async fn create(&self, root: &Path, create_user: &str) -> HubResult<Bucket> {
        let mut tx = self.db.begin_write().await?;
        let id = next_id(&mut tx, "bucket").await?;
        let bucket = Bucket {
            id,
            path: root.join(id.to_string()).to_string_lossy().into_owned(),
            expiration: None,
            create_user: create_user.to_string(),
            create_time: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO bucket (id, path, expiration, create_user, create_time) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bucket.id)
        .bind(bucket.path.as_str())
        .bind(bucket.expiration)
        .bind(bucket.create_user.as_str())
        .bind(bucket.create_time)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(bucket)
    }

    async fn get(&self, id: i64) -> HubResult<Option<Bucket>> {
        let row = sqlx::query(
            "SELECT id, path, expiration, create_user, create_time FROM bucket WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(Self::row_to_bucket).transpose()
    }

    async fn list(&self) -> HubResult<Vec<Bucket>> {
        let rows = sqlx::query(
            "SELECT id, path, expiration, create_user, create_time FROM bucket ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(Self::row_to_bucket).collect()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> HubResult<bool> {
        let mut tx = self.db.begin_write().await?;
        let result = sqlx::query("DELETE FROM bucket WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_expiration(&self, id: i64, expiration: Option<DateTime<Utc>>) -> HubResult<()> {
        let mut tx = self.db.begin_write().await?;
        sqlx::query("UPDATE bucket SET expiration = ? WHERE id = ?")
            .bind(expiration)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn referenced(&self) -> HubResult<HashSet<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT bucket_id FROM task WHERE bucket_id IS NOT NULL \
             UNION SELECT bucket_id FROM task_group WHERE bucket_id IS NOT NULL",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(ids.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_expiration() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("hub.db")).await.unwrap();
        let repo = SqliteBucketRepository::new(db);

        let bucket = repo.create(Path::new("/buckets"), "admin").await.unwrap();
        assert_eq!(bucket.path, "/buckets/1");
        assert!(repo.referenced().await.unwrap().is_empty());

        let when = Utc::now();
        repo.set_expiration(bucket.id, Some(when)).await.unwrap();
        let loaded = repo.get(bucket.id).await.unwrap().unwrap();
        assert!(loaded.expiration.is_some());

        repo.set_expiration(bucket.id, None).await.unwrap();
        assert!(repo.get(bucket.id).await.unwrap().unwrap().expiration.is_none());
        assert!(repo.delete(bucket.id).await.unwrap());
        assert!(repo.list().await.unwrap().is_empty());
    }
}
