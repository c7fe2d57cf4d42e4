use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskhub_core::models::FileRecord;
use taskhub_core::traits::FileRepository;
use taskhub_core::HubResult;
use tracing::instrument;

use super::sequence::next_id;
use crate::database::Database;

const FILE_SELECT: &str =
    "SELECT id, name, encoding, path, expiration, create_user, create_time FROM file";

pub struct SqliteFileRepository {
    db: Database,
}

impl SqliteFileRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_file(row: &SqliteRow) -> HubResult<FileRecord> {
        Ok(FileRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            encoding: row.try_get("encoding")?,
            path: row.try_get("path")?,
            expiration: row.try_get("expiration")?,
            create_user: row.try_get("create_user")?,
            create_time: row.try_get("create_time")?,
        })
    }
}

#[async_trait]
impl FileRepository for SqliteFileRepository {
    #[instrument(skip(self, root))]
    async fn create(
        &self,
        name: &str,
        encoding: &str,
        root: &Path,
        create_user: &str,
    ) -> HubResult<FileRecord> {
        let mut tx = self.db.begin_write().await?;
        let id = next_id(&mut tx, "file").await?;
        let file = FileRecord {
            id,
            name: name.to_string(),
            encoding: encoding.to_string(),
            path: root.join(id.to_string()).to_string_lossy().into_owned(),
            expiration: None,
            create_user: create_user.to_string(),
            create_time: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO file (id, name, encoding, path, expiration, create_user, create_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(file.id)
        .bind(file.name.as_str())
        .bind(file.encoding.as_str())
        .bind(file.path.as_str())
        .bind(file.expiration)
        .bind(file.create_user.as_str())
        .bind(file.create_time)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(file)
    }

    async fn get(&self, id: i64) -> HubResult<Option<FileRecord>> {
        let sql = format!("{FILE_SELECT} WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(Self::row_to_file).transpose()
    }

    async fn list(&self) -> HubResult<Vec<FileRecord>> {
        let sql = format!("{FILE_SELECT} ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
        rows.iter().map(Self::row_to_file).collect()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> HubResult<bool> {
        let mut tx = self.db.begin_write().await?;
        let result = sqlx::query("DELETE FROM file WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_expiration(&self, id: i64, expiration: Option<DateTime<Utc>>) -> HubResult<()> {
        let mut tx = self.db.begin_write().await?;
        sqlx::query("UPDATE file SET expiration = ? WHERE id = ?")
            .bind(expiration)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> HubResult<Vec<FileRecord>> {
        let sql = format!("{FILE_SELECT} WHERE expiration IS NOT NULL AND expiration < ? ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(now)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(Self::row_to_file).collect()
    }
}
