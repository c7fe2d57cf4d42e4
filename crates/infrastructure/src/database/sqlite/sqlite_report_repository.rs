use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskhub_core::models::{ReportStatus, TaskReport};
use taskhub_core::traits::ReportRepository;
use taskhub_core::HubResult;
use tracing::instrument;

use crate::database::mapping::MappingHelpers;
use crate::database::Database;

pub struct SqliteReportRepository {
    db: Database,
}

impl SqliteReportRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_report(row: &SqliteRow) -> HubResult<TaskReport> {
        let status: String = row.try_get("status")?;
        Ok(TaskReport {
            task_id: row.try_get("task_id")?,
            generation: row.try_get("generation")?,
            status: status.parse::<ReportStatus>()?,
            total: row.try_get("total")?,
            completed: row.try_get("completed")?,
            activity: MappingHelpers::json_column(row, "activity")?,
            errors: MappingHelpers::json_column(row, "errors")?,
            attached: MappingHelpers::json_column(row, "attached")?,
            result: MappingHelpers::json_column(row, "result")?,
            update_time: row.try_get("update_time")?,
        })
    }
}

#[async_trait]
impl ReportRepository for SqliteReportRepository {
    #[instrument(skip(self))]
    async fn get(&self, task_id: i64) -> HubResult<Option<TaskReport>> {
        let row = sqlx::query(
            "SELECT task_id, generation, status, total, completed, activity, errors, attached, \
             result, update_time FROM task_report WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(Self::row_to_report).transpose()
    }

    #[instrument(skip(self, report), fields(task.id = report.task_id))]
    async fn save(&self, report: &TaskReport) -> HubResult<()> {
        let mut tx = self.db.begin_write().await?;
        sqlx::query(
            "INSERT INTO task_report (task_id, generation, status, total, completed, activity, \
             errors, attached, result, update_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET generation = excluded.generation, \
             status = excluded.status, total = excluded.total, completed = excluded.completed, \
             activity = excluded.activity, errors = excluded.errors, attached = excluded.attached, \
             result = excluded.result, update_time = excluded.update_time",
        )
        .bind(report.task_id)
        .bind(report.generation)
        .bind(report.status.as_str())
        .bind(report.total)
        .bind(report.completed)
        .bind(MappingHelpers::to_json(&report.activity)?)
        .bind(MappingHelpers::to_json(&report.errors)?)
        .bind(MappingHelpers::to_json(&report.attached)?)
        .bind(MappingHelpers::to_json(&report.result)?)
        .bind(report.update_time)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, task_id: i64) -> HubResult<bool> {
        let mut tx = self.db.begin_write().await?;
        let result = sqlx::query("DELETE FROM task_report WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
