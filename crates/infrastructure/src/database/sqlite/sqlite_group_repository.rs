use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use taskhub_core::models::{GroupMode, ListQuery, Page, TaskGroup, TaskState};
use taskhub_core::traits::TaskGroupRepository;
use taskhub_core::{HubError, HubResult};
use tracing::{debug, instrument};

use super::sequence::next_id;
use super::sqlite_task_repository::{attach_events, insert_task, row_to_task, update_task};
use crate::database::mapping::{build_where, page_clause, MappingHelpers, GROUP_FIELDS};
use crate::database::Database;

const GROUP_SELECT: &str = "SELECT id, name, kind, addon, extensions, priority, policy, mode, \
    state, bucket_id, data, delete_requested, create_user, create_time FROM task_group";

pub struct SqliteTaskGroupRepository {
    db: Database,
}

impl SqliteTaskGroupRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn row_to_group(row: &SqliteRow) -> HubResult<TaskGroup> {
        let mode: String = row.try_get("mode")?;
        Ok(TaskGroup {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            kind: row.try_get("kind")?,
            addon: row.try_get("addon")?,
            extensions: MappingHelpers::json_column(row, "extensions")?,
            priority: row.try_get("priority")?,
            policy: MappingHelpers::json_column(row, "policy")?,
            mode: mode.parse::<GroupMode>()?,
            state: row.try_get("state")?,
            bucket_id: row.try_get("bucket_id")?,
            data: MappingHelpers::json_column(row, "data")?,
            delete_requested: row.try_get("delete_requested")?,
            create_user: row.try_get("create_user")?,
            create_time: row.try_get("create_time")?,
            tasks: Vec::new(),
        })
    }

    async fn load_members(&self, group: &mut TaskGroup) -> HubResult<()> {
        let rows = sqlx::query(
            "SELECT id, version, name, kind, addon, extensions, locator, priority, policy, ttl, \
             state, pod, node, retries, started, terminated, cancel_requested, reaped, \
             application_id, application_name, platform_id, platform_name, bucket_id, \
             task_group_id, create_user, create_time, update_user, data, errors, attached, token \
             FROM task WHERE task_group_id = ? ORDER BY id ASC",
        )
        .bind(group.id)
        .fetch_all(self.db.pool())
        .await?;
        let mut tasks = rows.iter().map(row_to_task).collect::<HubResult<Vec<_>>>()?;
        attach_events(self.db.pool(), &mut tasks).await?;
        group.tasks = tasks;
        Ok(())
    }

    async fn save_members(conn: &mut SqliteConnection, group: &mut TaskGroup) -> HubResult<()> {
        let existing: Vec<i64> = sqlx::query_scalar("SELECT id FROM task WHERE task_group_id = ?")
            .bind(group.id)
            .fetch_all(&mut *conn)
            .await?;
        let kept: HashSet<i64> = group.tasks.iter().map(|t| t.id).filter(|id| *id != 0).collect();

        for id in existing.into_iter().filter(|id| !kept.contains(id)) {
            sqlx::query("DELETE FROM task WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
        }

        let mut saved = Vec::with_capacity(group.tasks.len());
        for task in &group.tasks {
            let mut task = task.clone();
            task.task_group_id = Some(group.id);
            let task = if task.id == 0 {
                insert_task(conn, &task).await?
            } else {
                update_task(conn, &task).await?
            };
            saved.push(task);
        }
        group.tasks = saved;
        Ok(())
    }
}

#[async_trait]
impl TaskGroupRepository for SqliteTaskGroupRepository {
    #[instrument(skip(self, group), fields(group.name = %group.name))]
    async fn create(&self, group: &TaskGroup) -> HubResult<TaskGroup> {
        let mut tx = self.db.begin_write().await?;
        let id = next_id(&mut tx, "task_group").await?;
        sqlx::query(
            "INSERT INTO task_group (id, name, kind, addon, extensions, priority, policy, mode, \
             state, bucket_id, data, delete_requested, create_user, create_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(group.name.as_str())
        .bind(group.kind.as_str())
        .bind(group.addon.as_str())
        .bind(MappingHelpers::to_json(&group.extensions)?)
        .bind(group.priority)
        .bind(MappingHelpers::to_json(&group.policy)?)
        .bind(group.mode.as_str())
        .bind(group.state)
        .bind(group.bucket_id)
        .bind(MappingHelpers::to_json(&group.data)?)
        .bind(group.delete_requested)
        .bind(group.create_user.as_str())
        .bind(group.create_time)
        .execute(&mut *tx)
        .await?;

        let mut created = group.clone();
        created.id = id;
        Self::save_members(&mut tx, &mut created).await?;
        tx.commit().await?;
        debug!("创建任务组 {}，成员 {} 个", id, created.tasks.len());
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: i64) -> HubResult<Option<TaskGroup>> {
        let sql = format!("{GROUP_SELECT} WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        match row {
            Some(row) => {
                let mut group = Self::row_to_group(&row)?;
                self.load_members(&mut group).await?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, group), fields(group.id = group.id))]
    async fn update(&self, group: &TaskGroup) -> HubResult<TaskGroup> {
        let mut tx = self.db.begin_write().await?;
        let result = sqlx::query(
            "UPDATE task_group SET name = ?, kind = ?, addon = ?, extensions = ?, priority = ?, \
             policy = ?, mode = ?, state = ?, bucket_id = ?, data = ?, delete_requested = ? \
             WHERE id = ?",
        )
        .bind(group.name.as_str())
        .bind(group.kind.as_str())
        .bind(group.addon.as_str())
        .bind(MappingHelpers::to_json(&group.extensions)?)
        .bind(group.priority)
        .bind(MappingHelpers::to_json(&group.policy)?)
        .bind(group.mode.as_str())
        .bind(group.state)
        .bind(group.bucket_id)
        .bind(MappingHelpers::to_json(&group.data)?)
        .bind(group.delete_requested)
        .bind(group.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(HubError::not_found("TaskGroup", group.id));
        }

        let mut updated = group.clone();
        Self::save_members(&mut tx, &mut updated).await?;
        tx.commit().await?;
        Ok(updated)
    }

    #[instrument(skip(self, query))]
    async fn list(&self, query: &ListQuery) -> HubResult<Page<TaskGroup>> {
        let clause = build_where(query, GROUP_FIELDS)?;
        let count_sql = format!("SELECT COUNT(*) FROM task_group{}", clause.sql);
        let total: i64 = clause
            .bind_scalar(sqlx::query_scalar(&count_sql))
            .fetch_one(self.db.pool())
            .await?;

        let sql = format!("{GROUP_SELECT}{} ORDER BY id{}", clause.sql, page_clause(query));
        let rows = clause.bind(sqlx::query(&sql)).fetch_all(self.db.pool()).await?;
        let mut items = rows
            .iter()
            .map(Self::row_to_group)
            .collect::<HubResult<Vec<_>>>()?;
        for group in items.iter_mut() {
            self.load_members(group).await?;
        }
        Ok(Page { items, total })
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> HubResult<Vec<TaskGroup>> {
        let sql = format!("{GROUP_SELECT} WHERE state = 'Ready' OR delete_requested = 1 ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
        let mut groups = rows
            .iter()
            .map(Self::row_to_group)
            .collect::<HubResult<Vec<_>>>()?;
        for group in groups.iter_mut() {
            self.load_members(group).await?;
        }
        Ok(groups)
    }

    #[instrument(skip(self))]
    async fn set_state(&self, id: i64, state: TaskState) -> HubResult<()> {
        let mut tx = self.db.begin_write().await?;
        sqlx::query("UPDATE task_group SET state = ? WHERE id = ?")
            .bind(state)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    #[instrument(skip(self))]
    async fn request_delete(&self, id: i64) -> HubResult<bool> {
        let mut tx = self.db.begin_write().await?;
        let result = sqlx::query("UPDATE task_group SET delete_requested = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> HubResult<bool> {
        let mut tx = self.db.begin_write().await?;
        sqlx::query("DELETE FROM task WHERE task_group_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM task_group WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}
