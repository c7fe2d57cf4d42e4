use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use taskhub_core::models::{ListQuery, Page, PodRef, QueueReport, Ref, Task, TaskEvent, TaskState};
use taskhub_core::traits::TaskRepository;
use taskhub_core::{HubError, HubResult};
use tracing::{debug, instrument};

use super::sequence::next_id;
use crate::database::mapping::{build_where, page_clause, MappingHelpers, TASK_FIELDS};
use crate::database::Database;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// 除 id/version 外的可写列，顺序与 [`bind_task`] 一致
const TASK_WRITE_COLUMNS: [&str; 29] = [
    "name",
    "kind",
    "addon",
    "extensions",
    "locator",
    "priority",
    "policy",
    "ttl",
    "state",
    "pod",
    "node",
    "retries",
    "started",
    "terminated",
    "cancel_requested",
    "reaped",
    "application_id",
    "application_name",
    "platform_id",
    "platform_name",
    "bucket_id",
    "task_group_id",
    "create_user",
    "create_time",
    "update_user",
    "data",
    "errors",
    "attached",
    "token",
];

const TASK_SELECT: &str = "SELECT id, version, name, kind, addon, extensions, locator, priority, \
    policy, ttl, state, pod, node, retries, started, terminated, cancel_requested, reaped, \
    application_id, application_name, platform_id, platform_name, bucket_id, task_group_id, \
    create_user, create_time, update_user, data, errors, attached, token FROM task";

pub struct SqliteTaskRepository {
    db: Database,
}

impl SqliteTaskRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

fn bind_task<'q>(query: SqliteQuery<'q>, task: &'q Task) -> HubResult<SqliteQuery<'q>> {
    Ok(query
        .bind(task.name.as_str())
        .bind(task.kind.as_str())
        .bind(task.addon.as_str())
        .bind(MappingHelpers::to_json(&task.extensions)?)
        .bind(task.locator.as_str())
        .bind(task.priority)
        .bind(MappingHelpers::to_json(&task.policy)?)
        .bind(MappingHelpers::to_json(&task.ttl)?)
        .bind(task.state)
        .bind(task.pod.as_ref().map(|p| p.to_string()))
        .bind(task.node.as_deref())
        .bind(task.retries)
        .bind(task.started)
        .bind(task.terminated)
        .bind(task.cancel_requested)
        .bind(task.reaped)
        .bind(task.application.as_ref().map(|r| r.id))
        .bind(task.application.as_ref().map(|r| r.name.as_str()))
        .bind(task.platform.as_ref().map(|r| r.id))
        .bind(task.platform.as_ref().map(|r| r.name.as_str()))
        .bind(task.bucket_id)
        .bind(task.task_group_id)
        .bind(task.create_user.as_str())
        .bind(task.create_time)
        .bind(task.update_user.as_str())
        .bind(MappingHelpers::to_json(&task.data)?)
        .bind(MappingHelpers::to_json(&task.errors)?)
        .bind(MappingHelpers::to_json(&task.attached)?)
        .bind(task.token.as_deref()))
}

fn row_ref(row: &SqliteRow, id_col: &str, name_col: &str) -> HubResult<Option<Ref>> {
    let id: Option<i64> = row.try_get(id_col)?;
    match id {
        Some(id) => {
            let name: Option<String> = row.try_get(name_col)?;
            Ok(Some(Ref {
                id,
                name: name.unwrap_or_default(),
            }))
        }
        None => Ok(None),
    }
}

pub(crate) fn row_to_task(row: &SqliteRow) -> HubResult<Task> {
    let pod: Option<String> = row.try_get("pod")?;
    Ok(Task {
        id: row.try_get("id")?,
        version: row.try_get("version")?,
        name: row.try_get("name")?,
        kind: row.try_get("kind")?,
        addon: row.try_get("addon")?,
        extensions: MappingHelpers::json_column(row, "extensions")?,
        locator: row.try_get("locator")?,
        priority: row.try_get("priority")?,
        policy: MappingHelpers::json_column(row, "policy")?,
        ttl: MappingHelpers::json_column(row, "ttl")?,
        state: row.try_get("state")?,
        pod: pod.map(|p| p.parse::<PodRef>()).transpose()?,
        node: row.try_get("node")?,
        retries: row.try_get("retries")?,
        started: row.try_get("started")?,
        terminated: row.try_get("terminated")?,
        cancel_requested: row.try_get("cancel_requested")?,
        reaped: row.try_get("reaped")?,
        application: row_ref(row, "application_id", "application_name")?,
        platform: row_ref(row, "platform_id", "platform_name")?,
        bucket_id: row.try_get("bucket_id")?,
        task_group_id: row.try_get("task_group_id")?,
        create_user: row.try_get("create_user")?,
        create_time: row.try_get("create_time")?,
        update_user: row.try_get("update_user")?,
        data: MappingHelpers::json_column(row, "data")?,
        events: Vec::new(),
        errors: MappingHelpers::json_column(row, "errors")?,
        attached: MappingHelpers::json_column(row, "attached")?,
        token: row.try_get("token")?,
        report: None,
    })
}

/// 在事务中插入任务及其事件
pub(crate) async fn insert_task(conn: &mut SqliteConnection, task: &Task) -> HubResult<Task> {
    let id = next_id(conn, "task").await?;
    let columns = TASK_WRITE_COLUMNS.join(", ");
    let placeholders = vec!["?"; TASK_WRITE_COLUMNS.len()].join(", ");
    let sql = format!("INSERT INTO task (id, version, {columns}) VALUES (?, 1, {placeholders})");

    bind_task(sqlx::query(&sql).bind(id), task)?
        .execute(&mut *conn)
        .await?;

    let mut created = task.clone();
    created.id = id;
    created.version = 1;
    save_events(conn, &created).await?;
    Ok(created)
}

/// 在事务中按版本号更新任务及其事件
pub(crate) async fn update_task(conn: &mut SqliteConnection, task: &Task) -> HubResult<Task> {
    let assignments: Vec<String> = TASK_WRITE_COLUMNS
        .iter()
        .map(|c| format!("{c} = ?"))
        .collect();
    let sql = format!(
        "UPDATE task SET version = version + 1, {} WHERE id = ? AND version = ?",
        assignments.join(", ")
    );

    let result = bind_task(sqlx::query(&sql), task)?
        .bind(task.id)
        .bind(task.version)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM task WHERE id = ?")
            .bind(task.id)
            .fetch_optional(&mut *conn)
            .await?;
        return match exists {
            Some(_) => Err(HubError::Conflict(format!(
                "任务 {} 版本 {} 已过期",
                task.id, task.version
            ))),
            None => Err(HubError::not_found("Task", task.id)),
        };
    }

    save_events(conn, task).await?;
    let mut updated = task.clone();
    updated.version += 1;
    Ok(updated)
}

/// 事件按 (task_id, seq) 插入或更新计数
pub(crate) async fn save_events(conn: &mut SqliteConnection, task: &Task) -> HubResult<()> {
    for event in &task.events {
        sqlx::query(
            "INSERT INTO task_event (task_id, seq, kind, count, reason, time, last) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(task_id, seq) DO UPDATE SET count = excluded.count, last = excluded.last",
        )
        .bind(task.id)
        .bind(event.seq)
        .bind(event.kind.as_str())
        .bind(event.count)
        .bind(event.reason.as_str())
        .bind(event.time)
        .bind(event.last)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// 批量加载任务事件
pub(crate) async fn attach_events(pool: &SqlitePool, tasks: &mut [Task]) -> HubResult<()> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut by_task: HashMap<i64, Vec<TaskEvent>> = HashMap::new();
    for chunk in tasks.chunks(500) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT task_id, seq, kind, count, reason, time, last FROM task_event \
             WHERE task_id IN ({placeholders}) ORDER BY task_id, seq"
        );
        let mut query = sqlx::query(&sql);
        for task in chunk {
            query = query.bind(task.id);
        }
        for row in query.fetch_all(pool).await? {
            let task_id: i64 = row.try_get("task_id")?;
            by_task.entry(task_id).or_default().push(TaskEvent {
                seq: row.try_get("seq")?,
                kind: row.try_get("kind")?,
                count: row.try_get("count")?,
                reason: row.try_get("reason")?,
                time: row.try_get("time")?,
                last: row.try_get("last")?,
            });
        }
    }
    for task in tasks.iter_mut() {
        task.events = by_task.remove(&task.id).unwrap_or_default();
    }
    Ok(())
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task.name = %task.name))]
    async fn create(&self, task: &Task) -> HubResult<Task> {
        let mut tx = self.db.begin_write().await?;
        let created = insert_task(&mut tx, task).await?;
        tx.commit().await?;
        debug!("创建任务 {}", created.id);
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: i64) -> HubResult<Option<Task>> {
        let sql = format!("{TASK_SELECT} WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        match row {
            Some(row) => {
                let mut tasks = vec![row_to_task(&row)?];
                attach_events(self.db.pool(), &mut tasks).await?;
                Ok(tasks.pop())
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, task), fields(task.id = task.id, task.version = task.version))]
    async fn update(&self, task: &Task) -> HubResult<Task> {
        let mut tx = self.db.begin_write().await?;
        let updated = update_task(&mut tx, task).await?;
        tx.commit().await?;
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> HubResult<bool> {
        let mut tx = self.db.begin_write().await?;
        let result = sqlx::query("DELETE FROM task WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, query))]
    async fn list(&self, query: &ListQuery) -> HubResult<Page<Task>> {
        let clause = build_where(query, TASK_FIELDS)?;

        let count_sql = format!("SELECT COUNT(*) FROM task{}", clause.sql);
        let total: i64 = clause
            .bind_scalar(sqlx::query_scalar(&count_sql))
            .fetch_one(self.db.pool())
            .await?;

        let sql = format!(
            "{TASK_SELECT}{} ORDER BY id{}",
            clause.sql,
            page_clause(query)
        );
        let rows = clause.bind(sqlx::query(&sql)).fetch_all(self.db.pool()).await?;
        let mut items = rows.iter().map(row_to_task).collect::<HubResult<Vec<_>>>()?;
        attach_events(self.db.pool(), &mut items).await?;
        Ok(Page { items, total })
    }

    #[instrument(skip(self))]
    async fn list_by_states(&self, states: &[TaskState]) -> HubResult<Vec<Task>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "{TASK_SELECT} WHERE state IN ({placeholders}) ORDER BY priority DESC, id ASC"
        );
        let mut query = sqlx::query(&sql);
        for state in states {
            query = query.bind(*state);
        }
        let rows = query.fetch_all(self.db.pool()).await?;
        let mut tasks = rows.iter().map(row_to_task).collect::<HubResult<Vec<_>>>()?;
        attach_events(self.db.pool(), &mut tasks).await?;
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn list_with_pod(&self) -> HubResult<Vec<Task>> {
        let sql = format!(
            "{TASK_SELECT} WHERE pod IS NOT NULL AND state IN ('Succeeded', 'Failed', 'Canceled') \
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(self.db.pool()).await?;
        let mut tasks = rows.iter().map(row_to_task).collect::<HubResult<Vec<_>>>()?;
        attach_events(self.db.pool(), &mut tasks).await?;
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn list_by_group(&self, group_id: i64) -> HubResult<Vec<Task>> {
        let sql = format!("{TASK_SELECT} WHERE task_group_id = ? ORDER BY id ASC");
        let rows = sqlx::query(&sql)
            .bind(group_id)
            .fetch_all(self.db.pool())
            .await?;
        let mut tasks = rows.iter().map(row_to_task).collect::<HubResult<Vec<_>>>()?;
        attach_events(self.db.pool(), &mut tasks).await?;
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn queue_counts(&self, addon: Option<&str>) -> HubResult<QueueReport> {
        let placeholders = vec!["?"; TaskState::QUEUED.len()].join(", ");
        let mut sql = format!("SELECT state, COUNT(*) AS n FROM task WHERE state IN ({placeholders})");
        if addon.is_some() {
            sql.push_str(" AND addon = ?");
        }
        sql.push_str(" GROUP BY state");

        let mut query = sqlx::query(&sql);
        for state in TaskState::QUEUED {
            query = query.bind(state);
        }
        if let Some(addon) = addon {
            query = query.bind(addon);
        }

        let mut report = QueueReport::default();
        for row in query.fetch_all(self.db.pool()).await? {
            let state: TaskState = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            match state {
                TaskState::Ready => report.ready = n,
                TaskState::Postponed => report.postponed = n,
                TaskState::Pending => report.pending = n,
                TaskState::QuotaBlocked => report.quota_blocked = n,
                TaskState::Running => report.running = n,
                _ => {}
            }
            report.total += n;
        }
        Ok(report)
    }

    async fn find_by_token(&self, token: &str) -> HubResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM task WHERE token = ?")
            .bind(token)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(id)
    }
}
