use sqlx::SqliteConnection;
use taskhub_core::HubResult;

/// 使用 `pk` 序列表分配 id 的表
pub const SEQUENCED_TABLES: [&str; 4] = ["task", "task_group", "bucket", "file"];

/// 分配下一个 id；已删除行的 id 不会被复用
pub async fn next_id(conn: &mut SqliteConnection, kind: &str) -> HubResult<i64> {
    sqlx::query(
        "INSERT INTO pk (kind, last_id) VALUES (?, 1) \
         ON CONFLICT(kind) DO UPDATE SET last_id = last_id + 1",
    )
    .bind(kind)
    .execute(&mut *conn)
    .await?;

    let id: i64 = sqlx::query_scalar("SELECT last_id FROM pk WHERE kind = ?")
        .bind(kind)
        .fetch_one(&mut *conn)
        .await?;
    Ok(id)
}
