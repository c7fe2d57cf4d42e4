//! 持久化网关
//!
//! 嵌入式 SQLite 存储。写事务通过进程内唯一的写锁串行化：
//! [`Database::begin_write`] 获取锁并开启事务，事务提交或回滚（drop）时释放。
//! 读操作直接使用连接池，不加锁。

pub mod mapping;
pub mod sqlite;

use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use taskhub_core::config::DatabaseConfig;
use taskhub_core::HubResult;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

pub use sqlite::{
    SqliteBucketRepository, SqliteFileRepository, SqliteReportRepository,
    SqliteTaskGroupRepository, SqliteTaskRepository,
};

/// 数据库句柄
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

/// 持有写锁的事务
pub struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}

impl WriteTx {
    pub async fn commit(self) -> HubResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl Deref for WriteTx {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.tx
    }
}

impl DerefMut for WriteTx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.tx
    }
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> HubResult<Self> {
        if let Some(path) = config.url.strip_prefix("sqlite://") {
            let path = std::path::Path::new(path.split('?').next().unwrap_or(path));
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_seconds));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await?;

        let db = Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        };
        db.run_migrations().await?;
        db.seed_sequences().await?;
        info!("数据库已就绪: {}", config.url);
        Ok(db)
    }

    /// 打开指定路径的数据库文件（测试和嵌入场景使用）
    pub async fn open(path: &std::path::Path) -> HubResult<Self> {
        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            ..Default::default()
        };
        Self::connect(&config).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 获取写锁并开启事务
    pub async fn begin_write(&self) -> HubResult<WriteTx> {
        let guard = self.writer.clone().lock_owned().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTx { tx, _guard: guard })
    }

    pub async fn health_check(&self) -> HubResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn run_migrations(&self) -> HubResult<()> {
        debug!("执行数据库迁移");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS pk (
                kind TEXT PRIMARY KEY,
                last_id INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS bucket (
                id INTEGER PRIMARY KEY,
                path TEXT NOT NULL,
                expiration TEXT,
                create_user TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_group (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT '',
                addon TEXT NOT NULL DEFAULT '',
                extensions TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                policy TEXT NOT NULL DEFAULT '{}',
                mode TEXT NOT NULL DEFAULT 'Batch',
                state TEXT NOT NULL DEFAULT 'Created',
                bucket_id INTEGER REFERENCES bucket(id) ON DELETE SET NULL,
                data TEXT NOT NULL DEFAULT '{}',
                delete_requested INTEGER NOT NULL DEFAULT 0,
                create_user TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task (
                id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL DEFAULT 1,
                name TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT '',
                addon TEXT NOT NULL DEFAULT '',
                extensions TEXT NOT NULL DEFAULT '[]',
                locator TEXT NOT NULL DEFAULT '',
                priority INTEGER NOT NULL DEFAULT 0,
                policy TEXT NOT NULL DEFAULT '{}',
                ttl TEXT NOT NULL DEFAULT '{}',
                state TEXT NOT NULL DEFAULT 'Created',
                pod TEXT,
                node TEXT,
                retries INTEGER NOT NULL DEFAULT 0,
                started TEXT,
                terminated TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                reaped INTEGER NOT NULL DEFAULT 0,
                application_id INTEGER,
                application_name TEXT,
                platform_id INTEGER,
                platform_name TEXT,
                bucket_id INTEGER REFERENCES bucket(id) ON DELETE SET NULL,
                task_group_id INTEGER REFERENCES task_group(id) ON DELETE CASCADE,
                create_user TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL,
                update_user TEXT NOT NULL DEFAULT '',
                data TEXT NOT NULL DEFAULT '{}',
                errors TEXT NOT NULL DEFAULT '[]',
                attached TEXT NOT NULL DEFAULT '[]',
                token TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_event (
                task_id INTEGER NOT NULL REFERENCES task(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 1,
                reason TEXT NOT NULL DEFAULT '',
                time TEXT NOT NULL,
                last TEXT NOT NULL,
                PRIMARY KEY (task_id, seq)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_report (
                task_id INTEGER PRIMARY KEY REFERENCES task(id) ON DELETE CASCADE,
                generation INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'Running',
                total INTEGER NOT NULL DEFAULT 0,
                completed INTEGER NOT NULL DEFAULT 0,
                activity TEXT NOT NULL DEFAULT '[]',
                errors TEXT NOT NULL DEFAULT '[]',
                attached TEXT NOT NULL DEFAULT '[]',
                result TEXT NOT NULL DEFAULT '{}',
                update_time TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS file (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                encoding TEXT NOT NULL DEFAULT '',
                path TEXT NOT NULL,
                expiration TEXT,
                create_user TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL
            )
            "#,
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_task_state ON task(state)",
            "CREATE INDEX IF NOT EXISTS idx_task_locator ON task(locator)",
            "CREATE INDEX IF NOT EXISTS idx_task_group ON task(task_group_id)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_task_token ON task(token)",
            "CREATE INDEX IF NOT EXISTS idx_file_expiration ON file(expiration)",
        ];

        for sql in indexes {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        debug!("数据库迁移完成");
        Ok(())
    }

    /// 用现有最大 id 初始化序列，保证 id 不会被复用
    async fn seed_sequences(&self) -> HubResult<()> {
        for table in sqlite::sequence::SEQUENCED_TABLES {
            let sql = format!(
                "INSERT INTO pk (kind, last_id) SELECT '{table}', COALESCE(MAX(id), 0) FROM {table} WHERE true \
                 ON CONFLICT(kind) DO UPDATE SET last_id = MAX(last_id, excluded.last_id)"
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }
        Ok(())
    }
}
