//! 上传记录 - 本地持久化的 “已上传” 状态，用于断点续传和增量同步

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// 上传记录存储接口：record_key -> 上传时源文件的修改时间
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    async fn put(&self, key: &str, mod_time: i64) -> Result<()>;

    async fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// 刷盘并关闭，调用后不再写入
    async fn close(&self) -> Result<()>;
}

/// 基于 SQLite 的记录存储
///
/// WAL 模式下每次 put 都是一个独立事务，崩溃时最多丢失最后几条记录，
/// 不会出现写了一半的记录。
pub struct SqliteRecordStore {
    db: SqlitePool,
}

impl SqliteRecordStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let db = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .with_context(|| format!("打开上传记录数据库失败: {:?}", path))?;

        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("初始化上传记录表失败")?;

        debug!("上传记录数据库: {:?}", path);
        Ok(Self { db })
    }

    /// 记录条数
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM upload_records")
            .fetch_one(&self.db)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mod_time = sqlx::query_scalar::<_, i64>(
            "SELECT mod_time FROM upload_records WHERE record_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        Ok(mod_time)
    }

    async fn put(&self, key: &str, mod_time: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"INSERT INTO upload_records (record_key, mod_time, updated_at)
               VALUES (?, ?, ?)
               ON CONFLICT(record_key) DO UPDATE SET
                   mod_time = excluded.mod_time,
                   updated_at = excluded.updated_at"#,
        )
        .bind(key)
        .bind(mod_time)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // 关闭连接池时最后一个连接会执行 WAL checkpoint
        self.db.close().await;
        Ok(())
    }
}
