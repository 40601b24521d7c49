//! SQLite 数据库工具：统一创建连接池并初始化离线表结构
//!
//! 表结构由各 DAO 的 `init_db_with_connection` 负责（CREATE TABLE IF NOT EXISTS），
//! 这里只负责按顺序调用。

use crate::offline::queue::dao::SyncQueueDao;
use crate::offline::store::dao::LocalStoreDao;
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::info;

/// 按 URL 创建 SQLite 连接池（文件不存在时自动创建）并初始化表结构
///
/// 例如：`sqlite://travelmind_offline.db?mode=rwc`
pub async fn create_sqlite_pool(db_url: &str, max_connections: u32) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(db_url)
        .context(format!("无效的 SQLite 数据库地址: {}", db_url))?
        .create_if_missing(true);
    create_sqlite_pool_with_options(options, max_connections).await
}

/// 使用现成的连接参数创建连接池并初始化表结构
pub async fn create_sqlite_pool_with_options(
    options: SqliteConnectOptions,
    max_connections: u32,
) -> Result<Pool<Sqlite>> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options.journal_mode(SqliteJournalMode::Wal))
        .await
        .context("连接SQLite数据库失败")?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// 初始化离线存储与同步队列的表结构
pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
    info!("[DB] 初始化离线数据库表结构");
    LocalStoreDao::init_db_with_connection(pool).await?;
    SyncQueueDao::init_db_with_connection(pool).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (tempfile::TempDir, Pool<Sqlite>) {
    let dir = tempfile::tempdir().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("offline.db"))
        .create_if_missing(true);
    let pool = create_sqlite_pool_with_options(options, 5).await.unwrap();
    (dir, pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initialization_is_repeatable() {
        let (_dir, pool) = test_pool().await;
        init_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["local_entities", "local_quarantine", "resolved_temp_ids", "sync_queue"]);
    }

    #[tokio::test]
    async fn url_based_pool_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("from_url.db");
        let url = format!("sqlite://{}", path.display());
        let pool = create_sqlite_pool(&url, 1).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }
}
