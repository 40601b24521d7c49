//! 同步队列数据访问层（DAO）

use crate::offline::queue::models::QueuedOperation;
use crate::offline::types::{EntityType, TemporaryId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// 同步队列 DAO（基于 sqlx）
#[derive(Clone)]
pub struct SyncQueueDao {
    db: Pool<Sqlite>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT queue_id, op_type, entity_type, endpoint, method, data,
           temporary_id, parent_id, created_at, attempts, last_error
    FROM sync_queue
"#;

fn row_to_operation(row: &SqliteRow) -> Result<QueuedOperation> {
    let op_type: String = row.try_get("op_type")?;
    let entity_type: String = row.try_get("entity_type")?;
    let method: String = row.try_get("method")?;
    let data: Option<String> = row.try_get("data")?;
    let temporary_id: Option<String> = row.try_get("temporary_id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let created_at: i64 = row.try_get("created_at")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(QueuedOperation {
        queue_id: row.try_get("queue_id")?,
        op_type: op_type.parse()?,
        entity_type: entity_type.parse()?,
        endpoint: row.try_get("endpoint")?,
        method: method.parse()?,
        data: data
            .map(|d| serde_json::from_str(&d))
            .transpose()
            .context("队列数据不是合法 JSON")?,
        temporary_id: temporary_id
            .map(TemporaryId::try_from)
            .transpose()
            .map_err(anyhow::Error::msg)?,
        parent_id: parent_id.map(|p| p.parse()).transpose()?,
        created_at: DateTime::<Utc>::from_timestamp_millis(created_at).unwrap_or_default(),
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
    })
}

impl SyncQueueDao {
    /// 创建新的同步队列 DAO
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 使用共享连接初始化数据库表结构（静态方法）
    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        info!("[SyncQueueDAO/DB] 初始化同步队列表结构");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                queue_id INTEGER PRIMARY KEY,
                op_type TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                method TEXT NOT NULL,
                data TEXT,
                temporary_id TEXT,
                parent_id TEXT,
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(db)
        .await
        .context("创建同步队列表失败")?;

        // 已回放成功的 create：临时 ID -> 服务器 ID
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resolved_temp_ids (
                temporary_id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                server_id INTEGER NOT NULL,
                resolved_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(db)
        .await
        .context("创建临时ID映射表失败")?;
        Ok(())
    }

    /// 写入一条操作
    pub async fn insert(&self, op: &QueuedOperation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                queue_id, op_type, entity_type, endpoint, method, data,
                temporary_id, parent_id, created_at, attempts, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(op.queue_id)
        .bind(op.op_type.as_str())
        .bind(op.entity_type.as_str())
        .bind(&op.endpoint)
        .bind(op.method.as_str())
        .bind(op.data.as_ref().map(serde_json::to_string).transpose()?)
        .bind(op.temporary_id.as_ref().map(|t| t.as_str().to_string()))
        .bind(op.parent_id.as_ref().map(|p| p.to_string()))
        .bind(op.created_at.timestamp_millis())
        .bind(op.attempts as i64)
        .bind(&op.last_error)
        .execute(&self.db)
        .await
        .context("写入同步队列失败")?;
        debug!("[SyncQueueDAO] 入队 #{} {} {}", op.queue_id, op.method, op.endpoint);
        Ok(())
    }

    /// 按 queue_id 升序列出全部操作
    pub async fn list_ordered(&self) -> Result<Vec<QueuedOperation>> {
        let sql = format!("{} ORDER BY queue_id ASC", SELECT_COLUMNS);
        let rows = sqlx::query(&sql)
            .fetch_all(&self.db)
            .await
            .context("查询同步队列失败")?;
        rows.iter().map(row_to_operation).collect()
    }

    /// 查询路径、数据或所属行程中引用了指定文本的操作
    pub async fn find_referencing(&self, needle: &str) -> Result<Vec<QueuedOperation>> {
        let sql = format!(
            "{} WHERE instr(endpoint, ?) > 0 OR instr(COALESCE(data, ''), ?) > 0 OR parent_id = ? ORDER BY queue_id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(needle)
            .bind(needle)
            .bind(needle)
            .fetch_all(&self.db)
            .await
            .context("查询引用临时ID的队列操作失败")?;
        rows.iter().map(row_to_operation).collect()
    }

    /// 改写操作的路径、数据与所属行程
    pub async fn update_target(&self, op: &QueuedOperation) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET endpoint = ?, data = ?, parent_id = ? WHERE queue_id = ?")
            .bind(&op.endpoint)
            .bind(op.data.as_ref().map(serde_json::to_string).transpose()?)
            .bind(op.parent_id.as_ref().map(|p| p.to_string()))
            .bind(op.queue_id)
            .execute(&self.db)
            .await
            .context("改写队列操作失败")?;
        Ok(())
    }

    /// 出队
    pub async fn remove(&self, queue_id: i64) -> Result<bool> {
        let res = sqlx::query("DELETE FROM sync_queue WHERE queue_id = ?")
            .bind(queue_id)
            .execute(&self.db)
            .await
            .context("删除队列操作失败")?;
        Ok(res.rows_affected() > 0)
    }

    /// 记录一次失败的回放
    pub async fn record_failure(&self, queue_id: i64, error: &str) -> Result<()> {
        sqlx::query("UPDATE sync_queue SET attempts = attempts + 1, last_error = ? WHERE queue_id = ?")
            .bind(error)
            .bind(queue_id)
            .execute(&self.db)
            .await
            .context("更新队列失败信息失败")?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&self.db)
            .await
            .context("统计同步队列失败")?;
        Ok(count)
    }

    /// 某实体类型的待同步操作数
    pub async fn count_for_entity_type(&self, entity_type: EntityType) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE entity_type = ?")
            .bind(entity_type.as_str())
            .fetch_one(&self.db)
            .await
            .context("按类型统计同步队列失败")?;
        Ok(count)
    }

    /// 记录临时 ID 对应的服务器 ID
    pub async fn insert_resolution(
        &self,
        temp: &TemporaryId,
        entity_type: EntityType,
        server_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resolved_temp_ids (temporary_id, entity_type, server_id, resolved_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(temporary_id) DO UPDATE SET
                entity_type = excluded.entity_type,
                server_id = excluded.server_id,
                resolved_at = excluded.resolved_at
            "#,
        )
        .bind(temp.as_str())
        .bind(entity_type.as_str())
        .bind(server_id)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await
        .context("写入临时ID映射失败")?;
        Ok(())
    }

    /// 查询单个临时 ID 的服务器 ID
    pub async fn find_resolution(&self, temp: &TemporaryId) -> Result<Option<i64>> {
        let server_id: Option<i64> =
            sqlx::query_scalar("SELECT server_id FROM resolved_temp_ids WHERE temporary_id = ?")
                .bind(temp.as_str())
                .fetch_optional(&self.db)
                .await
                .context("查询临时ID映射失败")?;
        Ok(server_id)
    }

    /// 全部已解析的临时 ID
    pub async fn list_resolutions(&self) -> Result<Vec<(TemporaryId, i64)>> {
        let rows = sqlx::query("SELECT temporary_id, server_id FROM resolved_temp_ids")
            .fetch_all(&self.db)
            .await
            .context("查询临时ID映射失败")?;

        rows.iter()
            .map(|row| {
                let temp: String = row.try_get("temporary_id")?;
                let server_id: i64 = row.try_get("server_id")?;
                let temp = TemporaryId::try_from(temp).map_err(anyhow::Error::msg)?;
                Ok((temp, server_id))
            })
            .collect()
    }

    /// 已分配的最大 queue_id
    pub async fn max_queue_id(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(queue_id) FROM sync_queue")
            .fetch_one(&self.db)
            .await
            .context("查询最大队列ID失败")?;
        Ok(max)
    }

    /// 清空队列和临时 ID 映射
    pub async fn clear(&self) -> Result<u64> {
        let res = sqlx::query("DELETE FROM sync_queue")
            .execute(&self.db)
            .await
            .context("清空同步队列失败")?;
        sqlx::query("DELETE FROM resolved_temp_ids")
            .execute(&self.db)
            .await
            .context("清空临时ID映射失败")?;
        info!("[SyncQueueDAO] 已清空同步队列，删除 {} 条", res.rows_affected());
        Ok(res.rows_affected())
    }
}
