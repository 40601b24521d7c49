//! 本地存储数据访问层（DAO）
//!
//! 负责 `local_entities` / `local_quarantine` 两张表的读写。
//! 每次写入都是单行 upsert，不依赖跨实体事务。

use crate::offline::store::models::{CachedEntity, QuarantinedPayload};
use crate::offline::types::{EntityId, EntityType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

/// 本地存储 DAO（基于 sqlx）
#[derive(Clone)]
pub struct LocalStoreDao {
    db: Pool<Sqlite>,
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

fn row_to_entity(row: &SqliteRow) -> Result<CachedEntity> {
    let entity_type: String = row.try_get("entity_type")?;
    let entity_id: String = row.try_get("entity_id")?;
    let parent_id: Option<String> = row.try_get("parent_id")?;
    let payload: String = row.try_get("payload")?;
    let last_synced_at: Option<i64> = row.try_get("last_synced_at")?;

    Ok(CachedEntity {
        entity_type: entity_type.parse()?,
        id: entity_id.parse()?,
        parent_id: parent_id.map(|p| p.parse()).transpose()?,
        payload: serde_json::from_str(&payload).context("缓存载荷不是合法 JSON")?,
        last_synced_at: last_synced_at.and_then(millis_to_datetime),
    })
}

impl LocalStoreDao {
    /// 创建新的本地存储 DAO
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self { db }
    }

    /// 使用共享连接初始化数据库表结构（静态方法）
    pub async fn init_db_with_connection(db: &Pool<Sqlite>) -> Result<()> {
        info!("[LocalStoreDAO/DB] 初始化本地存储表结构");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS local_entities (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                parent_id TEXT,
                payload TEXT NOT NULL,
                last_synced_at INTEGER,
                UNIQUE (entity_type, entity_id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_local_entities_parent
                ON local_entities(entity_type, parent_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS local_quarantine (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                quarantined_at INTEGER NOT NULL
            )
            "#,
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(db)
                .await
                .context("创建本地存储表失败")?;
        }
        Ok(())
    }

    /// 按类型和 ID 查询单个实体
    pub async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<CachedEntity>> {
        let row = sqlx::query(
            r#"
            SELECT entity_type, entity_id, parent_id, payload, last_synced_at
            FROM local_entities
            WHERE entity_type = ? AND entity_id = ?
            "#,
        )
        .bind(entity_type.as_str())
        .bind(id.to_string())
        .fetch_optional(&self.db)
        .await
        .context("查询缓存实体失败")?;

        row.as_ref().map(row_to_entity).transpose()
    }

    /// 查询某类型的全部实体（按插入顺序）
    pub async fn get_all(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, entity_id, parent_id, payload, last_synced_at
            FROM local_entities
            WHERE entity_type = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(entity_type.as_str())
        .fetch_all(&self.db)
        .await
        .context("查询缓存实体列表失败")?;

        let entities = rows.iter().map(row_to_entity).collect::<Result<Vec<_>>>()?;
        debug!(
            "[LocalStoreDAO] 获取 {} 缓存，共 {} 条",
            entity_type,
            entities.len()
        );
        Ok(entities)
    }

    /// 查询某行程下的子实体（按插入顺序）
    pub async fn get_all_in_scope(
        &self,
        entity_type: EntityType,
        parent_id: &EntityId,
    ) -> Result<Vec<CachedEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, entity_id, parent_id, payload, last_synced_at
            FROM local_entities
            WHERE entity_type = ? AND parent_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(entity_type.as_str())
        .bind(parent_id.to_string())
        .fetch_all(&self.db)
        .await
        .context("按行程查询缓存实体失败")?;

        rows.iter().map(row_to_entity).collect()
    }

    /// 查询载荷或父 ID 中包含指定文本的实体（用于临时 ID 替换）
    pub async fn find_referencing(&self, needle: &str) -> Result<Vec<CachedEntity>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_type, entity_id, parent_id, payload, last_synced_at
            FROM local_entities
            WHERE instr(payload, ?) > 0 OR parent_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(needle)
        .bind(needle)
        .fetch_all(&self.db)
        .await
        .context("查询引用临时ID的缓存实体失败")?;

        rows.iter().map(row_to_entity).collect()
    }

    /// 插入或更新实体；覆盖时保留原插入位置
    pub async fn upsert(&self, entity: &CachedEntity) -> Result<()> {
        let sql = r#"
            INSERT INTO local_entities (
                entity_type, entity_id, parent_id, payload, last_synced_at
            ) VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                parent_id = COALESCE(excluded.parent_id, local_entities.parent_id),
                payload = excluded.payload,
                last_synced_at = excluded.last_synced_at
        "#;

        sqlx::query(sql)
            .bind(entity.entity_type.as_str())
            .bind(entity.id.to_string())
            .bind(entity.parent_id.as_ref().map(|p| p.to_string()))
            .bind(serde_json::to_string(&entity.payload)?)
            .bind(entity.last_synced_at.map(|t| t.timestamp_millis()))
            .execute(&self.db)
            .await
            .context("写入缓存实体失败")?;
        Ok(())
    }

    /// 将实体从旧 ID 改为新 ID，保留插入位置；新 ID 已存在时先删除旧记录
    pub async fn rekey(&self, entity_type: EntityType, old_id: &EntityId, entity: &CachedEntity) -> Result<bool> {
        sqlx::query("DELETE FROM local_entities WHERE entity_type = ? AND entity_id = ?")
            .bind(entity_type.as_str())
            .bind(entity.id.to_string())
            .execute(&self.db)
            .await
            .context("清理重复缓存实体失败")?;

        let res = sqlx::query(
            r#"
            UPDATE local_entities
            SET entity_id = ?, parent_id = ?, payload = ?, last_synced_at = ?
            WHERE entity_type = ? AND entity_id = ?
            "#,
        )
        .bind(entity.id.to_string())
        .bind(entity.parent_id.as_ref().map(|p| p.to_string()))
        .bind(serde_json::to_string(&entity.payload)?)
        .bind(entity.last_synced_at.map(|t| t.timestamp_millis()))
        .bind(entity_type.as_str())
        .bind(old_id.to_string())
        .execute(&self.db)
        .await
        .context("替换缓存实体ID失败")?;

        Ok(res.rows_affected() > 0)
    }

    /// 删除实体
    pub async fn delete(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM local_entities WHERE entity_type = ? AND entity_id = ?")
            .bind(entity_type.as_str())
            .bind(id.to_string())
            .execute(&self.db)
            .await
            .context("删除缓存实体失败")?;
        Ok(res.rows_affected() > 0)
    }

    /// 按类型统计条数
    pub async fn count_by_type(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT entity_type, COUNT(*) AS cnt FROM local_entities GROUP BY entity_type",
        )
        .fetch_all(&self.db)
        .await
        .context("统计缓存实体失败")?;

        rows.iter()
            .map(|row| Ok((row.try_get("entity_type")?, row.try_get("cnt")?)))
            .collect()
    }

    /// 写入隔离表
    pub async fn insert_quarantine(&self, item: &QuarantinedPayload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO local_quarantine (entity_type, payload, reason, quarantined_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(item.entity_type.as_str())
        .bind(serde_json::to_string(&item.payload)?)
        .bind(&item.reason)
        .bind(item.quarantined_at.timestamp_millis())
        .execute(&self.db)
        .await
        .context("写入隔离表失败")?;
        Ok(())
    }

    /// 查询隔离表
    pub async fn get_quarantine(&self) -> Result<Vec<QuarantinedPayload>> {
        let rows = sqlx::query(
            "SELECT entity_type, payload, reason, quarantined_at FROM local_quarantine ORDER BY id ASC",
        )
        .fetch_all(&self.db)
        .await
        .context("查询隔离表失败")?;

        rows.iter()
            .map(|row| {
                let entity_type: String = row.try_get("entity_type")?;
                let payload: String = row.try_get("payload")?;
                let quarantined_at: i64 = row.try_get("quarantined_at")?;
                Ok(QuarantinedPayload {
                    entity_type: entity_type.parse()?,
                    payload: serde_json::from_str(&payload)?,
                    reason: row.try_get("reason")?,
                    quarantined_at: millis_to_datetime(quarantined_at).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// 隔离表条数
    pub async fn count_quarantine(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM local_quarantine")
            .fetch_one(&self.db)
            .await
            .context("统计隔离表失败")?;
        Ok(count)
    }

    /// 清空全部缓存实体与隔离表
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM local_entities")
            .execute(&self.db)
            .await
            .context("清空缓存实体失败")?;
        sqlx::query("DELETE FROM local_quarantine")
            .execute(&self.db)
            .await
            .context("清空隔离表失败")?;
        info!("[LocalStoreDAO] 已清空本地存储");
        Ok(())
    }
}
