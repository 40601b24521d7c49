//! 本地存储的数据结构

use crate::offline::types::{EntityId, EntityType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// 本地缓存的实体信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedEntity {
    pub entity_type: EntityType,
    pub id: EntityId,
    /// 所属行程（子实体的缓存范围）
    pub parent_id: Option<EntityId>,
    /// 接口返回的原始 JSON，或离线乐观写入构造的 JSON
    pub payload: Value,
    /// 最近一次与服务器确认的时间；乐观写入为 None
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// 写入结果：存入，或因不符合实体结构被隔离
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Stored(EntityId),
    Quarantined(String),
}

impl StoreOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, StoreOutcome::Stored(_))
    }
}

/// 被隔离的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantinedPayload {
    pub entity_type: EntityType,
    pub payload: Value,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

/// 离线存储统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// 每种实体类型的缓存条数（所有类型都会出现，没有数据时为 0）
    pub entities: BTreeMap<EntityType, u64>,
    pub pending_operations: u64,
    pub quarantined: u64,
}

impl StorageStats {
    pub fn count(&self, entity_type: EntityType) -> u64 {
        self.entities.get(&entity_type).copied().unwrap_or(0)
    }

    pub fn total_entities(&self) -> u64 {
        self.entities.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_entities() == 0 && self.pending_operations == 0 && self.quarantined == 0
    }
}
