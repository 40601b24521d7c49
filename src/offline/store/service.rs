//! 本地存储服务层
//!
//! 以 (实体类型, ID) 为键缓存接口返回的 JSON。写入前按实体结构校验，
//! 不合法的载荷进入隔离表，不会作为缓存数据返回。

use crate::offline::models::validate_payload;
use crate::offline::store::dao::LocalStoreDao;
use crate::offline::store::models::{CachedEntity, QuarantinedPayload, StoreOutcome};
use crate::offline::types::{replace_temporary_id, EntityId, EntityType, TemporaryId};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// 本地实体缓存
#[derive(Clone)]
pub struct LocalStore {
    dao: LocalStoreDao,
}

impl LocalStore {
    /// 使用共享连接池创建本地存储（表结构需已初始化）
    pub fn new(db: Pool<Sqlite>) -> Self {
        Self {
            dao: LocalStoreDao::new(db),
        }
    }

    pub async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<CachedEntity>> {
        self.dao.get(entity_type, id).await
    }

    /// 某类型的全部缓存（插入顺序，不保证与服务器顺序一致）
    pub async fn get_all(&self, entity_type: EntityType) -> Result<Vec<CachedEntity>> {
        self.dao.get_all(entity_type).await
    }

    /// 某行程下的子实体缓存
    pub async fn get_all_in_scope(
        &self,
        entity_type: EntityType,
        parent_id: &EntityId,
    ) -> Result<Vec<CachedEntity>> {
        self.dao.get_all_in_scope(entity_type, parent_id).await
    }

    /// 按 ID 覆盖写入
    ///
    /// `parent` 为空时从载荷的外键字段推断；两者都没有时保留已缓存的范围。
    /// `synced_at` 为空表示尚未被服务器确认的乐观写入。
    pub async fn put(
        &self,
        entity_type: EntityType,
        payload: &Value,
        parent: Option<&EntityId>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<StoreOutcome> {
        let id = match validate_payload(entity_type, payload) {
            Ok(id) => id,
            Err(reason) => {
                self.quarantine(entity_type, payload, &reason).await?;
                return Ok(StoreOutcome::Quarantined(reason));
            }
        };

        let parent_id = parent.cloned().or_else(|| payload_parent(entity_type, payload));
        let entity = CachedEntity {
            entity_type,
            id: id.clone(),
            parent_id,
            payload: payload.clone(),
            last_synced_at: synced_at,
        };
        self.dao.upsert(&entity).await?;
        debug!("[LocalStore] 写入 {} {}", entity_type, id);
        Ok(StoreOutcome::Stored(id))
    }

    /// 批量写入（远端拉取成功后的回写）
    pub async fn put_many(
        &self,
        entity_type: EntityType,
        payloads: &[Value],
        parent: Option<&EntityId>,
        synced_at: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoreOutcome>> {
        let mut outcomes = Vec::with_capacity(payloads.len());
        for payload in payloads {
            outcomes.push(self.put(entity_type, payload, parent, synced_at).await?);
        }

        let quarantined = outcomes.iter().filter(|o| !o.is_stored()).count();
        info!(
            "[LocalStore] 批量写入 {}: {} 条，隔离 {} 条",
            entity_type,
            outcomes.len() - quarantined,
            quarantined
        );
        Ok(outcomes)
    }

    pub async fn delete(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let removed = self.dao.delete(entity_type, id).await?;
        debug!("[LocalStore] 删除 {} {}: {}", entity_type, id, removed);
        Ok(removed)
    }

    /// 清空所有类型的缓存和隔离表
    pub async fn clear_all(&self) -> Result<()> {
        self.dao.clear_all().await
    }

    /// 每种类型的缓存条数，没有数据的类型为 0
    pub async fn counts(&self) -> Result<BTreeMap<EntityType, u64>> {
        let mut counts: BTreeMap<EntityType, u64> =
            EntityType::ALL.iter().map(|t| (*t, 0)).collect();
        for (entity_type, count) in self.dao.count_by_type().await? {
            match entity_type.parse::<EntityType>() {
                Ok(t) => {
                    counts.insert(t, count.max(0) as u64);
                }
                Err(e) => warn!("[LocalStore] 统计时跳过未知类型: {}", e),
            }
        }
        Ok(counts)
    }

    /// 将不合法的载荷放入隔离表
    pub async fn quarantine(&self, entity_type: EntityType, payload: &Value, reason: &str) -> Result<()> {
        warn!("[LocalStore] ⚠️ {} 载荷不符合结构，已隔离: {}", entity_type, reason);
        self.dao
            .insert_quarantine(&QuarantinedPayload {
                entity_type,
                payload: payload.clone(),
                reason: reason.to_string(),
                quarantined_at: Utc::now(),
            })
            .await
    }

    pub async fn quarantined(&self) -> Result<Vec<QuarantinedPayload>> {
        self.dao.get_quarantine().await
    }

    pub async fn quarantined_count(&self) -> Result<u64> {
        Ok(self.dao.count_quarantine().await?.max(0) as u64)
    }

    /// 用服务器 ID 替换临时 ID
    ///
    /// 被创建的实体改为以服务器 ID 为键（保留插入位置），载荷优先使用服务器返回的版本；
    /// 其余缓存中对该临时 ID 的引用（外键、所属行程）一并改写。
    pub async fn replace_temporary_id(
        &self,
        entity_type: EntityType,
        temp: &TemporaryId,
        server_id: i64,
        server_payload: Option<&Value>,
    ) -> Result<()> {
        let temp_key = EntityId::Temporary(temp.clone());
        let server_key = EntityId::Server(server_id);
        let cached = self.dao.get(entity_type, &temp_key).await?;

        let confirmed = match server_payload {
            Some(payload) => match validate_payload(entity_type, payload) {
                Ok(_) => Some(payload.clone()),
                Err(reason) => {
                    self.quarantine(entity_type, payload, &reason).await?;
                    None
                }
            },
            None => None,
        };

        let payload = match (confirmed, &cached) {
            (Some(payload), _) => Some(payload),
            (None, Some(entity)) => {
                let mut payload = entity.payload.clone();
                replace_temporary_id(&mut payload, temp, server_id);
                Some(payload)
            }
            (None, None) => None,
        };

        if let Some(payload) = payload {
            let parent_id = cached
                .as_ref()
                .and_then(|e| e.parent_id.clone())
                .or_else(|| payload_parent(entity_type, &payload));
            let entity = CachedEntity {
                entity_type,
                id: server_key.clone(),
                parent_id,
                payload,
                last_synced_at: Some(Utc::now()),
            };
            let renamed = self.dao.rekey(entity_type, &temp_key, &entity).await?;
            if !renamed {
                self.dao.upsert(&entity).await?;
            }
        }

        let mut rewritten = 0usize;
        for mut entity in self.dao.find_referencing(temp.as_str()).await? {
            let mut changed = replace_temporary_id(&mut entity.payload, temp, server_id);
            if entity.parent_id.as_ref() == Some(&temp_key) {
                entity.parent_id = Some(server_key.clone());
                changed = true;
            }
            if changed {
                self.dao.upsert(&entity).await?;
                rewritten += 1;
            }
        }

        info!(
            "[LocalStore] 🔁 临时ID {} -> {}，改写引用 {} 条",
            temp, server_id, rewritten
        );
        Ok(())
    }
}

/// 从载荷的外键字段读取所属行程
fn payload_parent(entity_type: EntityType, payload: &Value) -> Option<EntityId> {
    let field = entity_type.parent_field()?;
    payload
        .get(field)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::db::test_pool;
    use serde_json::json;

    fn place(id: Value, trip_id: Value, name: &str) -> Value {
        json!({"id": id, "trip_id": trip_id, "name": name, "latitude": 38.7, "longitude": -9.1})
    }

    #[tokio::test]
    async fn overwrite_keeps_insertion_order() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        for (id, title) in [(1, "A"), (2, "B"), (3, "C")] {
            store
                .put(EntityType::Trips, &json!({"id": id, "title": title, "destination": "X"}), None, None)
                .await
                .unwrap();
        }
        store
            .put(EntityType::Trips, &json!({"id": 1, "title": "A2", "destination": "X"}), None, None)
            .await
            .unwrap();

        let all = store.get_all(EntityType::Trips).await.unwrap();
        let titles: Vec<_> = all.iter().map(|e| e.payload["title"].as_str().unwrap()).collect();
        assert_eq!(titles, vec!["A2", "B", "C"]);
    }

    #[tokio::test]
    async fn malformed_payload_is_quarantined() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);

        let outcome = store
            .put(EntityType::Places, &json!({"id": 1, "name": "ohne Koordinaten"}), None, None)
            .await
            .unwrap();
        assert!(!outcome.is_stored());
        assert!(store.get_all(EntityType::Places).await.unwrap().is_empty());
        assert_eq!(store.quarantined_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn explicit_scope_survives_payload_without_trip() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);
        let trip = EntityId::Server(4);

        let diary = json!({"id": 10, "title": "Tag 1", "content": "Ankunft"});
        store
            .put(EntityType::DiaryEntries, &diary, Some(&trip), Some(Utc::now()))
            .await
            .unwrap();
        // 后续写入不带范围时保留原范围
        store.put(EntityType::DiaryEntries, &diary, None, None).await.unwrap();

        let scoped = store
            .get_all_in_scope(EntityType::DiaryEntries, &trip)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert!(store
            .get_all_in_scope(EntityType::DiaryEntries, &EntityId::Server(5))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn temporary_id_is_replaced_everywhere() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);
        let temp = TemporaryId::parse("temp_1700000000000_5").unwrap();
        let temp_key = EntityId::Temporary(temp.clone());

        store
            .put(
                EntityType::Trips,
                &json!({"id": temp.as_str(), "title": "Offline", "destination": "Porto"}),
                None,
                None,
            )
            .await
            .unwrap();
        store
            .put(
                EntityType::Places,
                &place(json!("temp_1700000000001_6"), json!(temp.as_str()), "Ribeira"),
                None,
                None,
            )
            .await
            .unwrap();

        let server = json!({"id": 77, "title": "Offline", "destination": "Porto", "owner_id": 1});
        store
            .replace_temporary_id(EntityType::Trips, &temp, 77, Some(&server))
            .await
            .unwrap();

        assert!(store.get(EntityType::Trips, &temp_key).await.unwrap().is_none());
        let trip = store
            .get(EntityType::Trips, &EntityId::Server(77))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(trip.payload, server);
        assert!(trip.last_synced_at.is_some());

        let places = store
            .get_all_in_scope(EntityType::Places, &EntityId::Server(77))
            .await
            .unwrap();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].payload["trip_id"], json!(77));
        assert!(store.get_all_in_scope(EntityType::Places, &temp_key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_all_reports_zero_for_every_type() {
        let (_dir, pool) = test_pool().await;
        let store = LocalStore::new(pool);
        store
            .put(EntityType::Places, &place(json!(1), json!(2), "Sé"), None, None)
            .await
            .unwrap();
        store
            .put(EntityType::Expenses, &json!({"id": 1}), None, None)
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.len(), EntityType::ALL.len());
        assert_eq!(counts[&EntityType::Places], 1);
        assert_eq!(counts[&EntityType::Trips], 0);

        store.clear_all().await.unwrap();
        assert!(store.counts().await.unwrap().values().all(|c| *c == 0));
        assert_eq!(store.quarantined_count().await.unwrap(), 0);
    }
}
