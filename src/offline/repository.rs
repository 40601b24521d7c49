//! 离线感知的实体仓库
//!
//! 每种实体一个 `OfflineRepository<R>`，读写时在远端和本地缓存之间选择：
//!
//! - 读：在线时请求远端并回写缓存；远端失败或离线时返回缓存快照（`is_cached = true`）
//! - 写：在线时直接请求远端并回写缓存；离线时生成乐观结果（临时 ID，`_temp = true`），
//!   入队等待联网后回放
//!
//! 在线写入超时或网络不可达时把 `ApiError::Timeout` / `ApiError::Network` 返回给调用方，
//! 不会转入同步队列。

use crate::offline::api::{ApiError, RemoteApi};
use crate::offline::coordinator::{ConnectivityMonitor, Invalidation};
use crate::offline::listener::{NoticeListener, SyncNotice};
use crate::offline::models::{decode_record, OfflineRecord};
use crate::offline::queue::{NewOperation, SyncQueue};
use crate::offline::store::{CachedEntity, LocalStore};
use crate::offline::types::{
    collect_temporary_ids, EntityId, EntityType, HttpMethod, OperationType, TemporaryId,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 读取范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityQuery {
    /// 该类型的全部实体
    All,
    /// 某行程下的子实体
    ByParent(EntityId),
    ById(EntityId),
}

impl EntityQuery {
    fn temporary_id(&self) -> Option<&TemporaryId> {
        match self {
            EntityQuery::All => None,
            EntityQuery::ByParent(id) | EntityQuery::ById(id) => id.as_temporary(),
        }
    }
}

/// 读取结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult<R> {
    pub data: Vec<R>,
    pub is_loading: bool,
    pub is_offline: bool,
    pub is_cached: bool,
}

/// 读取状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Loading,
    /// 来自远端
    Live,
    /// 来自本地缓存
    Cached,
}

impl<R> ReadResult<R> {
    fn loading(data: Vec<R>, is_offline: bool) -> Self {
        Self {
            data,
            is_loading: true,
            is_offline,
            is_cached: false,
        }
    }

    pub fn state(&self) -> ReadState {
        if self.is_loading {
            ReadState::Loading
        } else if self.is_cached {
            ReadState::Cached
        } else {
            ReadState::Live
        }
    }
}

/// 写入方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteSpec {
    /// 子实体需要所属行程 ID
    Create { parent: Option<EntityId> },
    Update { id: EntityId },
    Delete { id: EntityId },
}

impl WriteSpec {
    fn operation(&self) -> OperationType {
        match self {
            WriteSpec::Create { .. } => OperationType::Create,
            WriteSpec::Update { .. } => OperationType::Update,
            WriteSpec::Delete { .. } => OperationType::Delete,
        }
    }

    fn references_temporary(&self) -> bool {
        match self {
            WriteSpec::Create { parent } => parent.as_ref().is_some_and(EntityId::is_temporary),
            WriteSpec::Update { id } | WriteSpec::Delete { id } => id.is_temporary(),
        }
    }
}

/// 写入结果；`temp` 为 true 表示尚未被服务器确认
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteResult<R> {
    pub record: Option<R>,
    #[serde(rename = "_temp")]
    pub temp: bool,
}

/// 写入失败
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("无效的写入: {0}")]
    Invalid(String),

    #[error("写入同步队列失败: {0}")]
    Queue(anyhow::Error),
}

/// 离线感知的实体仓库
pub struct OfflineRepository<R: OfflineRecord> {
    store: LocalStore,
    queue: Arc<SyncQueue>,
    api: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    invalidations: broadcast::Sender<Invalidation>,
    notices: Arc<dyn NoticeListener>,
    _record: PhantomData<fn() -> R>,
}

impl<R: OfflineRecord> Clone for OfflineRepository<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            queue: self.queue.clone(),
            api: self.api.clone(),
            connectivity: self.connectivity.clone(),
            invalidations: self.invalidations.clone(),
            notices: self.notices.clone(),
            _record: PhantomData,
        }
    }
}

impl<R: OfflineRecord> OfflineRepository<R> {
    pub fn new(
        store: LocalStore,
        queue: Arc<SyncQueue>,
        api: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
        invalidations: broadcast::Sender<Invalidation>,
        notices: Arc<dyn NoticeListener>,
    ) -> Self {
        Self {
            store,
            queue,
            api,
            connectivity,
            invalidations,
            notices,
            _record: PhantomData,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        R::ENTITY_TYPE
    }

    /// 读取
    ///
    /// 远端失败从不返回错误，而是回退到缓存。回放进行中、或该类型仍有待同步操作时也读缓存，
    /// 避免在队列写入服务器之前用远端旧数据覆盖乐观写入。
    pub async fn read(&self, query: &EntityQuery) -> ReadResult<R> {
        let query = &self.resolve_query(query).await;
        let offline = !self.connectivity.is_online();

        if !offline && self.remote_is_current().await {
            if let Some(endpoint) = self.remote_endpoint(query) {
                match self.api.request(HttpMethod::Get, &endpoint, None).await {
                    Ok(body) => {
                        if let Some(data) = self.accept_remote(query, body).await {
                            return ReadResult {
                                data,
                                is_loading: false,
                                is_offline: false,
                                is_cached: false,
                            };
                        }
                    }
                    Err(e) => {
                        if e == ApiError::Unauthorized {
                            self.notices.on_session_expired().await;
                        }
                        warn!(
                            "[Repository] {} 远端读取失败，回退到本地缓存: {}",
                            R::ENTITY_TYPE,
                            e
                        );
                    }
                }
            }
        }

        ReadResult {
            data: self.cached(query).await,
            is_loading: false,
            is_offline: offline,
            is_cached: true,
        }
    }

    /// 远端数据是否已包含本地全部变更
    async fn remote_is_current(&self) -> bool {
        if self.queue.is_syncing() {
            return false;
        }
        match self.queue.has_pending_for(R::ENTITY_TYPE).await {
            Ok(pending) => {
                if pending {
                    debug!("[Repository] {} 仍有待同步操作，读取本地缓存", R::ENTITY_TYPE);
                }
                !pending
            }
            Err(e) => {
                warn!("[Repository] 统计待同步操作失败，读取本地缓存: {:?}", e);
                false
            }
        }
    }

    /// 查询中已回放成功的临时 ID 换成服务器 ID
    async fn resolve_query(&self, query: &EntityQuery) -> EntityQuery {
        match query {
            EntityQuery::All => EntityQuery::All,
            EntityQuery::ByParent(id) => EntityQuery::ByParent(self.queue.resolve_entity_id(id).await),
            EntityQuery::ById(id) => EntityQuery::ById(self.queue.resolve_entity_id(id).await),
        }
    }

    /// 写入目标和载荷中已回放成功的临时 ID 换成服务器 ID
    async fn resolve_write(&self, spec: WriteSpec, mut payload: Value) -> (WriteSpec, Value) {
        let spec = match spec {
            WriteSpec::Create { parent: Some(parent) } => WriteSpec::Create {
                parent: Some(self.queue.resolve_entity_id(&parent).await),
            },
            WriteSpec::Create { parent: None } => WriteSpec::Create { parent: None },
            WriteSpec::Update { id } => WriteSpec::Update {
                id: self.queue.resolve_entity_id(&id).await,
            },
            WriteSpec::Delete { id } => WriteSpec::Delete {
                id: self.queue.resolve_entity_id(&id).await,
            },
        };
        self.queue.resolve_payload(&mut payload).await;
        (spec, payload)
    }

    /// 可以向远端请求的路径；查询涉及临时 ID 或接口没有对应路由时为 None
    fn remote_endpoint(&self, query: &EntityQuery) -> Option<String> {
        if query.temporary_id().is_some() {
            return None;
        }
        match (R::ENTITY_TYPE, query) {
            (EntityType::Trips, EntityQuery::ById(id)) => Some(EntityType::Trips.item_endpoint(id)),
            (EntityType::Trips, _) => EntityType::Trips.collection_endpoint(None).ok(),
            (_, EntityQuery::ByParent(parent)) => R::ENTITY_TYPE.collection_endpoint(Some(parent)).ok(),
            // 子实体没有跨行程列表或单体查询接口
            _ => None,
        }
    }

    /// 解码远端响应并回写缓存；响应格式不对时返回 None
    async fn accept_remote(&self, query: &EntityQuery, body: Option<Value>) -> Option<Vec<R>> {
        let items = match body {
            Some(Value::Array(items)) => items,
            Some(item @ Value::Object(_)) => vec![item],
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                warn!("[Repository] {} 远端响应格式异常: {}", R::ENTITY_TYPE, other);
                return None;
            }
        };

        let parent = match query {
            EntityQuery::ByParent(parent) if R::ENTITY_TYPE.parent_field().is_some() => Some(parent),
            _ => None,
        };
        if let Err(e) = self
            .store
            .put_many(R::ENTITY_TYPE, &items, parent, Some(Utc::now()))
            .await
        {
            warn!("[Repository] {} 回写本地缓存失败: {:?}", R::ENTITY_TYPE, e);
        }

        Some(items.iter().filter_map(|item| decode_record(item).ok()).collect())
    }

    async fn cached(&self, query: &EntityQuery) -> Vec<R> {
        let entity_type = R::ENTITY_TYPE;
        let entities = match query {
            EntityQuery::All => self.store.get_all(entity_type).await,
            EntityQuery::ByParent(parent) if entity_type != EntityType::Trips => {
                self.store.get_all_in_scope(entity_type, parent).await
            }
            EntityQuery::ByParent(_) => self.store.get_all(entity_type).await,
            EntityQuery::ById(id) => self
                .store
                .get(entity_type, id)
                .await
                .map(|e| e.into_iter().collect()),
        };

        match entities {
            Ok(entities) => entities
                .iter()
                .filter_map(|e| match decode_record::<R>(&e.payload) {
                    Ok(record) => Some(record),
                    Err(reason) => {
                        warn!("[Repository] 跳过无法解码的缓存 {} {}: {}", entity_type, e.id, reason);
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!("[Repository] 读取本地缓存失败: {:?}", e);
                Vec::new()
            }
        }
    }

    /// 写入
    ///
    /// 目标或载荷引用的临时 ID 如果已经同步过，先换成服务器 ID。
    pub async fn write(&self, spec: WriteSpec, payload: Value) -> Result<WriteResult<R>, WriteError> {
        let (spec, payload) = self.resolve_write(spec, payload).await;
        let offline = !self.connectivity.is_online();
        let mut referenced = Vec::new();
        collect_temporary_ids(&payload, &mut referenced);

        let result = if offline || spec.references_temporary() || !referenced.is_empty() {
            self.write_offline(spec, payload).await?
        } else {
            self.write_online(spec, payload).await?
        };

        let _ = self.invalidations.send(Invalidation::Entity(R::ENTITY_TYPE));
        Ok(result)
    }

    async fn write_online(&self, spec: WriteSpec, payload: Value) -> Result<WriteResult<R>, WriteError> {
        let entity_type = R::ENTITY_TYPE;
        let (method, endpoint, parent) = match &spec {
            WriteSpec::Create { parent } => (
                HttpMethod::Post,
                entity_type
                    .collection_endpoint(parent.as_ref())
                    .map_err(|e| WriteError::Invalid(e.to_string()))?,
                parent.clone(),
            ),
            WriteSpec::Update { id } => (HttpMethod::Put, entity_type.item_endpoint(id), None),
            WriteSpec::Delete { id } => (HttpMethod::Delete, entity_type.item_endpoint(id), None),
        };

        let body = match &spec {
            WriteSpec::Delete { .. } => None,
            _ => Some(&payload),
        };
        let response = match self.api.request(method, &endpoint, body).await {
            Ok(response) => response,
            Err(e) => {
                if e == ApiError::Unauthorized {
                    self.notices.on_session_expired().await;
                }
                return Err(e.into());
            }
        };
        info!("[Repository] ✅ {} {} 已写入服务器", method, endpoint);

        if let WriteSpec::Delete { id } = &spec {
            if let Err(e) = self.store.delete(entity_type, id).await {
                warn!("[Repository] 删除本地缓存失败: {:?}", e);
            }
            return Ok(WriteResult {
                record: None,
                temp: false,
            });
        }

        let Some(response) = response else {
            return Ok(WriteResult {
                record: None,
                temp: false,
            });
        };
        if let Err(e) = self
            .store
            .put(entity_type, &response, parent.as_ref(), Some(Utc::now()))
            .await
        {
            warn!("[Repository] 回写本地缓存失败: {:?}", e);
        }
        let record = match decode_record::<R>(&response) {
            Ok(record) => Some(record),
            Err(reason) => {
                warn!("[Repository] 服务器响应不符合 {} 结构: {}", entity_type, reason);
                None
            }
        };
        Ok(WriteResult {
            record,
            temp: false,
        })
    }

    async fn write_offline(&self, spec: WriteSpec, payload: Value) -> Result<WriteResult<R>, WriteError> {
        let entity_type = R::ENTITY_TYPE;
        let operation = spec.operation();

        let result = match spec {
            WriteSpec::Create { parent } => {
                let fields = as_object(payload)?;
                let endpoint = entity_type
                    .collection_endpoint(parent.as_ref())
                    .map_err(|e| WriteError::Invalid(e.to_string()))?;
                let temp = TemporaryId::generate();

                let mut optimistic = fields.clone();
                optimistic.insert("id".to_string(), Value::String(temp.as_str().to_string()));
                let optimistic = Value::Object(optimistic);
                let record = decode_record::<R>(&optimistic).map_err(WriteError::Invalid)?;

                self.queue
                    .queue_operation(NewOperation::create(
                        entity_type,
                        endpoint,
                        Value::Object(fields),
                        temp.clone(),
                        parent.clone(),
                    ))
                    .await
                    .map_err(WriteError::Queue)?;
                self.store_optimistic(&optimistic, parent.as_ref()).await;
                info!("[Repository] 📴 离线创建 {}，临时ID: {}", entity_type, temp);

                WriteResult {
                    record: Some(record),
                    temp: true,
                }
            }
            WriteSpec::Update { id } => {
                let fields = as_object(payload)?;
                let cached = self.cached_entity(&id).await;

                let mut merged = cached
                    .as_ref()
                    .and_then(|e| e.payload.as_object().cloned())
                    .unwrap_or_default();
                merged.extend(fields.clone());
                merged.insert("id".to_string(), id.to_json());
                let merged = Value::Object(merged);
                let parent = cached.and_then(|e| e.parent_id);

                self.queue
                    .queue_operation(NewOperation::update(
                        entity_type,
                        &id,
                        Value::Object(fields),
                        parent.clone(),
                    ))
                    .await
                    .map_err(WriteError::Queue)?;

                // 没有缓存且提交的字段不完整时，只入队不更新缓存
                let record = match decode_record::<R>(&merged) {
                    Ok(record) => {
                        self.store_optimistic(&merged, parent.as_ref()).await;
                        Some(record)
                    }
                    Err(reason) => {
                        debug!("[Repository] 离线更新 {} {} 无法构造完整记录: {}", entity_type, id, reason);
                        None
                    }
                };
                WriteResult { record, temp: true }
            }
            WriteSpec::Delete { id } => {
                self.queue
                    .queue_operation(NewOperation::delete(entity_type, &id))
                    .await
                    .map_err(WriteError::Queue)?;
                if let Err(e) = self.store.delete(entity_type, &id).await {
                    warn!("[Repository] 删除本地缓存失败: {:?}", e);
                }
                WriteResult {
                    record: None,
                    temp: true,
                }
            }
        };

        self.notices
            .on_notice(SyncNotice::QueuedForSync {
                entity_type,
                operation,
            })
            .await;
        Ok(result)
    }

    async fn cached_entity(&self, id: &EntityId) -> Option<CachedEntity> {
        match self.store.get(R::ENTITY_TYPE, id).await {
            Ok(entity) => entity,
            Err(e) => {
                warn!("[Repository] 读取本地缓存失败: {:?}", e);
                None
            }
        }
    }

    async fn store_optimistic(&self, payload: &Value, parent: Option<&EntityId>) {
        if let Err(e) = self.store.put(R::ENTITY_TYPE, payload, parent, None).await {
            warn!("[Repository] 乐观写入本地缓存失败: {:?}", e);
        }
    }

    /// 持续观察一个查询
    ///
    /// 初始状态为 Loading（带已有缓存），随后在离线、缓存失效时重新读取。
    /// 恢复联网后，如果队列中还有待同步操作，等待回放结束后的失效信号再读取远端。
    pub fn watch(&self, query: EntityQuery) -> QueryWatcher<R> {
        let (sender, receiver) =
            watch::channel(ReadResult::loading(Vec::new(), !self.connectivity.is_online()));
        let repository = self.clone();
        let mut connectivity = self.connectivity.subscribe();
        let mut invalidations = self.invalidations.subscribe();

        let task = tokio::spawn(async move {
            let snapshot = repository.cached(&query).await;
            let offline = !repository.connectivity.is_online();
            sender.send_replace(ReadResult::loading(snapshot, offline));

            if sender.send(repository.read(&query).await).is_err() {
                return;
            }

            loop {
                let refresh = tokio::select! {
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *connectivity.borrow_and_update();
                        !online || repository.queue_is_settled().await
                    }
                    received = invalidations.recv() => match received {
                        Ok(invalidation) => invalidation.affects(R::ENTITY_TYPE),
                        Err(broadcast::error::RecvError::Lagged(_)) => true,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                if refresh && sender.send(repository.read(&query).await).is_err() {
                    break;
                }
            }
        });

        QueryWatcher { receiver, task }
    }

    async fn queue_is_settled(&self) -> bool {
        !self.queue.is_syncing() && self.queue.is_empty().await.unwrap_or(false)
    }
}

fn as_object(payload: Value) -> Result<Map<String, Value>, WriteError> {
    match payload {
        Value::Object(map) => Ok(map),
        other => Err(WriteError::Invalid(format!("写入数据必须是 JSON 对象: {}", other))),
    }
}

/// 查询观察者；丢弃即停止后台任务
pub struct QueryWatcher<R> {
    receiver: watch::Receiver<ReadResult<R>>,
    task: JoinHandle<()>,
}

impl<R: Clone> QueryWatcher<R> {
    /// 当前结果
    pub fn current(&self) -> ReadResult<R> {
        self.receiver.borrow().clone()
    }

    /// 等待下一次结果变化
    pub async fn changed(&mut self) -> Option<ReadResult<R>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    pub fn receiver(&self) -> watch::Receiver<ReadResult<R>> {
        self.receiver.clone()
    }
}

impl<R> Drop for QueryWatcher<R> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::db::test_pool;
    use crate::offline::listener::EmptyNoticeListener;
    use crate::offline::models::{Place, Trip};
    use crate::offline::testing::MockRemoteApi;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        pool: sqlx::Pool<sqlx::Sqlite>,
        api: Arc<MockRemoteApi>,
        store: LocalStore,
        queue: Arc<SyncQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        invalidations: broadcast::Sender<Invalidation>,
    }

    impl Harness {
        async fn new(online: bool) -> Self {
            let (dir, pool) = test_pool().await;
            let api = Arc::new(MockRemoteApi::new());
            let store = LocalStore::new(pool.clone());
            let queue = Arc::new(
                SyncQueue::new(pool.clone(), store.clone(), api.clone(), Arc::new(EmptyNoticeListener))
                    .await
                    .unwrap(),
            );
            let (invalidations, _) = broadcast::channel(16);
            Self {
                _dir: dir,
                pool,
                api,
                store,
                queue,
                connectivity: Arc::new(ConnectivityMonitor::new(online)),
                invalidations,
            }
        }

        fn repo<R: OfflineRecord>(&self) -> OfflineRepository<R> {
            OfflineRepository::new(
                self.store.clone(),
                self.queue.clone(),
                self.api.clone(),
                self.connectivity.clone(),
                self.invalidations.clone(),
                Arc::new(EmptyNoticeListener),
            )
        }
    }

    fn trip_json(id: i64, title: &str) -> Value {
        json!({"id": id, "title": title, "destination": "Lissabon"})
    }

    #[tokio::test]
    async fn online_read_writes_through_and_offline_read_serves_cache() {
        let h = Harness::new(true).await;
        h.api.serve("/trips", json!([trip_json(1, "A"), trip_json(2, "B")]));
        let trips = h.repo::<Trip>();

        let live = trips.read(&EntityQuery::All).await;
        assert_eq!(live.state(), ReadState::Live);
        assert_eq!(live.data.len(), 2);

        h.connectivity.set_online(false);
        let cached = trips.read(&EntityQuery::All).await;
        assert_eq!(cached.state(), ReadState::Cached);
        assert!(cached.is_offline);
        assert_eq!(cached.data, live.data);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_cache() {
        let h = Harness::new(true).await;
        h.store.put(EntityType::Trips, &trip_json(1, "A"), None, None).await.unwrap();
        h.api.fail("/trips", ApiError::Timeout);

        let result = h.repo::<Trip>().read(&EntityQuery::All).await;
        assert!(result.is_cached);
        assert!(!result.is_offline);
        assert_eq!(result.data[0].title, "A");
    }

    #[tokio::test]
    async fn offline_reads_are_idempotent() {
        let h = Harness::new(false).await;
        let trips = h.repo::<Trip>();
        trips
            .write(WriteSpec::Create { parent: None }, json!({"title": "Porto", "destination": "Porto"}))
            .await
            .unwrap();

        let first = trips.read(&EntityQuery::All).await;
        let second = trips.read(&EntityQuery::All).await;
        assert_eq!(
            serde_json::to_vec(&first.data).unwrap(),
            serde_json::to_vec(&second.data).unwrap()
        );
        assert_eq!(h.api.call_count(), 0);
    }

    #[tokio::test]
    async fn offline_create_returns_temporary_record() {
        let h = Harness::new(false).await;
        let result = h
            .repo::<Trip>()
            .write(WriteSpec::Create { parent: None }, json!({"title": "Sintra", "destination": "Sintra"}))
            .await
            .unwrap();

        assert!(result.temp);
        let record = result.record.unwrap();
        assert!(record.id.is_temporary());
        let serialized = serde_json::to_value(WriteResult { record: Some(record.clone()), temp: true }).unwrap();
        assert_eq!(serialized["_temp"], json!(true));

        let queued = h.queue.pending_operations().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].temporary_id.as_ref(), record.id.as_temporary());
        assert!(queued[0].data.as_ref().unwrap().get("id").is_none());
    }

    #[tokio::test]
    async fn online_write_goes_straight_to_the_server() {
        let h = Harness::new(true).await;
        let result = h
            .repo::<Trip>()
            .write(WriteSpec::Create { parent: None }, json!({"title": "Évora", "destination": "Évora"}))
            .await
            .unwrap();

        assert!(!result.temp);
        assert_eq!(result.record.unwrap().id, EntityId::Server(100));
        assert!(h.queue.is_empty().await.unwrap());
        let cached = h.store.get(EntityType::Trips, &EntityId::Server(100)).await.unwrap();
        assert!(cached.unwrap().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn online_timeout_is_surfaced_not_queued() {
        let h = Harness::new(true).await;
        h.api.fail("/trips/1", ApiError::Timeout);
        let err = h
            .repo::<Trip>()
            .write(WriteSpec::Update { id: EntityId::Server(1) }, trip_json(1, "neu"))
            .await
            .unwrap_err();

        assert!(matches!(err, WriteError::Api(ApiError::Timeout)));
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn offline_update_merges_over_cached_payload() {
        let h = Harness::new(false).await;
        h.store.put(EntityType::Trips, &trip_json(5, "alt"), None, None).await.unwrap();

        let result = h
            .repo::<Trip>()
            .write(WriteSpec::Update { id: EntityId::Server(5) }, json!({"title": "neu"}))
            .await
            .unwrap();
        let record = result.record.unwrap();
        assert_eq!(record.title, "neu");
        assert_eq!(record.destination, "Lissabon");

        let queued = h.queue.pending_operations().await.unwrap();
        assert_eq!(queued[0].endpoint, "/trips/5");
        assert_eq!(queued[0].data, Some(json!({"title": "neu"})));
    }

    #[tokio::test]
    async fn child_write_under_temporary_trip_is_queued_while_online() {
        let h = Harness::new(true).await;
        let temp_trip = EntityId::Temporary(TemporaryId::generate());

        let result = h
            .repo::<Place>()
            .write(
                WriteSpec::Create { parent: Some(temp_trip.clone()) },
                json!({"name": "Cabo da Roca", "latitude": 38.78, "longitude": -9.5}),
            )
            .await
            .unwrap();

        assert!(result.temp);
        assert_eq!(h.api.call_count(), 0);
        let read = h.repo::<Place>().read(&EntityQuery::ByParent(temp_trip)).await;
        assert!(read.is_cached);
        assert_eq!(read.data.len(), 1);
        assert_eq!(h.api.call_count(), 0);
    }

    #[tokio::test]
    async fn invalid_offline_create_is_rejected() {
        let h = Harness::new(false).await;
        let err = h
            .repo::<Place>()
            .write(WriteSpec::Create { parent: Some(EntityId::Server(1)) }, json!({"name": "ohne Koordinaten"}))
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Invalid(_)));
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn watcher_moves_from_loading_to_cached_and_back_to_live() {
        let h = Harness::new(false).await;
        h.store.put(EntityType::Trips, &trip_json(1, "A"), None, None).await.unwrap();
        h.api.serve("/trips", json!([trip_json(1, "A"), trip_json(2, "B")]));

        let mut watcher = h.repo::<Trip>().watch(EntityQuery::All);
        let first = loop {
            let result = tokio::time::timeout(Duration::from_secs(5), watcher.changed())
                .await
                .unwrap()
                .unwrap();
            if !result.is_loading {
                break result;
            }
        };
        assert_eq!(first.state(), ReadState::Cached);
        assert_eq!(first.data.len(), 1);

        h.connectivity.set_online(true);
        let live = tokio::time::timeout(Duration::from_secs(5), watcher.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.state(), ReadState::Live);
        assert_eq!(live.data.len(), 2);
    }

    #[tokio::test]
    async fn queued_edit_is_not_overwritten_by_stale_server_copy() {
        let h = Harness::new(false).await;
        h.store.put(EntityType::Trips, &trip_json(5, "alt"), None, Some(Utc::now())).await.unwrap();
        h.api.serve("/trips/5", trip_json(5, "alt"));
        let trips = h.repo::<Trip>();
        trips
            .write(WriteSpec::Update { id: EntityId::Server(5) }, json!({"title": "neu"}))
            .await
            .unwrap();

        // 联网后、回放之前读取
        h.connectivity.set_online(true);
        let read = trips.read(&EntityQuery::ById(EntityId::Server(5))).await;
        assert_eq!(read.state(), ReadState::Cached);
        assert!(!read.is_offline);
        assert_eq!(read.data[0].title, "neu");
        assert_eq!(h.api.call_count(), 0);
        let cached = h.store.get(EntityType::Trips, &EntityId::Server(5)).await.unwrap().unwrap();
        assert_eq!(cached.payload["title"], json!("neu"));

        h.api.serve("/trips/5", trip_json(5, "neu"));
        assert!(h.queue.process_sync_queue().await.is_clean());
        let live = trips.read(&EntityQuery::ById(EntityId::Server(5))).await;
        assert_eq!(live.state(), ReadState::Live);
        assert_eq!(live.data[0].title, "neu");
    }

    #[tokio::test]
    async fn edit_of_a_synced_temporary_record_targets_the_server_id() {
        let h = Harness::new(false).await;
        let trips = h.repo::<Trip>();
        let created = trips
            .write(WriteSpec::Create { parent: None }, json!({"title": "Tavira", "destination": "Tavira"}))
            .await
            .unwrap();
        let temp_key = created.record.unwrap().id;
        assert!(h.queue.process_sync_queue().await.is_clean());

        trips
            .write(WriteSpec::Update { id: temp_key.clone() }, json!({"title": "Tavira im Mai", "destination": "Tavira"}))
            .await
            .unwrap();
        let queued = h.queue.pending_operations().await.unwrap();
        assert_eq!(queued[0].endpoint, "/trips/100");

        let report = h.queue.process_sync_queue().await;
        assert!(report.is_clean(), "{:?}", report.failed);
        assert_eq!(h.api.calls()[1], (HttpMethod::Put, "/trips/100".to_string()));

        let read = trips.read(&EntityQuery::ById(temp_key)).await;
        assert_eq!(read.data[0].id, EntityId::Server(100));
        assert_eq!(read.data[0].title, "Tavira im Mai");
    }

    #[tokio::test]
    async fn local_store_failure_does_not_reach_the_caller() {
        let h = Harness::new(true).await;
        sqlx::query("DROP TABLE local_entities").execute(&h.pool).await.unwrap();
        h.api.serve("/trips", json!([trip_json(1, "A")]));
        let trips = h.repo::<Trip>();

        let live = trips.read(&EntityQuery::All).await;
        assert_eq!(live.state(), ReadState::Live);
        assert_eq!(live.data.len(), 1);

        h.connectivity.set_online(false);
        let written = trips
            .write(WriteSpec::Create { parent: None }, json!({"title": "Faro", "destination": "Faro"}))
            .await
            .unwrap();
        assert!(written.temp);
        assert_eq!(written.record.unwrap().title, "Faro");
        assert_eq!(h.queue.len().await.unwrap(), 1);

        let cached = trips.read(&EntityQuery::All).await;
        assert!(cached.is_cached);
        assert!(cached.data.is_empty());
    }

    #[tokio::test]
    async fn unreachable_server_during_online_write_is_surfaced() {
        let h = Harness::new(true).await;
        h.api.set_unreachable(true);
        let err = h
            .repo::<Trip>()
            .write(WriteSpec::Create { parent: None }, json!({"title": "Nazaré", "destination": "Nazaré"}))
            .await
            .unwrap_err();

        match err {
            WriteError::Api(api_err) => {
                assert!(matches!(api_err, ApiError::Network(_)));
                assert!(api_err.is_transient());
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(h.queue.is_empty().await.unwrap());
        assert!(h.store.get_all(EntityType::Trips).await.unwrap().is_empty());
    }
}
