//! 同步队列服务层
//!
//! 离线或写入失败时记录变更，联网后按 queue_id 顺序逐条回放。
//! 回放期间的失败只记录不抛出：失败的操作留在队列中，继续处理后面的操作。

use crate::offline::api::{ApiError, RemoteApi};
use crate::offline::listener::{NoticeListener, SyncStatusListener};
use crate::offline::queue::dao::SyncQueueDao;
use crate::offline::queue::models::{
    FailedOperation, FailureReason, NewOperation, QueuedOperation, SyncReport, SyncStatus,
};
use crate::offline::queue::status::{SyncStatusNotifier, SyncStatusSubscription};
use crate::offline::store::LocalStore;
use crate::offline::types::{
    collect_temporary_ids, endpoint_temporary_ids, replace_in_endpoint, replace_temporary_id,
    EntityId, EntityType, OperationType, TemporaryId,
};
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 回放期间持有，离开作用域时释放同步标记
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 同步队列
pub struct SyncQueue {
    dao: SyncQueueDao,
    store: LocalStore,
    api: Arc<dyn RemoteApi>,
    notices: Arc<dyn NoticeListener>,
    status: SyncStatusNotifier,
    /// 同一时间只允许一次回放
    syncing: AtomicBool,
    last_queue_id: AtomicI64,
}

impl SyncQueue {
    /// 创建同步队列，queue_id 计数从已持久化的最大值继续
    pub async fn new(
        db: Pool<Sqlite>,
        store: LocalStore,
        api: Arc<dyn RemoteApi>,
        notices: Arc<dyn NoticeListener>,
    ) -> Result<Self> {
        let dao = SyncQueueDao::new(db);
        let last_queue_id = dao.max_queue_id().await?.unwrap_or(0);
        let pending = dao.count().await?.max(0) as u64;
        info!(
            "[SyncQueue] 初始化同步队列，待同步 {} 条，最大 queue_id: {}",
            pending, last_queue_id
        );

        let status = SyncStatusNotifier::new();
        status.update(|s| s.pending_operations = pending).await;

        Ok(Self {
            dao,
            store,
            api,
            notices,
            status,
            syncing: AtomicBool::new(false),
            last_queue_id: AtomicI64::new(last_queue_id),
        })
    }

    /// 分配严格递增的 queue_id：毫秒时间戳 × 1000，同一毫秒内或时钟回拨时取上一个 + 1
    pub fn next_queue_id(&self) -> i64 {
        let candidate = Utc::now().timestamp_millis().saturating_mul(1000);
        let previous = self
            .last_queue_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(candidate.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        candidate.max(previous + 1)
    }

    /// 入队并立即持久化
    pub async fn queue_operation(&self, op: NewOperation) -> Result<QueuedOperation> {
        let queued = QueuedOperation {
            queue_id: self.next_queue_id(),
            op_type: op.op_type,
            entity_type: op.entity_type,
            endpoint: op.endpoint,
            method: op.method,
            data: op.data,
            temporary_id: op.temporary_id,
            parent_id: op.parent_id,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        };
        self.dao.insert(&queued).await?;
        info!(
            "[SyncQueue] 📥 入队 #{} {} {} {}",
            queued.queue_id, queued.op_type, queued.method, queued.endpoint
        );
        self.refresh_pending().await;
        Ok(queued)
    }

    /// 按回放顺序列出待同步操作
    pub async fn pending_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.dao.list_ordered().await
    }

    pub async fn len(&self) -> Result<u64> {
        Ok(self.dao.count().await?.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// 清空队列
    pub async fn clear(&self) -> Result<()> {
        self.dao.clear().await?;
        self.refresh_pending().await;
        Ok(())
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// 某实体类型是否还有待同步的操作
    pub async fn has_pending_for(&self, entity_type: EntityType) -> Result<bool> {
        Ok(self.dao.count_for_entity_type(entity_type).await? > 0)
    }

    /// 已回放成功的临时 ID 对应的服务器 ID
    pub async fn resolved_server_id(&self, temp: &TemporaryId) -> Result<Option<i64>> {
        self.dao.find_resolution(temp).await
    }

    /// 将已解析的临时 ID 换成服务器 ID；未解析或查询失败时原样返回
    pub async fn resolve_entity_id(&self, id: &EntityId) -> EntityId {
        let Some(temp) = id.as_temporary() else {
            return id.clone();
        };
        match self.dao.find_resolution(temp).await {
            Ok(Some(server_id)) => {
                debug!("[SyncQueue] 临时ID {} 已解析为 {}", temp, server_id);
                EntityId::Server(server_id)
            }
            Ok(None) => id.clone(),
            Err(e) => {
                warn!("[SyncQueue] 查询临时ID映射失败: {:?}", e);
                id.clone()
            }
        }
    }

    /// 替换载荷 ID / 外键字段中已解析的临时 ID
    pub async fn resolve_payload(&self, payload: &mut Value) {
        let mut refs = Vec::new();
        collect_temporary_ids(payload, &mut refs);
        for temp in refs {
            match self.dao.find_resolution(&temp).await {
                Ok(Some(server_id)) => {
                    replace_temporary_id(payload, &temp, server_id);
                }
                Ok(None) => {}
                Err(e) => warn!("[SyncQueue] 查询临时ID映射失败: {:?}", e),
            }
        }
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// 注册同步状态监听器，返回的句柄用于解除监听
    pub fn on_sync_status_change(&self, listener: Arc<dyn SyncStatusListener>) -> SyncStatusSubscription {
        self.status.on_sync_status_change(listener)
    }

    async fn refresh_pending(&self) {
        match self.dao.count().await {
            Ok(count) => {
                let pending = count.max(0) as u64;
                self.status.update(|s| s.pending_operations = pending).await;
            }
            Err(e) => warn!("[SyncQueue] 统计待同步数量失败: {:?}", e),
        }
    }

    /// 回放队列
    ///
    /// 已有回放在进行时立即返回 `skipped` 报告，不发出任何请求。
    pub async fn process_sync_queue(&self) -> SyncReport {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("[SyncQueue] 已有同步在进行，跳过本次调用");
            return SyncReport::skipped();
        }
        let _guard = SyncingGuard(&self.syncing);

        self.status
            .update(|s| {
                s.syncing = true;
                s.last_error = None;
            })
            .await;

        let report = self.drain().await;

        let pending = match self.dao.count().await {
            Ok(count) => count.max(0) as u64,
            Err(e) => {
                warn!("[SyncQueue] 统计待同步数量失败: {:?}", e);
                report.failed.len() as u64
            }
        };
        let last_error = report.error.clone().or_else(|| {
            report
                .failed
                .last()
                .map(|f| format!("#{}: {}", f.operation.queue_id, f.reason))
        });
        let clean = report.is_clean();
        self.status
            .update(|s| {
                s.syncing = false;
                s.last_error = last_error;
                s.pending_operations = pending;
                if clean {
                    s.last_synced_at = Some(Utc::now());
                }
            })
            .await;

        report
    }

    async fn drain(&self) -> SyncReport {
        let mut report = SyncReport::default();

        let operations = match self.dao.list_ordered().await {
            Ok(ops) => ops,
            Err(e) => {
                error!("[SyncQueue] ❌ 读取同步队列失败: {:?}", e);
                report.error = Some(format!("读取同步队列失败: {}", e));
                return report;
            }
        };
        if operations.is_empty() {
            debug!("[SyncQueue] 队列为空，无需同步");
            return report;
        }
        info!("[SyncQueue] 🔄 开始同步，共 {} 条操作", operations.len());

        // 之前的回放已解析的临时 ID 同样适用于本次
        let mut resolved: HashMap<TemporaryId, i64> = match self.dao.list_resolutions().await {
            Ok(pairs) => pairs.into_iter().collect(),
            Err(e) => {
                warn!("[SyncQueue] 读取临时ID映射失败: {:?}", e);
                HashMap::new()
            }
        };
        for mut op in operations {
            for (temp, server_id) in &resolved {
                substitute(&mut op, temp, *server_id);
            }

            if let Some(dependency) = unresolved_dependency(&op) {
                info!(
                    "[SyncQueue] ⏸️ #{} 依赖尚未同步的 {}，保留在队列中",
                    op.queue_id, dependency
                );
                let reason = FailureReason::DependencyPending(dependency);
                self.record_failure(&op, &reason).await;
                report.failed.push(FailedOperation { operation: op, reason });
                continue;
            }

            match self.api.request(op.method, &op.endpoint, op.data.as_ref()).await {
                Ok(response) => {
                    let server_id = response.as_ref().and_then(response_server_id);
                    if op.op_type == OperationType::Create
                        && op.temporary_id.is_some()
                        && server_id.is_none()
                    {
                        warn!(
                            "[SyncQueue] ⚠️ #{} 创建成功但响应中没有服务器ID，保留在队列中",
                            op.queue_id
                        );
                        let reason = FailureReason::MissingServerId;
                        self.record_failure(&op, &reason).await;
                        report.failed.push(FailedOperation { operation: op, reason });
                        continue;
                    }

                    if let Err(e) = self.dao.remove(op.queue_id).await {
                        error!("[SyncQueue] 出队 #{} 失败: {:?}", op.queue_id, e);
                    }
                    if let Some((temp, server_id)) =
                        self.apply_success(&op, response.as_ref(), server_id).await
                    {
                        resolved.insert(temp.clone(), server_id);
                        report.resolved_ids.push((temp, server_id));
                    }
                    debug!("[SyncQueue] ✅ #{} {} {}", op.queue_id, op.method, op.endpoint);
                    report.succeeded.push(op);
                }
                Err(err) => {
                    warn!(
                        "[SyncQueue] ❌ #{} {} {} 失败: {}",
                        op.queue_id, op.method, op.endpoint, err
                    );
                    if err == ApiError::Unauthorized {
                        self.notices.on_session_expired().await;
                    }
                    let reason = FailureReason::Remote(err);
                    self.record_failure(&op, &reason).await;
                    report.failed.push(FailedOperation { operation: op, reason });
                }
            }
        }

        info!(
            "[SyncQueue] 同步结束，成功 {} 条，失败 {} 条",
            report.succeeded.len(),
            report.failed.len()
        );
        report
    }

    async fn record_failure(&self, op: &QueuedOperation, reason: &FailureReason) {
        if let Err(e) = self.dao.record_failure(op.queue_id, &reason.to_string()).await {
            warn!("[SyncQueue] 记录 #{} 失败信息出错: {:?}", op.queue_id, e);
        }
    }

    /// 回放成功后回写本地存储；create 返回解析出的临时 ID
    ///
    /// 本地存储失败只记录日志。
    async fn apply_success(
        &self,
        op: &QueuedOperation,
        response: Option<&Value>,
        server_id: Option<i64>,
    ) -> Option<(TemporaryId, i64)> {
        let now = Some(Utc::now());
        match op.op_type {
            OperationType::Create => match (&op.temporary_id, server_id) {
                (Some(temp), Some(server_id)) => {
                    if let Err(e) = self.dao.insert_resolution(temp, op.entity_type, server_id).await {
                        warn!("[SyncQueue] 记录临时ID映射失败: {:?}", e);
                    }
                    if let Err(e) = self
                        .store
                        .replace_temporary_id(op.entity_type, temp, server_id, response)
                        .await
                    {
                        warn!("[SyncQueue] 本地存储替换临时ID失败: {:?}", e);
                    }
                    if let Err(e) = self.rewrite_queued_references(temp, server_id).await {
                        warn!("[SyncQueue] 改写队列中的临时ID失败: {:?}", e);
                    }
                    Some((temp.clone(), server_id))
                }
                _ => {
                    if let Some(payload) = response {
                        self.write_through(op, payload, now).await;
                    }
                    None
                }
            },
            OperationType::Update => {
                if let Some(payload) = response {
                    self.write_through(op, payload, now).await;
                }
                None
            }
            OperationType::Delete => {
                let target = op.endpoint.rsplit('/').next().map(str::parse::<EntityId>);
                if let Some(Ok(id)) = target {
                    if let Err(e) = self.store.delete(op.entity_type, &id).await {
                        warn!("[SyncQueue] 本地存储删除失败: {:?}", e);
                    }
                }
                None
            }
        }
    }

    async fn write_through(
        &self,
        op: &QueuedOperation,
        payload: &Value,
        synced_at: Option<chrono::DateTime<Utc>>,
    ) {
        if let Err(e) = self
            .store
            .put(op.entity_type, payload, op.parent_id.as_ref(), synced_at)
            .await
        {
            warn!("[SyncQueue] 本地存储回写失败: {:?}", e);
        }
    }

    /// 将已持久化的排队操作中的临时 ID 改写为服务器 ID
    async fn rewrite_queued_references(&self, temp: &TemporaryId, server_id: i64) -> Result<()> {
        let referencing = self.dao.find_referencing(temp.as_str()).await?;
        for mut op in referencing {
            substitute(&mut op, temp, server_id);
            self.dao.update_target(&op).await?;
        }
        Ok(())
    }
}

/// 响应中的服务器 ID：整数，或纯数字字符串
fn response_server_id(response: &Value) -> Option<i64> {
    match response.get("id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// 在操作的路径、数据和所属行程中替换临时 ID
fn substitute(op: &mut QueuedOperation, temp: &TemporaryId, server_id: i64) {
    op.endpoint = replace_in_endpoint(&op.endpoint, temp, server_id);
    if let Some(data) = op.data.as_mut() {
        replace_temporary_id(data, temp, server_id);
    }
    if op.parent_id.as_ref().and_then(EntityId::as_temporary) == Some(temp) {
        op.parent_id = Some(EntityId::Server(server_id));
    }
}

/// 操作引用的、不是由它自己创建的第一个临时 ID
fn unresolved_dependency(op: &QueuedOperation) -> Option<TemporaryId> {
    let mut refs = endpoint_temporary_ids(&op.endpoint);
    if let Some(data) = &op.data {
        collect_temporary_ids(data, &mut refs);
    }
    if let Some(parent) = op.parent_id.as_ref().and_then(EntityId::as_temporary) {
        refs.push(parent.clone());
    }
    refs.into_iter()
        .find(|t| op.temporary_id.as_ref() != Some(t))
}
