//! 同步队列的数据结构

use crate::offline::api::ApiError;
use crate::offline::types::{EntityId, EntityType, HttpMethod, OperationType, TemporaryId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 已入队的变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// 入队时分配的单调递增 ID，回放按此顺序进行
    pub queue_id: i64,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub entity_type: EntityType,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: Option<Value>,
    /// create 操作为新实体生成的临时 ID
    pub temporary_id: Option<TemporaryId>,
    /// 子实体所属行程（回放成功后写回本地存储时使用）
    pub parent_id: Option<EntityId>,
    pub created_at: DateTime<Utc>,
    /// 已尝试回放的次数
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// 待入队的变更（queue_id 由队列分配）
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub op_type: OperationType,
    pub entity_type: EntityType,
    pub endpoint: String,
    pub method: HttpMethod,
    pub data: Option<Value>,
    pub temporary_id: Option<TemporaryId>,
    pub parent_id: Option<EntityId>,
}

impl NewOperation {
    /// 创建实体（POST 到集合路径）
    pub fn create(
        entity_type: EntityType,
        endpoint: String,
        data: Value,
        temporary_id: TemporaryId,
        parent_id: Option<EntityId>,
    ) -> Self {
        Self {
            op_type: OperationType::Create,
            entity_type,
            endpoint,
            method: HttpMethod::Post,
            data: Some(data),
            temporary_id: Some(temporary_id),
            parent_id,
        }
    }

    /// 更新实体（PUT 到单体路径）
    pub fn update(entity_type: EntityType, id: &EntityId, data: Value, parent_id: Option<EntityId>) -> Self {
        Self {
            op_type: OperationType::Update,
            entity_type,
            endpoint: entity_type.item_endpoint(id),
            method: HttpMethod::Put,
            data: Some(data),
            temporary_id: None,
            parent_id,
        }
    }

    /// 删除实体
    pub fn delete(entity_type: EntityType, id: &EntityId) -> Self {
        Self {
            op_type: OperationType::Delete,
            entity_type,
            endpoint: entity_type.item_endpoint(id),
            method: HttpMethod::Delete,
            data: None,
            temporary_id: None,
            parent_id: None,
        }
    }
}

/// 单个操作回放失败的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// 服务器或网络返回的错误
    Remote(ApiError),
    /// 依赖的创建操作尚未同步成功，操作保持排队
    DependencyPending(TemporaryId),
    /// create 请求成功但响应中没有可识别的服务器 ID，临时 ID 无法替换
    MissingServerId,
}

impl FailureReason {
    /// 无需人工处理、重新联网后再次回放即可能成功
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureReason::Remote(e) => e.is_transient(),
            FailureReason::DependencyPending(_) => true,
            FailureReason::MissingServerId => false,
        }
    }

    /// 服务器返回的 HTTP 状态码
    pub fn status(&self) -> Option<u16> {
        match self {
            FailureReason::Remote(e) => e.status(),
            _ => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Remote(e) => write!(f, "{}", e),
            FailureReason::DependencyPending(t) => write!(f, "等待依赖的临时ID {} 同步", t),
            FailureReason::MissingServerId => f.write_str("服务器响应中没有实体ID"),
        }
    }
}

/// 回放失败的操作（仍留在队列中）
#[derive(Debug, Clone, PartialEq)]
pub struct FailedOperation {
    pub operation: QueuedOperation,
    pub reason: FailureReason,
}

/// 一次回放的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// 成功并已出队的操作
    pub succeeded: Vec<QueuedOperation>,
    pub failed: Vec<FailedOperation>,
    /// 已有回放在进行，本次调用未执行
    pub skipped: bool,
    /// 本次回放解析出的临时 ID -> 服务器 ID
    pub resolved_ids: Vec<(TemporaryId, i64)>,
    /// 无法读取队列等整体性错误
    pub error: Option<String>,
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.error.is_none()
    }
}

/// 同步状态（进程内，不持久化）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub syncing: bool,
    pub last_error: Option<String>,
    pub pending_operations: u64,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_classification() {
        let offline = FailureReason::Remote(ApiError::Network("connection refused".into()));
        assert!(offline.is_retryable());
        assert_eq!(offline.status(), None);
        assert!(FailureReason::Remote(ApiError::Timeout).is_retryable());

        let rejected = FailureReason::Remote(ApiError::from_status(422, "destination missing"));
        assert!(!rejected.is_retryable());
        assert_eq!(rejected.status(), Some(422));
        assert_eq!(FailureReason::Remote(ApiError::Unauthorized).status(), Some(401));

        let waiting = FailureReason::DependencyPending(TemporaryId::generate());
        assert!(waiting.is_retryable());
        assert!(!FailureReason::MissingServerId.is_retryable());
        assert_eq!(FailureReason::MissingServerId.status(), None);
    }
}
