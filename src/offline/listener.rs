//! 离线同步层的监听器回调接口

use crate::offline::queue::models::SyncStatus;
use crate::offline::types::{EntityType, OperationType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 同步状态监听器
#[async_trait]
pub trait SyncStatusListener: Send + Sync {
    /// 同步状态发生变化（开始/结束一次回放，或待同步数量变化）
    async fn on_sync_status_changed(&self, status: SyncStatus);
}

/// 默认空实现（无操作）
pub struct EmptySyncStatusListener;

#[async_trait]
impl SyncStatusListener for EmptySyncStatusListener {
    async fn on_sync_status_changed(&self, _status: SyncStatus) {
        // 默认不做任何处理
    }
}

/// 面向界面的提示消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncNotice {
    /// 离线写入已进入同步队列，联网后同步
    QueuedForSync {
        entity_type: EntityType,
        operation: OperationType,
    },
    /// 一次回放结束
    SyncCompleted { succeeded: usize, failed: usize },
}

/// 提示消息监听器（类似前端的 toast 通道，发出即忘）
#[async_trait]
pub trait NoticeListener: Send + Sync {
    async fn on_notice(&self, notice: SyncNotice);

    /// 服务器返回 401，需要重新登录
    async fn on_session_expired(&self);
}

/// 默认空实现（无操作）
pub struct EmptyNoticeListener;

#[async_trait]
impl NoticeListener for EmptyNoticeListener {
    async fn on_notice(&self, _notice: SyncNotice) {
        // 默认不做任何处理
    }

    async fn on_session_expired(&self) {
        // 默认不做任何处理
    }
}
