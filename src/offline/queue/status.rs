//! 同步状态通知
//!
//! 状态同时通过 `watch` 通道和已注册的监听器发布。注册监听器返回订阅句柄，
//! 调用 `unsubscribe()` 或丢弃句柄即解除注册。

use crate::offline::listener::SyncStatusListener;
use crate::offline::queue::models::SyncStatus;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::debug;

type ListenerMap = Mutex<HashMap<u64, Arc<dyn SyncStatusListener>>>;

fn lock(map: &ListenerMap) -> MutexGuard<'_, HashMap<u64, Arc<dyn SyncStatusListener>>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 同步状态发布者
pub struct SyncStatusNotifier {
    sender: watch::Sender<SyncStatus>,
    listeners: Arc<ListenerMap>,
    next_id: AtomicU64,
}

impl Default for SyncStatusNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusNotifier {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(SyncStatus::default());
        Self {
            sender,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// 当前状态快照
    pub fn current(&self) -> SyncStatus {
        self.sender.borrow().clone()
    }

    /// 以 watch 通道订阅状态
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.sender.subscribe()
    }

    /// 注册监听器
    pub fn on_sync_status_change(&self, listener: Arc<dyn SyncStatusListener>) -> SyncStatusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners).insert(id, listener);
        debug!("[SyncStatus] 注册监听器 #{}", id);
        SyncStatusSubscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// 修改状态并通知所有订阅者
    pub async fn update(&self, modify: impl FnOnce(&mut SyncStatus)) {
        self.sender.send_modify(modify);
        let status = self.current();

        let listeners: Vec<Arc<dyn SyncStatusListener>> =
            lock(&self.listeners).values().cloned().collect();
        for listener in listeners {
            listener.on_sync_status_changed(status.clone()).await;
        }
    }
}

/// 监听器订阅句柄
#[must_use = "丢弃订阅句柄会立即解除监听"]
pub struct SyncStatusSubscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl SyncStatusSubscription {
    /// 解除监听
    pub fn unsubscribe(self) {
        // Drop 中完成
    }

    fn detach(&self) {
        if let Some(listeners) = self.listeners.upgrade() {
            if lock(&listeners).remove(&self.id).is_some() {
                debug!("[SyncStatus] 解除监听器 #{}", self.id);
            }
        }
    }
}

impl Drop for SyncStatusSubscription {
    fn drop(&mut self) {
        self.detach();
    }
}
