//! 联网状态与同步协调
//!
//! `ConnectivityMonitor` 由宿主（浏览器事件、系统网络状态或 CLI 参数）驱动；
//! `SyncCoordinator` 在离线 -> 在线时先回放队列，再广播缓存失效。

use crate::offline::listener::{NoticeListener, SyncNotice};
use crate::offline::queue::{SyncQueue, SyncReport};
use crate::offline::types::EntityType;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const INVALIDATION_CAPACITY: usize = 64;

/// 联网状态
pub struct ConnectivityMonitor {
    sender: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (sender, _) = watch::channel(online);
        Self { sender }
    }

    /// 更新联网状态；状态未变化时不通知订阅者
    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "[Connectivity] {}",
                if online { "🌐 已联网" } else { "📴 已离线" }
            );
        }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// 缓存失效信号：收到后活跃的查询重新拉取
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    All,
    Entity(EntityType),
}

impl Invalidation {
    pub fn affects(&self, entity_type: EntityType) -> bool {
        match self {
            Invalidation::All => true,
            Invalidation::Entity(t) => *t == entity_type,
        }
    }
}

/// 同步协调器
pub struct SyncCoordinator {
    queue: Arc<SyncQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    notices: Arc<dyn NoticeListener>,
    invalidations: broadcast::Sender<Invalidation>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<SyncQueue>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: Arc<dyn NoticeListener>,
    ) -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            queue,
            connectivity,
            notices,
            invalidations,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 启动联网状态监听任务（重复调用无副作用）
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("[SyncCoordinator] 已在运行");
            return;
        }

        let coordinator = Arc::downgrade(self);
        let mut connectivity = self.connectivity.subscribe();
        *task = Some(tokio::spawn(async move {
            info!("[SyncCoordinator] 🔄 启动联网状态监听");
            let mut was_online = *connectivity.borrow_and_update();
            while connectivity.changed().await.is_ok() {
                let online = *connectivity.borrow_and_update();
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                if online && !was_online {
                    info!("[SyncCoordinator] 恢复联网，开始回放同步队列");
                    coordinator.drain_then_invalidate().await;
                } else if !online && was_online {
                    debug!("[SyncCoordinator] 离线，读取将回退到本地缓存");
                }
                was_online = online;
            }
            debug!("[SyncCoordinator] 监听任务结束");
        }));
    }

    /// 停止监听任务
    pub fn stop(&self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
            info!("[SyncCoordinator] ⏹️ 已停止");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<Invalidation> {
        self.invalidations.subscribe()
    }

    pub(crate) fn invalidation_sender(&self) -> broadcast::Sender<Invalidation> {
        self.invalidations.clone()
    }

    /// 广播缓存失效（没有订阅者时忽略）
    pub fn invalidate(&self, invalidation: Invalidation) {
        let receivers = self.invalidations.send(invalidation).unwrap_or(0);
        debug!("[SyncCoordinator] 广播 {:?}，订阅者 {}", invalidation, receivers);
    }

    /// 手动触发同步：不论当前检测到的联网状态，都执行回放 + 失效
    pub async fn trigger_sync(&self) -> SyncReport {
        info!("[SyncCoordinator] 手动触发同步");
        self.drain_then_invalidate().await
    }

    async fn drain_then_invalidate(&self) -> SyncReport {
        let report = self.queue.process_sync_queue().await;
        if report.skipped {
            return report;
        }

        if let Some(error) = &report.error {
            warn!("[SyncCoordinator] 同步失败: {}", error);
        }
        if !report.succeeded.is_empty() || !report.failed.is_empty() {
            self.notices
                .on_notice(SyncNotice::SyncCompleted {
                    succeeded: report.succeeded.len(),
                    failed: report.failed.len(),
                })
                .await;
        }
        self.invalidate(Invalidation::All);
        report
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }
}
