//! 离线客户端
//!
//! 显式构造的会话级服务：登录后 `start()`，退出登录时 `logout()`。
//! 持有连接池、API、本地存储、同步队列、协调器，并按实体类型提供仓库。

use crate::offline::api::{HttpRemoteApi, RemoteApi, DEFAULT_REQUEST_TIMEOUT};
use crate::offline::coordinator::{ConnectivityMonitor, Invalidation, SyncCoordinator};
use crate::offline::db::create_sqlite_pool;
use crate::offline::listener::{EmptyNoticeListener, NoticeListener, SyncStatusListener};
use crate::offline::models::{DiaryEntry, Expense, OfflineRecord, Place, Trip};
use crate::offline::queue::{QueuedOperation, SyncQueue, SyncReport, SyncStatus, SyncStatusSubscription};
use crate::offline::repository::OfflineRepository;
use crate::offline::store::{LocalStore, QuarantinedPayload, StorageStats};
use anyhow::Result;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// 客户端配置
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// REST API 基础地址（含 `/api` 前缀）
    pub api_base_url: String,
    /// Bearer token
    pub token: String,
    /// 本地 SQLite 数据库 URL
    ///
    /// 例如：`sqlite://travelmind_offline.db?mode=rwc`
    pub db_url: String,
    /// 单次请求超时
    pub request_timeout: Duration,
    /// 连接池最大连接数
    pub max_connections: u32,
    /// 创建时的联网状态
    pub start_online: bool,
}

impl ClientConfig {
    /// 创建默认配置
    pub fn new(api_base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            token: token.into(),
            db_url: "sqlite://travelmind_offline.db?mode=rwc".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_connections: 5,
            start_online: true,
        }
    }
}

/// 离线客户端
pub struct OfflineClient {
    config: ClientConfig,
    pool: Pool<Sqlite>,
    api: Arc<dyn RemoteApi>,
    store: LocalStore,
    queue: Arc<SyncQueue>,
    connectivity: Arc<ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
    notices: Arc<dyn NoticeListener>,
}

impl OfflineClient {
    /// 创建客户端（使用默认空监听器）
    pub async fn new(config: ClientConfig) -> Result<Self> {
        Self::with_listener(config, Arc::new(EmptyNoticeListener)).await
    }

    /// 创建客户端（自定义提示监听器，内部创建连接池和 HTTP 客户端）
    pub async fn with_listener(config: ClientConfig, notices: Arc<dyn NoticeListener>) -> Result<Self> {
        info!("[Client] 创建离线客户端，API: {}, 数据库: {}", config.api_base_url, config.db_url);
        let pool = create_sqlite_pool(&config.db_url, config.max_connections).await?;
        let api = Arc::new(HttpRemoteApi::with_token(
            config.api_base_url.clone(),
            &config.token,
            config.request_timeout,
        )?);
        Self::with_components(config, pool, api, notices).await
    }

    /// 使用现成的连接池和 API 创建客户端（连接池表结构需已初始化）
    pub async fn with_components(
        config: ClientConfig,
        pool: Pool<Sqlite>,
        api: Arc<dyn RemoteApi>,
        notices: Arc<dyn NoticeListener>,
    ) -> Result<Self> {
        let store = LocalStore::new(pool.clone());
        let queue = Arc::new(SyncQueue::new(pool.clone(), store.clone(), api.clone(), notices.clone()).await?);
        let connectivity = Arc::new(ConnectivityMonitor::new(config.start_online));
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            connectivity.clone(),
            notices.clone(),
        ));

        Ok(Self {
            config,
            pool,
            api,
            store,
            queue,
            connectivity,
            coordinator,
            notices,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// 会话开始：启动联网状态监听
    pub fn start(&self) {
        self.coordinator.start();
    }

    /// 停止联网状态监听（不清理数据）
    pub fn stop(&self) {
        self.coordinator.stop();
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    /// 退出登录：停止监听并清空全部离线数据
    pub async fn logout(&self) -> Result<()> {
        info!("[Client] 退出登录，清空离线数据");
        self.coordinator.stop();
        self.clear_all_offline_data().await
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.coordinator.stop();
        self.pool.close().await;
    }

    /// 宿主上报联网状态
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn connectivity(&self) -> Arc<ConnectivityMonitor> {
        self.connectivity.clone()
    }

    /// 任意实体类型的仓库
    pub fn repository<R: OfflineRecord>(&self) -> OfflineRepository<R> {
        OfflineRepository::new(
            self.store.clone(),
            self.queue.clone(),
            self.api.clone(),
            self.connectivity.clone(),
            self.coordinator.invalidation_sender(),
            self.notices.clone(),
        )
    }

    pub fn trips(&self) -> OfflineRepository<Trip> {
        self.repository()
    }

    pub fn diary(&self) -> OfflineRepository<DiaryEntry> {
        self.repository()
    }

    pub fn places(&self) -> OfflineRepository<Place> {
        self.repository()
    }

    pub fn expenses(&self) -> OfflineRepository<Expense> {
        self.repository()
    }

    /// 手动同步（回放 + 失效）
    pub async fn trigger_sync(&self) -> SyncReport {
        self.coordinator.trigger_sync().await
    }

    /// 每种实体的缓存条数、待同步操作数、隔离数
    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            entities: self.store.counts().await?,
            pending_operations: self.queue.len().await?,
            quarantined: self.store.quarantined_count().await?,
        })
    }

    /// 清空本地缓存、隔离表与同步队列
    pub async fn clear_all_offline_data(&self) -> Result<()> {
        self.store.clear_all().await?;
        self.queue.clear().await?;
        self.coordinator.invalidate(Invalidation::All);
        info!("[Client] 🧹 已清空全部离线数据");
        Ok(())
    }

    pub async fn pending_operations(&self) -> Result<Vec<QueuedOperation>> {
        self.queue.pending_operations().await
    }

    pub async fn quarantined(&self) -> Result<Vec<QuarantinedPayload>> {
        self.store.quarantined().await
    }

    /// 注册同步状态监听器
    pub fn on_sync_status_change(&self, listener: Arc<dyn SyncStatusListener>) -> SyncStatusSubscription {
        self.queue.on_sync_status_change(listener)
    }

    pub fn subscribe_sync_status(&self) -> watch::Receiver<SyncStatus> {
        self.queue.subscribe_status()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.queue.sync_status()
    }

    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<Invalidation> {
        self.coordinator.subscribe_invalidations()
    }
}
