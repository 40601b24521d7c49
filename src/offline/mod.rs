//! TravelMind 离线同步层
//!
//! - `store`：本地实体缓存（SQLite）
//! - `queue`：待同步变更的有序队列与回放
//! - `coordinator`：联网状态变化时回放队列并广播缓存失效
//! - `repository`：按实体类型的离线感知读写

pub mod api;
pub mod client;
pub mod coordinator;
pub mod db;
pub mod listener;
pub mod models;
pub mod queue;
pub mod repository;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiError, HttpRemoteApi, RemoteApi};
pub use client::{ClientConfig, OfflineClient};
pub use coordinator::{ConnectivityMonitor, Invalidation, SyncCoordinator};
pub use listener::{
    EmptyNoticeListener, EmptySyncStatusListener, NoticeListener, SyncNotice, SyncStatusListener,
};
pub use models::{DiaryEntry, Expense, OfflineRecord, Place, Trip};
pub use queue::{FailureReason, QueuedOperation, SyncQueue, SyncReport, SyncStatus};
pub use repository::{
    EntityQuery, OfflineRepository, QueryWatcher, ReadResult, ReadState, WriteError, WriteResult,
    WriteSpec,
};
pub use store::{CachedEntity, LocalStore, StorageStats};
pub use types::{EntityId, EntityType, TemporaryId};
