pub mod offline;

// 重新导出常用类型，方便外部使用
pub use offline::{
    ApiError, ClientConfig, EntityId, EntityQuery, EntityType, OfflineClient, OfflineRepository,
    ReadResult, StorageStats, SyncReport, SyncStatus, TemporaryId, WriteResult, WriteSpec,
};
