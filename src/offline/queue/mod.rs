//! 同步队列模块
//!
//! 持久化待同步的变更并按入队顺序回放

pub mod dao;
pub mod models;
pub mod service;
pub mod status;

pub use dao::SyncQueueDao;
pub use models::{
    FailedOperation, FailureReason, NewOperation, QueuedOperation, SyncReport, SyncStatus,
};
pub use service::SyncQueue;
pub use status::{SyncStatusNotifier, SyncStatusSubscription};
