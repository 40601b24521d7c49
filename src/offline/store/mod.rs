//! 本地存储模块
//!
//! 持久化实体缓存（SQLite），页面/进程重启后仍然可用

pub mod dao;
pub mod models;
pub mod service;

pub use dao::LocalStoreDao;
pub use models::{CachedEntity, QuarantinedPayload, StorageStats, StoreOutcome};
pub use service::LocalStore;
