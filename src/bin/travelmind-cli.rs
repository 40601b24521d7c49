//! TravelMind 离线同步 CLI
//!
//! 查看本地缓存和同步队列、手动触发同步、清空离线数据

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info, warn};
use travelmind_offline_core::offline::listener::{NoticeListener, SyncNotice, SyncStatusListener};
use travelmind_offline_core::offline::{
    ClientConfig, EntityId, EntityQuery, EntityType, OfflineClient, OfflineRecord,
    OfflineRepository, SyncStatus,
};

/// TravelMind 离线同步 CLI
#[derive(Parser, Debug)]
#[command(name = "travelmind-cli")]
#[command(about = "TravelMind 离线同步 CLI - 查看缓存、回放同步队列", long_about = None)]
struct Args {
    /// REST API 基础地址
    #[arg(long, env = "TRAVELMIND_API_URL", default_value = "http://localhost:8000/api")]
    api_base_url: String,

    /// Bearer token
    #[arg(long, env = "TRAVELMIND_TOKEN", default_value = "")]
    token: String,

    /// 本地 SQLite 数据库地址
    #[arg(long, env = "TRAVELMIND_DB_URL", default_value = "sqlite://travelmind_offline.db?mode=rwc")]
    db_url: String,

    /// 以离线模式运行（只读本地缓存）
    #[arg(long)]
    offline: bool,

    /// 日志级别（默认: info,travelmind_offline_core=debug）
    #[arg(long, default_value = "info,travelmind_offline_core=debug")]
    log_level: String,

    /// 同时把日志写入该文件
    #[arg(long)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 各类型缓存条数、待同步数、隔离数
    Stats,
    /// 列出待同步操作
    Queue,
    /// 回放同步队列
    Sync,
    /// 清空全部离线数据
    Clear,
    /// 列出某类实体（trips / diary / places / expenses）
    List {
        entity_type: EntityType,
        /// 所属行程 ID（子实体）
        #[arg(long)]
        trip_id: Option<EntityId>,
    },
}

/// 初始化日志（stdout，可选同时写入文件）
fn init_logger(log_level: &str, log_file: Option<&str>) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG（如果设置了），否则使用命令行参数
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(false)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file {
        info!("[CLI] 📝 日志已同时输出到控制台和文件: {}", path);
    }
    Ok(())
}

struct CliNoticeListener;

#[async_trait::async_trait]
impl NoticeListener for CliNoticeListener {
    async fn on_notice(&self, notice: SyncNotice) {
        match notice {
            SyncNotice::QueuedForSync {
                entity_type,
                operation,
            } => info!("[CLI/Notice] 📥 {} {} 将在联网后同步", entity_type, operation),
            SyncNotice::SyncCompleted { succeeded, failed } => {
                info!("[CLI/Notice] ✅ 同步完成: 成功 {}, 失败 {}", succeeded, failed)
            }
        }
    }

    async fn on_session_expired(&self) {
        error!("[CLI/Notice] ⚠️ 登录已过期，请更新 token");
    }
}

struct CliSyncStatusListener;

#[async_trait::async_trait]
impl SyncStatusListener for CliSyncStatusListener {
    async fn on_sync_status_changed(&self, status: SyncStatus) {
        info!(
            "[CLI/Sync] syncing={} pending={} last_error={:?}",
            status.syncing, status.pending_operations, status.last_error
        );
    }
}

async fn print_list<R: OfflineRecord>(repository: OfflineRepository<R>, query: EntityQuery) -> Result<()> {
    let result = repository.read(&query).await;
    info!(
        "[CLI] {} 共 {} 条（cached={}, offline={}）",
        repository.entity_type(),
        result.data.len(),
        result.is_cached,
        result.is_offline
    );
    println!("{}", serde_json::to_string_pretty(&result.data)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logger(&args.log_level, args.log_file.as_deref())?;

    let mut config = ClientConfig::new(args.api_base_url.clone(), args.token.clone());
    config.db_url = args.db_url.clone();
    config.start_online = !args.offline;

    info!("[CLI] 🚀 TravelMind 离线同步 CLI");
    info!("[CLI] 🌐 API: {} | 💾 数据库: {}", config.api_base_url, config.db_url);

    let client = OfflineClient::with_listener(config, Arc::new(CliNoticeListener)).await?;
    let _status_subscription = client.on_sync_status_change(Arc::new(CliSyncStatusListener));

    match args.command {
        Command::Stats => {
            let stats = client.get_storage_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Queue => {
            let operations = client.pending_operations().await?;
            info!("[CLI] 📋 待同步操作共 {} 条", operations.len());
            println!("{}", serde_json::to_string_pretty(&operations)?);
        }
        Command::Sync => {
            if args.offline {
                warn!("[CLI] 当前为离线模式，仍然尝试回放");
            }
            let report = client.trigger_sync().await;
            if report.skipped {
                warn!("[CLI] 已有同步在进行");
            }
            for failed in &report.failed {
                let op = &failed.operation;
                match failed.reason.status() {
                    _ if failed.reason.is_retryable() => warn!(
                        "[CLI] ⏳ #{} {} {} 暂未同步，稍后重试: {}",
                        op.queue_id, op.method, op.endpoint, failed.reason
                    ),
                    Some(status) => error!(
                        "[CLI] ❌ #{} {} {} 被服务器拒绝 (HTTP {}): {}",
                        op.queue_id, op.method, op.endpoint, status, failed.reason
                    ),
                    None => error!(
                        "[CLI] ❌ #{} {} {}: {}",
                        op.queue_id, op.method, op.endpoint, failed.reason
                    ),
                }
            }
            if let Some(err) = &report.error {
                error!("[CLI] ❌ {}", err);
            }
            info!(
                "[CLI] 同步结束: 成功 {}，失败 {}",
                report.succeeded.len(),
                report.failed.len()
            );
        }
        Command::Clear => {
            client.clear_all_offline_data().await?;
            info!("[CLI] 🧹 已清空离线数据");
        }
        Command::List {
            entity_type,
            trip_id,
        } => {
            let query = match trip_id {
                Some(trip) => EntityQuery::ByParent(trip),
                None => EntityQuery::All,
            };
            match entity_type {
                EntityType::Trips => print_list(client.trips(), query).await?,
                EntityType::DiaryEntries => print_list(client.diary(), query).await?,
                EntityType::Places => print_list(client.places(), query).await?,
                EntityType::Expenses => print_list(client.expenses(), query).await?,
            }
        }
    }

    client.close().await;
    Ok(())
}
