//! Notify Sync CLI
//!
//! 查看通知、标记已读，以及持续同步通知列表和未读计数

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use notify_sync::{
    FetchAdapter, HttpNotificationApi, MutationAdapter, Notification, NotificationSnapshot, PushChannel,
    Reconciler, SyncConfig, SyncError, SyncState, TcpPushChannel,
};

#[derive(Parser)]
#[command(name = "nsync")]
#[command(about = "Notify Sync - 通知列表与未读计数同步")]
#[command(version)]
struct Cli {
    /// 配置文件路径 (默认: ~/.config/notify-sync/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// API 基础地址
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Bearer token
    #[arg(long, global = true)]
    token: Option<String>,
    /// 推送服务地址 (host:port)
    #[arg(long, global = true)]
    push_addr: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出通知（最新在前）
    List {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
        /// 只显示未读
        #[arg(long)]
        unread_only: bool,
    },
    /// 显示未读数量
    Count,
    /// 标记单条通知为已读
    Read {
        /// 通知 ID
        id: u64,
    },
    /// 全部标记为已读
    ReadAll,
    /// 持续同步并在变化时输出
    Watch {
        /// 输出 JSON 格式（每行一个快照）
        #[arg(long)]
        json: bool,
    },
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let mut config = SyncConfig::load_from(path)?;
            config.apply_env();
            config
        }
        None => SyncConfig::auto_load()?,
    };
    config.apply_overrides(cli.api_url.clone(), cli.token.clone(), cli.push_addr.clone());
    config.validate()?;
    Ok(config)
}

fn build_api(config: &SyncConfig) -> Result<HttpNotificationApi> {
    Ok(HttpNotificationApi::new(&config.api_base_url, config.request_timeout())?.with_page_size(config.page_size))
}

fn print_notification(n: &Notification) {
    let marker = if n.is_read { " " } else { "●" };
    println!(
        "  {} {} #{} [{}] {}",
        marker,
        n.kind.icon(),
        n.id,
        n.created_at.format("%Y-%m-%d %H:%M"),
        n.message
    );
    if let Some(link) = &n.link {
        println!("        → {}", link);
    }
}

fn print_snapshot(snapshot: &NotificationSnapshot) {
    let state = match snapshot.state {
        SyncState::Idle => "空闲",
        SyncState::Syncing => "同步中",
        SyncState::Live => "已同步",
    };
    println!("[{}] 未读: {} | 共 {} 条", state, snapshot.unread_count, snapshot.items.len());
    for n in snapshot.unread_items().take(10) {
        print_notification(n);
    }
    if snapshot.last_refresh_failed {
        println!("  (最近一次刷新失败，稍后重试)");
    }
    if snapshot.failed_confirmations > 0 {
        println!("  ({} 次已读标记未被服务端确认)", snapshot.failed_confirmations);
    }
    if snapshot.auth_required {
        println!("  (认证已失效，请更新 token)");
    }
}

/// 认证错误给出可操作的提示
fn explain(err: SyncError) -> anyhow::Error {
    match err {
        SyncError::Auth(_) => anyhow::anyhow!("{} (check the configured token)", err),
        other => other.into(),
    }
}

async fn watch(config: SyncConfig, json: bool) -> Result<()> {
    let auth = config.auth_context()?;
    let api = Arc::new(build_api(&config)?);
    let push = TcpPushChannel::from_config(&config.push).map(|c| Arc::new(c) as Arc<dyn PushChannel>);
    if push.is_none() {
        info!("No push address configured, relying on periodic refresh");
    }

    let (handle, task) = Reconciler::spawn(api.clone(), api, push, config.reconciler_settings());
    let mut updates = handle.subscribe();
    handle.login(auth).await?;

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Reconciler stopped unexpectedly");
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if json {
                    println!("{}", serde_json::to_string(&snapshot)?);
                } else {
                    print_snapshot(&snapshot);
                }
                if snapshot.auth_required {
                    warn!("Session expired, stopping watch");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    // 句柄可能已关闭，忽略错误
    let _ = handle.logout().await;
    let _ = handle.shutdown().await;
    if let Err(e) = task.await {
        debug!(error = %e, "Reconciler task join failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=debug nsync watch
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("notify_sync=info,nsync=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::List { json, unread_only } => {
            let auth = config.auth_context()?;
            let api = build_api(&config)?.with_unread_only(unread_only);
            let page = config.retry.run("list", || api.list(&auth)).await.map_err(explain)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&page.items)?);
            } else if page.items.is_empty() {
                println!("暂无通知");
            } else {
                println!("共 {} 条通知:\n", page.items.len());
                for n in &page.items {
                    print_notification(n);
                }
            }
        }
        Commands::Count => {
            let auth = config.auth_context()?;
            let api = build_api(&config)?;
            let count = config.retry.run("count", || api.count(&auth)).await.map_err(explain)?;
            println!("{}", count);
        }
        Commands::Read { id } => {
            let auth = config.auth_context()?;
            let api = build_api(&config)?;
            match config.retry.run("mark_one", || api.mark_one(&auth, id)).await {
                Ok(()) => println!("✅ 已标记 #{} 为已读", id),
                Err(SyncError::NotFound(_)) => eprintln!("未找到通知 #{}", id),
                Err(e) => return Err(explain(e)),
            }
        }
        Commands::ReadAll => {
            let auth = config.auth_context()?;
            let api = build_api(&config)?;
            config.retry.run("mark_all", || api.mark_all(&auth)).await.map_err(explain)?;
            println!("✅ 已全部标记为已读");
        }
        Commands::Watch { json } => watch(config, json).await?,
    }

    Ok(())
}
