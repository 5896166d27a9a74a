use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use v::http::health::SharedHealth;
use v_chat_relay::config::{RelayConfig, StorageBackend};
use v_chat_relay::service::health::RelayHealth;
use v_chat_relay::{server, PersistPool, RelayCore};
use v_chat_storage::{
    ChatStore, MemoryChatStore, MemoryOfflineQueue, MongoChatStore, OfflineQueue, RedisOfflineQueue,
};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-chat-relay gRPC relay core", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 如果提供配置文件路径则使用之，否则加载本服务默认配置
    // Initialize global config with provided file or service default
    let cm = match &args.config {
        Some(path) => v::init_global_config_with_file(path)?,
        None => v::init_global_config_with_file(&format!("{}/config/default.toml", env!("CARGO_MANIFEST_DIR")))?,
    };
    v::init_tracing()?;
    cm.log_sources_info();

    let cfg = RelayConfig::from_manager(&cm)?;
    info!("🎯 Starting v-chat-relay (backend={:?})", cfg.backend);

    let (store, queue): (Arc<dyn ChatStore>, Arc<dyn OfflineQueue>) = match cfg.backend {
        StorageBackend::External => {
            let store = MongoChatStore::connect(&cfg.mongo_uri, &cfg.mongo_database)
                .await
                .context("connect mongodb")?;
            let queue = RedisOfflineQueue::connect(&cfg.redis_url).await.context("connect redis")?;
            (Arc::new(store), Arc::new(queue))
        }
        StorageBackend::Memory => {
            info!("🧪 using in-memory stores, history is not durable");
            (Arc::new(MemoryChatStore::new()), Arc::new(MemoryOfflineQueue::new()))
        }
    };
    store.ensure_indexes().await.context("ensure indexes")?;

    let pool = PersistPool::spawn(Arc::clone(&store), cfg.persist.clone());
    let core = RelayCore::new(queue, pool);

    let grpc_addr: SocketAddr = format!("{}:{}", cfg.host, cfg.grpc_port).parse().context("server.host/grpc_port")?;
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let grpc_core = Arc::clone(&core);
    let grpc = tokio::spawn(async move {
        server::serve(grpc_core, grpc_addr, async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
    });

    let health: SharedHealth = Arc::new(RelayHealth::new(Arc::clone(&core)));
    let http = v::http::serve_health(health, cfg.host.clone(), cfg.http_port);

    tokio::select! {
        res = http => {
            if let Err(e) = res {
                error!("❌ health server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 shutdown requested");
        }
    }

    // 先结束所有网关流，网关看到流结束后自行重连
    // End every gateway stream first; gateways see end-of-stream and reconnect elsewhere
    core.close_all_streams();
    let _ = shutdown_tx.send(true);
    match grpc.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("❌ gRPC server error: {}", e),
        Err(e) => error!("❌ gRPC task join error: {}", e),
    }
    info!("👋 v-chat-relay stopped");
    Ok(())
}
