use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use v::http::health::SharedHealth;
use v_chat_gateway::config::{GatewayConfig, QueueBackend};
use v_chat_gateway::service::health::GatewayHealth;
use v_chat_gateway::{ConnectionRegistry, GatewayServer, RelayBridge};
use v_chat_storage::{MemoryOfflineQueue, OfflineQueue, RedisOfflineQueue};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-chat-gateway WebSocket gateway", long_about = None)]
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

    let cfg = GatewayConfig::from_manager(&cm)?;
    info!("🎯 Starting v-chat-gateway (relay={})", cfg.bridge.endpoint);

    let offline: Arc<dyn OfflineQueue> = match cfg.backend {
        QueueBackend::Redis => Arc::new(RedisOfflineQueue::connect(&cfg.redis_url).await.context("connect redis")?),
        QueueBackend::Memory => {
            info!("🧪 using in-memory offline queue, only useful with an in-process relay");
            Arc::new(MemoryOfflineQueue::new())
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let bridge = RelayBridge::new(cfg.bridge.clone(), Arc::clone(&registry), Arc::clone(&offline));
    let server = GatewayServer::new(Arc::clone(&registry), Arc::clone(&bridge), offline, cfg.session.clone());

    let bridge_task = {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move { bridge.run_forever().await })
    };

    let health: SharedHealth = Arc::new(GatewayHealth::new(Arc::clone(&registry), Arc::clone(&bridge)));
    let http = v::http::serve_health(health, cfg.host.clone(), cfg.http_port);
    let ws = server.run(&cfg.host, cfg.ws_port);

    tokio::select! {
        res = ws => {
            if let Err(e) = res {
                error!("❌ WebSocket server failed: {}", e);
            }
        }
        res = http => {
            if let Err(e) = res {
                error!("❌ health server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 shutdown requested");
        }
    }

    bridge.shutdown();
    match bridge_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("❌ relay bridge error: {}", e),
        Err(e) => error!("❌ relay bridge join error: {}", e),
    }
    info!("👋 v-chat-gateway stopped");
    Ok(())
}
