use std::sync::Arc;

use async_trait::async_trait;
use v::{HealthCheck, HealthStatus};

use crate::relay::RelayBridge;
use crate::server::ConnectionRegistry;

/// 网关健康检查 / Gateway health check
pub struct GatewayHealth {
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<RelayBridge>,
}

impl GatewayHealth {
    pub fn new(registry: Arc<ConnectionRegistry>, bridge: Arc<RelayBridge>) -> Self {
        Self { registry, bridge }
    }
}

// 为网关实现统一健康检查接口
// Implement unified HealthCheck for the gateway
#[async_trait]
impl HealthCheck for GatewayHealth {
    /// 进程存活即健康；中继流在线才就绪
    /// Healthy while the process serves; ready only with a live relay stream
    async fn check_health(&self) -> HealthStatus {
        let relay_connected = self.bridge.is_connected();
        HealthStatus {
            component: "chat_gateway".to_string(),
            healthy: true,
            ready: relay_connected,
            message: Some(format!(
                "online={} relay_connected={} relay_failed_attempts={} relay_sessions={}",
                self.registry.len(),
                relay_connected,
                self.bridge.failed_attempts(),
                self.bridge.sessions(),
            )),
            timestamp: chrono::Utc::now(),
        }
    }
}
