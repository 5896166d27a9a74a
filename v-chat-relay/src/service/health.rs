use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use v::{HealthCheck, HealthStatus};

use crate::relay_core::RelayCore;

/// 中继健康检查 / Relay health check
pub struct RelayHealth {
    core: Arc<RelayCore>,
}

impl RelayHealth {
    pub fn new(core: Arc<RelayCore>) -> Self {
        Self { core }
    }
}

// 为中继实现统一健康检查接口
// Implement unified HealthCheck for the relay
#[async_trait]
impl HealthCheck for RelayHealth {
    /// 统计流数量、映射用户数与投递计数
    /// Report stream count, mapped users and delivery counters
    async fn check_health(&self) -> HealthStatus {
        let stats = self.core.stats();
        let persist = self.core.persist().stats();
        let failed = persist.failed.load(Ordering::Relaxed);
        HealthStatus {
            component: "chat_relay".to_string(),
            healthy: true,
            ready: true,
            message: Some(format!(
                "streams={} mapped_users={} delivered={} queued={} queue_failed={} flushed={} persisted={} persist_failed={}",
                self.core.open_streams(),
                self.core.mapped_users(),
                stats.delivered.load(Ordering::Relaxed),
                stats.queued.load(Ordering::Relaxed),
                stats.queue_failed.load(Ordering::Relaxed),
                stats.flushed.load(Ordering::Relaxed),
                persist.persisted.load(Ordering::Relaxed),
                failed,
            )),
            timestamp: chrono::Utc::now(),
        }
    }
}
