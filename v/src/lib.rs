// v 库主入口，按需导出模块

pub mod comm;
pub use crate::comm::config::*;
pub use crate::comm::tracing::init_tracing;

pub mod chat;
pub use crate::chat::{ChatMessage, ErrorFrame};

#[cfg(feature = "web_actix")]
pub mod response;
#[cfg(feature = "web_actix")]
pub mod http;

/// 中继协议（tonic 生成）/ Relay protocol (generated by tonic)
pub mod proto {
    tonic::include_proto!("relay");
}

// 重新导出 tracing 宏，方便各服务使用
// Re-export tracing macros for service convenience
pub use tracing::{debug, error, info, trace, warn};

// 健康检查接口与状态定义（统一对外暴露）
// Health check interface and status definitions (unified public exposure)
use async_trait::async_trait;

/// 健康状态结构体：用于表示组件当前健康状况
/// Health status struct: represents the current health of a component
#[derive(Debug, serde::Serialize)]
pub struct HealthStatus {
    /// 组件名称（如 chat_gateway、chat_relay）
    /// Component name (e.g., chat_gateway, chat_relay)
    pub component: String,
    /// 是否健康（true=健康，false=不健康）
    /// Whether healthy (true=healthy, false=unhealthy)
    pub healthy: bool,
    /// 是否可接收流量 / Whether the component accepts traffic
    pub ready: bool,
    /// 附加消息（错误信息或提示）
    /// Additional message (error details or hint)
    pub message: Option<String>,
    /// 采样时间戳（UTC）
    /// Sample timestamp (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// 健康检查通用接口：由各服务或资源实现具体检查逻辑
/// Generic health check interface: implemented by services/resources with concrete logic
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// 执行健康检查并返回健康状态
    /// Perform health check and return the status
    async fn check_health(&self) -> HealthStatus;
}
