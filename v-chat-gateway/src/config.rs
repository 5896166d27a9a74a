use std::time::Duration;

use anyhow::{bail, Result};
use v::ConfigManager;

/// 离线队列后端 / Offline queue backend
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    /// 进程内存（开发用）/ Process memory (development)
    Memory,
}

/// 会话参数 / Per-session settings
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Ping 间隔 / Ping interval
    pub ping_interval: Duration,
    /// 无入站流量超时 / No-inbound-traffic timeout
    pub idle_timeout: Duration,
    /// 窗口内允许的畸形帧数 / Malformed frames tolerated per window
    pub max_malformed_frames: u32,
    pub malformed_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(30_000),
            idle_timeout: Duration::from_millis(90_000),
            max_malformed_frames: 10,
            malformed_window: Duration::from_millis(10_000),
        }
    }
}

/// 中继桥参数 / Relay bridge settings
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// 中继 gRPC 地址 / Relay gRPC endpoint, e.g. `http://127.0.0.1:50051`
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// 流结束后重连前等待 / Wait after the stream ends before reconnecting
    pub reconnect_delay: Duration,
    /// 连接失败后重试前等待 / Wait after a failed attempt
    pub retry_delay: Duration,
    /// 连续失败多少次发出告警 / Consecutive failures between alerts
    pub alert_after_attempts: u32,
    /// 发送缓冲容量 / Outbound buffer capacity
    pub buffer_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50051".to_string(),
            connect_timeout: Duration::from_millis(3_000),
            reconnect_delay: Duration::from_millis(2_000),
            retry_delay: Duration::from_millis(5_000),
            alert_after_attempts: 10,
            buffer_capacity: 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub host: String,
    pub ws_port: u16,
    pub http_port: u16,
    pub backend: QueueBackend,
    pub redis_url: String,
    pub session: SessionConfig,
    pub bridge: BridgeConfig,
}

impl GatewayConfig {
    pub fn from_manager(cm: &ConfigManager) -> Result<Self> {
        let backend = match cm.get_or("storage.backend", "redis".to_string()).as_str() {
            "redis" => QueueBackend::Redis,
            "memory" => QueueBackend::Memory,
            other => bail!("unknown storage.backend '{}' (expected redis|memory)", other),
        };
        let s = SessionConfig::default();
        let b = BridgeConfig::default();
        let ms = |key: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_millis(cm.get_int_or::<u64>(key, default.as_millis() as i64)?.max(1)))
        };

        let session = SessionConfig {
            ping_interval: ms("session.ping_interval_ms", s.ping_interval)?,
            idle_timeout: ms("session.idle_timeout_ms", s.idle_timeout)?,
            max_malformed_frames: cm.get_int_or("session.max_malformed_frames", s.max_malformed_frames as i64)?,
            malformed_window: ms("session.malformed_window_ms", s.malformed_window)?,
        };
        if session.idle_timeout <= session.ping_interval {
            bail!("session.idle_timeout_ms must be greater than session.ping_interval_ms");
        }

        Ok(Self {
            host: cm.get_or("server.host", "127.0.0.1".to_string()),
            ws_port: cm.get_int_or("server.ws_port", 5200)?,
            http_port: cm.get_int_or("server.http_port", 8080)?,
            backend,
            redis_url: cm.get_or("redis.url", "redis://127.0.0.1:6379".to_string()),
            session,
            bridge: BridgeConfig {
                endpoint: cm.get_or("relay.endpoint", b.endpoint),
                connect_timeout: ms("relay.connect_timeout_ms", b.connect_timeout)?,
                reconnect_delay: ms("relay.reconnect_delay_ms", b.reconnect_delay)?,
                retry_delay: ms("relay.retry_delay_ms", b.retry_delay)?,
                alert_after_attempts: cm.get_int_or::<u32>("relay.alert_after_attempts", b.alert_after_attempts as i64)?.max(1),
                buffer_capacity: cm.get_int_or::<usize>("relay.buffer_capacity", b.buffer_capacity as i64)?.max(1),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v::{ConfigSource, FileFormat};

    fn manager(toml: &str) -> ConfigManager {
        ConfigManager::from_sources_only(vec![ConfigSource::String { content: toml.to_string(), format: FileFormat::Toml }])
            .unwrap()
    }

    #[test]
    fn defaults_follow_reconnect_protocol() {
        let cfg = GatewayConfig::from_manager(&manager("")).unwrap();
        assert_eq!(cfg.bridge.reconnect_delay, Duration::from_secs(2));
        assert_eq!(cfg.bridge.retry_delay, Duration::from_secs(5));
        assert_eq!(cfg.session.ping_interval, Duration::from_secs(30));
        assert_eq!(cfg.backend, QueueBackend::Redis);
    }

    #[test]
    fn reads_session_overrides() {
        let cfg = GatewayConfig::from_manager(&manager(
            "[session]\nping_interval_ms = 100\nidle_timeout_ms = 500\nmax_malformed_frames = 2\n[storage]\nbackend = \"memory\"",
        ))
        .unwrap();
        assert_eq!(cfg.session.ping_interval, Duration::from_millis(100));
        assert_eq!(cfg.session.max_malformed_frames, 2);
        assert_eq!(cfg.backend, QueueBackend::Memory);
    }

    #[test]
    fn idle_timeout_must_exceed_ping_interval() {
        let err = GatewayConfig::from_manager(&manager("[session]\nping_interval_ms = 1000\nidle_timeout_ms = 1000"));
        assert!(err.is_err());
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        assert!(GatewayConfig::from_manager(&manager("[server]\nws_port = 70000")).is_err());
        assert!(GatewayConfig::from_manager(&manager("[relay]\nbuffer_capacity = -1")).is_err());
    }
}
