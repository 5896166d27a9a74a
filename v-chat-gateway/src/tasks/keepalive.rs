use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::SessionConfig;

/// 最近一次入站流量时间 / Time of the last inbound traffic
#[derive(Debug)]
pub struct ActivityClock {
    last: Mutex<Instant>,
}

impl ActivityClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { last: Mutex::new(Instant::now()) })
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

/// 保活退出原因 / Why keepalive stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveExit {
    /// 超过空闲时间没有入站流量 / No inbound traffic within the idle timeout
    IdleTimeout,
    /// Ping 无法入队（写任务已结束）/ Ping could not be queued, writer is gone
    SendFailed,
}

/// 启动保活任务：定时 Ping 并检查空闲
/// Spawn keepalive: periodic ping plus idle check
pub fn spawn_keepalive(
    user_id: u32,
    sender: mpsc::UnboundedSender<Message>,
    activity: Arc<ActivityClock>,
    cfg: &SessionConfig,
) -> JoinHandle<KeepaliveExit> {
    let ping_interval = cfg.ping_interval;
    let idle_timeout = cfg.idle_timeout;
    tokio::spawn(async move {
        let mut ticker = interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
        loop {
            ticker.tick().await;
            let idle = activity.idle_for();
            if idle >= idle_timeout {
                warn!("⏰ uid={} idle for {:?}, closing", user_id, idle);
                return KeepaliveExit::IdleTimeout;
            }
            if sender.send(Message::Ping(Vec::new())).is_err() {
                warn!("💔 uid={} ping failed, closing", user_id);
                return KeepaliveExit::SendFailed;
            }
            debug!("💓 ping uid={}", user_id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(70),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn pings_then_times_out_without_traffic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_keepalive(1, tx, ActivityClock::new(), &fast());
        assert!(matches!(rx.recv().await, Some(Message::Ping(_))));
        assert_eq!(handle.await.unwrap(), KeepaliveExit::IdleTimeout);
    }

    #[tokio::test]
    async fn stops_when_writer_is_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let handle = spawn_keepalive(1, tx, ActivityClock::new(), &fast());
        assert_eq!(handle.await.unwrap(), KeepaliveExit::SendFailed);
    }

    #[tokio::test]
    async fn traffic_keeps_session_alive() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let clock = ActivityClock::new();
        let handle = spawn_keepalive(1, tx, clock.clone(), &fast());
        for _ in 0..5 {
            assert!(matches!(rx.recv().await, Some(Message::Ping(_))));
            clock.touch();
        }
        assert!(!handle.is_finished());
        handle.abort();
    }
}
