use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use uuid::Uuid;
use v_chat_storage::OfflineQueue;

use crate::config::SessionConfig;
use crate::relay::RelayBridge;

/// 一个已激活的客户端连接 / One active client connection
#[derive(Clone, Debug)]
pub struct Connection {
    /// 连接唯一标识，区分同一用户的先后会话 / Unique per connection, tells successive sessions of a user apart
    pub conn_id: Uuid,
    pub user_id: u32,
    pub addr: SocketAddr,
    /// 写任务发送端 / Writer task sender
    pub sender: mpsc::UnboundedSender<Message>,
    pub connected_at: DateTime<Utc>,
}

/// 连接注册表：user_id → 连接，后写者覆盖
/// Connection registry: user_id → connection, last writer wins
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<u32, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接；已有连接会先被关闭再替换
    /// Register a connection; an existing one is closed before it is replaced
    pub fn register(&self, conn: Connection) -> Option<Connection> {
        let user_id = conn.user_id;
        let conn_id = conn.conn_id;
        let previous = self.connections.insert(user_id, conn);
        if let Some(prev) = &previous {
            if prev.conn_id != conn_id {
                info!("🔁 uid={} replaced connection {} with {}", user_id, prev.conn_id, conn_id);
                let _ = self.close_connection(prev, CloseCode::Normal, "replaced by a newer connection");
            }
        } else {
            debug!("➕ uid={} registered as {}", user_id, conn_id);
        }
        previous
    }

    /// 无条件移除（幂等）/ Remove unconditionally (idempotent)
    pub fn unregister(&self, user_id: u32) -> Option<Connection> {
        self.connections.remove(&user_id).map(|(_, conn)| conn)
    }

    /// 仅当条目仍是该连接时移除 / Remove only if the entry is still this connection
    pub fn unregister_conn(&self, user_id: u32, conn_id: Uuid) -> bool {
        self.connections.remove_if(&user_id, |_, c| c.conn_id == conn_id).is_some()
    }

    pub fn lookup(&self, user_id: u32) -> Option<Connection> {
        self.connections.get(&user_id).map(|c| c.value().clone())
    }

    pub fn contains(&self, user_id: u32) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn user_ids(&self) -> Vec<u32> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// 网关共享状态，显式注入到每个会话
/// Gateway shared state, injected explicitly into every session
#[derive(Clone)]
pub struct GatewayServer {
    pub registry: Arc<ConnectionRegistry>,
    pub bridge: Arc<RelayBridge>,
    pub offline: Arc<dyn OfflineQueue>,
    pub session: SessionConfig,
}

impl GatewayServer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<RelayBridge>,
        offline: Arc<dyn OfflineQueue>,
        session: SessionConfig,
    ) -> Self {
        Self { registry, bridge, offline, session }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(user_id: u32) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let c = Connection {
            conn_id: Uuid::new_v4(),
            user_id,
            addr: "127.0.0.1:9000".parse().unwrap(),
            sender: tx,
            connected_at: Utc::now(),
        };
        (c, rx)
    }

    #[test]
    fn lookup_returns_newest_and_old_is_closed() {
        let reg = ConnectionRegistry::new();
        let (first, mut first_rx) = conn(1);
        let (second, _second_rx) = conn(1);
        let second_id = second.conn_id;

        assert!(reg.register(first).is_none());
        let replaced = reg.register(second).expect("previous connection");
        assert_ne!(replaced.conn_id, second_id);
        assert_eq!(reg.lookup(1).unwrap().conn_id, second_id);
        assert_eq!(reg.len(), 1);
        assert!(matches!(first_rx.try_recv(), Ok(Message::Close(Some(_)))));
    }

    #[test]
    fn conn_scoped_unregister_keeps_successor() {
        let reg = ConnectionRegistry::new();
        let (first, _rx1) = conn(7);
        let (second, _rx2) = conn(7);
        let first_id = first.conn_id;
        reg.register(first);
        reg.register(second);

        assert!(!reg.unregister_conn(7, first_id));
        assert!(reg.contains(7));
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = ConnectionRegistry::new();
        let (c, _rx) = conn(3);
        reg.register(c);
        assert!(reg.unregister(3).is_some());
        assert!(reg.unregister(3).is_none());
        assert!(reg.lookup(3).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn user_ids_lists_every_registration() {
        let reg = ConnectionRegistry::new();
        let (a, _ra) = conn(1);
        let (b, _rb) = conn(2);
        reg.register(a);
        reg.register(b);
        let mut ids = reg.user_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }
}
