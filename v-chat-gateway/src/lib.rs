//! # 聊天网关 / Chat gateway
//!
//! 终结客户端 WebSocket 会话，维护 user_id → 连接 的注册表，
//! 并通过一条 gRPC 双向流（中继桥）与中继核心交换消息。
//! Terminates client WebSocket sessions, keeps the user_id → connection registry,
//! and exchanges messages with the relay core over one gRPC duplex stream (the relay bridge).

pub mod config;
pub mod relay;
pub mod server;
pub mod service;
pub mod tasks;
pub mod ws;

pub use crate::relay::{BridgeError, RelayBridge};
pub use crate::server::{Connection, ConnectionRegistry, GatewayServer};
