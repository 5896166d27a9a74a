//! # 中继核心 / Relay core
//!
//! 每个网关进程通过一条 gRPC 双向流接入。对每条入站消息：
//! Each gateway process attaches through one gRPC duplex stream. For every inbound message:
//!
//! 1. 记录发送者 → 当前流的映射 / record sender → this stream
//! 2. 交给持久化工作池（独立执行，不等待）/ hand it to the persistence pool (not awaited)
//! 3. 接收者在线则直接投递，否则写入离线队列 / deliver to the receiver's stream, else queue offline

pub mod config;
pub mod relay_core;
pub mod persist;
pub mod server;
pub mod service;

pub use crate::relay_core::{DeliveryOutcome, RelayCore};
pub use crate::persist::{PersistConfig, PersistPool};
