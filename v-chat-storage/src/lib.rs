//! # 聊天存储 / Chat storage
//!
//! 两个外部存储的访问层：
//! Access layer for the two external stores:
//!
//! - [`ChatStore`]：文档库中的 `chats` 与 `messages` 集合，历史记录的权威来源
//!   `chats` and `messages` collections in a document store, the system of record
//! - [`OfflineQueue`]：键值库中按接收者分组的有序列表，只存放发送时对方不在线的消息
//!   per-recipient ordered list in a key-value store for recipients that were offline
//!
//! 每个存储都有外部实现（MongoDB / Redis）和内存实现（开发与测试）。
//! Each has an external implementation (MongoDB / Redis) and an in-memory one.

pub mod chat_store;
pub mod error;
pub mod memory;
pub mod model;
pub mod mongo;
pub mod offline;
pub mod redis_queue;

pub use chat_store::ChatStore;
pub use error::{Result, StorageError};
pub use memory::{MemoryChatStore, MemoryOfflineQueue};
pub use model::{new_message_id, Chat, PersistedMessage};
pub use mongo::MongoChatStore;
pub use offline::{offline_key, OfflineQueue};
pub use redis_queue::RedisOfflineQueue;
