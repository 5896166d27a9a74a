//! 内存实现（开发与测试）/ In-memory implementations for development and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use v::ChatMessage;

use crate::chat_store::ChatStore;
use crate::error::{Result, StorageError};
use crate::model::{normalize_pair, pair_key, Chat, PersistedMessage};
use crate::offline::OfflineQueue;

#[derive(Default)]
struct ChatTables {
    next_id: u64,
    chats: HashMap<String, Chat>,
    pairs: HashMap<String, String>,
    messages: Vec<PersistedMessage>,
}

impl ChatTables {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:024x}", self.next_id)
    }
}

/// 内存聊天存储 / In-memory chat store
#[derive(Default)]
pub struct MemoryChatStore {
    tables: Mutex<ChatTables>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 全部消息（按写入顺序）/ Every stored message, in write order
    pub fn all_messages(&self) -> Vec<PersistedMessage> {
        self.tables.lock().messages.clone()
    }

    pub fn chat_count(&self) -> usize {
        self.tables.lock().chats.len()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn ensure_indexes(&self) -> Result<()> {
        Ok(())
    }

    async fn find_or_create_chat(&self, a: u32, b: u32) -> Result<Chat> {
        let key = pair_key(a, b);
        let mut t = self.tables.lock();
        if let Some(chat) = t.pairs.get(&key).and_then(|id| t.chats.get(id)) {
            return Ok(chat.clone());
        }
        let now = Utc::now();
        let chat = Chat {
            id: t.allocate_id(),
            participants: normalize_pair(a, b),
            last_message: None,
            last_message_at: None,
            created_at: now,
            updated_at: now,
        };
        t.pairs.insert(key, chat.id.clone());
        t.chats.insert(chat.id.clone(), chat.clone());
        Ok(chat)
    }

    async fn append_message(&self, chat_id: &str, message_id: &str, msg: &ChatMessage) -> Result<PersistedMessage> {
        let mut t = self.tables.lock();
        if !t.chats.contains_key(chat_id) {
            return Err(StorageError::Missing(format!("chat {}", chat_id)));
        }
        if let Some(existing) = t.messages.iter().find(|m| m.id == message_id) {
            return Ok(existing.clone());
        }
        let persisted = PersistedMessage {
            id: message_id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: msg.sender_id,
            receiver_id: msg.receiver_id,
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            created_at: Utc::now(),
            is_deleted: false,
            is_recalled: false,
            is_read: false,
        };
        t.messages.push(persisted.clone());
        Ok(persisted)
    }

    async fn touch_last_message(&self, chat_id: &str, content: &str, at: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.lock();
        let chat = t.chats.get_mut(chat_id).ok_or_else(|| StorageError::Missing(format!("chat {}", chat_id)))?;
        chat.last_message = Some(content.to_string());
        chat.last_message_at = Some(at);
        chat.updated_at = at;
        Ok(())
    }

    async fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<PersistedMessage>> {
        let t = self.tables.lock();
        let mut list: Vec<PersistedMessage> = t.messages.iter().filter(|m| m.chat_id == chat_id).cloned().collect();
        list.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        list.truncate(limit);
        Ok(list)
    }

    async fn list_chats(&self, user_id: u32, limit: usize) -> Result<Vec<Chat>> {
        let t = self.tables.lock();
        let mut list: Vec<Chat> = t.chats.values().filter(|c| c.participants.contains(&user_id)).cloned().collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        list.truncate(limit);
        Ok(list)
    }
}

/// 内存离线队列 / In-memory offline queue
#[derive(Default)]
pub struct MemoryOfflineQueue {
    lists: Mutex<HashMap<u32, VecDeque<String>>>,
}

impl MemoryOfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 键是否存在（空列表即不存在，与 Redis 一致）/ Whether the key exists; empty lists do not, as in Redis
    pub fn contains_key(&self, user_id: u32) -> bool {
        self.lists.lock().contains_key(&user_id)
    }
}

#[async_trait]
impl OfflineQueue for MemoryOfflineQueue {
    async fn push(&self, user_id: u32, payload: &str) -> Result<()> {
        self.lists.lock().entry(user_id).or_default().push_back(payload.to_string());
        Ok(())
    }

    async fn drain_all(&self, user_id: u32) -> Result<Vec<String>> {
        Ok(self.lists.lock().remove(&user_id).map(Vec::from).unwrap_or_default())
    }

    async fn len(&self, user_id: u32) -> Result<usize> {
        Ok(self.lists.lock().get(&user_id).map(|l| l.len()).unwrap_or(0))
    }
}
