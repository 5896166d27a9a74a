use async_trait::async_trait;
use chrono::{DateTime, Utc};
use v::ChatMessage;

use crate::error::Result;
use crate::model::{Chat, PersistedMessage};

/// 持久化聊天存储接口，便于测试替换 / Durable chat store, a trait for testability
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// 创建查询所需索引 / Create the indexes queries rely on
    async fn ensure_indexes(&self) -> Result<()>;

    /// 查找或创建参与者对的会话（与顺序无关）/ Find or create the chat for a pair, order independent
    async fn find_or_create_chat(&self, a: u32, b: u32) -> Result<Chat>;

    /// 以给定 id 追加一条消息；同一 id 再次写入返回已有记录
    /// Append a message under the given id; writing the same id again returns the stored row
    async fn append_message(&self, chat_id: &str, message_id: &str, msg: &ChatMessage) -> Result<PersistedMessage>;

    /// 更新会话的最后一条消息摘要 / Refresh a chat's last-message summary
    async fn touch_last_message(&self, chat_id: &str, content: &str, at: DateTime<Utc>) -> Result<()>;

    /// 最近的消息（新到旧）/ Most recent messages, newest first
    async fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<PersistedMessage>>;

    /// 用户参与的会话（按最后消息时间倒序）/ Chats of a user ordered by last message, newest first
    async fn list_chats(&self, user_id: u32, limit: usize) -> Result<Vec<Chat>>;

    /// 完整持久化一条消息：会话、消息、摘要。每一步都可重放，重试不会产生重复行
    /// Persist one message end to end: chat, message row, summary. Every step can be replayed,
    /// so a retry with the same `message_id` never writes a second row.
    async fn record_message(&self, message_id: &str, msg: &ChatMessage) -> Result<PersistedMessage> {
        let chat = self.find_or_create_chat(msg.sender_id, msg.receiver_id).await?;
        let persisted = self.append_message(&chat.id, message_id, msg).await?;
        self.touch_last_message(&chat.id, &msg.content, persisted.created_at).await?;
        Ok(persisted)
    }
}
