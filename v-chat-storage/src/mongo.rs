//! MongoDB 聊天存储 / MongoDB chat store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{self, doc, oid::ObjectId, Bson};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v::ChatMessage;

use crate::chat_store::ChatStore;
use crate::error::{Result, StorageError};
use crate::model::{normalize_pair, pair_key, Chat, PersistedMessage};

const CHATS: &str = "chats";
const MESSAGES: &str = "messages";
const DUPLICATE_KEY: i32 = 11000;

// ============================================================================
// 文档结构 / Document shapes
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ChatDocument {
    #[serde(rename = "_id")]
    id: ObjectId,
    participants: Vec<i64>,
    pair_key: String,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_at: Option<bson::DateTime>,
    created_at: bson::DateTime,
    updated_at: bson::DateTime,
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageDocument {
    #[serde(rename = "_id")]
    id: ObjectId,
    chat_id: ObjectId,
    sender_id: i64,
    receiver_id: i64,
    content: String,
    timestamp: i64,
    is_deleted: bool,
    is_recalled: bool,
    is_read: bool,
    created_at: bson::DateTime,
    updated_at: bson::DateTime,
}

fn to_bson_time(at: DateTime<Utc>) -> bson::DateTime {
    bson::DateTime::from_millis(at.timestamp_millis())
}

fn to_chrono(at: bson::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or_default()
}

impl From<ChatDocument> for Chat {
    fn from(d: ChatDocument) -> Self {
        let lo = d.participants.first().copied().unwrap_or_default() as u32;
        let hi = d.participants.get(1).copied().unwrap_or(lo as i64) as u32;
        Chat {
            id: d.id.to_hex(),
            participants: [lo, hi],
            last_message: d.last_message,
            last_message_at: d.last_message_at.map(to_chrono),
            created_at: to_chrono(d.created_at),
            updated_at: to_chrono(d.updated_at),
        }
    }
}

impl From<MessageDocument> for PersistedMessage {
    fn from(d: MessageDocument) -> Self {
        PersistedMessage {
            id: d.id.to_hex(),
            chat_id: d.chat_id.to_hex(),
            sender_id: d.sender_id as u32,
            receiver_id: d.receiver_id as u32,
            content: d.content,
            timestamp: d.timestamp,
            created_at: to_chrono(d.created_at),
            is_deleted: d.is_deleted,
            is_recalled: d.is_recalled,
            is_read: d.is_read,
        }
    }
}

fn parse_chat_id(chat_id: &str) -> Result<ObjectId> {
    ObjectId::parse_str(chat_id).map_err(|_| StorageError::Missing(format!("invalid chat id {}", chat_id)))
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    match e.kind.as_ref() {
        ErrorKind::Command(c) => c.code == DUPLICATE_KEY,
        ErrorKind::Write(WriteFailure::WriteError(w)) => w.code == DUPLICATE_KEY,
        _ => false,
    }
}

// ============================================================================
// MongoChatStore
// ============================================================================

/// MongoDB 实现 / MongoDB implementation
#[derive(Clone)]
pub struct MongoChatStore {
    client: Client,
    chats: Collection<ChatDocument>,
    messages: Collection<MessageDocument>,
}

impl MongoChatStore {
    /// 连接并选择数据库 / Connect and select the database
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);
        info!("🗄️  MongoDB chat store ready: db={}", database);
        Ok(Self { chats: db.collection(CHATS), messages: db.collection(MESSAGES), client })
    }

    /// 连通性检查 / Connectivity check
    pub async fn ping(&self) -> Result<()> {
        self.client.database("admin").run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MongoChatStore {
    async fn ensure_indexes(&self) -> Result<()> {
        let unique = IndexOptions::builder().unique(true).build();
        self.chats
            .create_indexes(
                vec![
                    IndexModel::builder().keys(doc! { "pair_key": 1 }).options(unique).build(),
                    IndexModel::builder().keys(doc! { "participants": 1 }).build(),
                    IndexModel::builder().keys(doc! { "last_message_at": -1 }).build(),
                ],
                None,
            )
            .await?;
        self.messages
            .create_indexes(
                vec![
                    IndexModel::builder().keys(doc! { "chat_id": 1 }).build(),
                    IndexModel::builder().keys(doc! { "sender_id": 1 }).build(),
                    IndexModel::builder().keys(doc! { "receiver_id": 1 }).build(),
                    IndexModel::builder().keys(doc! { "timestamp": -1 }).build(),
                ],
                None,
            )
            .await?;
        info!("📇 chat store indexes ensured");
        Ok(())
    }

    async fn find_or_create_chat(&self, a: u32, b: u32) -> Result<Chat> {
        let [lo, hi] = normalize_pair(a, b);
        let key = pair_key(a, b);
        let now = bson::DateTime::now();
        let participants = vec![lo as i64, hi as i64];
        let filter = doc! { "pair_key": key.as_str() };
        // 原子 upsert：并发首条消息不会建出两个会话
        // Atomic upsert so concurrent first messages cannot create two chats
        let update = doc! {
            "$setOnInsert": {
                "participants": participants,
                "last_message": Bson::Null,
                "last_message_at": Bson::Null,
                "created_at": now,
                "updated_at": now,
            },
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let found = match self.chats.find_one_and_update(filter.clone(), update, options).await {
            Ok(found) => found,
            // 唯一索引冲突说明另一方刚创建，直接读取 / Lost the insert race: read the winner
            Err(e) if is_duplicate_key(&e) => self.chats.find_one(filter, None).await?,
            Err(e) => return Err(e.into()),
        };
        found.map(Chat::from).ok_or_else(|| StorageError::Missing(format!("chat {}", key)))
    }

    async fn append_message(&self, chat_id: &str, message_id: &str, msg: &ChatMessage) -> Result<PersistedMessage> {
        let id = ObjectId::parse_str(message_id)
            .map_err(|_| StorageError::Missing(format!("invalid message id {}", message_id)))?;
        let now = bson::DateTime::now();
        let doc = MessageDocument {
            id,
            chat_id: parse_chat_id(chat_id)?,
            sender_id: msg.sender_id as i64,
            receiver_id: msg.receiver_id as i64,
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            is_deleted: false,
            is_recalled: false,
            is_read: false,
            created_at: now,
            updated_at: now,
        };
        match self.messages.insert_one(&doc, None).await {
            Ok(_) => debug!("💾 message {} appended to chat {}", doc.id, chat_id),
            // 上一次尝试已写入：返回已存在的记录 / An earlier attempt already wrote it: return that row
            Err(e) if is_duplicate_key(&e) => {
                debug!("💾 message {} already stored, replay ignored", doc.id);
                if let Some(existing) = self.messages.find_one(doc! { "_id": id }, None).await? {
                    return Ok(existing.into());
                }
            }
            Err(e) => return Err(e.into()),
        }
        Ok(doc.into())
    }

    async fn touch_last_message(&self, chat_id: &str, content: &str, at: DateTime<Utc>) -> Result<()> {
        let at = to_bson_time(at);
        let res = self
            .chats
            .update_one(
                doc! { "_id": parse_chat_id(chat_id)? },
                doc! { "$set": { "last_message": content, "last_message_at": at, "updated_at": at } },
                None,
            )
            .await?;
        if res.matched_count == 0 {
            return Err(StorageError::Missing(format!("chat {}", chat_id)));
        }
        Ok(())
    }

    async fn recent_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<PersistedMessage>> {
        let options = FindOptions::builder().sort(doc! { "timestamp": -1 }).limit(limit as i64).build();
        let cursor = self.messages.find(doc! { "chat_id": parse_chat_id(chat_id)? }, options).await?;
        let docs: Vec<MessageDocument> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(PersistedMessage::from).collect())
    }

    async fn list_chats(&self, user_id: u32, limit: usize) -> Result<Vec<Chat>> {
        let options = FindOptions::builder().sort(doc! { "last_message_at": -1 }).limit(limit as i64).build();
        let cursor = self.chats.find(doc! { "participants": user_id as i64 }, options).await?;
        let docs: Vec<ChatDocument> = cursor.try_collect().await?;
        Ok(docs.into_iter().map(Chat::from).collect())
    }
}
