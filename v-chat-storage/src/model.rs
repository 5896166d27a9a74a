use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

/// 会话聚合 / Chat aggregate
///
/// 每个无序参与者对至多一个，首条消息时惰性创建
/// At most one per unordered participant pair, created lazily on the first message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    /// 规范化为 `[min, max]` / Normalised as `[min, max]`
    pub participants: [u32; 2],
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 持久化消息 / Persisted message
///
/// 只追加；三个布尔标记由核心之外的操作修改
/// Append-only; the three flags are mutated by operations outside the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: u32,
    pub receiver_id: u32,
    pub content: String,
    pub timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_recalled: bool,
    pub is_read: bool,
}

/// 无序参与者对的规范形式 / Canonical form of an unordered participant pair
pub fn normalize_pair(a: u32, b: u32) -> [u32; 2] {
    if a <= b {
        [a, b]
    } else {
        [b, a]
    }
}

/// 新的消息 id，在第一次写入前分配 / Fresh message id, allocated before the first write attempt
pub fn new_message_id() -> String {
    ObjectId::new().to_hex()
}

/// 唯一索引使用的键 / Key backing the unique pair index
pub fn pair_key(a: u32, b: u32) -> String {
    let [lo, hi] = normalize_pair(a, b);
    format!("{}:{}", lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_order_independent() {
        assert_eq!(normalize_pair(9, 2), [2, 9]);
        assert_eq!(pair_key(9, 2), pair_key(2, 9));
        assert_eq!(pair_key(7, 7), "7:7");
    }

    #[test]
    fn message_ids_are_unique_object_ids() {
        let (a, b) = (new_message_id(), new_message_id());
        assert_ne!(a, b);
        assert!(ObjectId::parse_str(&a).is_ok());
    }
}
