//! 聊天帧与中继协议之间的转换
//! Chat frames and their mapping onto the relay protocol

use serde::{Deserialize, Serialize};

use crate::proto;

/// 客户端 JSON 帧 / Client-facing JSON frame
///
/// `{sender_id, receiver_id, content, timestamp}`，创建后不再修改，只转发或复制
/// Never mutated after creation; only forwarded or copied into a persisted form.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender_id: u32,
    pub receiver_id: u32,
    pub content: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl ChatMessage {
    pub fn new(sender_id: u32, receiver_id: u32, content: impl Into<String>) -> Self {
        Self { sender_id, receiver_id, content: content.into(), timestamp: chrono::Utc::now().timestamp_millis() }
    }

    /// 以服务端接收时间重新打时间戳 / Copy stamped with the server receive time (epoch ms)
    pub fn received_now(self) -> Self {
        Self { timestamp: chrono::Utc::now().timestamp_millis(), ..self }
    }

    /// 解析入站帧 / Decode an inbound frame
    pub fn from_frame(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// 编码为出站帧 / Encode as an outbound frame
    pub fn to_frame(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<proto::ChatMessage> for ChatMessage {
    fn from(m: proto::ChatMessage) -> Self {
        Self { sender_id: m.sender_id, receiver_id: m.receiver_id, content: m.content, timestamp: m.timestamp }
    }
}

impl From<ChatMessage> for proto::ChatMessage {
    fn from(m: ChatMessage) -> Self {
        Self { sender_id: m.sender_id, receiver_id: m.receiver_id, content: m.content, timestamp: m.timestamp }
    }
}

impl proto::RelayRequest {
    pub fn message(msg: ChatMessage) -> Self {
        Self { kind: Some(proto::relay_request::Kind::Message(msg.into())) }
    }

    pub fn presence(user_id: u32, online: bool) -> Self {
        Self { kind: Some(proto::relay_request::Kind::Presence(proto::Presence { user_id, online })) }
    }
}

/// 出站错误帧 / Outbound error frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub error: String,
    pub detail: String,
    pub timestamp: i64,
}

impl ErrorFrame {
    pub const MALFORMED_FRAME: &'static str = "malformed_frame";
    pub const NOT_SENT: &'static str = "not_sent";

    pub fn new(error: &str, detail: impl Into<String>) -> Self {
        Self { error: error.to_string(), detail: detail.into(), timestamp: chrono::Utc::now().timestamp_millis() }
    }

    pub fn to_frame(&self) -> String {
        // 仅含字符串与整数字段，序列化不会失败 / Plain fields only, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_client_frame() {
        let msg = ChatMessage::from_frame(r#"{"sender_id":1,"receiver_id":2,"content":"hi","timestamp":5}"#).unwrap();
        assert_eq!(msg, ChatMessage { sender_id: 1, receiver_id: 2, content: "hi".into(), timestamp: 5 });
    }

    #[test]
    fn timestamp_is_optional_on_inbound_frames() {
        let msg = ChatMessage::from_frame(r#"{"sender_id":1,"receiver_id":2,"content":"hi"}"#).unwrap();
        assert_eq!(msg.timestamp, 0);
        assert!(msg.received_now().timestamp > 0);
    }

    #[test]
    fn rejects_non_numeric_ids() {
        assert!(ChatMessage::from_frame(r#"{"sender_id":"x","receiver_id":2,"content":"hi"}"#).is_err());
        assert!(ChatMessage::from_frame("not json").is_err());
    }

    #[test]
    fn relay_request_carries_message() {
        let req = proto::RelayRequest::message(ChatMessage::new(3, 4, "yo"));
        match req.kind {
            Some(proto::relay_request::Kind::Message(m)) => {
                assert_eq!((m.sender_id, m.receiver_id, m.content.as_str()), (3, 4, "yo"));
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
