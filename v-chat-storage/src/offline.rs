use async_trait::async_trait;

use crate::error::Result;

/// 离线队列键 / Offline queue key
pub fn offline_key(user_id: u32) -> String {
    format!("offline:{}", user_id)
}

/// 离线消息队列接口 / Offline message queue
///
/// 只存放发送时接收者没有在线连接的消息，条目是序列化后的 JSON 帧
/// Holds only messages whose receiver had no live connection; entries are serialized JSON frames.
#[async_trait]
pub trait OfflineQueue: Send + Sync {
    /// 追加到接收者队列尾部 / Append to the receiver's queue
    async fn push(&self, user_id: u32, payload: &str) -> Result<()>;

    /// 原子地取出并删除全部条目，保持入队顺序
    /// Atomically read and remove every entry, in enqueue order
    async fn drain_all(&self, user_id: u32) -> Result<Vec<String>>;

    /// 当前队列长度 / Current queue length
    async fn len(&self, user_id: u32) -> Result<usize>;
}
