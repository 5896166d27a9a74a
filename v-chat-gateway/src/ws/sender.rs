use std::borrow::Cow;

use anyhow::Result;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::server::{Connection, ConnectionRegistry};

impl ConnectionRegistry {
    /// 向指定用户写入文本帧 / Write a text frame to a user's connection
    pub fn send_text(&self, user_id: u32, text: String) -> Result<()> {
        let Some(conn) = self.lookup(user_id) else {
            return Err(anyhow::anyhow!("uid={} has no live connection", user_id));
        };
        conn.sender
            .send(Message::Text(text))
            .map_err(|e| anyhow::anyhow!("Failed to send message to uid={}: {}", user_id, e))?;
        debug!("📤 Sent frame to uid={} ({})", user_id, conn.conn_id);
        Ok(())
    }

    /// 发送关闭帧 / Send a close frame
    pub fn close_connection(&self, conn: &Connection, code: CloseCode, reason: &'static str) -> Result<()> {
        conn.sender
            .send(close_message(code, reason))
            .map_err(|e| anyhow::anyhow!("Failed to send close message: {}", e))?;
        debug!("🔒 Sent close message to uid={} ({})", conn.user_id, conn.conn_id);
        Ok(())
    }
}

pub fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: Cow::Borrowed(reason) }))
}
