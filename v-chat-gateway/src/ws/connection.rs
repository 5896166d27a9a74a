use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::server::{Connection, GatewayServer};
use crate::tasks::keepalive::{spawn_keepalive, ActivityClock};
use crate::ws::handler::{FrameAction, MalformedLimiter, SessionContext};
use crate::ws::sender::close_message;

/// 握手失败原因 / Handshake rejection reason
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("缺少 user_id 参数 / missing user_id query parameter")]
    MissingUserId,
    #[error("user_id 不是数字 / user_id is not numeric: {0}")]
    InvalidUserId(String),
}

/// 会话状态 / Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "Connecting",
            SessionState::Active => "Active",
            SessionState::Closing => "Closing",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// 从握手 URI 解析 user_id / Parse user_id from the handshake URI
pub fn parse_user_id(uri: &Uri) -> Result<u32, HandshakeError> {
    let raw = uri
        .query()
        .and_then(|query| {
            query.split('&').find_map(|pair| {
                let mut parts = pair.splitn(2, '=');
                let key = parts.next()?;
                let value = parts.next().unwrap_or("");
                (key == "user_id").then_some(value)
            })
        })
        .ok_or(HandshakeError::MissingUserId)?;
    if raw.is_empty() {
        return Err(HandshakeError::MissingUserId);
    }
    raw.parse::<u32>().map_err(|_| HandshakeError::InvalidUserId(raw.to_string()))
}

fn reject(err: &HandshakeError) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(err.to_string()));
    *resp.status_mut() = StatusCode::BAD_REQUEST;
    resp
}

fn transition(user_id: u32, conn_id: Uuid, state: &mut SessionState, next: SessionState) {
    info!("🔄 uid={} ({}) {} → {}", user_id, conn_id, state, next);
    *state = next;
}

/// 处理新连接 / Handle new connection
pub async fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, server: GatewayServer) -> Result<()> {
    debug!("📨 New connection from: {}", peer_addr);

    let mut handshake_user: Option<u32> = None;
    let callback = |req: &Request, resp: Response| match parse_user_id(req.uri()) {
        Ok(user_id) => {
            handshake_user = Some(user_id);
            Ok(resp)
        }
        Err(e) => {
            warn!("🚫 handshake from {} refused: {}", peer_addr, e);
            Err(reject(&e))
        }
    };
    let ws_stream = accept_hdr_async(stream, callback).await?;
    let Some(user_id) = handshake_user else {
        return Err(anyhow::anyhow!("handshake completed without user_id"));
    };

    let conn_id = Uuid::new_v4();
    let mut state = SessionState::Connecting;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let is_close = matches!(&msg, Message::Close(_));
            if let Err(e) = ws_sender.send(msg).await {
                error!("Failed to send message to {}: {}", conn_id, e);
                break;
            }
            if is_close {
                let _ = ws_sender.close().await;
                break;
            }
        }
    });

    server.registry.register(Connection {
        conn_id,
        user_id,
        addr: peer_addr,
        sender: tx.clone(),
        connected_at: chrono::Utc::now(),
    });
    transition(user_id, conn_id, &mut state, SessionState::Active);

    // 先写离线消息，再声明在线，保证离线消息在实时消息之前
    // Write offline backlog before announcing presence so it precedes live deliveries
    match server.offline.drain_all(user_id).await {
        Ok(entries) => {
            if !entries.is_empty() {
                info!("📬 uid={} delivering {} offline messages", user_id, entries.len());
            }
            for entry in entries {
                if tx.send(Message::Text(entry)).is_err() {
                    warn!("⚠️ uid={} writer closed during offline delivery", user_id);
                    break;
                }
            }
        }
        Err(e) => warn!("⚠️ uid={} offline drain failed: {}", user_id, e),
    }
    server.bridge.announce(user_id, true);

    let activity = ActivityClock::new();
    let mut keepalive = spawn_keepalive(user_id, tx.clone(), activity.clone(), &server.session);
    let mut ctx = SessionContext {
        user_id,
        conn_id,
        sender: tx.clone(),
        limiter: MalformedLimiter::new(server.session.max_malformed_frames, server.session.malformed_window),
    };

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(message)) => {
                    activity.touch();
                    match server.handle_incoming_message(message, &mut ctx) {
                        FrameAction::Continue => {}
                        FrameAction::PeerClosed | FrameAction::PolicyClose => break,
                    }
                }
                Some(Err(e)) => {
                    warn!("WebSocket error from uid={}: {}", user_id, e);
                    break;
                }
                None => break,
            },
            exit = &mut keepalive => {
                match exit {
                    Ok(reason) => debug!("uid={} keepalive ended: {:?}", user_id, reason),
                    Err(e) => warn!("uid={} keepalive task failed: {}", user_id, e),
                }
                let _ = tx.send(close_message(CloseCode::Away, "keepalive timeout"));
                break;
            }
        }
    }

    transition(user_id, conn_id, &mut state, SessionState::Closing);
    if server.registry.unregister_conn(user_id, conn_id) {
        server.bridge.announce(user_id, false);
    }
    keepalive.abort();
    drop(ctx);
    drop(tx);
    // 写任务在所有发送端释放后结束，给关闭帧一点时间刷出
    // The writer ends once every sender is gone; give a close frame a moment to flush
    if tokio::time::timeout(Duration::from_secs(1), &mut send_task).await.is_err() {
        send_task.abort();
    }
    transition(user_id, conn_id, &mut state, SessionState::Closed);
    info!("👋 uid={} disconnected from {}", user_id, peer_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        s.parse().unwrap()
    }

    #[test]
    fn parses_user_id_among_other_params() {
        assert_eq!(parse_user_id(&uri("/?user_id=42")), Ok(42));
        assert_eq!(parse_user_id(&uri("/ws?x=1&user_id=7&y")), Ok(7));
    }

    #[test]
    fn rejects_missing_or_non_numeric() {
        assert_eq!(parse_user_id(&uri("/")), Err(HandshakeError::MissingUserId));
        assert_eq!(parse_user_id(&uri("/?user_id=")), Err(HandshakeError::MissingUserId));
        assert_eq!(parse_user_id(&uri("/?user_id=abc")), Err(HandshakeError::InvalidUserId("abc".into())));
        assert_eq!(parse_user_id(&uri("/?user_id=-1")), Err(HandshakeError::InvalidUserId("-1".into())));
    }

    #[test]
    fn rejection_is_bad_request() {
        assert_eq!(reject(&HandshakeError::MissingUserId).status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn states_render_for_logs() {
        assert_eq!(SessionState::Closing.to_string(), "Closing");
    }
}
