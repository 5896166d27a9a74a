use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use uuid::Uuid;
use v::proto::RelayRequest;
use v::{ChatMessage, ErrorFrame};

use crate::server::GatewayServer;
use crate::ws::sender::close_message;

/// 固定窗口内的畸形帧计数 / Malformed frame counter per fixed window
#[derive(Debug)]
pub struct MalformedLimiter {
    limit: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl MalformedLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window, count: 0, window_start: Instant::now() }
    }

    /// 记录一次畸形帧，超过上限返回 true / Record one malformed frame; true once over the limit
    pub fn record(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count = 1;
        } else {
            self.count += 1;
        }
        self.count > self.limit
    }
}

/// 单个会话的读循环上下文 / Read loop context of one session
pub struct SessionContext {
    pub user_id: u32,
    pub conn_id: Uuid,
    pub sender: mpsc::UnboundedSender<Message>,
    pub limiter: MalformedLimiter,
}

/// 读循环下一步 / What the read loop does next
#[derive(Debug, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    /// 对端关闭 / Peer closed
    PeerClosed,
    /// 服务端按策略关闭 / Server closes on policy
    PolicyClose,
}

impl GatewayServer {
    /// 处理一帧入站消息 / Handle one inbound frame
    pub fn handle_incoming_message(&self, msg: Message, ctx: &mut SessionContext) -> FrameAction {
        match msg {
            Message::Text(text) => self.handle_text(&text, ctx),
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => self.handle_text(&text, ctx),
                Err(e) => self.malformed(ctx, &format!("binary frame is not utf-8: {}", e)),
            },
            Message::Close(frame) => {
                debug!("uid={} sent close: {:?}", ctx.user_id, frame);
                FrameAction::PeerClosed
            }
            // Ping/Pong 只更新活跃时间，Pong 由协议层自动回复
            // Ping/Pong only refresh activity; pongs are answered by the protocol layer
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => FrameAction::Continue,
        }
    }

    fn handle_text(&self, text: &str, ctx: &mut SessionContext) -> FrameAction {
        let msg = match ChatMessage::from_frame(text) {
            Ok(msg) => msg,
            Err(e) => return self.malformed(ctx, &e.to_string()),
        };
        if msg.sender_id != ctx.user_id {
            warn!(
                "⚠️ uid={} claimed sender_id={}, using session identity",
                ctx.user_id, msg.sender_id
            );
        }
        let msg = ChatMessage { sender_id: ctx.user_id, ..msg }.received_now();
        let (sender_id, receiver_id) = (msg.sender_id, msg.receiver_id);
        match self.bridge.submit(RelayRequest::message(msg)) {
            Ok(()) => debug!("➡️ {}→{} submitted to relay", sender_id, receiver_id),
            Err(e) => {
                warn!("⚠️ {}→{} not sent: {}", sender_id, receiver_id, e);
                let _ = ctx.sender.send(Message::Text(ErrorFrame::new(ErrorFrame::NOT_SENT, e.to_string()).to_frame()));
            }
        }
        FrameAction::Continue
    }

    fn malformed(&self, ctx: &mut SessionContext, detail: &str) -> FrameAction {
        warn!("🧩 malformed frame from uid={} ({}): {}", ctx.user_id, ctx.conn_id, detail);
        let _ = ctx.sender.send(Message::Text(ErrorFrame::new(ErrorFrame::MALFORMED_FRAME, detail).to_frame()));
        if ctx.limiter.record(Instant::now()) {
            warn!("🚫 uid={} exceeded malformed frame limit, closing", ctx.user_id);
            let _ = ctx.sender.send(close_message(CloseCode::Policy, "too many malformed frames"));
            return FrameAction::PolicyClose;
        }
        FrameAction::Continue
    }
}
