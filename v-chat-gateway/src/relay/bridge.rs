//! 中继桥：网关与中继核心之间唯一的长连接双向流
//! Relay bridge: the single long-lived duplex stream between this gateway and the relay core
//!
//! 会话提交的消息先进入有界缓冲；桥在流可用时转发，流断开时按固定退避无限重连。
//! 上下线声明不经过缓冲：只在待发集合里记下用户，桥每轮优先按注册表的当前状态发送。
//! 每次连上后先为注册表中的所有用户重新声明在线，再转发缓冲中的请求。
//! Session messages enter a bounded buffer; the bridge forwards them while a stream is up and
//! reconnects forever with fixed backoff when it is not. Presence never goes through that buffer:
//! announcing only marks the user dirty, and the bridge sends the registry's current state for
//! every dirty user ahead of buffered messages. After each connect it re-announces presence for
//! every registered user before forwarding buffered requests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error, info, warn};
use v::proto::chat_relay_client::ChatRelayClient;
use v::proto::{RelayDelivery, RelayRequest};
use v::ChatMessage;
use v_chat_storage::OfflineQueue;

use crate::config::BridgeConfig;
use crate::server::ConnectionRegistry;

/// 提交失败原因 / Why a submission was refused
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("中继缓冲已满 / relay buffer is full")]
    Full,
    #[error("中继桥已关闭 / relay bridge is closed")]
    Closed,
}

/// 单次流会话的结束方式 / How one stream session ended
enum StreamEnd {
    Shutdown,
    Closed,
}

pub struct RelayBridge {
    cfg: BridgeConfig,
    registry: Arc<ConnectionRegistry>,
    /// 本网关写不出去的投递转入离线队列 / Deliveries this gateway cannot write go to the offline queue
    offline: Arc<dyn OfflineQueue>,
    tx: mpsc::Sender<RelayRequest>,
    rx: tokio::sync::Mutex<mpsc::Receiver<RelayRequest>>,
    /// 上一条流失败时未送出的请求，下一条流优先重发
    /// Request that failed on the previous stream, re-sent first on the next one
    pending: Mutex<Option<RelayRequest>>,
    /// 待声明状态的用户 / Users whose presence still has to reach the relay
    presence_dirty: Mutex<HashSet<u32>>,
    presence_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
    connected: AtomicBool,
    failed_attempts: AtomicU32,
    sessions: AtomicU64,
}

impl RelayBridge {
    pub fn new(cfg: BridgeConfig, registry: Arc<ConnectionRegistry>, offline: Arc<dyn OfflineQueue>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(cfg.buffer_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        info!("🌉 relay bridge for {} (buffer={})", cfg.endpoint, cfg.buffer_capacity);
        Arc::new(Self {
            cfg,
            registry,
            offline,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(None),
            presence_dirty: Mutex::new(HashSet::new()),
            presence_notify: Notify::new(),
            shutdown_tx,
            connected: AtomicBool::new(false),
            failed_attempts: AtomicU32::new(0),
            sessions: AtomicU64::new(0),
        })
    }

    /// 放入发送缓冲，从不等待 / Place a request in the outbound buffer without waiting
    pub fn submit(&self, req: RelayRequest) -> Result<(), BridgeError> {
        if *self.shutdown_tx.borrow() {
            return Err(BridgeError::Closed);
        }
        self.tx.try_send(req).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => BridgeError::Full,
            mpsc::error::TrySendError::Closed(_) => BridgeError::Closed,
        })
    }

    /// 声明用户上下线。从不丢失：实际发送的是注册表在发送时刻的状态
    /// Announce presence. Never dropped: what is sent is the registry's state at send time
    pub fn announce(&self, user_id: u32, online: bool) {
        debug!("📣 presence uid={} online={} marked", user_id, online);
        self.presence_dirty.lock().insert(user_id);
        self.presence_notify.notify_one();
    }

    /// 触发关闭信号 / Trigger shutdown signal
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    /// 成功建立的流会话数 / Number of stream sessions established so far
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// 永久运行，自动重连 / Run forever with auto reconnect
    pub async fn run_forever(&self) -> Result<()> {
        let mut rx = self.rx.lock().await;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            // 如果收到关闭信号则退出 / Exit on shutdown signal
            if *shutdown_rx.borrow() {
                break;
            }
            let delay = match self.connect().await {
                Ok(client) => {
                    self.failed_attempts.store(0, Ordering::Relaxed);
                    let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
                    info!("🔗 relay stream #{} established ({})", session, self.cfg.endpoint);
                    let ended = self.run_once(client, &mut rx, &mut shutdown_rx).await;
                    self.connected.store(false, Ordering::Relaxed);
                    match ended {
                        Ok(StreamEnd::Shutdown) => break,
                        Ok(StreamEnd::Closed) => info!("🔌 relay stream #{} ended, reconnecting", session),
                        Err(e) => warn!("⚠️ relay stream #{} failed: {}, reconnecting", session, e),
                    }
                    self.cfg.reconnect_delay
                }
                Err(e) => {
                    let attempt = self.failed_attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!("🔁 relay connect attempt #{} failed: {}", attempt, e);
                    if attempt % self.cfg.alert_after_attempts.max(1) == 0 {
                        error!(
                            "🚨 relay {} unreachable after {} consecutive attempts",
                            self.cfg.endpoint, attempt
                        );
                    }
                    self.cfg.retry_delay
                }
            };
            tokio::select! {
                _ = sleep(delay) => {},
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { break; }
                }
            }
        }
        info!("👋 relay bridge stopped");
        Ok(())
    }

    async fn connect(&self) -> Result<ChatRelayClient<Channel>> {
        let channel = Endpoint::from_shared(self.cfg.endpoint.clone())?
            .connect_timeout(self.cfg.connect_timeout)
            .connect()
            .await?;
        Ok(ChatRelayClient::new(channel))
    }

    /// 单次流会话 / Single stream session
    async fn run_once(
        &self,
        mut client: ChatRelayClient<Channel>,
        rx: &mut mpsc::Receiver<RelayRequest>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<StreamEnd> {
        // 容量为 1：请求只在流能接收时才离开缓冲
        // Capacity 1: a request leaves the buffer only when the stream can take it
        let (out_tx, out_rx) = mpsc::channel::<RelayRequest>(1);
        let mut inbound = client.relay(ReceiverStream::new(out_rx)).await?.into_inner();
        self.connected.store(true, Ordering::Relaxed);

        // 新流上没有旧映射，全量重声明即可覆盖积压的待发状态
        // A fresh stream has no mappings, so the full re-announce supersedes any dirty state
        self.presence_dirty.lock().clear();
        let users = self.registry.user_ids();
        for user_id in &users {
            self.forward(&out_tx, RelayRequest::presence(*user_id, true)).await?;
        }
        if !users.is_empty() {
            info!("📣 re-announced {} online users", users.len());
        }
        let pending = self.pending.lock().take();
        if let Some(req) = pending {
            debug!("🔁 re-sending request held from the previous stream");
            self.forward(&out_tx, req).await?;
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() { return Ok(StreamEnd::Shutdown); }
                }
                _ = self.presence_notify.notified() => self.flush_presence(&out_tx).await?,
                delivery = inbound.message() => match delivery {
                    Ok(Some(d)) => self.dispatch(d).await,
                    Ok(None) => return Ok(StreamEnd::Closed),
                    Err(status) => return Err(anyhow!("relay stream error: {}", status)),
                },
                next = rx.recv() => match next {
                    Some(req) => self.forward(&out_tx, req).await?,
                    None => return Ok(StreamEnd::Shutdown),
                },
            }
        }
    }

    /// 发送所有待声明用户的当前状态 / Send the current state of every dirty user
    async fn flush_presence(&self, out_tx: &mpsc::Sender<RelayRequest>) -> Result<()> {
        let dirty: Vec<u32> = self.presence_dirty.lock().drain().collect();
        for user_id in dirty {
            let online = self.registry.contains(user_id);
            self.forward(out_tx, RelayRequest::presence(user_id, online)).await?;
        }
        Ok(())
    }

    async fn forward(&self, out_tx: &mpsc::Sender<RelayRequest>, req: RelayRequest) -> Result<()> {
        if let Err(mpsc::error::SendError(req)) = out_tx.send(req).await {
            *self.pending.lock() = Some(req);
            return Err(anyhow!("relay stream closed while forwarding"));
        }
        Ok(())
    }

    /// 入站投递写给在线连接；连接已不在本网关则转入离线队列
    /// Write an inbound delivery to its live connection; queue it offline if the user left this gateway
    async fn dispatch(&self, delivery: RelayDelivery) {
        if !delivery.success {
            debug!("relay delivery without success flag ignored");
            return;
        }
        let Some(message) = delivery.message else {
            debug!("relay ack without payload");
            return;
        };
        let msg = ChatMessage::from(message);
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("⚠️ failed to encode delivery for uid={}: {}", msg.receiver_id, e);
                return;
            }
        };
        if self.registry.send_text(msg.receiver_id, frame.clone()).is_ok() {
            return;
        }
        debug!("📭 uid={} not on this gateway, queueing {}→{}", msg.receiver_id, msg.sender_id, msg.receiver_id);
        if let Err(e) = self.offline.push(msg.receiver_id, &frame).await {
            error!("❌ offline push for uid={} failed: {}", msg.receiver_id, e);
            return;
        }
        if self.registry.contains(msg.receiver_id) {
            // 入队期间用户重新连上：由本网关补发 / The user reconnected while we pushed: flush here
            self.flush_offline(msg.receiver_id).await;
        } else {
            // 中继仍把该用户映射到本网关，补发一次下线声明
            // The relay still maps this user here; announce offline again
            self.announce(msg.receiver_id, false);
        }
    }

    async fn flush_offline(&self, user_id: u32) {
        let entries = match self.offline.drain_all(user_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("⚠️ uid={} offline flush failed: {}", user_id, e);
                return;
            }
        };
        let mut entries = entries.into_iter();
        while let Some(entry) = entries.next() {
            if self.registry.send_text(user_id, entry.clone()).is_err() {
                for rest in std::iter::once(entry).chain(entries) {
                    if let Err(e) = self.offline.push(user_id, &rest).await {
                        error!("❌ uid={} offline entry lost while requeueing: {}", user_id, e);
                    }
                }
                break;
            }
        }
    }
}
