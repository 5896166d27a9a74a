use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::Status;
use tracing::{debug, error, info, warn};
use v::proto::{relay_request::Kind, RelayDelivery, RelayRequest};
use v::ChatMessage;
use v_chat_storage::OfflineQueue;

use crate::persist::PersistPool;

pub type DeliverySender = mpsc::UnboundedSender<Result<RelayDelivery, Status>>;
pub type DeliveryStream = UnboundedReceiverStream<Result<RelayDelivery, Status>>;

/// 用户 → 网关流 的映射项 / One user → gateway stream mapping
#[derive(Clone)]
struct StreamHandle {
    stream_id: u64,
    sender: DeliverySender,
}

/// 单条消息的投递结果 / Outcome of relaying one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 已推送到接收者所在网关流 / Pushed onto the receiver's gateway stream
    Delivered,
    /// 接收者不在线，已写入离线队列 / Receiver offline, written to the offline queue
    Queued,
    /// 离线队列写入失败（已记录日志）/ Offline push failed (logged)
    QueueFailed,
}

#[derive(Default, Debug)]
pub struct RelayStats {
    pub delivered: AtomicU64,
    pub queued: AtomicU64,
    pub queue_failed: AtomicU64,
    /// 上线时从离线队列补发的条数 / Offline entries flushed onto a stream when its user came online
    pub flushed: AtomicU64,
}

pub struct RelayCore {
    streams: DashMap<u32, StreamHandle>,
    next_stream_id: AtomicU64,
    open_streams: AtomicU64,
    queue: Arc<dyn OfflineQueue>,
    persist: PersistPool,
    close_tx: watch::Sender<u64>,
    stats: RelayStats,
}

impl RelayCore {
    pub fn new(queue: Arc<dyn OfflineQueue>, persist: PersistPool) -> Arc<Self> {
        let (close_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            streams: DashMap::new(),
            next_stream_id: AtomicU64::new(1),
            open_streams: AtomicU64::new(0),
            queue,
            persist,
            close_tx,
            stats: RelayStats::default(),
        })
    }

    /// 接入一条网关入站流，返回出站投递流
    /// Attach one inbound gateway stream and return its outbound delivery stream
    pub fn open_stream<S>(self: &Arc<Self>, inbound: S) -> DeliveryStream
    where
        S: Stream<Item = Result<RelayRequest, Status>> + Send + 'static,
    {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut close_rx = self.close_tx.subscribe();
        let core = Arc::clone(self);
        self.open_streams.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            let mut inbound = Box::pin(inbound);
            info!("🔗 gateway stream {} attached", stream_id);
            loop {
                tokio::select! {
                    changed = close_rx.changed() => {
                        if changed.is_ok() {
                            info!("🛑 closing gateway stream {}", stream_id);
                            let _ = tx.send(Err(Status::unavailable("relay shutting down")));
                        }
                        break;
                    }
                    next = inbound.next() => match next {
                        Some(Ok(req)) => core.handle_request(stream_id, &tx, req).await,
                        Some(Err(status)) => {
                            warn!("⚠️ gateway stream {} errored: {}", stream_id, status);
                            break;
                        }
                        None => break,
                    }
                }
            }
            core.drop_stream(stream_id);
            core.open_streams.fetch_sub(1, Ordering::Relaxed);
            info!("🔌 gateway stream {} detached", stream_id);
        });

        UnboundedReceiverStream::new(rx)
    }

    async fn handle_request(&self, stream_id: u64, tx: &DeliverySender, req: RelayRequest) {
        match req.kind {
            Some(Kind::Message(m)) => {
                self.relay_message(stream_id, tx, m.into()).await;
            }
            Some(Kind::Presence(p)) if p.online => {
                self.register(p.user_id, stream_id, tx);
                // 网关排空之后、映射生效之前入队的消息在这里补发
                // Entries queued after the gateway drained but before this mapping existed
                self.flush_offline(p.user_id).await;
            }
            Some(Kind::Presence(p)) => self.unregister_if_owned(p.user_id, stream_id),
            None => warn!("⚠️ empty relay request on stream {}", stream_id),
        }
    }

    /// 中继一条消息：登记发送者、提交持久化、投递或转离线
    /// Relay one message: register the sender, submit persistence, deliver or queue offline
    pub async fn relay_message(&self, stream_id: u64, tx: &DeliverySender, msg: ChatMessage) -> DeliveryOutcome {
        self.register(msg.sender_id, stream_id, tx);
        self.persist.submit(msg.clone());
        self.deliver(msg).await
    }

    async fn deliver(&self, msg: ChatMessage) -> DeliveryOutcome {
        // 先克隆出 sender，发送时不持有分片锁 / Clone the sender out so no shard lock is held while sending
        let target = self.streams.get(&msg.receiver_id).map(|h| h.value().clone());
        if let Some(handle) = target {
            if handle.sender.send(Ok(delivery_of(&msg))).is_ok() {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                debug!("📨 delivered {}→{} via stream {}", msg.sender_id, msg.receiver_id, handle.stream_id);
                return DeliveryOutcome::Delivered;
            }
            // 流已断开：删除过期映射后转离线 / Stream gone: drop the stale mapping, fall through to offline
            self.streams.remove_if(&msg.receiver_id, |_, h| h.stream_id == handle.stream_id);
            warn!("⚠️ stale stream {} for uid={}, queueing offline", handle.stream_id, msg.receiver_id);
        }
        self.queue_offline(&msg).await
    }

    async fn queue_offline(&self, msg: &ChatMessage) -> DeliveryOutcome {
        let pushed = match msg.to_frame() {
            Ok(frame) => self.queue.push(msg.receiver_id, &frame).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match pushed {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                debug!("📥 uid={} offline, queued message from {}", msg.receiver_id, msg.sender_id);
                // 入队期间接收者可能刚上线：映射已存在则立即补发
                // The receiver may have come online while we pushed; flush if it is mapped now
                if self.streams.contains_key(&msg.receiver_id) {
                    self.flush_offline(msg.receiver_id).await;
                }
                DeliveryOutcome::Queued
            }
            Err(e) => {
                self.stats.queue_failed.fetch_add(1, Ordering::Relaxed);
                error!("❌ offline push failed {}→{}: {}", msg.sender_id, msg.receiver_id, e);
                DeliveryOutcome::QueueFailed
            }
        }
    }

    /// 把用户的离线队列写到其当前映射的流上；写入失败的剩余条目放回队列
    /// Write a user's offline queue onto its mapped stream; entries that cannot be written go back
    async fn flush_offline(&self, user_id: u32) {
        let Some(handle) = self.streams.get(&user_id).map(|h| h.value().clone()) else {
            return;
        };
        let entries = match self.queue.drain_all(user_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("⚠️ uid={} offline flush failed: {}", user_id, e);
                return;
            }
        };
        if entries.is_empty() {
            return;
        }

        let total = entries.len();
        let mut entries = entries.into_iter();
        let mut flushed = 0u64;
        while let Some(raw) = entries.next() {
            let msg = match ChatMessage::from_frame(&raw) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("⚠️ uid={} undecodable offline entry skipped: {}", user_id, e);
                    continue;
                }
            };
            if handle.sender.send(Ok(delivery_of(&msg))).is_err() {
                self.streams.remove_if(&user_id, |_, h| h.stream_id == handle.stream_id);
                for rest in std::iter::once(raw).chain(entries) {
                    if let Err(e) = self.queue.push(user_id, &rest).await {
                        error!("❌ uid={} offline entry lost while requeueing: {}", user_id, e);
                    }
                }
                warn!("⚠️ uid={} stream {} closed during offline flush, requeued", user_id, handle.stream_id);
                break;
            }
            flushed += 1;
        }
        self.stats.flushed.fetch_add(flushed, Ordering::Relaxed);
        info!("📬 uid={} flushed {}/{} offline entries on stream {}", user_id, flushed, total, handle.stream_id);
    }

    /// 后写者覆盖 / Last writer wins
    fn register(&self, user_id: u32, stream_id: u64, tx: &DeliverySender) {
        let previous = self.streams.insert(user_id, StreamHandle { stream_id, sender: tx.clone() });
        match previous {
            Some(prev) if prev.stream_id == stream_id => {}
            Some(prev) => debug!("🔁 uid={} moved from stream {} to {}", user_id, prev.stream_id, stream_id),
            None => debug!("➕ uid={} mapped to stream {}", user_id, stream_id),
        }
    }

    fn unregister_if_owned(&self, user_id: u32, stream_id: u64) {
        if self.streams.remove_if(&user_id, |_, h| h.stream_id == stream_id).is_some() {
            debug!("➖ uid={} unmapped from stream {}", user_id, stream_id);
        }
    }

    fn drop_stream(&self, stream_id: u64) {
        self.streams.retain(|_, h| h.stream_id != stream_id);
    }

    /// 结束所有网关流（优雅关闭）/ End every live gateway stream (graceful shutdown)
    pub fn close_all_streams(&self) {
        self.close_tx.send_modify(|generation| *generation += 1);
    }

    pub fn is_mapped(&self, user_id: u32) -> bool {
        self.streams.contains_key(&user_id)
    }

    pub fn mapped_users(&self) -> usize {
        self.streams.len()
    }

    pub fn open_streams(&self) -> u64 {
        self.open_streams.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn persist(&self) -> &PersistPool {
        &self.persist
    }
}

fn delivery_of(msg: &ChatMessage) -> RelayDelivery {
    RelayDelivery {
        message: Some(msg.clone().into()),
        success: true,
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}
