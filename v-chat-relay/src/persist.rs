//! 持久化工作池 / Persistence worker pool
//!
//! 有界队列 + 固定数量的工作任务。投递路径只负责入队，不等待写库结果；
//! 暂时性错误按指数退避重试，最终失败只记录日志。消息 id 在入队时分配，
//! 所有重试共用同一 id，存储据此去重。
//! Bounded queue with a fixed set of workers. The delivery path only enqueues and never
//! waits on the write; transient errors are retried with exponential backoff, a final
//! failure is logged. The message id is allocated at enqueue time and shared by every
//! attempt, so the store can recognise a replay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};
use v::ChatMessage;
use v_chat_storage::{new_message_id, ChatStore, StorageError};

#[derive(Clone, Debug)]
pub struct PersistConfig {
    /// 工作任务数 / Number of workers
    pub workers: usize,
    /// 队列容量 / Queue capacity
    pub queue_capacity: usize,
    /// 单条消息最大尝试次数 / Max attempts per message
    pub max_attempts: u32,
    /// 首次重试等待 / First retry delay
    pub retry_base_ms: u64,
    /// 重试等待上限 / Retry delay cap
    pub retry_max_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self { workers: 4, queue_capacity: 1024, max_attempts: 3, retry_base_ms: 100, retry_max_ms: 2000 }
    }
}

#[derive(Default, Debug)]
pub struct PersistStats {
    pub persisted: AtomicU64,
    pub failed: AtomicU64,
    /// 队列满时转入后台等待的次数 / Times a full queue pushed the enqueue into a background task
    pub overflowed: AtomicU64,
}

/// 一次持久化任务 / One persistence job
#[derive(Debug)]
struct PersistJob {
    message_id: String,
    msg: ChatMessage,
}

pub struct PersistPool {
    tx: mpsc::Sender<PersistJob>,
    stats: Arc<PersistStats>,
}

impl PersistPool {
    /// 启动工作任务 / Spawn the workers
    pub fn spawn(store: Arc<dyn ChatStore>, cfg: PersistConfig) -> Self {
        let (tx, rx) = mpsc::channel::<PersistJob>(cfg.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(PersistStats::default());

        for worker_id in 0..cfg.workers.max(1) {
            let rx = Arc::clone(&rx);
            let store = Arc::clone(&store);
            let stats = Arc::clone(&stats);
            let cfg = cfg.clone();
            tokio::spawn(async move {
                loop {
                    // 锁只在取消息期间持有 / The lock is held only while receiving
                    let next = { rx.lock().await.recv().await };
                    let Some(job) = next else { break };
                    match persist_with_retry(store.as_ref(), &job, &cfg).await {
                        Ok(()) => {
                            stats.persisted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            stats.failed.fetch_add(1, Ordering::Relaxed);
                            error!(
                                "❌ persist failed after retries {} {}→{}: {}",
                                job.message_id, job.msg.sender_id, job.msg.receiver_id, e
                            );
                        }
                    }
                }
                debug!("persist worker {} stopped", worker_id);
            });
        }

        Self { tx, stats }
    }

    /// 提交一条消息，从不阻塞调用方
    /// Submit a message; never blocks the caller
    pub fn submit(&self, msg: ChatMessage) {
        let job = PersistJob { message_id: new_message_id(), msg };
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.stats.overflowed.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️ persist queue full, deferring {}→{}", job.msg.sender_id, job.msg.receiver_id);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(job).await.is_err() {
                        error!("❌ persist pool closed before deferred message was queued");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!("❌ persist pool closed, dropping {}→{}", job.msg.sender_id, job.msg.receiver_id);
            }
        }
    }

    pub fn stats(&self) -> &PersistStats {
        &self.stats
    }
}

async fn persist_with_retry(store: &dyn ChatStore, job: &PersistJob, cfg: &PersistConfig) -> Result<(), StorageError> {
    let mut attempt = 1;
    loop {
        match store.record_message(&job.message_id, &job.msg).await {
            Ok(persisted) => {
                debug!("💾 persisted message {} in chat {}", persisted.id, persisted.chat_id);
                return Ok(());
            }
            Err(e) if e.is_transient() && attempt < cfg.max_attempts => {
                let delay = backoff_delay(cfg, attempt);
                warn!("🔁 persist attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay(cfg: &PersistConfig, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    Duration::from_millis(cfg.retry_base_ms.saturating_mul(factor).min(cfg.retry_max_ms))
}
