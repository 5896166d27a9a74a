use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use v::proto::chat_relay_client::ChatRelayClient;
use v::proto::{RelayDelivery, RelayRequest};
use v::ChatMessage;
use v_chat_relay::{server, PersistConfig, PersistPool, RelayCore};
use v_chat_storage::{MemoryChatStore, MemoryOfflineQueue, OfflineQueue};

struct Harness {
    addr: SocketAddr,
    core: Arc<RelayCore>,
    store: Arc<MemoryChatStore>,
    queue: Arc<MemoryOfflineQueue>,
    _stop: oneshot::Sender<()>,
}

async fn start_relay() -> Result<Harness> {
    let store = Arc::new(MemoryChatStore::new());
    let queue = Arc::new(MemoryOfflineQueue::new());
    let pool = PersistPool::spawn(store.clone(), PersistConfig::default());
    let core = RelayCore::new(queue.clone(), pool);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let serve_core = Arc::clone(&core);
    tokio::spawn(async move {
        let _ = server::serve_with_listener(serve_core, listener, async {
            let _ = stop_rx.await;
        })
        .await;
    });
    Ok(Harness { addr, core, store, queue, _stop: stop_tx })
}

/// 一个模拟网关：返回请求发送端与投递流 / A fake gateway: request sender plus delivery stream
async fn attach(addr: SocketAddr) -> Result<(mpsc::UnboundedSender<RelayRequest>, tonic::Streaming<RelayDelivery>)> {
    let mut client = ChatRelayClient::connect(format!("http://{}", addr)).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let inbound = client.relay(UnboundedReceiverStream::new(rx)).await?.into_inner();
    Ok((tx, inbound))
}

async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..400 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn delivers_between_two_gateways() -> Result<()> {
    let h = start_relay().await?;
    let (gw1, _in1) = attach(h.addr).await?;
    let (gw2, mut in2) = attach(h.addr).await?;

    gw2.send(RelayRequest::presence(20, true))?;
    eventually(|| h.core.is_mapped(20)).await;

    gw1.send(RelayRequest::message(ChatMessage::new(10, 20, "hello")))?;
    let delivery = tokio::time::timeout(Duration::from_secs(5), in2.message()).await??.expect("delivery");
    assert!(delivery.success);
    let msg = delivery.message.expect("payload");
    assert_eq!((msg.sender_id, msg.receiver_id, msg.content.as_str()), (10, 20, "hello"));

    eventually(|| h.store.all_messages().len() == 1).await;
    assert!(!h.queue.contains_key(20));
    Ok(())
}

#[tokio::test]
async fn offline_receiver_is_queued_then_mapped_on_reply() -> Result<()> {
    let h = start_relay().await?;
    let (gw, mut inbound) = attach(h.addr).await?;

    gw.send(RelayRequest::message(ChatMessage::new(1, 2, "are you there")))?;
    eventually(|| h.queue.contains_key(2)).await;
    assert!(h.core.is_mapped(1));

    // 另一方上线后回复，发送者映射仍然有效 / Reply after the other side comes online reaches the sender
    gw.send(RelayRequest::message(ChatMessage::new(2, 1, "yes")))?;
    let delivery = tokio::time::timeout(Duration::from_secs(5), inbound.message()).await??.expect("delivery");
    assert_eq!(delivery.message.expect("payload").content, "yes");

    let queued = h.queue.drain_all(2).await?;
    assert_eq!(queued.len(), 1);
    assert_eq!(ChatMessage::from_frame(&queued[0])?.content, "are you there");
    Ok(())
}

#[tokio::test]
async fn disconnect_unmaps_users_and_close_all_ends_streams() -> Result<()> {
    let h = start_relay().await?;
    let (gw1, in1) = attach(h.addr).await?;
    gw1.send(RelayRequest::presence(5, true))?;
    eventually(|| h.core.is_mapped(5)).await;
    drop(gw1);
    drop(in1);
    eventually(|| !h.core.is_mapped(5)).await;

    let (_gw2, mut in2) = attach(h.addr).await?;
    eventually(|| h.core.open_streams() == 1).await;
    h.core.close_all_streams();
    let ended = tokio::time::timeout(Duration::from_secs(5), in2.message()).await?;
    assert!(ended.is_err() || matches!(ended, Ok(None)));
    Ok(())
}
