//! 网关 + 中继端到端测试，使用内存存储 / Gateway + relay end to end, on in-memory stores

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use v::{ChatMessage, ErrorFrame};
use v_chat_gateway::config::{BridgeConfig, SessionConfig};
use v_chat_gateway::{ConnectionRegistry, GatewayServer, RelayBridge};
use v_chat_relay::{server, PersistConfig, PersistPool, RelayCore};
use v_chat_storage::{MemoryChatStore, MemoryOfflineQueue, OfflineQueue};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Stack {
    gateway_addr: SocketAddr,
    core: Arc<RelayCore>,
    bridge: Arc<RelayBridge>,
    store: Arc<MemoryChatStore>,
    queue: Arc<MemoryOfflineQueue>,
    _stop_relay: oneshot::Sender<()>,
}

async fn start_stack() -> Result<Stack> {
    let store = Arc::new(MemoryChatStore::new());
    let queue = Arc::new(MemoryOfflineQueue::new());
    let relay_listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay_addr = relay_listener.local_addr()?;
    let (core, stop_tx) = start_relay(relay_listener, store.clone(), queue.clone());
    let (gateway_addr, bridge) = start_gateway(relay_addr, queue.clone()).await?;
    eventually("bridge connected", || bridge.is_connected()).await?;
    Ok(Stack { gateway_addr, core, bridge, store, queue, _stop_relay: stop_tx })
}

// 中继 / Relay
fn start_relay(
    listener: TcpListener,
    store: Arc<MemoryChatStore>,
    queue: Arc<MemoryOfflineQueue>,
) -> (Arc<RelayCore>, oneshot::Sender<()>) {
    let pool = PersistPool::spawn(store, PersistConfig::default());
    let core = RelayCore::new(queue, pool);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let relay_core = Arc::clone(&core);
    tokio::spawn(async move {
        let _ = server::serve_with_listener(relay_core, listener, async {
            let _ = stop_rx.await;
        })
        .await;
    });
    (core, stop_tx)
}

// 网关 / Gateway
async fn start_gateway(relay_addr: SocketAddr, queue: Arc<MemoryOfflineQueue>) -> Result<(SocketAddr, Arc<RelayBridge>)> {
    let registry = Arc::new(ConnectionRegistry::new());
    let bridge_cfg = BridgeConfig {
        endpoint: format!("http://{}", relay_addr),
        connect_timeout: Duration::from_secs(1),
        reconnect_delay: Duration::from_millis(50),
        retry_delay: Duration::from_millis(50),
        alert_after_attempts: 5,
        buffer_capacity: 64,
    };
    let bridge = RelayBridge::new(bridge_cfg, Arc::clone(&registry), queue.clone());
    let gateway = GatewayServer::new(registry, Arc::clone(&bridge), queue, SessionConfig::default());
    let gateway_listener = TcpListener::bind("127.0.0.1:0").await?;
    let gateway_addr = gateway_listener.local_addr()?;
    tokio::spawn(async move {
        let _ = gateway.serve(gateway_listener).await;
    });
    let runner = Arc::clone(&bridge);
    tokio::spawn(async move {
        let _ = runner.run_forever().await;
    });
    Ok((gateway_addr, bridge))
}

async fn eventually(what: &str, mut f: impl FnMut() -> bool) -> Result<()> {
    for _ in 0..500 {
        if f() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow!("timed out waiting for {}", what))
}

async fn connect(stack: &Stack, user_id: u32) -> Result<Client> {
    connect_to(stack.gateway_addr, user_id).await
}

async fn connect_to(gateway_addr: SocketAddr, user_id: u32) -> Result<Client> {
    let (ws, _) = connect_async(format!("ws://{}/?user_id={}", gateway_addr, user_id)).await?;
    Ok(ws)
}

async fn connect_online(stack: &Stack, user_id: u32) -> Result<Client> {
    let ws = connect(stack, user_id).await?;
    eventually("relay mapping", || stack.core.is_mapped(user_id)).await?;
    Ok(ws)
}

async fn send(ws: &mut Client, sender_id: u32, receiver_id: u32, content: &str) -> Result<()> {
    let frame = ChatMessage::new(sender_id, receiver_id, content).to_frame()?;
    ws.send(Message::Text(frame)).await?;
    Ok(())
}

/// 读取下一条文本帧，跳过控制帧 / Next text frame, skipping control frames
async fn next_text(ws: &mut Client) -> Result<String> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await?
            .ok_or_else(|| anyhow!("socket closed"))??;
        match msg {
            Message::Text(text) => return Ok(text),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return Err(anyhow!("unexpected frame {:?}", other)),
        }
    }
}

#[tokio::test]
async fn scenario_a_online_receiver_gets_message_and_history_is_written() -> Result<()> {
    let stack = start_stack().await?;
    let mut alice = connect_online(&stack, 1).await?;
    let mut bob = connect_online(&stack, 2).await?;

    send(&mut alice, 1, 2, "hi").await?;
    let got = ChatMessage::from_frame(&next_text(&mut bob).await?)?;
    assert_eq!((got.sender_id, got.receiver_id, got.content.as_str()), (1, 2, "hi"));
    assert!(got.timestamp > 0);

    eventually("persisted row", || stack.store.all_messages().len() == 1).await?;
    let row = &stack.store.all_messages()[0];
    assert_eq!((row.sender_id, row.receiver_id, row.content.as_str()), (1, 2, "hi"));
    assert!(!stack.queue.contains_key(2));
    Ok(())
}

#[tokio::test]
async fn scenarios_b_and_c_offline_then_drained_on_connect() -> Result<()> {
    let stack = start_stack().await?;
    let mut alice = connect_online(&stack, 1).await?;

    // B：接收者不在线 / receiver offline
    send(&mut alice, 1, 2, "hi").await?;
    eventually("offline entry", || stack.queue.contains_key(2)).await?;
    assert_eq!(stack.queue.len(2).await?, 1);
    eventually("persisted row", || stack.store.all_messages().len() == 1).await?;

    // C：上线后先收到离线消息，队列被清空 / on connect the backlog comes first, then the key is gone
    let mut bob = connect(&stack, 2).await?;
    let got = ChatMessage::from_frame(&next_text(&mut bob).await?)?;
    assert_eq!((got.sender_id, got.content.as_str()), (1, "hi"));
    assert!(!stack.queue.contains_key(2));

    eventually("relay mapping", || stack.core.is_mapped(2)).await?;
    send(&mut alice, 1, 2, "again").await?;
    let live = ChatMessage::from_frame(&next_text(&mut bob).await?)?;
    assert_eq!(live.content, "again");
    Ok(())
}

#[tokio::test]
async fn scenario_d_bridge_reconnects_after_relay_drops_streams() -> Result<()> {
    let stack = start_stack().await?;
    let mut alice = connect_online(&stack, 1).await?;
    let mut bob = connect_online(&stack, 2).await?;
    let sessions_before = stack.bridge.sessions();

    stack.core.close_all_streams();
    eventually("bridge reconnected", || {
        stack.bridge.sessions() > sessions_before
            && stack.bridge.is_connected()
            && stack.core.is_mapped(1)
            && stack.core.is_mapped(2)
    })
    .await?;

    // 同一个客户端连接继续收发 / Same client sockets keep working
    send(&mut alice, 1, 2, "still here").await?;
    let got = ChatMessage::from_frame(&next_text(&mut bob).await?)?;
    assert_eq!(got.content, "still here");
    Ok(())
}

#[tokio::test]
async fn message_sent_while_relay_is_down_arrives_once_after_it_starts() -> Result<()> {
    let store = Arc::new(MemoryChatStore::new());
    let queue = Arc::new(MemoryOfflineQueue::new());
    // 先占一个端口再释放，中继稍后在这里启动 / Reserve a port, the relay starts there later
    let relay_addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let (gateway_addr, bridge) = start_gateway(relay_addr, queue.clone()).await?;

    let mut alice = connect_to(gateway_addr, 1).await?;
    let mut bob = connect_to(gateway_addr, 2).await?;
    eventually("failed relay connects", || bridge.failed_attempts() >= 1).await?;
    send(&mut alice, 1, 2, "while down").await?;

    let (core, _stop) = start_relay(TcpListener::bind(relay_addr).await?, store.clone(), queue.clone());
    eventually("bridge connected", || bridge.is_connected()).await?;

    let got = ChatMessage::from_frame(&next_text(&mut bob).await?)?;
    assert_eq!((got.sender_id, got.content.as_str()), (1, "while down"));
    assert!(core.is_mapped(2));

    // 只投递一次 / Delivered exactly once
    let extra = tokio::time::timeout(Duration::from_millis(300), next_text(&mut bob)).await;
    assert!(extra.is_err(), "unexpected second frame: {:?}", extra);
    eventually("persisted row", || store.all_messages().len() == 1).await?;
    assert!(!queue.contains_key(2));
    Ok(())
}

#[tokio::test]
async fn sender_id_is_taken_from_the_handshake() -> Result<()> {
    let stack = start_stack().await?;
    let mut alice = connect_online(&stack, 1).await?;
    let mut bob = connect_online(&stack, 2).await?;

    send(&mut alice, 99, 2, "spoofed").await?;
    let got = ChatMessage::from_frame(&next_text(&mut bob).await?)?;
    assert_eq!(got.sender_id, 1);
    Ok(())
}

#[tokio::test]
async fn malformed_frame_gets_error_and_session_survives() -> Result<()> {
    let stack = start_stack().await?;
    let mut alice = connect_online(&stack, 1).await?;
    let mut bob = connect_online(&stack, 2).await?;

    alice.send(Message::Text("definitely not json".into())).await?;
    let err: ErrorFrame = serde_json::from_str(&next_text(&mut alice).await?)?;
    assert_eq!(err.error, ErrorFrame::MALFORMED_FRAME);

    send(&mut alice, 1, 2, "after error").await?;
    assert_eq!(ChatMessage::from_frame(&next_text(&mut bob).await?)?.content, "after error");
    Ok(())
}

#[tokio::test]
async fn handshake_without_numeric_user_id_is_refused() -> Result<()> {
    let stack = start_stack().await?;
    for query in ["", "?user_id=abc"] {
        let url = format!("ws://{}/{}", stack.gateway_addr, query);
        match connect_async(url).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(resp)) => assert_eq!(resp.status().as_u16(), 400),
            other => return Err(anyhow!("expected HTTP 400, got {:?}", other.map(|(_, r)| r.status()))),
        }
    }
    Ok(())
}

#[tokio::test]
async fn reconnecting_user_replaces_previous_socket() -> Result<()> {
    let stack = start_stack().await?;
    let mut first = connect_online(&stack, 5).await?;
    let mut second = connect(&stack, 5).await?;

    // 旧连接收到关闭帧 / The old socket is closed by the server
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let mut alice = connect_online(&stack, 1).await?;
    eventually("relay mapping", || stack.core.is_mapped(5)).await?;
    send(&mut alice, 1, 5, "to the new socket").await?;
    assert_eq!(ChatMessage::from_frame(&next_text(&mut second).await?)?.content, "to the new socket");
    Ok(())
}
