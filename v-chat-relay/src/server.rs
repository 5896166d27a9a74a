use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::info;
use v::proto::chat_relay_server::{ChatRelay, ChatRelayServer};
use v::proto::RelayRequest;

use crate::relay_core::{DeliveryStream, RelayCore};

/// gRPC 服务：每个调用即一条网关双向流 / gRPC service: each call is one gateway duplex stream
#[derive(Clone)]
pub struct RelayService {
    core: Arc<RelayCore>,
}

impl RelayService {
    pub fn new(core: Arc<RelayCore>) -> Self {
        Self { core }
    }
}

#[tonic::async_trait]
impl ChatRelay for RelayService {
    type RelayStream = DeliveryStream;

    async fn relay(&self, request: Request<Streaming<RelayRequest>>) -> Result<Response<Self::RelayStream>, Status> {
        if let Some(addr) = request.remote_addr() {
            info!("🤝 gateway connected from {}", addr);
        }
        let inbound = request.into_inner();
        Ok(Response::new(self.core.open_stream(inbound)))
    }
}

/// 绑定并运行 gRPC 服务，直到 `shutdown` 完成
/// Bind and run the gRPC server until `shutdown` resolves
pub async fn serve(core: Arc<RelayCore>, addr: SocketAddr, shutdown: impl Future<Output = ()>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("🚀 relay gRPC listening on {}", listener.local_addr()?);
    serve_with_listener(core, listener, shutdown).await
}

/// 使用已绑定的监听器运行（测试使用临时端口）
/// Run on an already bound listener (tests bind an ephemeral port)
pub async fn serve_with_listener(
    core: Arc<RelayCore>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    Server::builder()
        .add_service(ChatRelayServer::new(RelayService::new(core)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;
    info!("👋 relay gRPC server stopped");
    Ok(())
}
