//! Transfer WebSocket server.
//!
//! Listens on a TCP port, upgrades incoming connections to WebSocket, and
//! runs an independent pump pair for each peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, Semaphore};
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use chunkvault_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::{self, PeerConnection, PeerMeta};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Upper bound on simultaneously open peer connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_connections: 64,
        }
    }
}

/// The transfer WebSocket server.
///
/// Every peer gets its own connection and send channel; the [`Handler`] is
/// shared.
pub struct TransferServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    peers: Mutex<HashMap<String, PeerConnection>>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> TransferServer<H> {
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Self::with_cancel(config, handler, CancellationToken::new())
    }

    /// Creates a server that stops when `cancel` fires.
    pub fn with_cancel(config: ServerConfig, handler: H, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            slots: Arc::new(Semaphore::new(config.max_connections)),
            config,
            handler: Arc::new(handler),
            peers: Mutex::new(HashMap::new()),
            cancel,
            local_addr: Mutex::new(None),
        })
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of open peer connections.
    pub async fn connection_count(&self) -> usize {
        let mut peers = self.peers.lock().await;
        peers.retain(|_, conn| conn.is_open());
        peers.len()
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("transfer server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    let mut peers = self.peers.lock().await;
                    for conn in peers.values() {
                        conn.close();
                    }
                    peers.clear();
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection to WebSocket and registers the peer.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // Held until the peer disconnects.
        let Ok(slot) = Arc::clone(&self.slots).try_acquire_owned() else {
            let limit = self.config.max_connections;
            tracing::warn!(%peer_addr, limit, "rejecting connection: limit reached");
            return Err(ServerError::TooManyConnections(limit));
        };

        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let meta = PeerMeta {
            conn_id: uuid::Uuid::new_v4().to_string(),
            remote_addr: peer_addr.to_string(),
        };
        tracing::info!(%peer_addr, conn_id = %meta.conn_id, "WebSocket connection established");

        let conn = connection::spawn_connection(
            ws_stream,
            meta.clone(),
            Arc::clone(&self.handler),
            self.cancel.clone(),
            slot,
        );
        self.peers.lock().await.insert(meta.conn_id, conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerFuture;
    use chunkvault_protocol::MessageType;
    use chunkvault_protocol::envelope::Message;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[derive(Default)]
    struct CountingHandler {
        disconnects: AtomicUsize,
    }

    impl Handler for CountingHandler {
        fn on_peer_disconnected(&self, _meta: PeerMeta) -> HandlerFuture<'_> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    async fn spawn_server(
        config: ServerConfig,
    ) -> (Arc<TransferServer<CountingHandler>>, tokio::task::JoinHandle<()>, String) {
        let server = TransferServer::new(config, CountingHandler::default());
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        (server, handle, url)
    }

    async fn next_text<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, _) = spawn_server(ServerConfig::default()).await;
        assert!(server.port().await > 0);
        assert_eq!(server.connection_count().await, 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_accepts_multiple_peers() {
        let (server, handle, url) = spawn_server(ServerConfig::default()).await;

        let (ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (ws2, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count().await, 2);

        drop(ws1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.connection_count().await, 1);
        assert_eq!(server.handler().disconnects.load(Ordering::SeqCst), 1);

        drop(ws2);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn server_enforces_connection_limit() {
        let config = ServerConfig {
            port: 0,
            max_connections: 1,
        };
        let (server, handle, url) = spawn_server(config).await;

        let (_ws1, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The second handshake is refused before the upgrade.
        assert!(tokio_tungstenite::connect_async(&url).await.is_err());
        assert_eq!(server.connection_count().await, 1);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn parallel_handshakes_respect_connection_limit() {
        let config = ServerConfig {
            port: 0,
            max_connections: 2,
        };
        let (server, handle, url) = spawn_server(config).await;

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let url = url.clone();
                tokio::spawn(async move { tokio_tungstenite::connect_async(url).await })
            })
            .collect();
        let mut open = Vec::new();
        for attempt in attempts {
            if let Ok((ws, _)) = attempt.await.unwrap() {
                open.push(ws);
            }
        }
        assert_eq!(open.len(), 2);
        assert_eq!(server.connection_count().await, 2);

        // Closing a peer frees its slot.
        drop(open.pop());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let (_ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ping_gets_pong_on_same_connection() {
        let (server, handle, url) = spawn_server(ServerConfig::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let ping = Message::new::<()>("p-1", MessageType::Ping, None).unwrap();
        ws.send(WsMessage::Text(serde_json::to_string(&ping).unwrap().into()))
            .await
            .unwrap();

        let reply = next_text(&mut ws).await;
        assert_eq!(reply.id, "p-1");
        assert_eq!(reply.msg_type, MessageType::Pong);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_type_and_default_handlers_reply_not_implemented() {
        let (server, handle, url) = spawn_server(ServerConfig::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        for (id, ty) in [("u-1", "bogus_type"), ("u-2", "start_transfer")] {
            let msg = serde_json::json!({ "id": id, "type": ty, "payload": {} });
            ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();
            let reply = next_text(&mut ws).await;
            assert_eq!(reply.id, id);
            assert_eq!(reply.error.unwrap().code, 501);
        }

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_json_gets_invalid_request() {
        let (server, handle, url) = spawn_server(ServerConfig::default()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(WsMessage::Text(String::from("{not json").into())).await.unwrap();
        let reply = next_text(&mut ws).await;
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, 400);

        server.shutdown();
        handle.await.unwrap();
    }
}
