//! Peer connection management: read/write pumps, ping/pong, send buffering.

use std::sync::Arc;

use chunkvault_protocol::constants::{
    ERR_INVALID_REQUEST, ERR_NOT_IMPLEMENTED, MessageType, WS_MAX_MESSAGE_SIZE, WS_PING_PERIOD,
    WS_PONG_WAIT,
};
use chunkvault_protocol::envelope::Message;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::binary::parse_binary_chunk;
use crate::handler::Handler;

/// Identity of a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMeta {
    /// Server-assigned connection id.
    pub conn_id: String,
    pub remote_addr: String,
}

/// Handle for sending messages to one connected peer.
///
/// Cloneable; wraps an `mpsc::Sender` feeding that connection's write pump.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
}

impl Sender {
    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the peer disconnected.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!(msg_type = ?msg.msg_type, "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(&self, req: &Message, code: i32, message: &str) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, message))
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Active connection to a peer.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct PeerConnection {
    pub meta: PeerMeta,
    sender: Sender,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals both pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// `true` until either pump has exited.
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && self.sender.is_connected()
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// The pumps run as background tokio tasks and stop when the peer closes
/// the socket, misses pongs, or `server_cancel` fires. `slot` is released
/// once the peer has disconnected.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    meta: PeerMeta,
    handler: Arc<H>,
    server_cancel: CancellationToken,
    slot: OwnedSemaphorePermit,
) -> PeerConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender { tx };

    let conn = PeerConnection {
        meta: meta.clone(),
        sender: sender.clone(),
        cancel: cancel.clone(),
    };

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel;
    tokio::spawn(async move {
        read_pump(ws_stream, sender, Arc::clone(&handler), read_cancel.clone()).await;
        read_cancel.cancel();
        tracing::info!(conn_id = %meta.conn_id, remote = %meta.remote_addr, "peer disconnected");
        handler.on_peer_disconnected(meta).await;
        drop(slot);
    });

    conn
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(ws_msg) = msg else { break };
                if let Err(e) = sink.send(ws_msg).await {
                    tracing::error!("write pump send error: {e}");
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches them to the handler in order.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!("pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if text.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        dispatch_text(&handler, &sender, &text).await;
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        if data.len() > WS_MAX_MESSAGE_SIZE {
                            tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                            continue;
                        }
                        dispatch_binary(&handler, &sender, &data).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        got_pong = true;
                        pong_deadline.reset();
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        let _ = sender.tx.try_send(WsMessage::Pong(data));
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        tracing::info!("received close frame");
                        break;
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(e)) => {
                        tracing::error!("read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Routes a text (JSON) message to the matching handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("invalid message JSON: {e}");
            let _ = sender.send_msg(Message::error(
                "",
                ERR_INVALID_REQUEST,
                format!("invalid message: {e}"),
            ));
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::Ping => handler.on_ping(s, msg).await,
        MessageType::StartTransfer => handler.on_start_transfer(s, msg).await,
        MessageType::FileChunk => handler.on_file_chunk(s, msg).await,
        MessageType::ResumeTransfer => handler.on_resume_transfer(s, msg).await,
        MessageType::Pong => {}
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, ERR_NOT_IMPLEMENTED, "unknown message type");
        }
    }
}

/// Routes a binary frame to [`Handler::on_binary_chunk`].
async fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_binary_chunk(data) {
        Ok((header, payload)) => handler.on_binary_chunk(sender.clone(), header, payload).await,
        Err(e) => {
            tracing::warn!("failed to parse binary frame: {e}");
            let _ = sender.send_msg(Message::error("", ERR_INVALID_REQUEST, e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_display() {
        assert!(SendError.to_string().contains("buffer full"));
    }

    #[tokio::test]
    async fn sender_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        let sender = Sender { tx };
        assert!(sender.is_connected());

        let ping = Message::new::<()>("p", MessageType::Ping, None).unwrap();
        sender.send_msg(ping.clone()).unwrap();
        // Buffer of one is now full.
        assert!(sender.send_msg(ping.clone()).is_err());

        drop(rx);
        assert!(!sender.is_connected());
        assert!(sender.send_msg(ping).is_err());
    }

    #[tokio::test]
    async fn send_error_echoes_request_id() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = Sender { tx };
        let req = Message::new::<()>("req-7", MessageType::ResumeTransfer, None).unwrap();
        sender.send_error(&req, 404, "transfer not found").unwrap();

        let Some(WsMessage::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        let reply: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(reply.id, "req-7");
        assert_eq!(reply.msg_type, MessageType::Error);
        assert_eq!(reply.error.unwrap().code, 404);
    }
}
