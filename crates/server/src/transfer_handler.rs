//! [`Handler`] that drives a [`TransferCoordinator`].

use std::sync::Arc;

use serde::de::DeserializeOwned;

use chunkvault_protocol::MessageType;
use chunkvault_protocol::constants::ERR_INVALID_REQUEST;
use chunkvault_protocol::envelope::Message;
use chunkvault_protocol::messages::{
    ChunkAckResponse, FileChunkRequest, ResumeTransferRequest, ResumeTransferResponse,
    StartTransferRequest, StartTransferResponse, TransferCompletedEvent,
};
use chunkvault_transfer::{
    ChunkAck, ChunkIndex, StartTransfer, TransferCoordinator, TransferError, TransferId,
};

use crate::binary::BinaryChunkHeader;
use crate::connection::{PeerMeta, Sender};
use crate::handler::{Handler, HandlerFuture};

/// Translates wire messages into coordinator calls.
///
/// Sessions are not tied to connections: a peer that disconnects keeps its
/// transfers and can `resume_transfer` from a new connection.
pub struct TransferHandler {
    coordinator: Arc<TransferCoordinator>,
}

impl TransferHandler {
    pub fn new(coordinator: Arc<TransferCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &Arc<TransferCoordinator> {
        &self.coordinator
    }

    async fn handle_chunk(
        &self,
        sender: &Sender,
        request_id: &str,
        transfer_id: TransferId,
        index: ChunkIndex,
        payload: &[u8],
        chunk_hash: &str,
    ) {
        let result = self
            .coordinator
            .accept_chunk(&transfer_id, index, payload, chunk_hash)
            .await;

        match result {
            Ok(ack) => send_ack(sender, request_id, ack),
            Err(e) => send_transfer_error(sender, request_id, &e),
        }
    }
}

/// Decodes a request payload, answering 400 if it is missing or malformed.
fn decode<T: DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload::<T>() {
        Ok(Some(req)) => Some(req),
        Ok(None) => {
            let _ = sender.send_error(msg, ERR_INVALID_REQUEST, "missing payload");
            None
        }
        Err(e) => {
            let _ = sender.send_error(msg, ERR_INVALID_REQUEST, &format!("invalid payload: {e}"));
            None
        }
    }
}

fn send_transfer_error(sender: &Sender, request_id: &str, err: &TransferError) {
    let _ = sender.send_msg(Message::error(request_id, err.code(), err.to_string()));
}

fn send_reply<T: serde::Serialize>(sender: &Sender, request_id: &str, msg_type: MessageType, payload: &T) {
    match Message::new(request_id, msg_type, Some(payload)) {
        Ok(msg) => {
            let _ = sender.send_msg(msg);
        }
        Err(e) => tracing::error!(?msg_type, "failed to encode reply: {e}"),
    }
}

fn send_ack(sender: &Sender, request_id: &str, ack: ChunkAck) {
    let transfer_id = ack.transfer_id.to_string();
    send_reply(
        sender,
        request_id,
        MessageType::ChunkAck,
        &ChunkAckResponse {
            transfer_id: transfer_id.clone(),
            index: ack.index,
            completes_transfer: ack.completes_transfer,
            received_bytes: ack.received_bytes,
        },
    );

    if let Some(object) = ack.object {
        let event = TransferCompletedEvent {
            transfer_id,
            size: object.size,
            hash: object.hash.to_hex(),
            location: object.location,
        };
        send_reply(
            sender,
            &uuid::Uuid::new_v4().to_string(),
            MessageType::TransferCompleted,
            &event,
        );
    }
}

impl Handler for TransferHandler {
    fn on_start_transfer(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = decode::<StartTransferRequest>(&sender, &msg) else {
                return;
            };
            let chunk_size = req
                .chunk_size
                .unwrap_or(self.coordinator.config().chunk_size_hint);

            let result = self
                .coordinator
                .start_transfer(StartTransfer {
                    filename: req.filename,
                    expected_size: req.size,
                    expected_hash: req.hash,
                    chunk_size_hint: req.chunk_size,
                })
                .await;

            match result {
                Ok(id) => send_reply(
                    &sender,
                    &msg.id,
                    MessageType::TransferStarted,
                    &StartTransferResponse {
                        transfer_id: id.to_string(),
                        chunk_size,
                    },
                ),
                Err(e) => send_transfer_error(&sender, &msg.id, &e),
            }
        })
    }

    fn on_file_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = decode::<FileChunkRequest>(&sender, &msg) else {
                return;
            };
            self.handle_chunk(
                &sender,
                &msg.id,
                TransferId::from(req.transfer_id),
                req.index,
                &req.payload,
                &req.chunk_hash,
            )
            .await;
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.handle_chunk(
                &sender,
                &header.id,
                TransferId::from(header.transfer_id),
                header.index,
                &data,
                &header.chunk_hash,
            )
            .await;
        })
    }

    fn on_resume_transfer(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = decode::<ResumeTransferRequest>(&sender, &msg) else {
                return;
            };
            match self.coordinator.resume_transfer(&TransferId::from(req.transfer_id)) {
                Ok(info) => send_reply(
                    &sender,
                    &msg.id,
                    MessageType::ResumeResponse,
                    &ResumeTransferResponse {
                        transfer_id: info.transfer_id.to_string(),
                        received_indices: info.received_indices,
                        received_bytes: info.received_bytes,
                        expected_size: info.expected_size,
                    },
                ),
                Err(e) => send_transfer_error(&sender, &msg.id, &e),
            }
        })
    }

    fn on_peer_disconnected(&self, meta: PeerMeta) -> HandlerFuture<'_> {
        Box::pin(async move {
            tracing::debug!(
                conn_id = %meta.conn_id,
                active = self.coordinator.active_count(),
                "peer gone, sessions kept for resume"
            );
        })
    }
}
