//! Handler trait for processing peer messages.
//!
//! Implementors provide the transfer logic while the server handles
//! connection management, routing, and the binary frame format.

use std::future::Future;
use std::pin::Pin;

use chunkvault_protocol::MessageType;
use chunkvault_protocol::constants::ERR_NOT_IMPLEMENTED;
use chunkvault_protocol::envelope::Message;

use crate::binary::BinaryChunkHeader;
use crate::connection::{PeerMeta, Sender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from a connected peer.
///
/// Each method receives the [`Sender`] of the connection the message arrived
/// on; responses must be sent there and nowhere else.
///
/// Default implementations reply with "not implemented" so handlers only
/// need to override the message types they care about.
pub trait Handler: Send + Sync + 'static {
    /// Called for `ping` messages.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `start_transfer`.
    fn on_start_transfer(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `file_chunk` with a base64 payload.
    fn on_file_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for `resume_transfer`.
    fn on_resume_transfer(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, ERR_NOT_IMPLEMENTED, "not implemented");
        })
    }

    /// Called for a binary chunk frame.
    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = data;
        Box::pin(async move {
            let _ = sender.send_msg(Message::error(
                header.id,
                ERR_NOT_IMPLEMENTED,
                "binary chunks not supported",
            ));
        })
    }

    /// Called after a connection's read pump exits.
    fn on_peer_disconnected(&self, meta: PeerMeta) -> HandlerFuture<'_> {
        let _ = meta;
        Box::pin(async {})
    }
}
