//! # skiff-protocol
//!
//! Message types and status codes for the Skiff daemon RPC surface.
//!
//! This crate defines the request/reply shapes exchanged between clients and
//! the daemon, together with the [`Status`]/[`StatusCode`] pair every
//! operation resolves to. The transport encoding is owned by the front-end
//! (`skiff-api`); these types only fix the operation semantics.
//!
//! Streamed operations (create, launch, restore) emit intermediate replies
//! through a [`ReplyTx`] before the final status is produced.

mod message;
mod status;

pub use message::*;
pub use status::{ErrorDetail, LaunchError, StartErrorCause, Status, StatusCode};

use tokio::sync::mpsc;

/// Sending half of a reply stream.
///
/// Operations that report progress write intermediate replies here. Sends
/// never fail from the daemon's point of view: a client that went away simply
/// stops receiving.
#[derive(Debug, Clone)]
pub struct ReplyTx<T>(mpsc::UnboundedSender<T>);

impl<T> ReplyTx<T> {
    /// Creates a reply stream, returning the sending half and the receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Sends a reply, ignoring a disconnected receiver.
    pub fn send(&self, reply: T) {
        let _ = self.0.send(reply);
    }
}
