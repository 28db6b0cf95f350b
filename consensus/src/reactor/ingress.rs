use commonware_cryptography::PublicKey;
use futures::{channel::mpsc, SinkExt};
use tracing::error;

/// Messages sent to the [super::Engine].
pub enum Message<P: PublicKey> {
    /// A peer connected and should receive gossip.
    AddPeer { peer: P },
    /// A peer disconnected.
    RemovePeer { peer: P },
}

/// Mailbox used to inform the [super::Engine] about peer lifecycle events.
#[derive(Clone)]
pub struct Mailbox<P: PublicKey> {
    sender: mpsc::Sender<Message<P>>,
}

impl<P: PublicKey> Mailbox<P> {
    pub(super) fn new(sender: mpsc::Sender<Message<P>>) -> Self {
        Self { sender }
    }

    pub async fn add_peer(&mut self, peer: P) {
        if let Err(err) = self.sender.send(Message::AddPeer { peer }).await {
            error!(?err, "failed to send add peer message");
        }
    }

    pub async fn remove_peer(&mut self, peer: P) {
        if let Err(err) = self.sender.send(Message::RemovePeer { peer }).await {
            error!(?err, "failed to send remove peer message");
        }
    }
}
