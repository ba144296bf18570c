use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

use crate::discovery::peer_id::PeerId;
use crate::fetch::envelope::Envelope;

/// What a transport backend reports back to the fetch engine
#[derive(Debug)]
pub enum BackendEvent {
    /// a decoded message from an authenticated, non-blacklisted peer
    Received { peer: PeerId, envelope: Envelope },
    /// The request could not be delivered. The engine decides between retrying and giving up.
    Failed { peer: PeerId, rid: i64 },
}

pub type BackendEventSender = mpsc::UnboundedSender<BackendEvent>;
pub type BackendEventReceiver = mpsc::UnboundedReceiver<BackendEvent>;

/// A transport that moves encoded fetch envelopes to and from peers.
///
/// `send_request` returning `true` means the request was handed to the transport. Failures
///  after that point are reported asynchronously as [BackendEvent::Failed].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FetchBackend: Send + Sync + 'static {
    async fn send_request(&self, peer: PeerId, rid: i64, payload: Bytes) -> bool;

    async fn send_reply(&self, peer: PeerId, rid: i64, payload: Bytes) -> bool;

    /// `true` if the backend can deliver one payload to a group of peers more cheaply than by
    ///  sending it to each of them
    fn is_peer_set_send_efficient(&self) -> bool {
        false
    }

    async fn send_to_peer_set(&self, members: Vec<PeerId>, rid: i64, payload: Bytes) -> bool {
        let mut success = true;
        for peer in members {
            success &= self.send_request(peer, rid, payload.clone()).await;
        }
        success
    }

    /// closes all connections, pending requests see a delivery failure
    async fn close_all(&self, reason: &str);
}
