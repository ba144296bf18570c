use std::sync::Arc;

use async_trait::async_trait;

use crate::discovery::peer_id::PeerId;
use crate::fetch::envelope::Envelope;
use crate::util::bencode::Dict;

/// What a request handler wants sent back to the requesting peer
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HandlerReply {
    Reply(Dict),
    /// No reply now, the application sends one later through `Fetcher::send_reply`
    Postpone,
    /// No reply to a peer-set request that this node has nothing to say about. For unicast
    ///  requests this is treated like [HandlerReply::Error].
    Silent,
    /// an explicit empty error reply
    Error,
}

#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, peer: PeerId, request: &Envelope) -> HandlerReply;
}

/// Adapter for registering plain functions or closures that do not need to await anything
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where F: Fn(PeerId, &Envelope) -> HandlerReply + Send + Sync + 'static
{
    async fn handle(&self, peer: PeerId, request: &Envelope) -> HandlerReply {
        (self.0)(peer, request)
    }
}

pub fn fn_handler<F>(f: F) -> Arc<dyn RequestHandler>
where F: Fn(PeerId, &Envelope) -> HandlerReply + Send + Sync + 'static
{
    Arc::new(FnHandler(f))
}
