use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::select;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::dict;
use crate::discovery::peer_id::PeerId;
use crate::discovery::peer_table::PeerTable;
use crate::fetch::backend::{BackendEvent, BackendEventReceiver, FetchBackend};
use crate::fetch::envelope::{Envelope, ERROR_REPLY_KEY, NO_REPLY_RID};
use crate::fetch::handler::{HandlerReply, RequestHandler};
use crate::fetch::pending::{FetchCallback, PendingTable, Request, RetryDecision};
use crate::util::bencode::{Dict, Value};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FetchOptions {
    /// number of retransmissions after a delivery failure
    pub retries: u32,
    /// `false` sends the request without a rid, no reply is expected
    pub require_ack: bool,
}

impl FetchOptions {
    pub fn no_reply() -> FetchOptions {
        FetchOptions { retries: 0, require_ack: false }
    }

    pub fn with_retries(retries: u32) -> FetchOptions {
        FetchOptions { retries, require_ack: true }
    }
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions { retries: 0, require_ack: true }
    }
}

/// A named group of peers whose membership changes over time
#[async_trait]
pub trait PeerSet: Send + Sync {
    fn name(&self) -> &str;

    async fn active_members(&self) -> Vec<PeerId>;
}

/// A peer set with fixed membership. Only members that are currently active count.
pub struct StaticPeerSet {
    name: String,
    members: Vec<PeerId>,
    peers: Arc<PeerTable>,
}

impl StaticPeerSet {
    pub fn new(name: impl Into<String>, members: Vec<PeerId>, peers: Arc<PeerTable>) -> StaticPeerSet {
        StaticPeerSet {
            name: name.into(),
            members,
            peers,
        }
    }
}

#[async_trait]
impl PeerSet for StaticPeerSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn active_members(&self) -> Vec<PeerId> {
        let mut result = Vec::new();
        for peer in &self.members {
            if self.peers.is_active(peer).await {
                result.push(*peer);
            }
        }
        result
    }
}

/// The request / reply engine. It does not know about transports, it hands encoded envelopes
///  to a [FetchBackend] and receives decoded envelopes and delivery failures from it as
///  [BackendEvent]s.
///
/// Request handlers run on the engine's event loop. They must not wait for replies to their
///  own fetches, since those are processed by the same loop.
pub struct Fetcher {
    config: Arc<NodeConfig>,
    peers: Arc<PeerTable>,
    backend: Arc<dyn FetchBackend>,
    handlers: RwLock<FxHashMap<String, Arc<dyn RequestHandler>>>,
    pending: Mutex<PendingTable>,
    next_rid: AtomicI64,
    peer_sets: RwLock<FxHashSet<String>>,
}

impl Fetcher {
    pub fn new(config: Arc<NodeConfig>, peers: Arc<PeerTable>, backend: Arc<dyn FetchBackend>) -> Fetcher {
        Fetcher {
            config,
            peers,
            backend,
            handlers: Default::default(),
            pending: Default::default(),
            next_rid: AtomicI64::new(0),
            peer_sets: Default::default(),
        }
    }

    pub async fn register_handler(&self, request_type: &str, handler: Arc<dyn RequestHandler>) -> anyhow::Result<()> {
        if request_type.is_empty() {
            return Err(anyhow!("request type must not be empty"));
        }
        match self.handlers.write().await
            .entry(request_type.to_string())
        {
            Entry::Occupied(_) => Err(anyhow!("fetch handler for request type {} already registered", request_type)),
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn join_peer_set(&self, name: &str) {
        self.peer_sets.write().await
            .insert(name.to_string());
    }

    pub async fn leave_peer_set(&self, name: &str) {
        self.peer_sets.write().await
            .remove(name);
    }

    pub async fn is_peer_set_member(&self, name: &str) -> bool {
        self.peer_sets.read().await
            .contains(name)
    }

    pub async fn num_pending(&self) -> usize {
        self.pending.lock().await
            .len()
    }

    fn obtain_rid(&self, require_ack: bool) -> i64 {
        if require_ack {
            self.next_rid.fetch_add(1, Ordering::Relaxed)
        }
        else {
            NO_REPLY_RID
        }
    }

    /// Sends a request to a peer. The callback is invoked exactly once with the reply or with
    ///  `None`, unless `options.require_ack` is false in which case it is never invoked.
    ///
    /// Returns `false` if the backend could not even start sending the request.
    pub async fn fetch(&self, peer: PeerId, request_type: &str, mut request: Dict, callback: Option<FetchCallback>, options: FetchOptions) -> bool {
        request.entry("c".to_string())
            .or_insert_with(|| Value::from(""));

        let rid = self.obtain_rid(options.require_ack);
        let payload = Envelope::encode(request, rid, request_type);
        trace!("fetch {} from {:?}: rid {}, {} bytes", request_type, peer, rid, payload.len());

        let request = Arc::new(Request::new(rid, payload.clone(), callback));
        if rid >= 0 {
            self.pending.lock().await
                .insert(peer, request, self.config.request_ttl(), options.retries);
        }

        let success = self.backend.send_request(peer, rid, payload).await;
        if !success {
            debug!("could not send {} request to {:?}", request_type, peer);
            if rid >= 0 {
                self.pending.lock().await
                    .remove(&peer, rid);
            }
        }
        success
    }

    /// Sends a request to all currently active members of a peer set. Membership is
    ///  snapshotted when the call is made.
    pub async fn fetch_to_peer_set(&self, peer_set: &dyn PeerSet, request_type: &str, mut request: Dict, callback: Option<FetchCallback>, options: FetchOptions) -> bool {
        request.insert("c".to_string(), Value::from(peer_set.name()));

        let my_uid = self.peers.my_uid();
        let members = peer_set.active_members().await
            .into_iter()
            .filter(|p| *p != my_uid)
            .collect::<Vec<_>>();
        debug!("fetch {} from peer set {}: {} active members", request_type, peer_set.name(), members.len());

        if self.backend.is_peer_set_send_efficient() {
            let rid = self.obtain_rid(options.require_ack);
            let payload = Envelope::encode(request, rid, request_type);
            if rid >= 0 {
                let request = Arc::new(Request::new(rid, payload.clone(), callback));
                let mut pending = self.pending.lock().await;
                for peer in &members {
                    pending.insert(*peer, request.clone(), self.config.request_ttl(), options.retries);
                }
            }
            let success = self.backend.send_to_peer_set(members.clone(), rid, payload).await;
            if !success && rid >= 0 {
                debug!("could not send {} request to peer set {}", request_type, peer_set.name());
                let mut pending = self.pending.lock().await;
                for peer in &members {
                    pending.remove(peer, rid);
                }
            }
            return success;
        }

        for peer in members {
            self.fetch(peer, request_type, request.clone(), callback.clone(), options).await;
        }
        true
    }

    /// Replies to a request, typically one whose handler returned [HandlerReply::Postpone].
    ///  `None` sends an error reply.
    pub async fn send_reply(&self, peer: PeerId, rid: i64, reply: Option<Dict>) -> bool {
        let mut reply = reply.unwrap_or_else(|| dict!(ERROR_REPLY_KEY => ""));
        reply.insert("c".to_string(), Value::from(""));
        let payload = Envelope::encode(reply, rid, "");

        let success = self.backend.send_reply(peer, rid, payload).await;
        if !success {
            warn!("can not reply to rid {} for {:?}", rid, peer);
        }
        success
    }

    pub async fn handle_envelope(&self, peer: PeerId, envelope: Envelope) {
        self.peers.note_traffic(&peer).await;

        if envelope.is_request() {
            self.handle_request(peer, envelope).await;
        }
        else {
            self.handle_reply(peer, envelope).await;
        }
    }

    async fn handle_request(&self, peer: PeerId, request: Envelope) {
        let is_peer_set_request = !request.peer_set.is_empty();
        if is_peer_set_request && !self.is_peer_set_member(&request.peer_set).await {
            trace!("ignoring {} request for peer set {} from {:?}", request.request_type, request.peer_set, peer);
            return;
        }

        let handler = self.handlers.read().await
            .get(&request.request_type)
            .cloned();
        let reply = match handler {
            Some(handler) => handler.handle(peer, &request).await,
            None => {
                warn!("no fetch handler for {}:{} from {:?}", request.request_type, request.kind, peer);
                HandlerReply::Error
            }
        };

        if request.rid < 0 {
            return;
        }
        let reply = match reply {
            HandlerReply::Reply(d) => Some(d),
            HandlerReply::Postpone => return,
            HandlerReply::Silent if is_peer_set_request => return,
            HandlerReply::Silent | HandlerReply::Error => None,
        };
        self.send_reply(peer, request.rid, reply).await;
    }

    async fn handle_reply(&self, peer: PeerId, reply: Envelope) {
        let request = self.pending.lock().await
            .remove(&peer, reply.rid);
        let Some(request) = request else {
            warn!("invalid rid {} in reply from {:?}", reply.rid, peer);
            return;
        };

        trace!("reply to rid {} from {:?}", reply.rid, peer);
        if reply.is_error_reply() {
            request.call(peer, None);
        }
        else {
            request.call(peer, Some(&reply.fields));
        }
    }

    /// Retransmits a request whose delivery failed, or fails it if its retries are used up
    pub async fn on_delivery_failed(&self, peer: PeerId, rid: i64) {
        if rid < 0 {
            return;
        }

        loop {
            let decision = self.pending.lock().await
                .take_retry(&peer, rid);
            match decision {
                RetryDecision::Retry(request) => {
                    debug!("retrying rid {} to {:?}", rid, peer);
                    if self.backend.send_request(peer, rid, request.payload.clone()).await {
                        return;
                    }
                }
                RetryDecision::Exhausted(request) => {
                    debug!("giving up on rid {} to {:?}", rid, peer);
                    request.call(peer, None);
                    return;
                }
                RetryDecision::Unknown => return,
            }
        }
    }

    pub async fn retirement_sweep(&self) {
        let expired = self.pending.lock().await
            .sweep();
        for (peer, request) in expired {
            debug!("rid {} to {:?} timed out", request.rid, peer);
            request.call(peer, None);
        }
    }

    pub async fn run(self: Arc<Self>, mut events: BackendEventReceiver) {
        let cycle = self.config.retirement_cycle;
        let mut retirement = time::interval_at(Instant::now() + cycle, cycle);

        loop {
            select! {
                event = events.recv() => {
                    match event {
                        Some(BackendEvent::Received { peer, envelope }) => self.handle_envelope(peer, envelope).await,
                        Some(BackendEvent::Failed { peer, rid }) => self.on_delivery_failed(peer, rid).await,
                        None => {
                            info!("fetch backend terminated");
                            break;
                        }
                    }
                }
                _ = retirement.tick() => self.retirement_sweep().await,
            }
        }
    }

    /// Fails every pending request and closes all transport connections. Pending requests are
    ///  flushed first so that the delivery failures caused by closing find nothing to retry.
    pub async fn shutdown(&self) {
        let pending = self.pending.lock().await
            .drain();
        for (peer, request) in pending {
            request.call(peer, None);
        }

        self.backend.close_all("shutting down").await;
    }
}
