use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::discovery::peer_id::PeerId;
use crate::util::bencode::Dict;

/// Called with the reply's payload fields, or with `None` if the request failed, timed out
///  or was answered with an error reply
pub type FetchCallback = Arc<dyn Fn(PeerId, Option<&Dict>) + Send + Sync>;

pub struct Request {
    pub rid: i64,
    /// the encoded envelope, kept for retransmission
    pub payload: Bytes,
    callback: Option<FetchCallback>,
    replied: Mutex<FxHashSet<PeerId>>,
}

impl Request {
    pub fn new(rid: i64, payload: Bytes, callback: Option<FetchCallback>) -> Request {
        Request {
            rid,
            payload,
            callback,
            replied: Default::default(),
        }
    }

    /// Invokes the callback, at most once per peer
    pub fn call(&self, peer: PeerId, reply: Option<&Dict>) {
        let is_first = self.replied.lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer);
        if is_first {
            if let Some(callback) = &self.callback {
                callback(peer, reply);
            }
        }
    }
}

struct PendingEntry {
    request: Arc<Request>,
    ttl: u32,
    retries: u32,
}

pub enum RetryDecision {
    Retry(Arc<Request>),
    /// the entry was removed, its callback is due
    Exhausted(Arc<Request>),
    /// not pending (any more)
    Unknown,
}

/// Requests waiting for a reply, by peer and rid. An entry exists only while a reply is
///  outstanding, and a peer's map is removed when it becomes empty.
#[derive(Default)]
pub struct PendingTable {
    by_peer: FxHashMap<PeerId, FxHashMap<i64, PendingEntry>>,
}

impl PendingTable {
    pub fn insert(&mut self, peer: PeerId, request: Arc<Request>, ttl: u32, retries: u32) {
        self.by_peer.entry(peer)
            .or_default()
            .insert(request.rid, PendingEntry { request, ttl, retries });
    }

    pub fn remove(&mut self, peer: &PeerId, rid: i64) -> Option<Arc<Request>> {
        let requests = self.by_peer.get_mut(peer)?;
        let result = requests.remove(&rid)
            .map(|e| e.request);
        if requests.is_empty() {
            self.by_peer.remove(peer);
        }
        result
    }

    pub fn contains(&self, peer: &PeerId, rid: i64) -> bool {
        self.by_peer.get(peer)
            .map(|requests| requests.contains_key(&rid))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_peer.values()
            .map(|requests| requests.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    /// Uses up one retry of a request whose delivery failed, or removes the request if it has
    ///  none left
    pub fn take_retry(&mut self, peer: &PeerId, rid: i64) -> RetryDecision {
        let Some(entry) = self.by_peer.get_mut(peer).and_then(|requests| requests.get_mut(&rid)) else {
            return RetryDecision::Unknown;
        };

        if entry.retries > 0 {
            entry.retries -= 1;
            RetryDecision::Retry(entry.request.clone())
        }
        else {
            match self.remove(peer, rid) {
                Some(request) => RetryDecision::Exhausted(request),
                None => RetryDecision::Unknown,
            }
        }
    }

    /// Decrements every entry's ttl, removing and returning the entries that reach zero
    pub fn sweep(&mut self) -> Vec<(PeerId, Arc<Request>)> {
        let mut expired = Vec::new();
        for (peer, requests) in self.by_peer.iter_mut() {
            requests.retain(|_, entry| {
                entry.ttl = entry.ttl.saturating_sub(1);
                if entry.ttl == 0 {
                    expired.push((*peer, entry.request.clone()));
                    false
                }
                else {
                    true
                }
            });
        }
        self.by_peer.retain(|_, requests| !requests.is_empty());
        expired
    }

    pub fn drain(&mut self) -> Vec<(PeerId, Arc<Request>)> {
        self.by_peer.drain()
            .flat_map(|(peer, requests)| requests.into_values().map(move |e| (peer, e.request)))
            .collect()
    }
}
