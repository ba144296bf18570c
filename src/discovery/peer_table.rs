use std::collections::hash_map::Entry;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::discovery::hello::Hello;
use crate::discovery::peer_events::{PeerAppearedData, PeerChangedData, PeerDepartedData, PeerEvent, PeerEventNotifier};
use crate::discovery::peer_id::PeerId;

/// An address to probe for a peer outside the local network, e.g. behind NAT
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RemoteAddress {
    pub host: String,
    /// `None` means the well-known default port
    pub port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub nick: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub protocol_version: Option<i64>,
    pub profile_version: Option<i64>,
    pub present: bool,
    pub presence_deadline: Option<Instant>,
    pub blacklisted: bool,
    pub remotes: Vec<RemoteAddress>,
}

impl Peer {
    fn new(id: PeerId) -> Peer {
        Peer {
            id,
            nick: None,
            ip: None,
            port: None,
            protocol_version: None,
            profile_version: None,
            present: false,
            presence_deadline: None,
            blacklisted: false,
            remotes: Vec::new(),
        }
    }

    pub fn address(&self) -> Option<SocketAddr> {
        match (self.ip, self.port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            _ => None,
        }
    }
}

/// All peers this node knows about, present or not.
///
/// Peers are never removed, a departed peer just stops being active. Presence and address
///  fields are written by the discovery subsystem, everybody else reads.
pub struct PeerTable {
    my_uid: PeerId,
    presence_timeout: Duration,
    peers: RwLock<FxHashMap<PeerId, Peer>>,
    events: PeerEventNotifier,
}

impl PeerTable {
    pub fn new(my_uid: PeerId, presence_timeout: Duration) -> PeerTable {
        PeerTable {
            my_uid,
            presence_timeout,
            peers: Default::default(),
            events: PeerEventNotifier::new(),
        }
    }

    pub fn my_uid(&self) -> PeerId {
        self.my_uid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().await
            .get(id)
            .cloned()
    }

    pub async fn is_active(&self, id: &PeerId) -> bool {
        self.peers.read().await
            .get(id)
            .map(|p| p.present)
            .unwrap_or(false)
    }

    pub async fn get_address(&self, id: &PeerId) -> Option<SocketAddr> {
        self.peers.read().await
            .get(id)
            .and_then(|p| p.address())
    }

    pub async fn is_blacklisted(&self, id: &PeerId) -> bool {
        self.peers.read().await
            .get(id)
            .map(|p| p.blacklisted)
            .unwrap_or(false)
    }

    pub async fn active_peers(&self) -> Vec<PeerId> {
        let mut result = self.peers.read().await
            .values()
            .filter(|p| p.present)
            .map(|p| p.id)
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    /// Resolves a uid received from the network at `ip`. Returns `None` for malformed uids,
    ///  our own uid, blacklisted peers and peers whose known ip differs from `ip`. Unknown peers
    ///  are registered with no attributes so that we can reply to them.
    pub async fn safe_get_peer(&self, uid: &str, ip: Option<IpAddr>) -> Option<PeerId> {
        let id = PeerId::parse(uid).ok()?;
        if id == self.my_uid {
            return None;
        }

        match self.peers.write().await.entry(id) {
            Entry::Vacant(e) => {
                debug!("registering previously unknown peer {:?}", id);
                e.insert(Peer::new(id));
                Some(id)
            }
            Entry::Occupied(e) => {
                let peer = e.get();
                if let (Some(ip), Some(known_ip)) = (ip, peer.ip) {
                    if ip != known_ip {
                        debug!("peer {:?} is known at {}, not at {}", id, known_ip, ip);
                        return None;
                    }
                }
                if peer.blacklisted {
                    return None;
                }
                Some(id)
            }
        }
    }

    /// Registers the attributes from a validated hello and marks the peer as present. Address
    ///  fields are only touched if `ip` is known, i.e. if the hello did not arrive through a
    ///  relayed path.
    pub async fn add_or_update(&self, hello: &Hello, ip: Option<IpAddr>) {
        let event = {
            let mut peers = self.peers.write().await;
            let (peer, is_new) = match peers.entry(hello.uid) {
                Entry::Vacant(e) => (e.insert(Peer::new(hello.uid)), true),
                Entry::Occupied(e) => (e.into_mut(), false),
            };

            let mut changed = is_new;
            if let Some(ip) = ip {
                changed |= peer.ip != Some(ip) || peer.port != Some(hello.port);
                peer.ip = Some(ip);
                peer.port = Some(hello.port);
            }
            changed |= peer.nick.as_deref() != Some(hello.nick.as_str());
            peer.nick = Some(hello.nick.clone());
            peer.protocol_version = Some(hello.protocol_version);

            let profile_changed = peer.profile_version != Some(hello.profile_version);
            peer.profile_version = Some(hello.profile_version);

            let appeared = !peer.present;
            peer.present = true;
            peer.presence_deadline = Some(Instant::now() + self.presence_timeout);

            if appeared {
                info!("peer {:?} ({}) appeared", peer.id, hello.nick);
                Some(PeerEvent::Appeared(PeerAppearedData { peer: peer.id, profile_changed }))
            }
            else if changed || profile_changed {
                Some(PeerEvent::Changed(PeerChangedData { peer: peer.id, profile_changed }))
            }
            else {
                None
            }
        };

        if let Some(event) = event {
            self.events.send_event(event);
        }
    }

    /// Any accepted message from a peer counts as a sign of life: it extends the presence
    ///  deadline and makes a peer that is not present (yet) active.
    pub async fn note_traffic(&self, id: &PeerId) {
        let appeared = {
            let mut peers = self.peers.write().await;
            let Some(peer) = peers.get_mut(id) else {
                return;
            };
            if peer.blacklisted {
                return;
            }
            peer.presence_deadline = Some(Instant::now() + self.presence_timeout);
            let appeared = !peer.present;
            peer.present = true;
            appeared
        };

        if appeared {
            info!("peer {:?} appeared", id);
            self.events.send_event(PeerEvent::Appeared(PeerAppearedData { peer: *id, profile_changed: false }));
        }
    }

    /// Marks a peer as departed. Returns `false` if it was not present in the first place.
    pub async fn depart(&self, id: &PeerId, timed_out: bool) -> bool {
        let departed = match self.peers.write().await.get_mut(id) {
            Some(peer) if peer.present => {
                peer.present = false;
                true
            }
            _ => false,
        };

        if departed {
            info!("peer {:?} departed{}", id, if timed_out { " (timeout)" } else { "" });
            self.events.send_event(PeerEvent::Departed(PeerDepartedData { peer: *id, timed_out }));
        }
        departed
    }

    /// demotes every present peer whose presence deadline has passed
    pub async fn expire_stale(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let stale = self.peers.read().await
            .values()
            .filter(|p| p.present)
            .filter(|p| p.presence_deadline.map(|d| d <= now).unwrap_or(true))
            .map(|p| p.id)
            .collect::<Vec<_>>();

        let mut result = Vec::new();
        for id in stale {
            if self.depart(&id, true).await {
                result.push(id);
            }
        }
        result
    }

    pub async fn depart_all(&self) {
        for id in self.active_peers().await {
            self.depart(&id, false).await;
        }
    }

    pub async fn blacklist(&self, id: &PeerId) {
        self.set_blacklisted(id, true).await;
    }

    pub async fn unblacklist(&self, id: &PeerId) {
        self.set_blacklisted(id, false).await;
    }

    async fn set_blacklisted(&self, id: &PeerId, blacklisted: bool) {
        info!("peer {:?} blacklisted: {}", id, blacklisted);
        let mut peers = self.peers.write().await;
        peers.entry(*id)
            .or_insert_with(|| Peer::new(*id))
            .blacklisted = blacklisted;
    }

    pub async fn add_remote(&self, id: &PeerId, remote: RemoteAddress) {
        let mut peers = self.peers.write().await;
        let peer = peers.entry(*id)
            .or_insert_with(|| Peer::new(*id));
        if !peer.remotes.contains(&remote) {
            peer.remotes.push(remote);
        }
    }

    pub async fn remotes(&self, id: &PeerId) -> Vec<RemoteAddress> {
        self.peers.read().await
            .get(id)
            .map(|p| p.remotes.clone())
            .unwrap_or_default()
    }

    pub async fn peers_with_remotes(&self) -> Vec<PeerId> {
        self.peers.read().await
            .values()
            .filter(|p| !p.remotes.is_empty())
            .map(|p| p.id)
            .collect()
    }
}
