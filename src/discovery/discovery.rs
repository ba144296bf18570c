use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::config::{NodeConfig, DEFAULT_PORT};
use crate::discovery::hello::{bye_dict, Hello, HelloRejection, BYE_TYPE, HELLO_TYPE};
use crate::discovery::hello_rpc::send_hello;
use crate::discovery::peer_id::PeerId;
use crate::discovery::peer_table::PeerTable;
use crate::fetch::envelope::Envelope;
use crate::fetch::fetcher::{FetchOptions, Fetcher};
use crate::fetch::handler::{HandlerReply, RequestHandler};
use crate::net::sockets::InterfaceProvider;
use crate::net::NetworkState;
use crate::util::bencode::{decode_dict, encode_dict, Dict};

/// request type of hellos sent through the fetch engine to remote peers
pub const DISCOVERY_REQUEST_TYPE: &str = "discovery";

/// Finds peers and tracks their presence.
///
/// Peers on the local network are found through hello broadcasts on the discovery port. Peers
///  that are only reachable through a known remote address (e.g. behind NAT) are probed with
///  direct TCP hello exchanges, and once they are active they get hello requests through the
///  fetch engine at a slower pace to keep a path open through one-sided firewalls.
pub struct Discovery {
    config: Arc<NodeConfig>,
    peers: Arc<PeerTable>,
    network: Arc<NetworkState>,
    interfaces: Arc<dyn InterfaceProvider>,
    socket: Arc<UdpSocket>,
    rpc_port: u16,
    /// scan counters for peers that are kept alive through remote discovery
    remote_counters: Mutex<FxHashMap<PeerId, u32>>,
}

impl Discovery {
    pub fn new(config: Arc<NodeConfig>, peers: Arc<PeerTable>, network: Arc<NetworkState>, interfaces: Arc<dyn InterfaceProvider>, socket: Arc<UdpSocket>, rpc_port: u16) -> Discovery {
        Discovery {
            config,
            peers,
            network,
            interfaces,
            socket,
            rpc_port,
            remote_counters: Default::default(),
        }
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn hello(&self) -> Hello {
        Hello {
            uid: self.config.uid,
            nick: self.config.nick.clone(),
            port: self.rpc_port,
            protocol_version: crate::config::PROTOCOL_VERSION,
            profile_version: self.config.profile_version,
        }
    }

    /// the handler for hello requests arriving through the fetch engine
    pub fn request_handler(self: &Arc<Self>) -> Arc<dyn RequestHandler> {
        Arc::new(HelloRequestHandler { discovery: self.clone() })
    }

    pub async fn run(self: Arc<Self>, fetcher: Arc<Fetcher>) {
        info!("discovery listening on {:?}", self.socket.local_addr());

        let mut scan_interval = time::interval(self.config.scan_interval);
        let mut buf = vec![0u8; 2048];

        loop {
            select! {
                r = self.socket.recv_from(&mut buf), if self.config.udp_listen => {
                    match r {
                        Ok((len, from)) => self.got_rpc_msg(&buf[..len], Some(from.ip())).await,
                        Err(e) => error!("error receiving discovery datagram: {}", e),
                    }
                }
                _ = scan_interval.tick() => {
                    self.scan(&fetcher).await;
                }
            }
        }
    }

    /// Handles a hello or bye, received by broadcast or as the answer in a direct hello exchange. `ip`
    ///  is the address the message came from.
    pub async fn got_rpc_msg(&self, data: &[u8], ip: Option<IpAddr>) {
        if !self.network.is_ip_enabled() {
            return;
        }

        let d = match decode_dict(data) {
            Ok(d) => d,
            Err(e) => {
                debug!("invalid discovery message: {}", e);
                return;
            }
        };

        match d.get("t").and_then(|t| t.as_str()) {
            Some(HELLO_TYPE) => {
                self.got_hello(&d, ip).await;
            }
            Some(BYE_TYPE) => self.got_bye(&d, ip).await,
            other => info!("invalid discovery message type {:?}", other),
        }
    }

    /// Handles the hello opening a direct hello exchange. Returns `false` if the message is not
    ///  an acceptable hello, in which case it had no effect and must not be answered.
    pub async fn got_direct_hello(&self, data: &[u8], ip: IpAddr) -> bool {
        if !self.network.is_ip_enabled() {
            return false;
        }

        match decode_dict(data) {
            Ok(d) if d.get("t").and_then(|t| t.as_str()) == Some(HELLO_TYPE) => {
                self.got_hello(&d, Some(ip)).await
            }
            Ok(_) => {
                info!("direct hello exchange from {} without a hello", ip);
                false
            }
            Err(e) => {
                debug!("invalid direct hello from {}: {}", ip, e);
                false
            }
        }
    }

    fn validate_hello(&self, d: &Dict, ip: Option<IpAddr>) -> Option<Hello> {
        match Hello::from_dict(d, self.config.uid) {
            Ok(hello) => Some(hello),
            Err(HelloRejection::OwnUid) => None,
            Err(e) => {
                info!("rejecting hello from {:?}: {}", ip, e);
                None
            }
        }
    }

    /// registers the sender of a valid hello, returns `false` if the hello was rejected
    async fn got_hello(&self, d: &Dict, ip: Option<IpAddr>) -> bool {
        let Some(hello) = self.validate_hello(d, ip) else {
            return false;
        };
        trace!("hello from {:?} at {:?}", hello.uid, ip);
        self.peers.add_or_update(&hello, ip).await;
        true
    }

    async fn got_bye(&self, d: &Dict, ip: Option<IpAddr>) {
        let uid = d.get("uid")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        match self.peers.safe_get_peer(uid, ip).await {
            Some(peer) => {
                self.peers.depart(&peer, false).await;
            }
            None => {
                if uid != self.config.uid.as_hex() {
                    info!("rejecting bye from uid {:?} at {:?}", uid, ip);
                }
            }
        }
    }

    /// sends a datagram to every broadcast port on every interface with a usable address
    pub async fn broadcast(&self, payload: &[u8]) {
        if !self.network.is_ip_enabled() {
            return;
        }

        for interface in self.interfaces.interfaces() {
            if interface.ip.is_none() {
                trace!("interface {} has no address - skipping", interface.name);
                continue;
            }
            for &port in &self.config.broadcast_ports {
                let addr = SocketAddr::from((interface.broadcast, port));
                if let Err(e) = self.socket.send_to(payload, addr).await {
                    debug!("error broadcasting to {} on {}: {}", addr, interface.name, e);
                }
            }
        }
    }

    pub async fn scan(self: &Arc<Self>, fetcher: &Fetcher) {
        if self.config.udp_send {
            self.broadcast(&encode_dict(&self.hello().to_dict())).await;
        }

        self.peers.expire_stale().await;
        self.remote_discovery(fetcher).await;
    }

    async fn remote_discovery(self: &Arc<Self>, fetcher: &Fetcher) {
        if !self.network.is_ip_enabled() {
            return;
        }

        let active = self.peers.active_peers().await
            .into_iter()
            .collect::<FxHashSet<_>>();
        let with_remotes = self.peers.peers_with_remotes().await;

        let mut to_greet = Vec::new();
        let mut to_probe = Vec::new();
        {
            let mut counters = self.remote_counters.lock().await;
            for peer in with_remotes {
                counters.entry(peer).or_insert(0);
            }

            for (peer, counter) in counters.iter_mut() {
                let current = *counter;
                if active.contains(peer) {
                    *counter = (current + 1) % self.config.remote_hello_every_n_scans.max(1);
                    if current == 0 {
                        to_greet.push(*peer);
                    }
                    continue;
                }

                let remotes = self.peers.remotes(peer).await;
                if remotes.is_empty() {
                    continue;
                }
                *counter = (current + 1) % self.config.remote_connect_every_n_scans.max(1);
                if current == 0 {
                    to_probe.extend(remotes);
                }
            }
        }

        for peer in to_greet {
            debug!("sending remote hello to {:?}", peer);
            fetcher.fetch(peer, DISCOVERY_REQUEST_TYPE, self.hello().to_dict(), None, FetchOptions::default()).await;
        }
        for remote in to_probe {
            debug!("probing remote address {}:{:?}", remote.host, remote.port);
            send_hello(self.clone(), &remote.host, remote.port.unwrap_or(DEFAULT_PORT));
        }
    }

    pub async fn say_goodbye(&self) {
        debug!("broadcasting bye");
        self.broadcast(&encode_dict(&bye_dict(self.config.uid))).await;
    }
}

struct HelloRequestHandler {
    discovery: Arc<Discovery>,
}

#[async_trait]
impl RequestHandler for HelloRequestHandler {
    async fn handle(&self, peer: PeerId, request: &Envelope) -> HandlerReply {
        if request.kind != HELLO_TYPE {
            warn!("unsupported discovery request {:?} from {:?}", request.kind, peer);
            return HandlerReply::Error;
        }

        let Some(hello) = self.discovery.validate_hello(&request.message(), None) else {
            return HandlerReply::Error;
        };
        if hello.uid != peer {
            info!("rejecting hello for {:?} sent by {:?}", hello.uid, peer);
            return HandlerReply::Error;
        }

        self.discovery.peers.add_or_update(&hello, None).await;
        self.discovery.remote_counters.lock().await
            .insert(peer, 0);
        HandlerReply::Reply(Dict::new())
    }
}
