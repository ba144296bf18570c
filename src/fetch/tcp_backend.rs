use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::NodeConfig;
use crate::dict;
use crate::discovery::peer_id::PeerId;
use crate::discovery::peer_table::PeerTable;
use crate::fetch::backend::{BackendEvent, BackendEventSender, FetchBackend};
use crate::fetch::envelope::{Envelope, NO_REPLY_RID};
use crate::net::connection::{CloseReason, ConnectionHandler, ConnectionOptions, FramedConnection};
use crate::net::listener::RpcHandler;
use crate::net::NetworkState;

/// RPC command line opening a fetch session
pub const FETCH_COMMAND: &str = "PROXIMATE_FETCH";

struct PooledConnection {
    conn: FramedConnection,
    /// requests sent on this connection that have not seen a reply yet
    sent_rids: FxHashSet<i64>,
}

struct Pool {
    config: Arc<NodeConfig>,
    peers: Arc<PeerTable>,
    network: Arc<NetworkState>,
    events: BackendEventSender,
    connections: Mutex<FxHashMap<PeerId, Vec<PooledConnection>>>,
}

impl Pool {
    fn options(&self) -> ConnectionOptions {
        ConnectionOptions::from_config(&self.config)
    }

    /// the first message on an outgoing fetch connection, telling the other side who we are
    fn identity_message(&self) -> Bytes {
        Envelope::encode(dict!(
            "t" => "",
            "uid" => self.peers.my_uid().as_hex(),
            "c" => "",
        ), NO_REPLY_RID, "")
    }

    /// Picks one of the peer's open connections at random, or opens a new one. A request's
    ///  rid is recorded for the chosen connection while the pool is locked, so a connection
    ///  failing right away still reports it.
    async fn select_connection(self: &Arc<Self>, peer: PeerId, rid: Option<i64>) -> Option<FramedConnection> {
        let addr = self.peers.get_address(&peer).await;

        let mut connections = self.connections.lock().await;
        let open = connections.get(&peer)
            .map(|list| list.iter()
                .enumerate()
                .filter(|(_, c)| !c.conn.is_closed())
                .map(|(idx, _)| idx)
                .collect::<Vec<_>>())
            .unwrap_or_default();

        let idx = if open.is_empty() {
            let conn = self.open_connection(peer, addr)?;
            let list = connections.entry(peer).or_default();
            list.push(PooledConnection { conn, sent_rids: Default::default() });
            list.len() - 1
        }
        else {
            open[rand::thread_rng().gen_range(0..open.len())]
        };

        let pooled = connections.get_mut(&peer)?.get_mut(idx)?;
        if let Some(rid) = rid.filter(|&rid| rid >= 0) {
            pooled.sent_rids.insert(rid);
        }
        Some(pooled.conn.clone())
    }

    fn open_connection(self: &Arc<Self>, peer: PeerId, addr: Option<SocketAddr>) -> Option<FramedConnection> {
        if !self.network.is_ip_enabled() {
            warn!("IP network disabled, not connecting to {:?}", peer);
            return None;
        }
        let Some(addr) = addr else {
            warn!("no ip / port to connect to {:?}", peer);
            return None;
        };

        debug!("opening fetch connection to {:?} at {}", peer, addr);
        let session = Arc::new(FetchSession {
            pool: self.clone(),
            peer: std::sync::Mutex::new(Some(peer)),
        });
        let conn = FramedConnection::connect(&addr.ip().to_string(), addr.port(), self.config.connect_timeout, self.options(), session);
        conn.write_raw(format!("{}\n", FETCH_COMMAND).as_bytes());
        conn.write(&self.identity_message());
        // this is also the upper bound for the processing time of a request
        conn.set_timeout(self.config.fetch_timeout, 1);
        Some(conn)
    }

    /// returns the number of connections to the peer after adding
    async fn add(&self, peer: PeerId, conn: FramedConnection) -> usize {
        let mut connections = self.connections.lock().await;
        let list = connections.entry(peer).or_default();
        list.push(PooledConnection { conn, sent_rids: Default::default() });
        list.len()
    }

    /// removes a closed connection, returning the rids that were not replied to
    async fn remove(&self, peer: PeerId, conn_id: u64) -> FxHashSet<i64> {
        let mut connections = self.connections.lock().await;
        let Some(list) = connections.get_mut(&peer) else {
            return Default::default();
        };
        let result = match list.iter().position(|c| c.conn.id() == conn_id) {
            Some(idx) => list.swap_remove(idx).sent_rids,
            None => Default::default(),
        };
        if list.is_empty() {
            connections.remove(&peer);
        }
        result
    }

    async fn note_replied(&self, peer: PeerId, conn_id: u64, rid: i64) {
        let mut connections = self.connections.lock().await;
        if let Some(c) = connections.get_mut(&peer)
            .and_then(|list| list.iter_mut().find(|c| c.conn.id() == conn_id))
        {
            c.sent_rids.remove(&rid);
        }
    }
}

/// The handler of a single fetch connection, outgoing or incoming. The peer of an incoming
///  connection is unknown until its first message arrives.
struct FetchSession {
    pool: Arc<Pool>,
    peer: std::sync::Mutex<Option<PeerId>>,
}

impl FetchSession {
    fn peer(&self) -> Option<PeerId> {
        *self.peer.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    async fn identify(&self, conn: &FramedConnection, envelope: &Envelope) -> bool {
        let Some(uid) = envelope.fields.get("uid").and_then(|v| v.as_str()) else {
            warn!("no uid in fetch connection from {:?}", conn.remote());
            return false;
        };
        let ip = conn.remote().map(|a| a.ip());
        let Some(peer) = self.pool.peers.safe_get_peer(uid, ip).await else {
            warn!("invalid uid {:?} in fetch connection from {:?}", uid, conn.remote());
            return false;
        };

        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer);
        let num_connections = self.pool.add(peer, conn.clone()).await;
        if num_connections > self.pool.config.max_connections_per_peer {
            warn!("not allowing more than {} connections from {:?}", self.pool.config.max_connections_per_peer, peer);
            return false;
        }
        debug!("fetch connection from {:?}", peer);
        true
    }
}

#[async_trait]
impl ConnectionHandler for FetchSession {
    async fn on_message(&self, conn: &FramedConnection, msg: Bytes) -> bool {
        let envelope = match Envelope::decode(&msg) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("invalid fetch message from {:?}: {}", conn.remote(), e);
                return false;
            }
        };

        let Some(peer) = self.peer() else {
            return self.identify(conn, &envelope).await;
        };

        if !envelope.is_request() {
            self.pool.note_replied(peer, conn.id(), envelope.rid).await;
        }
        if self.pool.peers.is_blacklisted(&peer).await {
            debug!("dropping message from blacklisted peer {:?}", peer);
            return true;
        }
        self.pool.events.send(BackendEvent::Received { peer, envelope }).is_ok()
    }

    async fn on_close(&self, conn: &FramedConnection, reason: &CloseReason) {
        let Some(peer) = self.peer() else {
            debug!("fetch connection without peer context closed: {}", reason);
            return;
        };

        let unreplied = self.pool.remove(peer, conn.id()).await;
        debug!("fetch connection to {:?} closed: {} - {} unreplied requests", peer, reason, unreplied.len());
        for rid in unreplied {
            let _ = self.pool.events.send(BackendEvent::Failed { peer, rid });
        }
    }
}

/// Fetch backend sending envelopes over pooled TCP connections, several per peer
#[derive(Clone)]
pub struct TcpBackend {
    pool: Arc<Pool>,
}

impl TcpBackend {
    pub fn new(config: Arc<NodeConfig>, peers: Arc<PeerTable>, network: Arc<NetworkState>, events: BackendEventSender) -> TcpBackend {
        TcpBackend {
            pool: Arc::new(Pool {
                config,
                peers,
                network,
                events,
                connections: Default::default(),
            }),
        }
    }

    /// the handler for [FETCH_COMMAND] connections, to be registered with the RPC listener
    pub fn rpc_handler(&self) -> Arc<dyn RpcHandler> {
        Arc::new(FetchRpcHandler { pool: self.pool.clone() })
    }

    pub async fn num_connections(&self, peer: &PeerId) -> usize {
        self.pool.connections.lock().await
            .get(peer)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FetchBackend for TcpBackend {
    async fn send_request(&self, peer: PeerId, rid: i64, payload: Bytes) -> bool {
        match self.pool.select_connection(peer, Some(rid)).await {
            Some(conn) => conn.write(&payload),
            None => false,
        }
    }

    async fn send_reply(&self, peer: PeerId, _rid: i64, payload: Bytes) -> bool {
        match self.pool.select_connection(peer, None).await {
            Some(conn) => conn.write(&payload),
            None => false,
        }
    }

    async fn close_all(&self, reason: &str) {
        let connections = self.pool.connections.lock().await
            .values()
            .flat_map(|list| list.iter().map(|c| c.conn.clone()))
            .collect::<Vec<_>>();
        debug!("closing {} fetch connections: {}", connections.len(), reason);
        for conn in connections {
            conn.close(reason);
        }
    }
}

struct FetchRpcHandler {
    pool: Arc<Pool>,
}

#[async_trait]
impl RpcHandler for FetchRpcHandler {
    async fn accept(&self, stream: TcpStream, remote: SocketAddr, initial_input: Bytes) {
        debug!("incoming fetch connection from {}", remote);
        let session = Arc::new(FetchSession {
            pool: self.pool.clone(),
            peer: std::sync::Mutex::new(None),
        });
        let conn = FramedConnection::accept(stream, initial_input, self.pool.options(), session);
        conn.set_timeout(self.pool.config.fetch_timeout, 1);
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time;

    use crate::discovery::hello::Hello;
    use crate::fetch::backend::BackendEventReceiver;
    use crate::net::frame::encode_frame;
    use crate::net::listener::RpcListener;

    use super::*;

    const A: PeerId = PeerId::new(0xa);
    const B: PeerId = PeerId::new(0xb);

    struct TestNode {
        backend: TcpBackend,
        peers: Arc<PeerTable>,
        network: Arc<NetworkState>,
        events: BackendEventReceiver,
        port: u16,
    }

    async fn node(uid: PeerId, max_connections_per_peer: usize) -> TestNode {
        let mut config = NodeConfig::new(uid, "test");
        config.max_connections_per_peer = max_connections_per_peer;
        config.connect_timeout = Duration::from_secs(2);
        let config = Arc::new(config);
        let peers = Arc::new(PeerTable::new(uid, config.presence_timeout));
        let network = Arc::new(NetworkState::new());
        let (send, events) = mpsc::unbounded_channel();
        let backend = TcpBackend::new(config.clone(), peers.clone(), network.clone(), send);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let rpc_listener = Arc::new(RpcListener::new(network.clone(), config.protocol_timeout));
        rpc_listener.register_command(FETCH_COMMAND, backend.rpc_handler()).await.unwrap();
        tokio::spawn(rpc_listener.accept_loop(listener));

        TestNode { backend, peers, network, events, port }
    }

    async fn introduce(peers: &PeerTable, uid: PeerId, port: u16) {
        peers.add_or_update(&Hello {
            uid,
            nick: "other".to_string(),
            port,
            protocol_version: 0,
            profile_version: 0,
        }, Some(IpAddr::from([127, 0, 0, 1]))).await;
    }

    fn request(rid: i64) -> Bytes {
        Envelope::encode(dict!("c" => "", "n" => rid), rid, "ping")
    }

    async fn next_event(events: &mut BackendEventReceiver) -> BackendEvent {
        time::timeout(Duration::from_secs(5), events.recv()).await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_request_and_reply() {
        let mut a = node(A, 8).await;
        let mut b = node(B, 8).await;
        introduce(&a.peers, B, b.port).await;

        assert!(a.backend.send_request(B, 0, request(0)).await);
        match next_event(&mut b.events).await {
            BackendEvent::Received { peer, envelope } => {
                assert_eq!(peer, A);
                assert_eq!(envelope.rid, 0);
                assert_eq!(envelope.request_type, "ping");
            }
            other => panic!("unexpected event {:?}", other),
        }
        // the inbound connection is pooled under the identified peer and used for the reply
        assert_eq!(b.backend.num_connections(&A).await, 1);

        let reply = Envelope::encode(dict!("c" => "", "pong" => 1), 0, "");
        assert!(b.backend.send_reply(A, 0, reply).await);
        match next_event(&mut a.events).await {
            BackendEvent::Received { peer, envelope } => {
                assert_eq!(peer, B);
                assert!(!envelope.is_request());
                assert_eq!(envelope.fields, dict!("pong" => 1));
            }
            other => panic!("unexpected event {:?}", other),
        }

        // the second request reuses the connection
        assert!(a.backend.send_request(B, 1, request(1)).await);
        next_event(&mut b.events).await;
        assert_eq!(a.backend.num_connections(&B).await, 1);
    }

    #[tokio::test]
    async fn test_unreplied_requests_fail_on_close() {
        let mut a = node(A, 8).await;
        let mut b = node(B, 8).await;
        introduce(&a.peers, B, b.port).await;

        assert!(a.backend.send_request(B, 4, request(4)).await);
        assert!(a.backend.send_request(B, NO_REPLY_RID, request(NO_REPLY_RID)).await);
        next_event(&mut b.events).await;
        next_event(&mut b.events).await;

        b.backend.close_all("test").await;
        match next_event(&mut a.events).await {
            BackendEvent::Failed { peer, rid } => assert_eq!((peer, rid), (B, 4)),
            other => panic!("unexpected event {:?}", other),
        }
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.backend.num_connections(&B).await, 0);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let mut a = node(A, 8).await;
        let unused_port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        introduce(&a.peers, B, unused_port).await;

        assert!(a.backend.send_request(B, 0, request(0)).await);
        match next_event(&mut a.events).await {
            BackendEvent::Failed { peer, rid } => assert_eq!((peer, rid), (B, 0)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_address() {
        let a = node(A, 8).await;
        assert!(!a.backend.send_request(B, 0, request(0)).await);
        a.peers.safe_get_peer(&B.as_hex(), None).await;
        assert!(!a.backend.send_request(B, 0, request(0)).await);
        assert!(!a.backend.send_reply(B, 0, request(0)).await);
    }

    #[tokio::test]
    async fn test_ip_network_disabled() {
        let a = node(A, 8).await;
        introduce(&a.peers, B, 4000).await;
        a.network.set_ip_enabled(false);
        assert!(!a.backend.send_request(B, 0, request(0)).await);
    }

    async fn raw_fetch_connection(port: u16, uid: &str) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("{}\n", FETCH_COMMAND).as_bytes());
        encode_frame(&Envelope::encode(dict!("c" => "", "uid" => uid), NO_REPLY_RID, ""), &mut buf);
        stream.write_all(&buf).await.unwrap();
        stream
    }

    async fn is_closed_by_peer(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 16];
        match time::timeout(Duration::from_millis(500), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            _ => false,
        }
    }

    #[tokio::test]
    async fn test_connections_per_peer_limit() {
        let b = node(B, 1).await;

        let mut first = raw_fetch_connection(b.port, &A.as_hex()).await;
        let mut second = raw_fetch_connection(b.port, &A.as_hex()).await;

        assert!(is_closed_by_peer(&mut second).await);
        assert!(!is_closed_by_peer(&mut first).await);
        assert_eq!(b.backend.num_connections(&A).await, 1);
    }

    #[rstest::rstest]
    #[case::own_uid("000000000000000b")]
    #[case::malformed_uid("xyz")]
    #[tokio::test]
    async fn test_invalid_identity_closes(#[case] uid: &str) {
        let b = node(B, 8).await;
        let mut stream = raw_fetch_connection(b.port, uid).await;
        assert!(is_closed_by_peer(&mut stream).await);
    }

    #[tokio::test]
    async fn test_identity_from_wrong_ip_closes() {
        let b = node(B, 8).await;
        b.peers.add_or_update(&Hello {
            uid: A,
            nick: "a".to_string(),
            port: 4000,
            protocol_version: 0,
            profile_version: 0,
        }, Some(IpAddr::from([10, 1, 2, 3]))).await;

        let mut stream = raw_fetch_connection(b.port, &A.as_hex()).await;
        assert!(is_closed_by_peer(&mut stream).await);
    }
}
