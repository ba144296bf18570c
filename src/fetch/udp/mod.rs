use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::config::NodeConfig;
use crate::discovery::peer_id::PeerId;
use crate::discovery::peer_table::PeerTable;
use crate::fetch::backend::{BackendEvent, BackendEventSender, FetchBackend};
use crate::fetch::envelope::Envelope;
use crate::fetch::udp::channel::{DatagramChannel, SendCallback};
use crate::net::NetworkState;
use crate::util::compression::decompress_with_limit;

pub mod channel;
pub mod packets;

/// Fetch backend sending envelopes as fragmented, acknowledged UDP datagrams from the node's
///  RPC port
pub struct UdpBackend {
    config: Arc<NodeConfig>,
    channel: Arc<DatagramChannel>,
    socket: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    network: Arc<NetworkState>,
    events: BackendEventSender,
}

impl UdpBackend {
    pub fn new(config: Arc<NodeConfig>, peers: Arc<PeerTable>, network: Arc<NetworkState>, socket: Arc<UdpSocket>, events: BackendEventSender) -> UdpBackend {
        UdpBackend {
            channel: Arc::new(DatagramChannel::new(config.clone(), peers.clone(), socket.clone())),
            config,
            socket,
            peers,
            network,
            events,
        }
    }

    pub fn set_packet_loss(&self, probability: f64) {
        self.channel.set_packet_loss(probability);
    }

    pub async fn recv_loop(self: Arc<Self>) {
        info!("receiving fetch datagrams on {:?}", self.socket.local_addr());

        let sweep_interval = self.config.receive_timeout / 4;
        let mut expiry = time::interval_at(time::Instant::now() + sweep_interval, sweep_interval);
        let mut buf = vec![0u8; 65536];

        loop {
            select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            trace!("received {} byte datagram from {}", len, from);
                            if let Some((peer, payload)) = self.channel.on_datagram(&buf[..len]).await {
                                self.handle_packet(peer, &payload).await;
                            }
                        }
                        Err(e) => {
                            error!("error receiving fetch datagram: {}", e);
                        }
                    }
                }
                _ = expiry.tick() => {
                    self.channel.expire_receives().await;
                }
            }
        }
    }

    async fn handle_packet(&self, peer: PeerId, payload: &[u8]) {
        let decompressed = match decompress_with_limit(payload, self.config.max_record_size) {
            Ok(decompressed) => decompressed,
            Err(e) => {
                debug!("payload from {:?} could not be decompressed, using it as is: {}", peer, e);
                payload.to_vec()
            }
        };

        let envelope = match Envelope::decode(&decompressed) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("invalid fetch payload from {:?}: {}", peer, e);
                return;
            }
        };

        if self.peers.is_blacklisted(&peer).await {
            debug!("dropping fetch payload from blacklisted peer {:?}", peer);
            return;
        }

        let _ = self.events.send(BackendEvent::Received { peer, envelope });
    }

    fn check_network(&self) -> bool {
        if !self.network.is_ip_enabled() {
            debug!("IP networking is disabled - not sending");
            return false;
        }
        true
    }
}

#[async_trait]
impl FetchBackend for UdpBackend {
    async fn send_request(&self, peer: PeerId, rid: i64, payload: Bytes) -> bool {
        if !self.check_network() {
            return false;
        }

        let require_ack = rid >= 0;
        let on_done: Option<SendCallback> = if require_ack {
            let events = self.events.clone();
            Some(Box::new(move |success| {
                if !success {
                    let _ = events.send(BackendEvent::Failed { peer, rid });
                }
            }))
        }
        else {
            None
        };
        self.channel.send_packet(peer, &payload, require_ack, on_done).await
    }

    async fn send_reply(&self, peer: PeerId, _rid: i64, payload: Bytes) -> bool {
        if !self.check_network() {
            return false;
        }
        self.channel.send_packet(peer, &payload, true, None).await
    }

    async fn close_all(&self, reason: &str) {
        debug!("aborting UDP transfers: {}", reason);
        self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use tokio::runtime::Builder;
    use tokio::sync::mpsc;

    use crate::dict;
    use crate::discovery::hello::Hello;
    use crate::fetch::backend::BackendEventReceiver;
    use crate::util::compression::compress;

    use super::*;

    const A: PeerId = PeerId::new(0xa);
    const B: PeerId = PeerId::new(0xb);

    struct TestNode {
        backend: Arc<UdpBackend>,
        peers: Arc<PeerTable>,
        network: Arc<NetworkState>,
        events: BackendEventReceiver,
        port: u16,
    }

    async fn node(uid: PeerId) -> TestNode {
        let config = Arc::new(NodeConfig::new(uid, "test"));
        let peers = Arc::new(PeerTable::new(uid, config.presence_timeout));
        let network = Arc::new(NetworkState::new());
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let port = socket.local_addr().unwrap().port();
        let (send, events) = mpsc::unbounded_channel();
        let backend = Arc::new(UdpBackend::new(config, peers.clone(), network.clone(), socket, send));
        tokio::spawn(backend.clone().recv_loop());
        TestNode { backend, peers, network, events, port }
    }

    async fn introduce(node: &TestNode, uid: PeerId, port: u16) {
        node.peers.add_or_update(&Hello {
            uid,
            nick: "peer".to_string(),
            port,
            protocol_version: 0,
            profile_version: 0,
        }, Some(IpAddr::from([127, 0, 0, 1]))).await;
    }

    async fn pair() -> (TestNode, TestNode) {
        let a = node(A).await;
        let b = node(B).await;
        introduce(&a, B, b.port).await;
        introduce(&b, A, a.port).await;
        (a, b)
    }

    #[tokio::test]
    async fn test_request_is_delivered() {
        let (a, mut b) = pair().await;

        let payload = Envelope::encode(dict!("c" => "", "t" => "ping", "n" => 3), 5, "ping");
        assert!(a.backend.send_request(B, 5, payload).await);

        match time::timeout(Duration::from_secs(5), b.events.recv()).await.unwrap() {
            Some(BackendEvent::Received { peer, envelope }) => {
                assert_eq!(peer, A);
                assert_eq!(envelope.rid, 5);
                assert_eq!(envelope.request_type, "ping");
                assert_eq!(envelope.fields.get("n").and_then(|v| v.as_int()), Some(3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_large_reply_is_reassembled() {
        let (a, mut b) = pair().await;

        let blob = (0..20_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect::<Vec<_>>();
        let payload = Envelope::encode(dict!("c" => "", "t" => "", "blob" => Bytes::from(blob.clone())), 1, "");
        assert!(a.backend.send_reply(B, 1, payload).await);

        match time::timeout(Duration::from_secs(5), b.events.recv()).await.unwrap() {
            Some(BackendEvent::Received { envelope, .. }) => {
                assert_eq!(envelope.fields.get("blob").and_then(|v| v.as_bytes()).map(|b| b.to_vec()), Some(blob));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_uncompressed_payload_is_accepted() {
        let (_a, b) = pair().await;
        let payload = Envelope::encode(dict!("c" => "", "t" => "x"), 2, "x");
        b.backend.handle_packet(A, &payload).await;
        let mut events = b.events;
        assert!(matches!(events.try_recv(), Ok(BackendEvent::Received { peer: A, .. })));

        let compressed = compress(&Envelope::encode(dict!("c" => "", "t" => "x"), 3, "x")).unwrap();
        b.backend.handle_packet(A, &compressed).await;
        assert!(matches!(events.try_recv(), Ok(BackendEvent::Received { peer: A, .. })));

        b.backend.handle_packet(A, b"garbage").await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_blacklisted_sender_is_dropped() {
        let (_a, b) = pair().await;
        b.peers.blacklist(&A).await;
        b.backend.handle_packet(A, &Envelope::encode(dict!("c" => "", "t" => "x"), 2, "x")).await;
        let mut events = b.events;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_without_address() {
        let (a, _b) = pair().await;
        assert!(!a.backend.send_request(PeerId::new(0xc), 1, Bytes::from_static(b"x")).await);
    }

    #[tokio::test]
    async fn test_send_with_ip_disabled() {
        let (a, _b) = pair().await;
        a.network.set_ip_enabled(false);
        assert!(!a.backend.send_request(B, 1, Bytes::from_static(b"x")).await);
        assert!(!a.backend.send_reply(B, 1, Bytes::from_static(b"x")).await);
    }

    #[test]
    fn test_unacknowledged_request_fails() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let mut a = node(A).await;
            let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            introduce(&a, B, silent.local_addr().unwrap().port()).await;

            assert!(a.backend.send_request(B, 4, Bytes::from_static(b"x")).await);
            assert!(a.backend.send_request(B, -1, Bytes::from_static(b"y")).await);

            time::sleep(Duration::from_secs(45)).await;
            assert!(matches!(a.events.try_recv(), Ok(BackendEvent::Failed { peer: B, rid: 4 })));
            assert!(a.events.try_recv().is_err());
        });
    }
}
