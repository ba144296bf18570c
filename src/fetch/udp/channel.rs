use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bit_set::BitSet;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::NodeConfig;
use crate::discovery::peer_id::PeerId;
use crate::discovery::peer_table::PeerTable;
use crate::fetch::udp::packets::{fragment, AckPacket, DataPacket, Packet};
use crate::util::compression::compress;

/// Called once when a transfer requiring acknowledgement completes: `true` when all
///  fragments were acknowledged, `false` when the retries ran out
pub type SendCallback = Box<dyn FnOnce(bool) + Send>;

type TransferKey = (PeerId, i64);

struct SendTransfer {
    /// encoded datagrams by fragment index
    unacked: BTreeMap<usize, Bytes>,
    retries: u32,
    on_done: Option<SendCallback>,
    retry_task: Option<JoinHandle<()>>,
}

struct ReceiveTransfer {
    fragcount: usize,
    ack: bool,
    received: BitSet,
    fragments: BTreeMap<usize, Bytes>,
    ack_task: Option<JoinHandle<()>>,
    last_activity: Instant,
}

impl ReceiveTransfer {
    fn ack_packet(&self, from: PeerId, key: TransferKey) -> Bytes {
        Packet::Ack(AckPacket {
            from,
            to: key.0,
            packet: key.1,
            ack: self.received.iter().collect(),
        }).encode()
    }
}

/// Reliable transfer of payloads over UDP datagrams.
///
/// Payloads are compressed and split into MTU sized fragments. If the sender asks for
///  acknowledgement, the receiver acks (after a short delay, batching fragments arriving in a
///  burst) the full set of fragments received so far, and the sender resends all unacknowledged
///  fragments periodically until they are acked or its retries run out. A receiver keeps a
///  transfer's record until it saw no new fragment for a while, so retransmissions of a
///  completed transfer are acked again but not delivered twice.
///
/// Packet ids are per sender, a receiver keys transfers by (peer, packet id).
pub struct DatagramChannel {
    config: Arc<NodeConfig>,
    my_uid: PeerId,
    socket: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    next_packet: AtomicI64,
    /// f64 bits
    packet_loss: AtomicU64,
    sends: Mutex<FxHashMap<TransferKey, SendTransfer>>,
    receives: Mutex<FxHashMap<TransferKey, ReceiveTransfer>>,
}

impl DatagramChannel {
    pub fn new(config: Arc<NodeConfig>, peers: Arc<PeerTable>, socket: Arc<UdpSocket>) -> DatagramChannel {
        DatagramChannel {
            my_uid: config.uid,
            config,
            socket,
            peers,
            next_packet: AtomicI64::new(0),
            packet_loss: AtomicU64::new(0f64.to_bits()),
            sends: Default::default(),
            receives: Default::default(),
        }
    }

    /// drops this fraction of received datagrams, for testing
    pub fn set_packet_loss(&self, probability: f64) {
        self.packet_loss.store(probability.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn packet_loss(&self) -> f64 {
        f64::from_bits(self.packet_loss.load(Ordering::Relaxed))
    }

    pub async fn num_pending_sends(&self) -> usize {
        self.sends.lock().await.len()
    }

    pub async fn num_pending_receives(&self) -> usize {
        self.receives.lock().await.len()
    }

    /// Starts a transfer. Returns `false` if the peer has no known address.
    pub async fn send_packet(self: &Arc<Self>, peer: PeerId, payload: &[u8], require_ack: bool, on_done: Option<SendCallback>) -> bool {
        if self.peers.get_address(&peer).await.is_none() {
            warn!("no ip / port to send to {:?}", peer);
            return false;
        }

        let compressed = match compress(payload) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!("could not compress payload for {:?}: {}", peer, e);
                return false;
            }
        };

        let packet = self.next_packet.fetch_add(1, Ordering::Relaxed);
        let datagrams = fragment(self.my_uid, peer, packet, &compressed, self.config.mtu, require_ack);
        trace!("sending packet {} to {:?} in {} fragments", packet, peer, datagrams.len());

        let retry_interval = self.config.udp_retry_interval;
        let channel = self.clone();
        if require_ack {
            let key = (peer, packet);
            let retry_task = tokio::spawn(async move {
                loop {
                    time::sleep(retry_interval).await;
                    if !channel.retry(key).await {
                        break;
                    }
                }
            });
            self.sends.lock().await
                .insert(key, SendTransfer {
                    unacked: datagrams.iter().cloned().enumerate().collect(),
                    retries: self.config.udp_max_retries,
                    on_done,
                    retry_task: Some(retry_task),
                });
            self.send_datagrams(&peer, &datagrams).await;
        }
        else {
            self.send_datagrams(&peer, &datagrams).await;
            // best effort: a second copy after the retry interval
            tokio::spawn(async move {
                time::sleep(retry_interval).await;
                channel.send_datagrams(&peer, &datagrams).await;
            });
        }
        true
    }

    async fn send_datagrams(&self, peer: &PeerId, datagrams: &[Bytes]) {
        let Some(addr) = self.peers.get_address(peer).await else {
            warn!("no ip / port to send to {:?}", peer);
            return;
        };
        for datagram in datagrams {
            if let Err(e) = self.socket.send_to(datagram, addr).await {
                debug!("error sending datagram to {}: {}", addr, e);
            }
        }
    }

    /// resends all unacknowledged fragments, returns `false` when the transfer is finished
    async fn retry(&self, key: TransferKey) -> bool {
        let datagrams = {
            let mut sends = self.sends.lock().await;
            let Some(transfer) = sends.get_mut(&key) else {
                return false;
            };

            if transfer.retries == 0 {
                let transfer = sends.remove(&key);
                drop(sends);
                debug!("packet {} to {:?} was not acknowledged - giving up", key.1, key.0);
                if let Some(on_done) = transfer.and_then(|t| t.on_done) {
                    on_done(false);
                }
                return false;
            }

            transfer.retries -= 1;
            transfer.unacked.values()
                .cloned()
                .collect::<Vec<_>>()
        };

        debug!("resending {} fragments of packet {} to {:?}", datagrams.len(), key.1, key.0);
        self.send_datagrams(&key.0, &datagrams).await;
        true
    }

    /// Processes a received datagram, returning the sender and the reassembled (compressed)
    ///  payload when it completes a transfer
    pub async fn on_datagram(self: &Arc<Self>, data: &[u8]) -> Option<(PeerId, Bytes)> {
        let packet_loss = self.packet_loss();
        if packet_loss > 0.0 && rand::random::<f64>() < packet_loss {
            trace!("simulated packet loss");
            return None;
        }

        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("received an invalid packet: {}", e);
                return None;
            }
        };

        if packet.from() == self.my_uid || packet.to() != self.my_uid {
            return None;
        }
        if self.peers.get(&packet.from()).await.is_none() {
            warn!("packet from unknown peer {:?}", packet.from());
            return None;
        }

        match packet {
            Packet::Data(d) => {
                if d.fragcount > self.config.max_fragment_count() {
                    warn!("too large packet from {:?}: {} fragments", d.from, d.fragcount);
                    return None;
                }
                if d.payload.len() > 2 * self.config.mtu {
                    warn!("too large fragment from {:?}: {} bytes", d.from, d.payload.len());
                    return None;
                }
                let from = d.from;
                self.got_data(d).await
                    .map(|payload| (from, payload))
            }
            Packet::Ack(a) => {
                self.got_ack(a).await;
                None
            }
        }
    }

    async fn got_data(self: &Arc<Self>, d: DataPacket) -> Option<Bytes> {
        let key = (d.from, d.packet);

        let (ack, payload) = {
            let mut receives = self.receives.lock().await;
            let transfer = receives.entry(key)
                .or_insert_with(|| ReceiveTransfer {
                    fragcount: d.fragcount,
                    ack: d.ack,
                    received: BitSet::with_capacity(d.fragcount),
                    fragments: Default::default(),
                    ack_task: None,
                    last_activity: Instant::now(),
                });

            if transfer.fragcount != d.fragcount {
                warn!("invalid number of fragments {} for packet {} from {:?}", d.fragcount, d.packet, d.from);
                return None;
            }
            if d.frag >= transfer.fragcount {
                warn!("invalid fragment {} for packet {} from {:?}", d.frag, d.packet, d.from);
                return None;
            }

            if transfer.ack && transfer.ack_task.is_none() {
                let channel = self.clone();
                let ack_delay = self.config.ack_delay;
                transfer.ack_task = Some(tokio::spawn(async move {
                    time::sleep(ack_delay).await;
                    channel.send_delayed_ack(key).await;
                }));
            }

            if !transfer.received.insert(d.frag) {
                trace!("duplicate fragment {} of packet {} from {:?}", d.frag, d.packet, d.from);
                return None;
            }
            transfer.fragments.insert(d.frag, d.payload);
            transfer.last_activity = Instant::now();

            if transfer.received.len() < transfer.fragcount {
                return None;
            }

            debug!("received packet {} from {:?}", d.packet, d.from);
            if let Some(task) = transfer.ack_task.take() {
                task.abort();
            }
            let ack = transfer.ack.then(|| transfer.ack_packet(self.my_uid, key));

            let mut payload = Vec::new();
            for fragment in std::mem::take(&mut transfer.fragments).into_values() {
                payload.extend_from_slice(&fragment);
            }
            (ack, Bytes::from(payload))
        };

        if let Some(ack) = ack {
            self.send_datagrams(&key.0, &[ack]).await;
        }
        Some(payload)
    }

    async fn send_delayed_ack(&self, key: TransferKey) {
        let ack = {
            let mut receives = self.receives.lock().await;
            let Some(transfer) = receives.get_mut(&key) else {
                return;
            };
            transfer.ack_task = None;
            transfer.ack_packet(self.my_uid, key)
        };
        self.send_datagrams(&key.0, &[ack]).await;
    }

    async fn got_ack(&self, a: AckPacket) {
        let key = (a.from, a.packet);
        let finished = {
            let mut sends = self.sends.lock().await;
            let Some(transfer) = sends.get_mut(&key) else {
                trace!("ack for unknown packet {} from {:?}", a.packet, a.from);
                return;
            };
            for frag in &a.ack {
                transfer.unacked.remove(frag);
            }
            if !transfer.unacked.is_empty() {
                return;
            }
            sends.remove(&key)
        };

        if let Some(transfer) = finished {
            debug!("packet {} to {:?} was acknowledged", a.packet, a.from);
            if let Some(task) = transfer.retry_task {
                task.abort();
            }
            if let Some(on_done) = transfer.on_done {
                on_done(true);
            }
        }
    }

    /// discards receive records that saw no new fragments for the receive timeout
    pub async fn expire_receives(&self) {
        let Some(deadline) = Instant::now().checked_sub(self.config.receive_timeout) else {
            return;
        };
        self.receives.lock().await
            .retain(|key, transfer| {
                if transfer.last_activity > deadline {
                    return true;
                }
                trace!("discarding receive record for packet {} from {:?}", key.1, key.0);
                if let Some(task) = transfer.ack_task.take() {
                    task.abort();
                }
                false
            });
    }

    /// Aborts all transfers. Pending sends report failure.
    pub async fn close(&self) {
        let sends = self.sends.lock().await
            .drain()
            .collect::<Vec<_>>();
        for (_, transfer) in sends {
            if let Some(task) = transfer.retry_task {
                task.abort();
            }
            if let Some(on_done) = transfer.on_done {
                on_done(false);
            }
        }

        for (_, transfer) in self.receives.lock().await.drain() {
            if let Some(task) = transfer.ack_task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tokio::runtime::Builder;

    use crate::discovery::hello::Hello;
    use crate::util::compression::decompress_with_limit;

    use super::*;

    const A: PeerId = PeerId::new(0xa);
    const B: PeerId = PeerId::new(0xb);

    async fn introduce(peers: &PeerTable, uid: PeerId, port: u16) {
        peers.add_or_update(&Hello {
            uid,
            nick: "peer".to_string(),
            port,
            protocol_version: 0,
            profile_version: 0,
        }, Some(IpAddr::from([127, 0, 0, 1]))).await;
    }

    /// a channel for uid `me` that knows `other` at `other_port`
    async fn channel(me: PeerId, other: PeerId, other_port: u16, mtu: usize) -> Arc<DatagramChannel> {
        let mut config = NodeConfig::new(me, "test");
        config.mtu = mtu;
        let config = Arc::new(config);
        let peers = Arc::new(PeerTable::new(me, config.presence_timeout));
        introduce(&peers, other, other_port).await;
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        Arc::new(DatagramChannel::new(config, peers, socket))
    }

    async fn raw_socket() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn drain(socket: &UdpSocket) -> Vec<Packet> {
        let mut result = Vec::new();
        let mut buf = vec![0u8; 65536];
        while let Ok(n) = socket.try_recv(&mut buf) {
            result.push(Packet::decode(&buf[..n]).unwrap());
        }
        result
    }

    fn recording_callback() -> (Option<SendCallback>, Arc<StdMutex<Vec<bool>>>) {
        let results: Arc<StdMutex<Vec<bool>>> = Default::default();
        let r = results.clone();
        (Some(Box::new(move |success| r.lock().unwrap().push(success))), results)
    }

    fn data_fragments(payload: &[u8], mtu: usize, ack: bool) -> Vec<Bytes> {
        fragment(A, B, 7, &compress(payload).unwrap(), mtu, ack)
    }

    fn incompressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i * 7919) % 251) as u8 ^ (i >> 3) as u8).collect()
    }

    #[tokio::test]
    async fn test_transfer_between_channels() {
        let a = channel(A, PeerId::new(0xc), 4000, 100).await;
        let b = channel(B, A, a.socket.local_addr().unwrap().port(), 100).await;
        introduce(&a.peers, B, b.socket.local_addr().unwrap().port()).await;

        let payload = incompressible(1000);
        let (callback, results) = recording_callback();
        assert!(a.send_packet(B, &payload, true, callback).await);
        assert_eq!(a.num_pending_sends().await, 1);

        let mut buf = vec![0u8; 65536];
        let mut delivered = None;
        while delivered.is_none() {
            let n = b.socket.recv(&mut buf).await.unwrap();
            delivered = b.on_datagram(&buf[..n]).await;
        }
        let (from, compressed) = delivered.unwrap();
        assert_eq!(from, A);
        assert_eq!(decompress_with_limit(&compressed, 1 << 20).unwrap(), payload);

        // the final fragment triggers an immediate ack
        let n = a.socket.recv(&mut buf).await.unwrap();
        assert!(a.on_datagram(&buf[..n]).await.is_none());
        assert_eq!(*results.lock().unwrap(), vec![true]);
        assert_eq!(a.num_pending_sends().await, 0);
    }

    #[test]
    fn test_reassembly_in_any_order_with_duplicates() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (a_socket, a_port) = raw_socket().await;
            let b = channel(B, A, a_port, 100).await;

            let payload = incompressible(450);
            let fragments = data_fragments(&payload, 100, true);
            assert_eq!(fragments.len(), 5);

            let mut delivered = Vec::new();
            for idx in [3, 0, 3, 4, 1, 0, 2, 2, 4] {
                if let Some((_, compressed)) = b.on_datagram(&fragments[idx]).await {
                    delivered.push(decompress_with_limit(&compressed, 1 << 20).unwrap());
                }
            }
            assert_eq!(delivered, vec![payload]);

            time::sleep(Duration::from_millis(10)).await;
            match drain(&a_socket).as_slice() {
                [Packet::Ack(ack)] => {
                    assert_eq!(ack.packet, 7);
                    assert_eq!(ack.from, B);
                    assert_eq!(ack.ack, vec![0, 1, 2, 3, 4]);
                }
                other => panic!("expected exactly one ack, got {:?}", other),
            }

            // a retransmission after completion is acked again after the ack delay, but not delivered
            assert!(b.on_datagram(&fragments[1]).await.is_none());
            time::sleep(Duration::from_millis(2_100)).await;
            match drain(&a_socket).as_slice() {
                [Packet::Ack(ack)] => assert_eq!(ack.ack, vec![0, 1, 2, 3, 4]),
                other => panic!("expected exactly one ack, got {:?}", other),
            }

            // the record expires after inactivity
            time::sleep(Duration::from_secs(41)).await;
            b.expire_receives().await;
            assert_eq!(b.num_pending_receives().await, 0);
        });
    }

    #[test]
    fn test_delayed_ack_batches_fragments() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (a_socket, a_port) = raw_socket().await;
            let b = channel(B, A, a_port, 100).await;
            let fragments = data_fragments(&incompressible(450), 100, true);

            b.on_datagram(&fragments[0]).await;
            b.on_datagram(&fragments[2]).await;
            time::sleep(Duration::from_millis(1_900)).await;
            assert!(drain(&a_socket).is_empty());

            time::sleep(Duration::from_millis(200)).await;
            match drain(&a_socket).as_slice() {
                [Packet::Ack(ack)] => assert_eq!(ack.ack, vec![0, 2]),
                other => panic!("expected exactly one ack, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_no_ack_for_unacknowledged_transfer() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (a_socket, a_port) = raw_socket().await;
            let b = channel(B, A, a_port, 100).await;
            let fragments = data_fragments(b"hello", 100, false);

            assert!(b.on_datagram(&fragments[0]).await.is_some());
            time::sleep(Duration::from_secs(3)).await;
            assert!(drain(&a_socket).is_empty());
        });
    }

    #[test]
    fn test_retries_exhausted() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (b_socket, b_port) = raw_socket().await;
            let a = channel(A, B, b_port, 100).await;
            let (callback, results) = recording_callback();

            assert!(a.send_packet(B, b"ping", true, callback).await);
            time::sleep(Duration::from_secs(35)).await;
            assert_eq!(drain(&b_socket).len(), 4);
            assert!(results.lock().unwrap().is_empty());

            time::sleep(Duration::from_secs(10)).await;
            assert_eq!(*results.lock().unwrap(), vec![false]);
            assert_eq!(a.num_pending_sends().await, 0);
            assert!(drain(&b_socket).is_empty());
        });
    }

    #[test]
    fn test_partial_ack_resends_remaining_fragments() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (b_socket, b_port) = raw_socket().await;
            let a = channel(A, B, b_port, 100).await;
            let (callback, results) = recording_callback();

            assert!(a.send_packet(B, &incompressible(250), true, callback).await);
            time::sleep(Duration::from_millis(10)).await;
            let first = drain(&b_socket);
            assert_eq!(first.len(), 3);

            let ack = Packet::Ack(AckPacket { from: B, to: A, packet: 0, ack: vec![0, 2] }).encode();
            a.on_datagram(&ack).await;

            time::sleep(Duration::from_secs(10)).await;
            match drain(&b_socket).as_slice() {
                [Packet::Data(d)] => assert_eq!(d.frag, 1),
                other => panic!("expected only fragment 1, got {:?}", other),
            }

            let ack = Packet::Ack(AckPacket { from: B, to: A, packet: 0, ack: vec![0, 1, 2] }).encode();
            a.on_datagram(&ack).await;
            assert_eq!(*results.lock().unwrap(), vec![true]);
        });
    }

    #[test]
    fn test_unacknowledged_send_goes_out_twice() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async move {
            let (b_socket, b_port) = raw_socket().await;
            let a = channel(A, B, b_port, 100).await;

            assert!(a.send_packet(B, b"fire and forget", false, None).await);
            assert_eq!(a.num_pending_sends().await, 0);
            time::sleep(Duration::from_millis(10)).await;
            assert_eq!(drain(&b_socket).len(), 1);
            time::sleep(Duration::from_secs(10)).await;
            assert_eq!(drain(&b_socket).len(), 1);
            time::sleep(Duration::from_secs(30)).await;
            assert!(drain(&b_socket).is_empty());
        });
    }

    #[tokio::test]
    async fn test_send_without_address() {
        let a = channel(A, B, 4000, 100).await;
        assert!(!a.send_packet(PeerId::new(0xc), b"x", true, None).await);
    }

    #[rstest::rstest]
    #[case::from_myself(Packet::Data(DataPacket { from: B, to: B, packet: 1, frag: 0, fragcount: 1, payload: Bytes::from_static(b"x"), ack: false }))]
    #[case::not_for_me(Packet::Data(DataPacket { from: A, to: PeerId::new(0xc), packet: 1, frag: 0, fragcount: 1, payload: Bytes::from_static(b"x"), ack: false }))]
    #[case::unknown_sender(Packet::Data(DataPacket { from: PeerId::new(0xc), to: B, packet: 1, frag: 0, fragcount: 1, payload: Bytes::from_static(b"x"), ack: false }))]
    #[case::fragment_out_of_range(Packet::Data(DataPacket { from: A, to: B, packet: 1, frag: 1, fragcount: 1, payload: Bytes::from_static(b"x"), ack: false }))]
    #[case::too_many_fragments(Packet::Data(DataPacket { from: A, to: B, packet: 1, frag: 0, fragcount: 100_000, payload: Bytes::from_static(b"x"), ack: false }))]
    #[case::fragment_too_large(Packet::Data(DataPacket { from: A, to: B, packet: 1, frag: 0, fragcount: 1, payload: Bytes::from(vec![0u8; 201]), ack: false }))]
    #[tokio::test]
    async fn test_rejected_datagrams(#[case] packet: Packet) {
        let b = channel(B, A, 4000, 100).await;
        assert!(b.on_datagram(&packet.encode()).await.is_none());
    }

    #[tokio::test]
    async fn test_fragcount_mismatch_is_ignored() {
        let b = channel(B, A, 4000, 100).await;
        let first = Packet::Data(DataPacket { from: A, to: B, packet: 1, frag: 0, fragcount: 2, payload: Bytes::from_static(b"x"), ack: false });
        let mismatch = Packet::Data(DataPacket { from: A, to: B, packet: 1, frag: 1, fragcount: 1, payload: Bytes::from_static(b"y"), ack: false });
        assert!(b.on_datagram(&first.encode()).await.is_none());
        assert!(b.on_datagram(&mismatch.encode()).await.is_none());
        assert_eq!(b.num_pending_receives().await, 1);
    }

    #[tokio::test]
    async fn test_total_packet_loss() {
        let b = channel(B, A, 4000, 100).await;
        b.set_packet_loss(1.0);
        let fragments = data_fragments(b"hello", 100, false);
        assert!(b.on_datagram(&fragments[0]).await.is_none());
        b.set_packet_loss(0.0);
        assert!(b.on_datagram(&fragments[0]).await.is_some());
    }

    #[tokio::test]
    async fn test_close_fails_pending_sends() {
        let (_b_socket, b_port) = raw_socket().await;
        let a = channel(A, B, b_port, 100).await;
        let (callback, results) = recording_callback();
        a.send_packet(B, b"x", true, callback).await;
        a.close().await;
        assert_eq!(*results.lock().unwrap(), vec![false]);
        assert_eq!(a.num_pending_sends().await, 0);
    }
}
