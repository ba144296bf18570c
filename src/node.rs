use std::sync::{Arc, Mutex};

use anyhow::bail;
use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{NodeConfig, DEFAULT_PORT, MIN_PORT};
use crate::discovery::discovery::{Discovery, DISCOVERY_REQUEST_TYPE};
use crate::discovery::hello_rpc::{HelloRpcHandler, HELLO_COMMAND};
use crate::discovery::peer_id::PeerId;
use crate::discovery::peer_table::PeerTable;
use crate::fetch::backend::FetchBackend;
use crate::fetch::fetcher::Fetcher;
use crate::fetch::tcp_backend::{TcpBackend, FETCH_COMMAND};
use crate::fetch::udp::UdpBackend;
use crate::net::listener::RpcListener;
use crate::net::sockets::{bind_tcp_listener, bind_udp, InterfaceProvider};
use crate::net::NetworkState;

/// A running node: the public API for applications.
///
/// All loops (discovery, fetch events and retirement, RPC listeners, UDP receive) run as
///  spawned tasks that live until [Node::shutdown].
pub struct Node {
    config: Arc<NodeConfig>,
    peers: Arc<PeerTable>,
    network: Arc<NetworkState>,
    fetcher: Arc<Fetcher>,
    discovery: Arc<Discovery>,
    backend: Arc<dyn FetchBackend>,
    udp_backend: Option<Arc<UdpBackend>>,
    rpc_port: u16,
    discovery_port: u16,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Binds all sockets and starts the node. Failing to bind is the only error, everything
    ///  after that is handled (and logged) internally.
    pub async fn start(config: NodeConfig, interfaces: Arc<dyn InterfaceProvider>) -> anyhow::Result<Arc<Node>> {
        config.validate()?;
        let config = Arc::new(config);

        let (rpc_listener, rpc_port) = bind_rpc_port(&config)?;
        let default_port_listener = if config.listen_default_port && rpc_port != DEFAULT_PORT {
            match bind_tcp_listener(DEFAULT_PORT) {
                Ok(listener) => Some(listener),
                Err(e) => {
                    warn!("could not listen on default port {}: {}", DEFAULT_PORT, e);
                    None
                }
            }
        }
        else {
            None
        };

        let discovery_socket = Arc::new(bind_udp(config.discovery_port, true)?);
        let discovery_port = discovery_socket.local_addr()?.port();

        let peers = Arc::new(PeerTable::new(config.uid, config.presence_timeout));
        let network = Arc::new(NetworkState::new());
        let rpc = Arc::new(RpcListener::new(network.clone(), config.protocol_timeout));
        let (events_send, events_recv) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        let (backend, udp_backend): (Arc<dyn FetchBackend>, _) = if config.use_udp_fetcher {
            let socket = Arc::new(bind_udp(rpc_port, false)?);
            let udp = Arc::new(UdpBackend::new(config.clone(), peers.clone(), network.clone(), socket, events_send));
            tasks.push(tokio::spawn(udp.clone().recv_loop()));
            (udp.clone(), Some(udp))
        }
        else {
            let tcp = TcpBackend::new(config.clone(), peers.clone(), network.clone(), events_send);
            rpc.register_command(FETCH_COMMAND, tcp.rpc_handler()).await?;
            (Arc::new(tcp), None)
        };

        let fetcher = Arc::new(Fetcher::new(config.clone(), peers.clone(), backend.clone()));
        let discovery = Arc::new(Discovery::new(config.clone(), peers.clone(), network.clone(), interfaces, discovery_socket, rpc_port));

        debug!("registering discovery handlers");
        fetcher.register_handler(DISCOVERY_REQUEST_TYPE, discovery.request_handler()).await?;
        rpc.register_command(HELLO_COMMAND, Arc::new(HelloRpcHandler::new(discovery.clone()))).await?;

        tasks.push(tokio::spawn(fetcher.clone().run(events_recv)));
        tasks.push(tokio::spawn(discovery.clone().run(fetcher.clone())));
        for listener in [Some(rpc_listener), default_port_listener].into_iter().flatten() {
            let rpc = rpc.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = rpc.accept_loop(listener).await {
                    error!("RPC listener terminated: {}", e);
                }
            }));
        }

        info!("node {:?} ({}) started: RPC port {}, discovery port {}{}", config.uid, config.nick, rpc_port, discovery_port,
            if config.use_udp_fetcher { ", fetching over UDP" } else { "" });

        Ok(Arc::new(Node {
            config,
            peers,
            network,
            fetcher,
            discovery,
            backend,
            udp_backend,
            rpc_port,
            discovery_port,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn uid(&self) -> PeerId {
        self.config.uid
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn fetcher(&self) -> &Arc<Fetcher> {
        &self.fetcher
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    /// `None` unless the node fetches over UDP
    pub fn udp_backend(&self) -> Option<&Arc<UdpBackend>> {
        self.udp_backend.as_ref()
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    pub fn discovery_port(&self) -> u16 {
        self.discovery_port
    }

    pub fn is_ip_network_enabled(&self) -> bool {
        self.network.is_ip_enabled()
    }

    /// Switches IP networking on or off. Switching it off closes all fetch connections,
    ///  pending requests see this as a delivery failure.
    pub async fn set_ip_network(&self, enabled: bool) {
        if self.network.set_ip_enabled(enabled) && !enabled {
            self.backend.close_all("IP networking disabled").await;
        }
    }

    pub async fn shutdown(&self) {
        info!("shutting down node {:?}", self.config.uid);

        if self.config.udp_send {
            self.discovery.say_goodbye().await;
        }
        self.peers.depart_all().await;
        self.fetcher.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
    }
}

/// Binds the configured RPC port, or a random one if none is configured
fn bind_rpc_port(config: &NodeConfig) -> anyhow::Result<(TcpListener, u16)> {
    if let Some(port) = config.rpc_port {
        let listener = bind_tcp_listener(port)?;
        let port = listener.local_addr()?.port();
        return Ok((listener, port));
    }

    let mut rng = rand::thread_rng();
    for _ in 0..config.rpc_port_retries {
        let port = rng.gen_range(MIN_PORT..=u16::MAX);
        match bind_tcp_listener(port) {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!("could not bind RPC port {}: {}", port, e),
        }
    }
    bail!("no free RPC port found in {} attempts", config.rpc_port_retries)
}
