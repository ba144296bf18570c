use std::time::Duration;

use anyhow::bail;

use crate::discovery::peer_id::PeerId;

pub const PROTOCOL_VERSION: i64 = 0;

/// Well-known port for discovery broadcasts and for connections from outside the local network
pub const DEFAULT_PORT: u16 = 10651;
pub const MIN_PORT: u16 = 1024;

pub const NICK_MAX_LEN: usize = 32;
pub const MAX_COMMAND_NAME_LEN: usize = 32;
pub const MAX_HELLO_SIZE: usize = 512;

pub fn is_valid_port(port: i64) -> bool {
    port >= MIN_PORT as i64 && port <= u16::MAX as i64
}

/// A nick is 1 to 32 bytes and must not contain a line break
pub fn is_valid_nick(nick: &str) -> bool {
    !nick.is_empty() && nick.len() <= NICK_MAX_LEN && !nick.contains('\n')
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub uid: PeerId,
    pub nick: String,
    pub profile_version: i64,

    /// TCP and UDP port for fetch traffic, chosen randomly (with retries) if `None`
    pub rpc_port: Option<u16>,
    pub rpc_port_retries: usize,
    /// accept TCP connections on [DEFAULT_PORT] too, which is where remote peers connect to
    pub listen_default_port: bool,
    /// UDP port for receiving hello / bye messages, 0 for an OS assigned port
    pub discovery_port: u16,
    pub broadcast_ports: Vec<u16>,

    pub udp_listen: bool,
    pub udp_send: bool,
    /// fetch over the reliable datagram channel instead of TCP connections
    pub use_udp_fetcher: bool,

    pub scan_interval: Duration,
    pub presence_timeout: Duration,
    pub connect_timeout: Duration,
    pub protocol_timeout: Duration,
    /// idle timeout of fetch connections, and the time after which a request without reply
    ///  is considered failed
    pub fetch_timeout: Duration,
    pub retirement_cycle: Duration,

    pub max_record_size: usize,
    /// maximum number of bytes handed to the socket in a single write
    pub max_transfer: usize,
    pub max_connections_per_peer: usize,

    pub mtu: usize,
    pub udp_retry_interval: Duration,
    pub udp_max_retries: u32,
    pub ack_delay: Duration,
    pub receive_timeout: Duration,

    pub remote_hello_every_n_scans: u32,
    pub remote_connect_every_n_scans: u32,
}

impl NodeConfig {
    pub fn new(uid: PeerId, nick: impl Into<String>) -> NodeConfig {
        NodeConfig {
            uid,
            nick: nick.into(),
            profile_version: 0,
            rpc_port: None,
            rpc_port_retries: 13,
            listen_default_port: true,
            discovery_port: DEFAULT_PORT,
            broadcast_ports: vec![DEFAULT_PORT],
            udp_listen: true,
            udp_send: true,
            use_udp_fetcher: false,
            scan_interval: Duration::from_secs(5),
            presence_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(20),
            protocol_timeout: Duration::from_secs(20),
            fetch_timeout: Duration::from_secs(60),
            retirement_cycle: Duration::from_secs(5),
            max_record_size: 1024 * 1024,
            max_transfer: 4096,
            max_connections_per_peer: 8,
            mtu: 1024,
            udp_retry_interval: Duration::from_secs(10),
            udp_max_retries: 3,
            ack_delay: Duration::from_secs(2),
            receive_timeout: Duration::from_secs(40),
            remote_hello_every_n_scans: 3,
            remote_connect_every_n_scans: 6,
        }
    }

    /// Number of retirement sweeps a request survives. The extra sweep compensates for the
    ///  sweep cycle being out of phase with the request's creation.
    pub fn request_ttl(&self) -> u32 {
        (self.fetch_timeout.as_millis() / self.retirement_cycle.as_millis().max(1)) as u32 + 1
    }

    /// upper bound for the declared fragment count of an incoming datagram transfer
    pub fn max_fragment_count(&self) -> usize {
        self.max_record_size / self.mtu + 1
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_valid_nick(&self.nick) {
            bail!("invalid nick {:?}: must be 1 to {} bytes without line breaks", self.nick, NICK_MAX_LEN);
        }
        if let Some(port) = self.rpc_port {
            if port != 0 && !is_valid_port(port as i64) {
                bail!("rpc port must be at least {}: {}", MIN_PORT, port);
            }
        }
        if self.discovery_port != 0 && !is_valid_port(self.discovery_port as i64) {
            bail!("discovery port must be at least {}: {}", MIN_PORT, self.discovery_port);
        }
        if self.broadcast_ports.iter().any(|&p| p == 0) {
            bail!("broadcast ports must not be 0");
        }
        for (name, d) in [
            ("scan_interval", self.scan_interval),
            ("presence_timeout", self.presence_timeout),
            ("connect_timeout", self.connect_timeout),
            ("protocol_timeout", self.protocol_timeout),
            ("fetch_timeout", self.fetch_timeout),
            ("retirement_cycle", self.retirement_cycle),
            ("udp_retry_interval", self.udp_retry_interval),
            ("ack_delay", self.ack_delay),
            ("receive_timeout", self.receive_timeout),
        ] {
            if d.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }
        if self.mtu < 64 {
            bail!("mtu must be at least 64: {}", self.mtu);
        }
        if self.max_transfer == 0 || self.max_record_size == 0 {
            bail!("max_transfer and max_record_size must be greater than zero");
        }
        if self.max_connections_per_peer == 0 {
            bail!("max_connections_per_peer must be greater than zero");
        }
        if self.remote_hello_every_n_scans == 0 || self.remote_connect_every_n_scans == 0 {
            bail!("remote discovery cadences must be greater than zero");
        }
        Ok(())
    }
}
