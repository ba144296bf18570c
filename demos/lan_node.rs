use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use lanfetch::config::{NodeConfig, DEFAULT_PORT};
use lanfetch::discovery::peer_id::PeerId;
use lanfetch::discovery::peer_table::RemoteAddress;
use lanfetch::dict;
use lanfetch::fetch::fetcher::FetchOptions;
use lanfetch::fetch::handler::{fn_handler, HandlerReply};
use lanfetch::net::sockets::{InterfaceProvider, StaticInterfaces};
use lanfetch::node::Node;
use lanfetch::util::bencode::Dict;
use tokio::{select, signal, time};
use tracing::{info, Level};

#[derive(Parser)]
struct Args {
    nick: String,

    /// RPC port, random if omitted
    #[clap(long)]
    port: Option<u16>,

    #[clap(long, default_value_t = DEFAULT_PORT)]
    discovery_port: u16,

    /// fetch over UDP instead of TCP
    #[clap(long, default_value_t = false)]
    udp_fetch: bool,

    /// 'broadcast' on 127.0.0.1 only, for several nodes on one host
    #[clap(long, default_value_t = false)]
    loopback: bool,

    /// remote peer to probe, as <uid>@<host>[:<port>]
    #[clap(long)]
    remote: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn parse_remote(s: &str) -> anyhow::Result<(PeerId, RemoteAddress)> {
    let (uid, address) = s.split_once('@')
        .ok_or_else(|| anyhow!("remote must be <uid>@<host>[:<port>]: {}", s))?;
    let remote = match address.rsplit_once(':') {
        Some((host, port)) => RemoteAddress { host: host.to_string(), port: Some(port.parse()?) },
        None => RemoteAddress { host: address.to_string(), port: None },
    };
    Ok((PeerId::parse(uid)?, remote))
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = NodeConfig::new(PeerId::random(), args.nick);
    config.rpc_port = args.port;
    config.discovery_port = args.discovery_port;
    config.broadcast_ports = vec![args.discovery_port];
    config.use_udp_fetcher = args.udp_fetch;
    config.listen_default_port = args.port.is_none();

    let interfaces: Arc<dyn InterfaceProvider> = if args.loopback {
        Arc::new(StaticInterfaces::loopback())
    }
    else {
        Arc::new(StaticInterfaces::limited_broadcast())
    };

    let node = Node::start(config, interfaces).await?;
    for remote in &args.remote {
        let (uid, address) = parse_remote(remote)?;
        node.peers().safe_get_peer(&uid.as_hex(), None).await;
        node.peers().add_remote(&uid, address).await;
    }

    node.fetcher().register_handler("ping", fn_handler(|peer, _| {
        info!("ping from {:?}", peer);
        HandlerReply::Reply(dict!("pong" => 1))
    })).await?;

    let mut ping_interval = time::interval(Duration::from_secs(10));
    loop {
        select! {
            _ = ping_interval.tick() => {
                for peer in node.peers().active_peers().await {
                    node.fetcher().fetch(peer, "ping", Dict::new(), Some(Arc::new(|peer: PeerId, reply: Option<&Dict>| {
                        match reply {
                            Some(reply) => info!("{:?} replied {:?}", peer, reply),
                            None => info!("no reply from {:?}", peer),
                        }
                    })), FetchOptions::with_retries(1)).await;
                }
            }
            _ = signal::ctrl_c() => {
                node.shutdown().await;
                return Ok(());
            }
        }
    }
}
