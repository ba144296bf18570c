use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::MAX_HELLO_SIZE;
use crate::discovery::discovery::Discovery;
use crate::net::connection::{ConnectionHandler, ConnectionOptions, FramedConnection};
use crate::net::listener::RpcHandler;
use crate::util::bencode::encode_dict;

/// RPC command line opening a direct hello exchange
pub const HELLO_COMMAND: &str = "PROXIMATE_HELLO";

fn options(discovery: &Discovery) -> ConnectionOptions {
    ConnectionOptions {
        max_message_size: MAX_HELLO_SIZE,
        ..ConnectionOptions::from_config(discovery.config())
    }
}

/// Opens a connection to a remote address, sends our hello and processes the hello that comes
///  back. This is how peers outside the broadcast domain find each other.
pub fn send_hello(discovery: Arc<Discovery>, host: &str, port: u16) -> FramedConnection {
    let timeout = discovery.config().connect_timeout;
    let hello = encode_dict(&discovery.hello().to_dict());
    let session = Arc::new(HelloClientSession {
        ip: host.parse().ok(),
        discovery: discovery.clone(),
    });

    let conn = FramedConnection::connect(host, port, timeout, options(&discovery), session);
    conn.write_raw(format!("{}\n", HELLO_COMMAND).as_bytes());
    conn.write(&hello);
    conn.set_timeout(timeout, 1);
    conn
}

struct HelloClientSession {
    discovery: Arc<Discovery>,
    ip: Option<IpAddr>,
}

#[async_trait]
impl ConnectionHandler for HelloClientSession {
    async fn on_message(&self, conn: &FramedConnection, msg: Bytes) -> bool {
        self.discovery.got_rpc_msg(&msg, self.ip).await;
        conn.close("hello exchanged");
        true
    }
}

/// Answers [HELLO_COMMAND] connections with our own hello
pub struct HelloRpcHandler {
    discovery: Arc<Discovery>,
}

impl HelloRpcHandler {
    pub fn new(discovery: Arc<Discovery>) -> HelloRpcHandler {
        HelloRpcHandler { discovery }
    }
}

#[async_trait]
impl RpcHandler for HelloRpcHandler {
    async fn accept(&self, stream: TcpStream, remote: SocketAddr, initial_input: Bytes) {
        debug!("hello exchange with {}", remote);
        let session = Arc::new(HelloServerSession {
            discovery: self.discovery.clone(),
            ip: remote.ip(),
        });
        let conn = FramedConnection::accept(stream, initial_input, options(&self.discovery), session);
        conn.set_timeout(self.discovery.config().connect_timeout, 1);
    }
}

struct HelloServerSession {
    discovery: Arc<Discovery>,
    ip: IpAddr,
}

#[async_trait]
impl ConnectionHandler for HelloServerSession {
    async fn on_message(&self, conn: &FramedConnection, msg: Bytes) -> bool {
        if !self.discovery.got_direct_hello(&msg, self.ip).await {
            conn.close("rejected hello");
            return true;
        }
        conn.write(&encode_dict(&self.discovery.hello().to_dict()));
        conn.close_after_send("hello exchanged");
        true
    }
}
