use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::config::MAX_COMMAND_NAME_LEN;
use crate::net::NetworkState;

/// A role that an inbound TCP connection can take, selected by the command line that the
///  connecting side sends first.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Takes over the connection. `initial_input` holds the bytes that were read past the
    ///  command line.
    async fn accept(&self, stream: TcpStream, remote: SocketAddr, initial_input: Bytes);
}

/// Accepts TCP connections, reads their `<COMMAND>\n` preamble and hands them to the handler
///  registered for that command
pub struct RpcListener {
    commands: RwLock<FxHashMap<String, Arc<dyn RpcHandler>>>,
    network: Arc<NetworkState>,
    protocol_timeout: Duration,
}

impl RpcListener {
    pub fn new(network: Arc<NetworkState>, protocol_timeout: Duration) -> RpcListener {
        RpcListener {
            commands: Default::default(),
            network,
            protocol_timeout,
        }
    }

    pub async fn register_command(&self, name: &str, handler: Arc<dyn RpcHandler>) -> anyhow::Result<()> {
        if name.is_empty() || name.len() > MAX_COMMAND_NAME_LEN || name.contains('\n') {
            bail!("invalid RPC command name {:?}", name);
        }

        match self.commands.write().await
            .entry(name.to_string())
        {
            Entry::Occupied(_) => Err(anyhow!("registering a second handler for RPC command {}", name)),
            Entry::Vacant(e) => {
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!("accepting RPC connections on {:?}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;

            if !self.network.is_ip_enabled() {
                debug!("IP network disabled - dropping connection from {}", addr);
                continue;
            }

            let rpc_listener = self.clone();
            tokio::spawn(async move {
                rpc_listener.handle_connection(stream, addr).await;
            });
        }
    }

    #[instrument(name="rpc_connection", skip_all, fields(addr = format!("{:?}", addr)))]
    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let (command, rest) = match time::timeout(self.protocol_timeout, read_command_line(&mut stream)).await {
            Ok(Ok(line)) => line,
            Ok(Err(e)) => {
                debug!("no valid command line: {}", e);
                return;
            }
            Err(_) => {
                debug!("timeout waiting for command line");
                return;
            }
        };

        let handler = self.commands.read().await
            .get(&command)
            .cloned();
        match handler {
            Some(handler) => {
                debug!("RPC command {}", command);
                handler.accept(stream, addr, rest)
                    .instrument(Span::current())
                    .await;
            }
            None => warn!("unknown RPC command {:?} - closing connection", command),
        }
    }
}

/// Reads until the first line is complete. Returns the command and the bytes after the line
///  break.
async fn read_command_line(stream: &mut TcpStream) -> anyhow::Result<(String, Bytes)> {
    let mut buf = BytesMut::with_capacity(256);
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if pos > MAX_COMMAND_NAME_LEN {
                bail!("command line exceeds {} bytes", MAX_COMMAND_NAME_LEN);
            }
            let line = buf.split_to(pos + 1);
            let command = std::str::from_utf8(&line[..pos])?.to_string();
            return Ok((command, buf.freeze()));
        }
        if buf.len() > MAX_COMMAND_NAME_LEN {
            bail!("command line exceeds {} bytes", MAX_COMMAND_NAME_LEN);
        }
        if stream.read_buf(&mut buf).await? == 0 {
            bail!("end of stream before command line was complete");
        }
    }
}
