use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tokio::{select, time};
use tracing::{debug, trace};

use crate::config::NodeConfig;
use crate::net::frame::{encode_frame, FrameDecoder};

/// Why a connection ended. Every connection ends with exactly one of these, passed to
///  [ConnectionHandler::on_close].
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloseReason {
    #[error("end of stream")]
    Eof,
    #[error("connection timeout")]
    ConnectTimeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("unknown host {0}")]
    UnknownHost(String),
    #[error("idle timeout")]
    IdleTimeout,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("I/O error: {0}")]
    Io(String),
    /// closed locally
    #[error("closed: {0}")]
    Closed(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    NoConnection,
    Connecting,
    Ok,
    Closed(CloseReason),
}

/// Callbacks for a connection in normal (framed) mode. They are called from the task driving
///  the connection, one at a time.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called for every complete message. Returning `false` closes the connection as a protocol
    ///  violation.
    async fn on_message(&self, conn: &FramedConnection, msg: Bytes) -> bool;

    async fn on_close(&self, _conn: &FramedConnection, _reason: &CloseReason) {}
}

/// Streaming mode receive handler: gets all buffered input, returns the number of bytes it
///  consumed, or `None` to close the connection
pub type RecvHandler = Box<dyn FnMut(&[u8]) -> Option<usize> + Send>;

/// Streaming mode send handler: polled whenever the output buffer runs low, `None` ends
///  streaming mode
pub type SendHandler = Box<dyn FnMut() -> Option<Bytes> + Send>;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_message_size: usize,
    pub write_window: usize,
}

impl ConnectionOptions {
    pub fn from_config(config: &NodeConfig) -> ConnectionOptions {
        ConnectionOptions {
            max_message_size: config.max_record_size,
            write_window: config.max_transfer,
        }
    }
}

enum Command {
    Write(Bytes),
    SetRecvHandler(Option<RecvHandler>),
    SetSendHandler(Option<SendHandler>),
    SetTimeout(Option<(Duration, usize)>),
    SetMaxMessageSize(usize),
    Throttle(bool),
    Close(String),
    CloseAfterSend(String),
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Handle to a length-prefixed, bidirectional message channel over a TCP stream.
///
/// The stream itself is owned by a driver task that does all reading, writing and timer
///  handling; handles talk to it through a command queue, so all operations are non-blocking
///  and may be called from inside the connection's own handler. Operations on a closed
///  connection are no-ops.
#[derive(Clone)]
pub struct FramedConnection {
    id: u64,
    remote: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Debug for FramedConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FramedConnection{{#{} {:?} {:?}}}", self.id, self.remote, *self.state.borrow())
    }
}

impl PartialEq for FramedConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl FramedConnection {
    /// Starts connecting to `host:port` in the background. Data written before the connection
    ///  is established is buffered. A failed attempt closes the connection with a categorized
    ///  [CloseReason].
    pub fn connect(host: &str, port: u16, timeout: Duration, options: ConnectionOptions, handler: Arc<dyn ConnectionHandler>) -> FramedConnection {
        let (conn, driver) = ConnectionDriver::new(None, options, handler, BytesMut::new(), ConnectionState::Connecting);
        let host = host.to_string();
        tokio::spawn(driver.run_outgoing(host, port, timeout));
        conn
    }

    /// Takes over an accepted stream. `initial_input` holds bytes that were already read from
    ///  the stream before, they are processed as if they had just arrived.
    pub fn accept(stream: TcpStream, initial_input: Bytes, options: ConnectionOptions, handler: Arc<dyn ConnectionHandler>) -> FramedConnection {
        let remote = stream.peer_addr().ok();
        let (conn, driver) = ConnectionDriver::new(remote, options, handler, BytesMut::from(initial_input.as_ref()), ConnectionState::Ok);
        tokio::spawn(driver.run(stream));
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// the remote socket address, if this connection was accepted rather than opened
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Closed(_))
    }

    /// waits for the connection to close, returning the reason
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.clone();
        let waited = state.wait_for(|s| matches!(s, ConnectionState::Closed(_))).await
            .map(|s| s.clone());
        let result = match waited {
            Ok(s) => s,
            Err(_) => state.borrow().clone(),
        };
        match result {
            ConnectionState::Closed(reason) => reason,
            _ => CloseReason::Closed("connection driver terminated".to_string()),
        }
    }

    /// Writes a message with length prefix. Returns `false` if the connection is closed.
    pub fn write(&self, payload: &[u8]) -> bool {
        let mut buf = BytesMut::with_capacity(payload.len() + 12);
        encode_frame(payload, &mut buf);
        self.send(Command::Write(buf.freeze()))
    }

    /// Writes bytes without length prefix, e.g. an RPC preamble or streamed data
    pub fn write_raw(&self, data: &[u8]) -> bool {
        self.send(Command::Write(Bytes::copy_from_slice(data)))
    }

    /// Switches to (or, with `None`, out of) streaming receive mode
    pub fn set_recv_handler(&self, handler: Option<RecvHandler>) {
        self.send(Command::SetRecvHandler(handler));
    }

    pub fn set_send_handler(&self, handler: Option<SendHandler>) {
        self.send(Command::SetSendHandler(handler));
    }

    /// The connection is closed if fewer than `min_bytes` are transferred (in both directions
    ///  together) during any `interval`. Replaces a previous timeout.
    pub fn set_timeout(&self, interval: Duration, min_bytes: usize) {
        self.send(Command::SetTimeout(Some((interval, min_bytes.max(1)))));
    }

    pub fn clear_timeout(&self) {
        self.send(Command::SetTimeout(None));
    }

    pub fn set_max_message_size(&self, max_message_size: usize) {
        self.send(Command::SetMaxMessageSize(max_message_size));
    }

    /// Stops (or resumes) reading from the socket and delivering messages, without closing
    pub fn throttle(&self, enabled: bool) {
        self.send(Command::Throttle(enabled));
    }

    pub fn close(&self, msg: &str) {
        self.send(Command::Close(msg.to_string()));
    }

    /// closes the connection as soon as all buffered output is written and the send handler
    ///  (if any) has no more data
    pub fn close_after_send(&self, msg: &str) {
        self.send(Command::CloseAfterSend(msg.to_string()));
    }

    fn send(&self, cmd: Command) -> bool {
        if self.is_closed() {
            return false;
        }
        self.commands.send(cmd).is_ok()
    }
}

struct IdleTimer {
    interval: Interval,
    min_bytes: usize,
    transferred: usize,
}

/// Owns the stream. It keeps a handle of its own for passing to the handler, so the command
///  queue stays open and the connection lives until it is closed locally, by the peer or by
///  the idle timeout.
struct ConnectionDriver {
    conn: FramedConnection,
    handler: Arc<dyn ConnectionHandler>,
    state: watch::Sender<ConnectionState>,
    commands: mpsc::UnboundedReceiver<Command>,
    write_window: usize,
    decoder: FrameDecoder,
    inb: BytesMut,
    outb: BytesMut,
    recv_handler: Option<RecvHandler>,
    send_handler: Option<SendHandler>,
    throttled: bool,
    /// input must be processed even without new bytes arriving, e.g. after leaving throttled mode
    reprocess: bool,
    close_after_send: Option<String>,
    idle: Option<IdleTimer>,
    closed: bool,
}

impl ConnectionDriver {
    fn new(remote: Option<SocketAddr>, options: ConnectionOptions, handler: Arc<dyn ConnectionHandler>, inb: BytesMut, initial_state: ConnectionState) -> (FramedConnection, ConnectionDriver) {
        let (commands_send, commands_recv) = mpsc::unbounded_channel();
        let (state_send, state_recv) = watch::channel(initial_state);

        let conn = FramedConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            commands: commands_send,
            state: state_recv,
        };

        let reprocess = !inb.is_empty();
        let driver = ConnectionDriver {
            conn: conn.clone(),
            handler,
            state: state_send,
            commands: commands_recv,
            write_window: options.write_window.max(1),
            decoder: FrameDecoder::new(options.max_message_size),
            inb,
            outb: BytesMut::new(),
            recv_handler: None,
            send_handler: None,
            throttled: false,
            reprocess,
            close_after_send: None,
            idle: None,
            closed: false,
        };
        (conn, driver)
    }

    async fn run_outgoing(mut self, host: String, port: u16, timeout: Duration) {
        let connect = connect_stream(&host, port, timeout);
        tokio::pin!(connect);

        loop {
            select! {
                result = &mut connect => {
                    match result {
                        Ok(stream) => {
                            debug!("connection #{} to {}:{} established", self.conn.id, host, port);
                            self.state.send_replace(ConnectionState::Ok);
                            self.run(stream).await;
                        }
                        Err(reason) => {
                            self.close(reason).await;
                        }
                    }
                    return;
                }
                Some(cmd) = self.commands.recv() => {
                    if !self.apply_command(cmd).await {
                        return;
                    }
                }
            }
        }
    }

    async fn run(mut self, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();

        loop {
            if self.closed {
                return;
            }
            if self.reprocess {
                self.reprocess = false;
                if !self.process_input().await {
                    return;
                }
                continue;
            }

            self.refill_output();
            if self.outb.is_empty() && self.send_handler.is_none() {
                if let Some(msg) = self.close_after_send.take() {
                    self.close(CloseReason::Closed(msg)).await;
                    return;
                }
            }

            let write_len = self.outb.len().min(self.write_window);

            select! {
                result = reader.read_buf(&mut self.inb), if !self.throttled => {
                    match result {
                        Ok(0) => {
                            self.close(CloseReason::Eof).await;
                        }
                        Ok(n) => {
                            trace!("connection #{}: read {} bytes", self.conn.id, n);
                            self.note_transferred(n);
                            self.process_input().await;
                        }
                        Err(e) => {
                            self.close(CloseReason::Io(e.to_string())).await;
                        }
                    }
                }
                result = writer.write(&self.outb[..write_len]), if write_len > 0 => {
                    match result {
                        Ok(n) => {
                            self.outb.advance(n);
                            self.note_transferred(n);
                        }
                        Err(e) => {
                            self.close(CloseReason::Io(e.to_string())).await;
                        }
                    }
                }
                Some(cmd) = self.commands.recv() => {
                    self.apply_command(cmd).await;
                }
                _ = next_idle_tick(&mut self.idle) => {
                    self.check_idle().await;
                }
            }
        }
    }

    /// Delivers all complete messages in the input buffer (or hands the buffer to the streaming
    ///  receive handler). Returns `false` if the connection was closed in the process.
    async fn process_input(&mut self) -> bool {
        while !self.throttled && !self.closed {
            if let Some(recv_handler) = self.recv_handler.as_mut() {
                if self.inb.is_empty() {
                    break;
                }
                match recv_handler(&self.inb) {
                    Some(consumed) => {
                        let consumed = consumed.min(self.inb.len());
                        self.inb.advance(consumed);
                        if consumed == 0 {
                            break;
                        }
                    }
                    None => {
                        self.close(CloseReason::ProtocolViolation("receive handler failed".to_string())).await;
                        return false;
                    }
                }
            }
            else {
                match self.decoder.decode(&mut self.inb) {
                    Ok(None) => break,
                    Ok(Some(msg)) => {
                        let handler = self.handler.clone();
                        if !handler.on_message(&self.conn, msg).await {
                            self.close(CloseReason::ProtocolViolation("message rejected by handler".to_string())).await;
                            return false;
                        }
                        // the handler may have throttled the connection or switched modes
                        if !self.drain_commands().await {
                            return false;
                        }
                    }
                    Err(e) => {
                        self.close(CloseReason::ProtocolViolation(e.to_string())).await;
                        return false;
                    }
                }
            }
        }
        !self.closed
    }

    async fn drain_commands(&mut self) -> bool {
        while let Ok(cmd) = self.commands.try_recv() {
            if !self.apply_command(cmd).await {
                return false;
            }
        }
        true
    }

    /// returns `false` if the command closed the connection
    async fn apply_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Write(data) => {
                self.outb.extend_from_slice(&data);
            }
            Command::SetRecvHandler(handler) => {
                self.recv_handler = handler;
                self.reprocess = true;
            }
            Command::SetSendHandler(handler) => {
                self.send_handler = handler;
            }
            Command::SetTimeout(timeout) => {
                self.idle = timeout.map(|(interval, min_bytes)| IdleTimer {
                    interval: time::interval_at(Instant::now() + interval, interval),
                    min_bytes,
                    transferred: 0,
                });
            }
            Command::SetMaxMessageSize(max) => {
                self.decoder.set_max_len(max);
            }
            Command::Throttle(enabled) => {
                self.throttled = enabled;
                if !enabled {
                    self.reprocess = true;
                }
            }
            Command::Close(msg) => {
                self.close(CloseReason::Closed(msg)).await;
                return false;
            }
            Command::CloseAfterSend(msg) => {
                self.close_after_send = Some(msg);
            }
        }
        true
    }

    fn refill_output(&mut self) {
        while self.outb.len() < self.write_window {
            let Some(send_handler) = self.send_handler.as_mut() else {
                return;
            };
            match send_handler() {
                Some(data) => self.outb.extend_from_slice(&data),
                None => self.send_handler = None,
            }
        }
    }

    fn note_transferred(&mut self, n: usize) {
        if let Some(idle) = &mut self.idle {
            idle.transferred += n;
        }
    }

    async fn check_idle(&mut self) {
        let timed_out = match &mut self.idle {
            Some(idle) if idle.transferred < idle.min_bytes => true,
            Some(idle) => {
                idle.transferred = 0;
                false
            }
            None => false,
        };
        if timed_out {
            self.close(CloseReason::IdleTimeout).await;
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!("connection #{} closed: {}", self.conn.id, reason);

        self.inb.clear();
        self.outb.clear();
        self.recv_handler = None;
        self.send_handler = None;
        self.idle = None;
        self.throttled = false;

        self.state.send_replace(ConnectionState::Closed(reason.clone()));
        let handler = self.handler.clone();
        handler.on_close(&self.conn, &reason).await;
    }
}

async fn next_idle_tick(idle: &mut Option<IdleTimer>) {
    match idle {
        Some(idle) => {
            idle.interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn connect_stream(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, CloseReason> {
    let connect = async {
        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await
            .map_err(|_| CloseReason::UnknownHost(host.to_string()))?
            .collect();
        if addrs.is_empty() {
            return Err(CloseReason::UnknownHost(host.to_string()));
        }
        TcpStream::connect(addrs.as_slice()).await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => CloseReason::ConnectionRefused,
                _ => CloseReason::Io(e.to_string()),
            })
    };

    match time::timeout(timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(CloseReason::ConnectTimeout),
    }
}
