//! Client connection manager: one socket, a pending-request table, an offline
//! queue, and reconnect scheduling.
//!
//! All connection state lives on a single event-loop thread, the Rust
//! rendition of the source platform's cooperative single-threaded scheduling.
//! The public handle talks to it over channels, so `send` never blocks the
//! caller. A dedicated reader thread per connection forwards decoded frames
//! into the loop; it owns no state and dies when the socket closes.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bridge_core::frame::{self, Opcode};
use bridge_core::{handshake, http};
use serde_json::{json, Value};

/// Deliberate close code; anything else schedules a reconnect.
const NORMAL_CLOSE: u16 = 1000;
/// How often the loop wakes to check timers when idle.
const TICK: Duration = Duration::from_millis(10);

/// Connection lifecycle. Exactly one manager instance drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client-side failure surfaced through [`PendingReply`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("no response from the host in time")]
    Timeout,
    #[error("{0}")]
    Remote(String),
    #[error("connection manager stopped")]
    Stopped,
}

/// Tunables. Defaults match the bridge protocol constants.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Host address, e.g. `127.0.0.1:8080`.
    pub addr: String,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            addr: format!("127.0.0.1:{}", bridge_core::DEFAULT_PORT),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
        }
    }
}

/// A reply that will arrive later: on response, on timeout, or as `Stopped`
/// if the manager goes away first.
pub struct PendingReply {
    rx: Receiver<Result<Value, ClientError>>,
}

impl PendingReply {
    /// Block until the request resolves.
    pub fn wait(self) -> Result<Value, ClientError> {
        self.rx.recv().unwrap_or(Err(ClientError::Stopped))
    }

    /// Block up to `timeout`; `None` means still unresolved.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Value, ClientError>> {
        self.rx.recv_timeout(timeout).ok()
    }
}

enum Command {
    Connect(Sender<Result<(), ClientError>>),
    Disconnect,
    State(Sender<ConnectionState>),
    Send {
        action: String,
        payload: Value,
        reply: Sender<Result<Value, ClientError>>,
    },
    Shutdown,
}

/// Public handle. Cheap to share by reference; dropping it stops the loop.
pub struct ConnectionManager {
    tx: Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn new(cfg: ManagerConfig) -> Self {
        let (tx, rx) = channel();
        let worker = thread::spawn(move || EventLoop::new(cfg, rx).run());
        Self {
            tx,
            worker: Some(worker),
        }
    }

    /// Open the connection. Success once the socket is open and the handshake
    /// done; a no-op when already Connected. Also clears the reconnect halt
    /// left behind after the attempt cap was exceeded.
    pub fn connect(&self) -> Result<(), ClientError> {
        let (ack_tx, ack_rx) = channel();
        if self.tx.send(Command::Connect(ack_tx)).is_err() {
            return Err(ClientError::Stopped);
        }
        ack_rx.recv().unwrap_or(Err(ClientError::Stopped))
    }

    /// Queue or transmit a request. Never blocks; resolution arrives through
    /// the returned [`PendingReply`].
    pub fn send(&self, action: &str, payload: Value) -> PendingReply {
        let (reply_tx, reply_rx) = channel();
        let cmd = Command::Send {
            action: action.to_string(),
            payload,
            reply: reply_tx.clone(),
        };
        if self.tx.send(cmd).is_err() {
            let _ = reply_tx.send(Err(ClientError::Stopped));
        }
        PendingReply { rx: reply_rx }
    }

    /// Deliberate close: sends the normal close code and suppresses any
    /// scheduled reconnect.
    pub fn disconnect(&self) {
        let _ = self.tx.send(Command::Disconnect);
    }

    /// Current connection state. A stopped manager reads as Disconnected.
    pub fn state(&self) -> ConnectionState {
        let (tx, rx) = channel();
        if self.tx.send(Command::State(tx)).is_err() {
            return ConnectionState::Disconnected;
        }
        rx.recv().unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

enum SocketEvent {
    Frame(frame::Frame),
    Closed(Option<String>),
}

struct Conn {
    stream: TcpStream,
    events: Receiver<SocketEvent>,
}

struct Pending {
    reply: Sender<Result<Value, ClientError>>,
    created_at: Instant,
}

struct Queued {
    id: u64,
    envelope: Value,
    reply: Sender<Result<Value, ClientError>>,
    created_at: Instant,
}

struct EventLoop {
    cfg: ManagerConfig,
    rx: Receiver<Command>,
    state: ConnectionState,
    conn: Option<Conn>,
    pending: HashMap<u64, Pending>,
    queue: VecDeque<Queued>,
    next_id: u64,
    failures: u32,
    reconnect_at: Option<Instant>,
    suppress_reconnect: bool,
}

impl EventLoop {
    fn new(cfg: ManagerConfig, rx: Receiver<Command>) -> Self {
        Self {
            cfg,
            rx,
            state: ConnectionState::Disconnected,
            conn: None,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            next_id: 0,
            failures: 0,
            reconnect_at: None,
            suppress_reconnect: false,
        }
    }

    fn run(mut self) {
        loop {
            match self.rx.recv_timeout(TICK) {
                Ok(Command::Shutdown) => break,
                Ok(cmd) => self.on_command(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.poll_socket();
            self.tick();
        }
        // Resolve everything outstanding so callers never hang.
        self.close_connection(true);
        for (_, p) in self.pending.drain() {
            let _ = p.reply.send(Err(ClientError::Stopped));
        }
        for q in self.queue.drain(..) {
            let _ = q.reply.send(Err(ClientError::Stopped));
        }
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(ack) => {
                self.suppress_reconnect = false;
                if self.state == ConnectionState::Connected {
                    let _ = ack.send(Ok(()));
                } else {
                    let _ = ack.send(self.do_connect());
                }
            }
            Command::Disconnect => {
                log::info!("deliberate disconnect");
                self.suppress_reconnect = true;
                self.reconnect_at = None;
                if let Some(conn) = &mut self.conn {
                    let code = NORMAL_CLOSE.to_be_bytes();
                    let _ = conn.stream.write_all(&frame::encode_masked_frame(
                        Opcode::Close,
                        &code,
                        rand::random(),
                    ));
                }
                self.close_connection(true);
            }
            Command::State(reply) => {
                let _ = reply.send(self.state);
            }
            Command::Send {
                action,
                payload,
                reply,
            } => self.on_send(action, payload, reply),
            Command::Shutdown => unreachable!("handled in run"),
        }
    }

    fn on_send(
        &mut self,
        action: String,
        payload: Value,
        reply: Sender<Result<Value, ClientError>>,
    ) {
        self.next_id += 1;
        let id = self.next_id;
        let envelope = json!({ "id": id, "action": action, "payload": payload });
        let created_at = Instant::now();

        if self.state == ConnectionState::Connected {
            match self.write_text(&envelope) {
                Ok(()) => {
                    self.pending.insert(id, Pending { reply, created_at });
                }
                Err(e) => {
                    log::warn!("send failed: {e}");
                    let _ = reply.send(Err(ClientError::Send(e)));
                    self.connection_lost();
                }
            }
        } else {
            log::debug!("queueing {action} (id {id}) while disconnected");
            self.queue.push_back(Queued {
                id,
                envelope,
                reply,
                created_at,
            });
            // Sending while down is an implicit connect request.
            self.suppress_reconnect = false;
            if self.state == ConnectionState::Disconnected && self.reconnect_at.is_none() {
                let _ = self.do_connect();
            }
        }
    }

    fn do_connect(&mut self) -> Result<(), ClientError> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        match self.try_open() {
            Ok(conn) => {
                log::info!("connected to {}", self.cfg.addr);
                self.conn = Some(conn);
                self.state = ConnectionState::Connected;
                self.failures = 0;
                self.reconnect_at = None;
                self.flush_queue();
                Ok(())
            }
            Err(e) => {
                log::warn!("connect to {} failed: {e}", self.cfg.addr);
                self.state = ConnectionState::Disconnected;
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    fn try_open(&self) -> Result<Conn, ClientError> {
        let addr = self
            .cfg
            .addr
            .to_socket_addrs()
            .map_err(|e| ClientError::Connect(e.to_string()))?
            .next()
            .ok_or_else(|| ClientError::Connect(format!("no address for {}", self.cfg.addr)))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.cfg.connect_timeout)
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        stream
            .set_read_timeout(Some(self.cfg.connect_timeout))
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let key = handshake::nonce_from_bytes(rand::random());
        stream
            .write_all(handshake::client_request(&self.cfg.addr, &key).as_bytes())
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let mut reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| ClientError::Connect(e.to_string()))?,
        );
        let mut status_line = String::new();
        reader
            .read_line(&mut status_line)
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let headers =
            http::read_headers(&mut reader).map_err(|e| ClientError::Connect(e.to_string()))?;
        handshake::verify_accept(&key, status_line.trim_end(), &headers)
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        stream
            .set_read_timeout(None)
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let (events_tx, events) = channel();
        thread::spawn(move || read_loop(reader, events_tx));
        Ok(Conn { stream, events })
    }

    /// Flush the offline queue strictly FIFO before anything newer goes out.
    fn flush_queue(&mut self) {
        while self.state == ConnectionState::Connected {
            let Some(q) = self.queue.pop_front() else {
                return;
            };
            match self.write_text(&q.envelope) {
                Ok(()) => {
                    log::debug!("flushed queued request {}", q.id);
                    self.pending.insert(
                        q.id,
                        Pending {
                            reply: q.reply,
                            created_at: q.created_at,
                        },
                    );
                }
                Err(e) => {
                    log::warn!("flush failed: {e}");
                    let _ = q.reply.send(Err(ClientError::Send(e)));
                    self.connection_lost();
                    return;
                }
            }
        }
    }

    fn write_text(&mut self, value: &Value) -> Result<(), String> {
        let conn = self.conn.as_mut().ok_or("not connected")?;
        let bytes = frame::encode_masked_frame(
            Opcode::Text,
            value.to_string().as_bytes(),
            rand::random(),
        );
        conn.stream.write_all(&bytes).map_err(|e| e.to_string())
    }

    fn poll_socket(&mut self) {
        loop {
            let Some(conn) = &self.conn else { return };
            match conn.events.try_recv() {
                Ok(SocketEvent::Frame(f)) => self.on_frame(f),
                Ok(SocketEvent::Closed(reason)) => {
                    if let Some(reason) = reason {
                        log::warn!("connection lost: {reason}");
                    } else {
                        log::info!("connection closed by host");
                    }
                    self.connection_lost();
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.connection_lost();
                    return;
                }
            }
        }
    }

    fn on_frame(&mut self, f: frame::Frame) {
        match f.opcode {
            Opcode::Text => self.on_text(&f.payload),
            Opcode::Close => {
                let code = close_code(&f.payload);
                log::info!("close frame received (code {code})");
                if code == NORMAL_CLOSE {
                    self.close_connection(true);
                } else {
                    self.connection_lost();
                }
            }
            Opcode::Ping => {
                if let Some(conn) = &mut self.conn {
                    let _ = conn.stream.write_all(&frame::encode_masked_frame(
                        Opcode::Pong,
                        &f.payload,
                        rand::random(),
                    ));
                }
            }
            Opcode::Pong | Opcode::Binary | Opcode::Continuation => {}
        }
    }

    /// Correlate an incoming envelope with its pending request. Envelopes
    /// without a resolvable id are logged and dropped; so are late arrivals
    /// whose entry already expired.
    fn on_text(&mut self, payload: &[u8]) {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("unparseable envelope: {e}");
                return;
            }
        };
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            log::debug!("envelope without id dropped");
            return;
        };
        let Some(pending) = self.pending.remove(&id) else {
            log::debug!("envelope for unknown or expired request {id} dropped");
            return;
        };
        let failed = value.get("success").and_then(Value::as_bool) == Some(false);
        let outcome = if failed {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown host error")
                .to_string();
            Err(ClientError::Remote(message))
        } else {
            Ok(value)
        };
        let _ = pending.reply.send(outcome);
    }

    fn connection_lost(&mut self) {
        self.close_connection(false);
    }

    fn close_connection(&mut self, deliberate: bool) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
        if self.state != ConnectionState::Disconnected {
            self.state = ConnectionState::Disconnected;
            if !deliberate {
                self.schedule_reconnect();
            }
        }
    }

    /// Backoff: delay before attempt N is `base × N`, counting the initial
    /// attempt as 1. After the cap only an explicit `connect` tries again.
    fn schedule_reconnect(&mut self) {
        if self.suppress_reconnect {
            return;
        }
        self.failures += 1;
        if self.failures >= self.cfg.max_reconnect_attempts {
            log::warn!(
                "giving up after {} failed attempts; waiting for an explicit connect",
                self.failures
            );
            self.reconnect_at = None;
            return;
        }
        let next_attempt = self.failures + 1;
        let delay = self.cfg.reconnect_base_delay * next_attempt;
        log::info!("reconnect attempt {next_attempt} in {delay:?}");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn tick(&mut self) {
        let now = Instant::now();

        if let Some(at) = self.reconnect_at {
            if now >= at && self.state == ConnectionState::Disconnected {
                self.reconnect_at = None;
                let _ = self.do_connect();
            }
        }

        // Every request carries its own timeout from the moment it was
        // issued, queued or in flight alike.
        let deadline = self.cfg.response_timeout;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.created_at) >= deadline)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                log::warn!("request {id} timed out");
                let _ = p.reply.send(Err(ClientError::Timeout));
            }
        }
        while let Some(q) = self.queue.front() {
            if now.duration_since(q.created_at) < deadline {
                break;
            }
            if let Some(q) = self.queue.pop_front() {
                log::warn!("queued request {} timed out before connecting", q.id);
                let _ = q.reply.send(Err(ClientError::Timeout));
            }
        }
    }
}

fn close_code(payload: &[u8]) -> u16 {
    if payload.len() >= 2 {
        u16::from_be_bytes([payload[0], payload[1]])
    } else {
        1005 // no status present
    }
}

fn read_loop(mut reader: BufReader<TcpStream>, events: Sender<SocketEvent>) {
    loop {
        match frame::read_frame(&mut reader) {
            Ok(Some(f)) => {
                if events.send(SocketEvent::Frame(f)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = events.send(SocketEvent::Closed(None));
                return;
            }
            Err(e) => {
                let _ = events.send(SocketEvent::Closed(Some(e.to_string())));
                return;
            }
        }
    }
}
