//! TCP server: accept loop, per-connection threads, upgrade sniffing.
//!
//! Each accepted socket gets its own handler thread doing blocking reads. The
//! handler reads the request line: GET requests are parsed further and either
//! upgraded into frame mode or answered as one-shot HTTP; anything else is
//! one-shot HTTP. Shutdown is cooperative: `stop()` shuts down every
//! registered socket, which unblocks the reads, then joins the threads.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bridge_core::frame::{FrameError, Opcode};
use bridge_core::{frame, handshake, http};

use crate::router::Router;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Registry and enabled flag. One mutex guards both so a connection cannot be
/// added while `stop()` is tearing the registry down.
struct ServerState {
    enabled: bool,
    connections: HashMap<u64, TcpStream>,
    handlers: Vec<JoinHandle<()>>,
}

struct Shared {
    router: Router,
    state: Mutex<ServerState>,
    next_conn_id: AtomicU64,
}

impl Shared {
    fn enabled(&self) -> bool {
        self.state.lock().map(|s| s.enabled).unwrap_or(false)
    }
}

/// The bridge server. `start` then `stop` may be repeated on one instance.
pub struct BridgeServer {
    shared: Arc<Shared>,
    accept_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl BridgeServer {
    pub fn new(router: Router) -> Self {
        Self {
            shared: Arc::new(Shared {
                router,
                state: Mutex::new(ServerState {
                    enabled: false,
                    connections: HashMap::new(),
                    handlers: Vec::new(),
                }),
                next_conn_id: AtomicU64::new(1),
            }),
            accept_handle: None,
            local_addr: None,
        }
    }

    /// Bind and spawn the accept loop. Bind failure is fatal for this call;
    /// there is no retry.
    pub fn start(&mut self, port: u16) -> io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        self.local_addr = Some(listener.local_addr()?);
        if let Ok(mut state) = self.shared.state.lock() {
            state.enabled = true;
        }
        let shared = self.shared.clone();
        self.accept_handle = Some(thread::spawn(move || accept_loop(shared, listener)));
        log::info!("server listening on {:?}", self.local_addr);
        Ok(())
    }

    /// The bound address, once started. Useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Cooperative shutdown: disable, shut down every registered socket to
    /// unblock its handler, then join the accept loop and all handlers. The
    /// registry is empty when this returns and `start` may be called again.
    pub fn stop(&mut self) {
        let handlers = match self.shared.state.lock() {
            Ok(mut state) => {
                state.enabled = false;
                for stream in state.connections.values() {
                    let _ = stream.shutdown(Shutdown::Both);
                }
                state.connections.clear();
                std::mem::take(&mut state.handlers)
            }
            Err(_) => Vec::new(),
        };
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        for handle in handlers {
            let _ = handle.join();
        }
        self.local_addr = None;
        log::info!("server stopped");
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|s| s.connections.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn handler_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|s| s.handlers.len())
            .unwrap_or(0)
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        if !shared.enabled() {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                log::info!("connection {id} accepted from {peer}");
                let registered = stream.try_clone();
                let handler_shared = shared.clone();
                let mut state = match shared.state.lock() {
                    Ok(s) => s,
                    Err(_) => break,
                };
                if !state.enabled {
                    break;
                }
                if let Ok(clone) = registered {
                    state.connections.insert(id, clone);
                }
                let handle = thread::spawn(move || handle_client(handler_shared, id, stream));
                state.handlers.push(handle);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                reap_finished(&shared);
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                log::warn!("accept failed: {e}");
                break;
            }
        }
    }
    // Dropping the listener closes it; a later start() can rebind.
}

/// Join handler threads that have already exited. Without this the handle
/// list grows for the life of the server under connection churn; joining
/// happens outside the lock.
fn reap_finished(shared: &Shared) {
    let finished: Vec<JoinHandle<()>> = match shared.state.lock() {
        Ok(mut state) => {
            let (done, live): (Vec<_>, Vec<_>) = state
                .handlers
                .drain(..)
                .partition(|h| h.is_finished());
            state.handlers = live;
            done
        }
        Err(_) => return,
    };
    for handle in finished {
        let _ = handle.join();
    }
}

fn handle_client(shared: Arc<Shared>, id: u64, stream: TcpStream) {
    if let Err(e) = serve_connection(&shared, stream) {
        log::warn!("connection {id}: {e}");
    }
    if let Ok(mut state) = shared.state.lock() {
        state.connections.remove(&id);
        log::info!("connection {id} closed ({} remaining)", state.connections.len());
    }
}

/// Per-connection error. Contained to this connection's thread; everything
/// else keeps running.
#[derive(Debug, thiserror::Error)]
enum ServeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("http error: {0}")]
    Http(#[from] http::HttpError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

fn serve_connection(shared: &Shared, stream: TcpStream) -> Result<(), ServeError> {
    // Blocking reads from here on; the accept listener was nonblocking and
    // accepted sockets inherit that on some platforms.
    stream.set_nonblocking(false)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    let mut first_line = String::new();
    if reader.read_line(&mut first_line)? == 0 {
        return Ok(());
    }
    let first_line = first_line.trim_end_matches(['\r', '\n']).to_string();

    if first_line.starts_with("GET") {
        let headers = http::read_headers(&mut reader)?;
        let wants_upgrade = headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        if wants_upgrade {
            match handshake::validate(&headers) {
                Ok(key) => {
                    writer.write_all(handshake::accept_response(key).as_bytes())?;
                    log::debug!("handshake complete, entering frame mode");
                    return frame_loop(shared, reader, writer);
                }
                Err(e) => {
                    log::warn!("handshake rejected: {e}");
                    writer.write_all(&http::error_response(400, &e.to_string()))?;
                    return Ok(());
                }
            }
        }
        let request = http::finish_request(&first_line, headers, &mut reader)?;
        let (status, body) = shared.router.route_http(&request);
        writer.write_all(&http::response(status, &body))?;
        return Ok(());
    }

    // Non-GET: one-shot HTTP request.
    let request = http::read_request(&first_line, &mut reader)?;
    let (status, body) = shared.router.route_http(&request);
    writer.write_all(&http::response(status, &body))?;
    Ok(())
}

/// Frame mode: read frames until the peer closes, routing text messages and
/// answering each with one frame.
fn frame_loop(
    shared: &Shared,
    mut reader: BufReader<TcpStream>,
    mut writer: TcpStream,
) -> Result<(), ServeError> {
    loop {
        let frame = match frame::read_frame(&mut reader)? {
            Some(f) => f,
            None => return Ok(()),
        };
        match frame.opcode {
            Opcode::Text => {
                let text = String::from_utf8_lossy(&frame.payload);
                log::debug!("message received: {text}");
                let reply = shared.router.route_text(&text);
                writer.write_all(&frame::encode_frame(Opcode::Text, reply.to_json().as_bytes()))?;
            }
            Opcode::Close => {
                let _ = writer.write_all(&frame::encode_frame(Opcode::Close, &frame.payload));
                return Ok(());
            }
            Opcode::Ping => {
                writer.write_all(&frame::encode_frame(Opcode::Pong, &frame.payload))?;
            }
            Opcode::Pong | Opcode::Binary | Opcode::Continuation => {
                // Single text-message granularity; everything else is noise.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::ModelLoop;
    use crate::model::{test_png, Model};
    use crate::relay::{ImageSource, RelayError};
    use bridge_core::frame::encode_masked_frame;
    use serde_json::Value;
    use std::io::Read;

    struct FakeImages;

    impl ImageSource for FakeImages {
        fn fetch(&self, _image_id: &str) -> Result<Vec<u8>, RelayError> {
            Ok(test_png(64, 64))
        }
    }

    fn start_server() -> (BridgeServer, SocketAddr) {
        let (model_loop, bridge) = ModelLoop::new(Model::new(1.0));
        thread::spawn(move || model_loop.run());
        let bridge = bridge.with_poll_interval(Duration::from_millis(5));
        let router = Router::new(bridge, Arc::new(FakeImages), 0);
        let mut server = BridgeServer::new(router);
        server.start(0).expect("bind");
        let mut addr = server.local_addr().expect("addr");
        addr.set_ip("127.0.0.1".parse().unwrap());
        (server, addr)
    }

    fn http_roundtrip(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(request.as_bytes()).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    fn body_of(response: &str) -> Value {
        let idx = response.find("\r\n\r\n").expect("header terminator");
        serde_json::from_str(&response[idx + 4..]).expect("json body")
    }

    #[test]
    fn http_status_endpoint() {
        let (mut server, addr) = start_server();
        let resp = http_roundtrip(addr, "GET /status HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        let body = body_of(&resp);
        assert_eq!(body["action"], "connectionStatus");
        assert_eq!(body["isConnected"], true);
        server.stop();
    }

    #[test]
    fn http_color_post_and_errors() {
        let (mut server, addr) = start_server();

        let body = r#"{"r":9,"g":8,"b":7}"#;
        let resp = http_roundtrip(
            addr,
            &format!(
                "POST /color HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            ),
        );
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        let parsed = body_of(&resp);
        assert_eq!(parsed["success"], true);
        assert!(parsed["data"]["name"].as_str().unwrap().starts_with("Color_090807_"));

        let resp = http_roundtrip(addr, "GET /color HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));

        let resp = http_roundtrip(addr, "GET /bogus HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));

        server.stop();
    }

    #[test]
    fn upgrade_then_frame_roundtrip() {
        let (mut server, addr) = start_server();
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(handshake::client_request("localhost", "dGhlIHNhbXBsZSBub25jZQ==").as_bytes())
            .unwrap();

        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();
        assert!(status_line.contains("101"));
        let headers = http::read_headers(&mut reader).unwrap();
        assert_eq!(
            headers["sec-websocket-accept"],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );

        let msg = r#"{"id":1,"action":"sendColor","payload":{"r":1,"g":2,"b":3}}"#;
        stream
            .write_all(&encode_masked_frame(Opcode::Text, msg.as_bytes(), [9, 9, 9, 9]))
            .unwrap();
        let reply = frame::read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(reply.opcode, Opcode::Text);
        let parsed: Value = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(parsed["success"], true);
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["originalAction"], "sendColor");

        // Close frame is echoed and the loop ends.
        stream
            .write_all(&encode_masked_frame(Opcode::Close, &[0x03, 0xE8], [1, 2, 3, 4]))
            .unwrap();
        let echo = frame::read_frame(&mut reader).unwrap().unwrap();
        assert_eq!(echo.opcode, Opcode::Close);

        server.stop();
    }

    #[test]
    fn bad_handshake_gets_400() {
        let (mut server, addr) = start_server();
        let resp = http_roundtrip(
            addr,
            "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: keep-alive\r\n\r\n",
        );
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        server.stop();
    }

    #[test]
    fn finished_handler_threads_are_reaped() {
        let (mut server, addr) = start_server();
        for _ in 0..3 {
            let stream = TcpStream::connect(addr).unwrap();
            drop(stream);
        }
        // The accept loop sweeps exited handlers on its idle path.
        for _ in 0..100 {
            if server.handler_count() == 0 && server.connection_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.handler_count(), 0);
        server.stop();
    }

    #[test]
    fn stop_clears_registry_and_allows_restart() {
        let (mut server, addr) = start_server();
        let port = addr.port();

        // Park a live frame-mode connection so stop() has something to tear down.
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(handshake::client_request("localhost", "cGFya2VkIGNvbm5lY3Rpb24=").as_bytes())
            .unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut status_line = String::new();
        reader.read_line(&mut status_line).unwrap();
        assert!(status_line.contains("101"));
        // Give the registry a moment to record the connection.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(server.connection_count(), 1);

        // Close from the client side so the server port has no lingering
        // TIME_WAIT sockets blocking the rebind below.
        drop(reader);
        drop(stream);
        for _ in 0..100 {
            if server.connection_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        server.stop();
        assert_eq!(server.connection_count(), 0);

        server.start(port).expect("restart on same port");
        server.stop();
    }
}
