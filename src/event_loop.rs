//! The connection multiplexer.
//!
//! One thread owns one `mio::Poll` plus every listening and client socket.
//! Listeners are registered read-only; accepted clients are registered for
//! read and write interest and get a per-connection inbound buffer. A buffer
//! is handed to the parser once the framing predicate says the request is
//! complete, the response is written, and the connection is closed: each
//! connection serves exactly one request.
//!
//! The loop samples a shared stop flag once per iteration, so a signal
//! handler only has to flip the flag. Everything request-scoped
//! (`storage_size` included) lives on this struct and is passed down
//! explicitly; there is no process-global state here.

use crate::config::{self, ListenAddr, ServerConfig};
use crate::error::{Error, Result};
use crate::handlers;
use crate::request::{self, find, Method, Request};
use crate::resolver;
use crate::response::CONTINUE_INTERIM;
use crate::status;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Sockets are drained in chunks of this size.
const READ_CHUNK: usize = 2 * 1024;

/// Where the kernel advertises the epoll watch budget.
const MAX_CLIENTS_PATH: &str = "/proc/sys/fs/epoll/max_user_watches";

const DEFAULT_MAX_CLIENTS: usize = 666;

/// Upper bound on the per-wakeup event batch; the kernel value can be huge.
const MAX_EVENT_BATCH: usize = 1024;

/// The wait is bounded so the stop flag is sampled even when idle.
const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// One accepted client: its socket, the local address it was accepted on
/// (cached so virtual-server resolution needs no further syscalls), and the
/// bytes received so far.
struct Connection {
    stream: TcpStream,
    local_addr: ListenAddr,
    buffer: Vec<u8>,
}

pub struct EventLoop {
    servers: Vec<ServerConfig>,
    poll: Poll,
    events: Events,
    listeners: HashMap<Token, TcpListener>,
    addresses: Vec<SocketAddr>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    storage_size: u64,
    running: Arc<AtomicBool>,
}

impl EventLoop {
    /// Validates the server set, binds every deduplicated listen endpoint,
    /// and registers the listeners for read readiness.
    pub fn new(servers: Vec<ServerConfig>, running: Arc<AtomicBool>) -> Result<Self> {
        config::ensure_unique(&servers)?;

        let poll = Poll::new()?;
        let events = Events::with_capacity(max_clients().min(MAX_EVENT_BATCH));

        let mut event_loop = EventLoop {
            servers,
            poll,
            events,
            listeners: HashMap::new(),
            addresses: Vec::new(),
            connections: HashMap::new(),
            next_token: 0,
            storage_size: 0,
            running,
        };
        event_loop.setup_listeners()?;
        Ok(event_loop)
    }

    /// The addresses actually bound, with OS-assigned ports filled in.
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    fn setup_listeners(&mut self) -> Result<()> {
        let endpoints = listen_set(&self.servers);
        if endpoints.is_empty() {
            return Err(Error::Config("no listen endpoints configured".to_string()));
        }

        for addr in endpoints {
            let socket_addr = to_socket_addr(&addr)?;
            let mut listener = TcpListener::bind(socket_addr)?;
            let bound = listener.local_addr()?;

            // Binding port 0 asks the OS for a port; propagate the answer
            // back into the server set so resolution keeps working.
            if addr.port == "0" {
                let port = bound.port().to_string();
                for server in &mut self.servers {
                    for listen in &mut server.listens {
                        if listen.port == "0" && listen.ip == addr.ip {
                            listen.port = port.clone();
                        }
                    }
                }
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            self.poll
                .registry()
                .register(&mut listener, token, Interest::READABLE)?;

            log::info!(address = bound.to_string().as_str(); "listening");
            self.listeners.insert(token, listener);
            self.addresses.push(bound);
        }
        Ok(())
    }

    /// Blocks on readiness until the stop flag clears, then returns.
    pub fn run(&mut self) {
        while self.running.load(Ordering::Relaxed) {
            match self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!(error:err = e; "poll failed, server loop will exit");
                    break;
                }
            }

            let ready: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|event| (event.token(), event.is_error(), event.is_readable()))
                .collect();

            for (token, is_error, is_readable) in ready {
                if is_error {
                    self.kill_connection(token);
                } else if self.listeners.contains_key(&token) {
                    self.accept_clients(token);
                } else if is_readable {
                    self.handle_readable(token);
                }
            }
        }
        log::info!("server loop stopped");
    }

    fn accept_clients(&mut self, token: Token) {
        loop {
            let Some(listener) = self.listeners.get(&token) else {
                return;
            };
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = self.register_client(stream) {
                        log::warn!(error:err = e; "failed to register accepted connection");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!(error:err = e; "accept failed");
                    return;
                }
            }
        }
    }

    fn register_client(&mut self, mut stream: TcpStream) -> std::io::Result<()> {
        let local = stream.local_addr()?;
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        self.connections.insert(
            token,
            Connection {
                stream,
                local_addr: ListenAddr::new(local.ip().to_string(), local.port().to_string()),
                buffer: Vec::new(),
            },
        );
        Ok(())
    }

    /// Drains the socket. On EOF a non-empty buffer is flushed through
    /// processing once; a complete frame is processed immediately. Either
    /// way the connection closes afterwards.
    fn handle_readable(&mut self, token: Token) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    if !conn.buffer.is_empty() {
                        self.process_request(token);
                    }
                    self.kill_connection(token);
                    return;
                }
                Ok(n) => {
                    conn.buffer.extend_from_slice(&chunk[..n]);
                    if request_is_complete(&conn.buffer) {
                        self.process_request(token);
                        self.kill_connection(token);
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.kill_connection(token);
                    return;
                }
            }
        }
    }

    /// Parse, resolve, dispatch, respond. The response write is a single
    /// attempt: with no keep-alive a short write just means the connection
    /// closes early.
    fn process_request(&mut self, token: Token) {
        let (buffer, local) = {
            let Some(conn) = self.connections.get_mut(&token) else {
                return;
            };
            (std::mem::take(&mut conn.buffer), conn.local_addr.clone())
        };

        let (request, parse_status) = request::parse(&buffer);

        let server = match resolver::resolve(&self.servers, &local, request.hostname()) {
            Ok(server) => server,
            Err(e) => {
                log::error!(error:err = e; "dropping connection without a server context");
                return;
            }
        };

        if parse_status == status::OK && wants_continue(&request) {
            if let Some(conn) = self.connections.get_mut(&token) {
                let _ = conn.stream.write_all(CONTINUE_INTERIM);
            }
        }

        let response = handlers::dispatch(server, &request, parse_status, &mut self.storage_size);

        log::info!(
            status = response.status,
            method = request.method.as_str(),
            uri = request.uri.as_str();
            "request"
        );

        let bytes = response.to_bytes();
        if let Some(conn) = self.connections.get_mut(&token) {
            if let Err(e) = conn.stream.write_all(&bytes) {
                log::warn!(error:err = e; "response write failed");
            }
        }
    }

    /// Closing always pairs with removal from the readiness set; the fd
    /// itself closes when the stream drops.
    fn kill_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                log::warn!(error:err = e; "failed to deregister connection");
            }
        }
    }
}

fn wants_continue(request: &Request) -> bool {
    request.method == Method::Post
        && request
            .header("expect")
            .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"))
}

/// The framing predicate: have enough bytes arrived to parse the request as
/// a whole? Monotone — once true for a buffer it stays true for every
/// extension of it.
pub(crate) fn request_is_complete(buffer: &[u8]) -> bool {
    let Some(header_end) = find(buffer, b"\r\n\r\n") else {
        return false;
    };
    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();

    if let Some(length) = content_length(&head) {
        return buffer.len() - (header_end + 4) >= length;
    }
    if is_chunked(&head) {
        return find(buffer, b"0\r\n\r\n").is_some();
    }
    // Neither header: assume a bodyless request.
    true
}

fn content_length(head: &str) -> Option<usize> {
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

fn is_chunked(head: &str) -> bool {
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("transfer-encoding")
                && value.to_ascii_lowercase().contains("chunked")
            {
                return true;
            }
        }
    }
    false
}

/// The union of every server's endpoints, minus specific ips shadowed by a
/// wildcard on the same port.
fn listen_set(servers: &[ServerConfig]) -> Vec<ListenAddr> {
    let all: BTreeSet<ListenAddr> = servers
        .iter()
        .flat_map(|server| server.listens.iter().cloned())
        .collect();

    let wildcard_ports: BTreeSet<String> = all
        .iter()
        .filter(|addr| addr.is_wildcard())
        .map(|addr| addr.port.clone())
        .collect();

    all.into_iter()
        .filter(|addr| addr.is_wildcard() || !wildcard_ports.contains(&addr.port))
        .collect()
}

fn to_socket_addr(addr: &ListenAddr) -> Result<SocketAddr> {
    let ip = if addr.is_wildcard() {
        "0.0.0.0"
    } else if addr.ip == "localhost" {
        "127.0.0.1"
    } else {
        addr.ip.as_str()
    };
    format!("{ip}:{}", addr.port)
        .parse()
        .map_err(|_| Error::Config(format!("invalid listen address {}:{}", addr.ip, addr.port)))
}

/// Reads the client budget once at startup; absence of the proc file falls
/// back to the default.
fn max_clients() -> usize {
    match fs::read_to_string(MAX_CLIENTS_PATH) {
        Ok(contents) => contents
            .split_whitespace()
            .next()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_MAX_CLIENTS),
        Err(_) => {
            log::error!("failed to open {MAX_CLIENTS_PATH}");
            DEFAULT_MAX_CLIENTS
        }
    }
}


#[cfg(test)]
mod listen_tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn server_listening(addrs: &[(&str, &str)]) -> ServerConfig {
        ServerConfig {
            listens: addrs
                .iter()
                .map(|(ip, port)| ListenAddr::new(*ip, *port))
                .collect(),
            root: Utf8PathBuf::from("/var/www"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn wildcard_shadows_specific_ips_on_same_port() {
        let servers = vec![
            server_listening(&[("0.0.0.0", "8080"), ("127.0.0.1", "8080")]),
            server_listening(&[("10.0.0.1", "8080"), ("10.0.0.1", "9090")]),
        ];

        let endpoints = listen_set(&servers);
        assert_eq!(
            endpoints,
            vec![
                ListenAddr::new("0.0.0.0", "8080"),
                ListenAddr::new("10.0.0.1", "9090"),
            ]
        );
    }

    #[test]
    fn duplicate_endpoints_collapse() {
        let servers = vec![
            server_listening(&[("127.0.0.1", "8080")]),
            server_listening(&[("127.0.0.1", "8080")]),
        ];
        assert_eq!(listen_set(&servers).len(), 1);
    }
}
