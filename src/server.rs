use crate::config::{
    CONN_TIMEOUT, DEFAULT_PORT, DEFAULT_WORKER_THREADS, LISTEN_BACKLOG, MAX_BUFFER_SIZE,
    MAX_CONNS,
};
use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::pool::ThreadPool;
use crate::reactor::Reactor;
use crate::registry::ConnectionRegistry;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use mio::net::{TcpListener, TcpStream};
use mio::Interest;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

type ConnObserver = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type ErrorObserver = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_connections: usize,
    /// Per-connection buffer cap; requests that outgrow it are dropped.
    pub max_request_size: usize,
    pub timeout_seconds: u64,
    pub worker_threads: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            backlog: LISTEN_BACKLOG,
            max_connections: MAX_CONNS,
            max_request_size: MAX_BUFFER_SIZE,
            timeout_seconds: CONN_TIMEOUT.as_secs(),
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub total_requests: u64,
    pub active_connections: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// HTTP server: listener, routing, and connection lifecycle glue.
///
/// Accepted sockets become [`Connection`]s owned by the registry; parsed
/// requests are dispatched to the worker pool and the serialized response
/// is posted back to the reactor thread for writing. The reactor itself is
/// driven by the caller (`reactor.run()`), so tests and embedders control
/// the loop thread.
pub struct Server {
    config: ServerConfig,
    reactor: Arc<Reactor>,
    pool: Arc<ThreadPool>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<RwLock<Router>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    running: AtomicBool,
    next_request_id: AtomicU64,
    total_requests: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    on_connect: Mutex<Option<ConnObserver>>,
    on_disconnect: Mutex<Option<ConnObserver>>,
    on_error: Mutex<Option<ErrorObserver>>,
}

impl Server {
    pub fn new(config: ServerConfig, reactor: Arc<Reactor>, pool: Arc<ThreadPool>) -> Self {
        Self {
            config,
            reactor,
            pool,
            registry: Arc::new(ConnectionRegistry::new()),
            router: Arc::new(RwLock::new(Router::new())),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            running: AtomicBool::new(false),
            next_request_id: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            on_error: Mutex::new(None),
        }
    }

    // ---- route registration ----

    pub fn get<F>(&self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.router.write().unwrap().get(path, handler);
    }

    pub fn post<F>(&self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.router.write().unwrap().post(path, handler);
    }

    pub fn put<F>(&self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.router.write().unwrap().put(path, handler);
    }

    pub fn delete<F>(&self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.router.write().unwrap().delete(path, handler);
    }

    pub fn any<F>(&self, path: &str, handler: F)
    where
        F: Fn(&Request) -> Response + Send + Sync + 'static,
    {
        self.router.write().unwrap().any(path, handler);
    }

    pub fn wrap<F>(&self, middleware: F)
    where
        F: Fn(&Request, &mut Response) -> bool + Send + Sync + 'static,
    {
        self.router.write().unwrap().wrap(middleware);
    }

    pub fn mount_static(&self, prefix: &str, dir: impl Into<PathBuf>) {
        self.router.write().unwrap().mount_static(prefix, dir);
    }

    // ---- observers ----

    pub fn set_on_connect(&self, callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        *self.on_connect.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_on_disconnect(&self, callback: impl Fn(&Arc<Connection>) + Send + Sync + 'static) {
        *self.on_disconnect.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_error.lock().unwrap() = Some(Arc::new(callback));
    }

    // ---- lifecycle ----

    /// Binds, listens, and registers the accept callback with the reactor.
    /// Startup failures here are fatal to the caller.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.bind_and_register() {
            Ok(local) => {
                *self.local_addr.lock().unwrap() = Some(local);
                info!(
                    "listening on {local} ({} worker threads)",
                    self.config.worker_threads
                );
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn bind_and_register(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| Error::SocketSetup(format!("invalid listen address: {e}")))?;

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.bind(&addr.into())?;
        sock.listen(self.config.backlog)?;

        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(sock.into_raw_fd()) };
        let listener = TcpListener::from_std(std_listener);
        let local = listener.local_addr()?;
        let fd = listener.as_raw_fd();

        // Store before registering so the accept callback never observes an
        // empty listener slot.
        let mut guard = self.listener.lock().unwrap();
        *guard = Some(listener);

        let accept = Arc::downgrade(self);
        let registered = self.reactor.register(
            guard.as_mut().expect("listener just stored"),
            fd,
            Interest::READABLE,
            Arc::new(move |_readiness| {
                if let Some(server) = accept.upgrade() {
                    server.accept_connections();
                }
            }),
        );
        if let Err(e) = registered {
            *guard = None;
            return Err(e);
        }

        Ok(local)
    }

    /// Graceful stop: the listener leaves the reactor and closes, every
    /// registered connection closes, then the reactor is asked to exit.
    /// Idempotent and callable from any thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("stopping server");

        if let Some(mut listener) = self.listener.lock().unwrap().take() {
            let fd = listener.as_raw_fd();
            self.reactor.deregister(&mut listener, fd);
        }

        self.registry.stop_all();
        self.reactor.stop();
    }

    /// Wires SIGINT/SIGTERM to a one-shot stop request serviced on a
    /// helper thread, so the reactor thread never runs signal logic.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<()>();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .map_err(|e| Error::SocketSetup(format!("failed to install signal handler: {e}")))?;

        let server = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("tarn-signals".to_string())
            .spawn(move || {
                if rx.recv().is_ok() {
                    info!("shutdown signal received");
                    if let Some(server) = server.upgrade() {
                        server.stop();
                    }
                }
            })
            .map_err(Error::Io)?;
        Ok(())
    }

    // ---- observers / accessors ----

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Actual bound address; useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn active_connections(&self) -> usize {
        self.registry.count()
    }

    pub fn statistics(&self) -> ServerStats {
        ServerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            active_connections: self.registry.count(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    // ---- accept path ----

    /// Drains the accept queue until it would block; each accepted socket
    /// becomes a registered connection. Non-fatal accept errors are
    /// reported and the loop continues on the next readiness event.
    fn accept_connections(self: &Arc<Self>) {
        loop {
            let accepted = {
                let mut guard = self.listener.lock().unwrap();
                let Some(listener) = guard.as_mut() else { return };
                listener.accept()
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = self.admit(stream, peer) {
                        warn!("failed to admit connection from {peer}: {e}");
                        self.notify_error(&format!("connection setup failed: {e}"));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept error: {e}");
                    self.notify_error(&format!("accept error: {e}"));
                    break;
                }
            }
        }
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if self.registry.count() >= self.config.max_connections {
            return Err(Error::ConnectionLimit);
        }

        let conn = Connection::new(stream, self.reactor.clone())?;
        conn.set_timeout(Duration::from_secs(self.config.timeout_seconds));
        conn.set_max_buffer_size(self.config.max_request_size);
        conn.set_handler(Arc::new(HttpHandler {
            server: Arc::downgrade(self),
        }));

        // The connection detaches itself from the registry as it closes.
        let registry = Arc::downgrade(&self.registry);
        let fd = conn.fd();
        conn.set_close_callback(move || {
            if let Some(registry) = registry.upgrade() {
                registry.detach(fd);
            }
        });

        // A completed parse hands the request to the dispatch path.
        let server = Arc::downgrade(self);
        let weak_conn = Arc::downgrade(&conn);
        conn.set_read_callback(move || {
            if let (Some(server), Some(conn)) = (server.upgrade(), weak_conn.upgrade()) {
                server.process_request(&conn);
            }
        });

        debug!("accepted connection from {peer} (fd {fd})");
        self.registry.start(conn)
    }

    // ---- request dispatch ----

    /// Moves the parsed request onto the worker pool. The worker resolves
    /// the route and serializes the response; the write is posted back to
    /// the reactor thread. Pool refusal answers 503 inline.
    fn process_request(self: &Arc<Self>, conn: &Arc<Connection>) {
        let Some(mut req) = conn.take_request() else { return };
        conn.reset_parser();

        req.set_remote_addr(conn.peer_addr());
        req.set_received_at(SystemTime::now());
        req.set_request_id(self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1);

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(req.body().len() as u64, Ordering::Relaxed);

        let keep_alive = req.is_keep_alive();
        let router = self.router.clone();
        let reactor = self.reactor.clone();
        let server = Arc::downgrade(self);
        let conn = conn.clone();
        let conn_for_worker = conn.clone();

        let submitted = self.pool.submit(move || {
            let mut response = router.read().unwrap().dispatch(&req);
            response.set_header(
                "Connection",
                if keep_alive { "keep-alive" } else { "close" },
            );
            let bytes = response.to_bytes();
            if let Some(server) = server.upgrade() {
                server
                    .bytes_sent
                    .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            }
            reactor.queue_in_loop(move || {
                if !keep_alive {
                    conn_for_worker.set_close_after_write(true);
                }
                if let Err(e) = conn_for_worker.write_data(&bytes) {
                    warn!("failed to queue response: {e}");
                }
            });
        });

        if submitted.is_err() {
            let response = Response::service_unavailable().with_header("Connection", "close");
            conn.set_close_after_write(true);
            let _ = conn.write_data(&response.to_bytes());
        }
    }

    fn notify_error(&self, message: &str) {
        let callback = self.on_error.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }
}

/// Default per-connection handler the server attaches: logs lifecycle
/// transitions, forwards them to the server's observers, and drives the
/// connection's built-in read/write machinery.
struct HttpHandler {
    server: Weak<Server>,
}

impl Handler for HttpHandler {
    fn on_connect(&self, conn: &Arc<Connection>) {
        debug!("new HTTP connection from {}", conn.peer_addr());
        if let Some(server) = self.server.upgrade() {
            let callback = server.on_connect.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(conn);
            }
        }
    }

    fn on_disconnect(&self, conn: &Arc<Connection>) {
        debug!("HTTP connection closed: {}", conn.peer_addr());
        if let Some(server) = self.server.upgrade() {
            let callback = server.on_disconnect.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(conn);
            }
        }
    }

    fn on_readable(&self, conn: &Arc<Connection>) {
        conn.default_handle_read();
    }

    fn on_writable(&self, conn: &Arc<Connection>) {
        conn.default_handle_write();
    }

    fn on_error(&self, conn: &Arc<Connection>) {
        conn.default_handle_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    #[test]
    fn default_config_matches_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.max_request_size, 1024 * 1024);
    }

    #[test]
    fn stop_before_start_is_a_noop() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let pool = Arc::new(ThreadPool::new(PoolConfig {
            core_threads: 1,
            ..PoolConfig::default()
        }));
        let server = Arc::new(Server::new(ServerConfig::default(), reactor, pool));

        assert!(!server.is_running());
        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn start_binds_an_ephemeral_port() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let pool = Arc::new(ThreadPool::new(PoolConfig {
            core_threads: 1,
            ..PoolConfig::default()
        }));
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let server = Arc::new(Server::new(config, reactor, pool));

        server.start().unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        server.stop();
    }
}
