use crate::config::{CONN_TIMEOUT, MAX_BUFFER_SIZE, READ_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::parser::Parser;
use crate::reactor::Reactor;
use crate::request::Request;
use crate::response::Response;
use crate::timer::TimerId;
use mio::net::TcpStream;
use mio::Interest;
use socket2::SockRef;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Connection lifecycle. `Disconnected` implies the socket is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Reading = 2,
    Writing = 3,
    Closing = 4,
    Disconnected = 5,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Reading,
            3 => ConnState::Writing,
            4 => ConnState::Closing,
            _ => ConnState::Disconnected,
        }
    }
}

type EventCallback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One TCP session from accept to close.
///
/// Shared as `Arc<Connection>`: the registry holds the strong reference,
/// the reactor's per-fd closure holds a `Weak` that silently discards
/// events once the registry drops the connection. All socket-facing work
/// runs on the reactor thread; the buffer mutexes exist so other threads
/// can safely query sizes and state.
pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    reactor: Arc<Reactor>,
    stream: Mutex<Option<TcpStream>>,
    state: AtomicU8,
    created_at: Instant,
    last_active: Mutex<Instant>,
    timeout: Mutex<Duration>,
    max_buffer: AtomicUsize,
    ingress: Mutex<Vec<u8>>,
    egress: Mutex<Vec<u8>>,
    parser: Mutex<Parser>,
    handler: Mutex<Option<Arc<dyn Handler>>>,
    on_read: Mutex<Option<EventCallback>>,
    on_write: Mutex<Option<EventCallback>>,
    on_close: Mutex<Option<EventCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    idle_timer: Mutex<Option<TimerId>>,
    close_after_write: AtomicBool,
}

impl Connection {
    /// Wraps an accepted socket. Reads the peer address and enables
    /// `TCP_NODELAY` and `SO_KEEPALIVE`; any failure is a
    /// [`Error::SocketSetup`]. The stream is already non-blocking.
    pub fn new(stream: TcpStream, reactor: Arc<Reactor>) -> Result<Arc<Self>> {
        let fd = stream.as_raw_fd();
        if fd < 0 {
            return Err(Error::SocketSetup("invalid socket descriptor".into()));
        }
        let peer = stream
            .peer_addr()
            .map_err(|e| Error::SocketSetup(format!("failed to get peer address: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::SocketSetup(format!("failed to set TCP_NODELAY: {e}")))?;
        // mio streams do not expose keepalive; borrow the fd for socket2.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        SockRef::from(&borrowed)
            .set_keepalive(true)
            .map_err(|e| Error::SocketSetup(format!("failed to set SO_KEEPALIVE: {e}")))?;

        let now = Instant::now();
        Ok(Arc::new(Self {
            fd,
            peer,
            reactor,
            stream: Mutex::new(Some(stream)),
            state: AtomicU8::new(ConnState::Connecting as u8),
            created_at: now,
            last_active: Mutex::new(now),
            timeout: Mutex::new(CONN_TIMEOUT),
            max_buffer: AtomicUsize::new(MAX_BUFFER_SIZE),
            ingress: Mutex::new(Vec::new()),
            egress: Mutex::new(Vec::new()),
            parser: Mutex::new(Parser::new()),
            handler: Mutex::new(None),
            on_read: Mutex::new(None),
            on_write: Mutex::new(None),
            on_close: Mutex::new(None),
            on_error: Mutex::new(None),
            idle_timer: Mutex::new(None),
            close_after_write: AtomicBool::new(false),
        }))
    }

    /// Registers with the reactor for read readiness, schedules the idle
    /// timer, and notifies the handler. Transitions Connecting → Connected.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let events = Arc::downgrade(self);
        {
            let mut guard = self.stream.lock().unwrap();
            let stream = guard.as_mut().ok_or(Error::ConnectionClosed)?;
            self.reactor.register(
                stream,
                self.fd,
                Interest::READABLE,
                Arc::new(move |readiness| {
                    if let Some(conn) = events.upgrade() {
                        conn.handle_event(readiness);
                    }
                }),
            )?;
        }

        let idle = Arc::downgrade(self);
        let period = *self.timeout.lock().unwrap();
        let timer = self.reactor.run_every(period, move || {
            if let Some(conn) = idle.upgrade() {
                conn.check_idle();
            }
        });
        *self.idle_timer.lock().unwrap() = Some(timer);

        self.set_state(ConnState::Connected);
        self.touch();

        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_connect(self);
        }
        Ok(())
    }

    /// Tears the connection down: cancels the idle timer, deregisters,
    /// shuts the socket down both ways, fires disconnect notifications,
    /// and releases buffer capacity. Idempotent.
    pub fn close(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let state = ConnState::from_u8(current);
            if state == ConnState::Closing || state == ConnState::Disconnected {
                return;
            }
            match self.state.compare_exchange(
                current,
                ConnState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let timer = self.idle_timer.lock().unwrap().take();
        if let Some(timer) = timer {
            self.reactor.cancel_timer(timer);
        }

        let stream = self.stream.lock().unwrap().take();
        if let Some(mut stream) = stream {
            self.reactor.deregister(&mut stream, self.fd);
            let _ = stream.shutdown(Shutdown::Both);
        }

        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.on_disconnect(self);
        }
        let callback = self.on_close.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }

        {
            let mut ingress = self.ingress.lock().unwrap();
            ingress.clear();
            ingress.shrink_to_fit();
        }
        {
            let mut egress = self.egress.lock().unwrap();
            egress.clear();
            egress.shrink_to_fit();
        }

        self.set_state(ConnState::Disconnected);
        debug!("connection to {} closed (fd {})", self.peer, self.fd);
    }

    /// One read of up to 4096 bytes into the ingress buffer.
    ///
    /// `Ok(0)` means the peer closed (the connection is closed before
    /// returning). `WouldBlock` passes through untouched so drain loops can
    /// stop; any other error is reported and closes the connection.
    pub fn read_data(self: &Arc<Self>) -> io::Result<usize> {
        if !matches!(
            self.state(),
            ConnState::Connected | ConnState::Reading | ConnState::Writing
        ) {
            return Err(io::ErrorKind::NotConnected.into());
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let read = {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else {
                return Err(io::ErrorKind::NotConnected.into());
            };
            stream.read(&mut chunk)
        };

        match read {
            Ok(0) => {
                self.close();
                Ok(0)
            }
            Ok(n) => {
                self.touch();
                let overflow = {
                    let mut ingress = self.ingress.lock().unwrap();
                    ingress.extend_from_slice(&chunk[..n]);
                    ingress.len() > self.max_buffer.load(Ordering::Relaxed)
                };
                if overflow {
                    self.notify_error("read buffer overflow");
                    self.close();
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        "read buffer overflow",
                    ));
                }
                if self.state() == ConnState::Connected {
                    self.set_state(ConnState::Reading);
                }
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(e),
            Err(e) => {
                self.notify_error(&format!("read error: {e}"));
                self.close();
                Err(e)
            }
        }
    }

    /// Appends to the egress buffer and arms write interest. Returns the
    /// number of bytes queued. Overflow reports an error and closes.
    pub fn write_data(self: &Arc<Self>, data: &[u8]) -> Result<usize> {
        if matches!(self.state(), ConnState::Closing | ConnState::Disconnected) {
            return Err(Error::ConnectionClosed);
        }

        let overflow = {
            let mut egress = self.egress.lock().unwrap();
            egress.extend_from_slice(data);
            egress.len() > self.max_buffer.load(Ordering::Relaxed)
        };
        if overflow {
            self.notify_error("write buffer overflow");
            self.close();
            return Err(Error::BufferOverflow("egress"));
        }

        let armed = {
            let mut guard = self.stream.lock().unwrap();
            match guard.as_mut() {
                Some(stream) => self.reactor.reregister(
                    stream,
                    self.fd,
                    Interest::READABLE | Interest::WRITABLE,
                ),
                None => return Err(Error::ConnectionClosed),
            }
        };
        if let Err(e) = armed {
            self.notify_error(&format!("failed to arm write interest: {e}"));
            self.close();
            return Err(e);
        }

        self.set_state(ConnState::Writing);
        Ok(data.len())
    }

    /// Feeds buffered ingress to the parser. Returns true when a complete
    /// request is ready for [`take_request`]. A protocol violation answers
    /// `400 Bad Request` and closes once the response drains.
    ///
    /// [`take_request`]: Connection::take_request
    pub fn try_parse_request(self: &Arc<Self>) -> bool {
        let data = {
            let mut ingress = self.ingress.lock().unwrap();
            if ingress.is_empty() {
                return false;
            }
            std::mem::take(&mut *ingress)
        };

        let outcome = self.parser.lock().unwrap().parse(&data);

        if let Some(err) = &outcome.error {
            warn!("protocol error from {}: {err}", self.peer);
            let response = Response::bad_request().with_header("Connection", "close");
            self.close_after_write.store(true, Ordering::Release);
            let _ = self.write_data(&response.to_bytes());
            return false;
        }
        outcome.is_complete()
    }

    /// Takes the parsed request once the parser reports completion.
    pub fn take_request(&self) -> Option<Request> {
        self.parser.lock().unwrap().take_request()
    }

    /// Re-arms the parser for the next message on a keep-alive socket.
    pub fn reset_parser(&self) {
        self.parser.lock().unwrap().reset();
    }

    /// Readiness entry point invoked by the reactor closure.
    pub fn handle_event(self: &Arc<Self>, readiness: crate::reactor::Readiness) {
        if readiness.error {
            self.handle_error();
            return;
        }
        if readiness.readable {
            self.handle_readable();
        }
        if readiness.writable && self.state() != ConnState::Disconnected {
            self.handle_writable();
        }
    }

    pub fn handle_readable(self: &Arc<Self>) {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler.on_readable(self),
            None => self.default_handle_read(),
        }
    }

    pub fn handle_writable(self: &Arc<Self>) {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler.on_writable(self),
            None => self.default_handle_write(),
        }
    }

    pub fn handle_error(self: &Arc<Self>) {
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler.on_error(self),
            None => self.default_handle_error(),
        }
    }

    /// Drains the socket until it would block, then runs the parser. Fires
    /// the read-complete callback when a full request arrived.
    pub fn default_handle_read(self: &Arc<Self>) {
        loop {
            match self.read_data() {
                Ok(0) => return,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return,
            }
        }
        if self.try_parse_request() {
            let callback = self.on_read.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }
        }
    }

    /// Writes as much egress as the socket accepts. When the buffer drains,
    /// write interest is dropped, the write-complete callback fires, and a
    /// pending close-after-write takes effect.
    pub fn default_handle_write(self: &Arc<Self>) {
        let mut fatal: Option<String> = None;
        let mut drained = false;
        {
            let mut guard = self.stream.lock().unwrap();
            let Some(stream) = guard.as_mut() else { return };
            let mut egress = self.egress.lock().unwrap();

            while !egress.is_empty() {
                match stream.write(&egress) {
                    Ok(0) => break,
                    Ok(n) => {
                        egress.drain(..n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        fatal = Some(format!("write error: {e}"));
                        break;
                    }
                }
            }

            if fatal.is_none() && egress.is_empty() {
                if let Err(e) = self.reactor.reregister(stream, self.fd, Interest::READABLE) {
                    fatal = Some(format!("failed to disarm write interest: {e}"));
                } else {
                    drained = true;
                }
            }
        }

        if let Some(message) = fatal {
            self.notify_error(&message);
            self.close();
            return;
        }
        if drained {
            self.set_state(ConnState::Connected);
            let callback = self.on_write.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }
            if self.close_after_write.load(Ordering::Acquire) {
                self.close();
            }
        }
    }

    pub fn default_handle_error(self: &Arc<Self>) {
        self.notify_error("socket error event");
        self.close();
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_active.lock().unwrap()
    }

    pub fn ingress_len(&self) -> usize {
        self.ingress.lock().unwrap().len()
    }

    pub fn egress_len(&self) -> usize {
        self.egress.lock().unwrap().len()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap() = timeout;
    }

    pub fn set_max_buffer_size(&self, size: usize) {
        self.max_buffer.store(size, Ordering::Relaxed);
    }

    pub fn set_handler(&self, handler: Arc<dyn Handler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn set_read_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_read.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_write_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_write.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_close_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_close.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_error.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Close once the egress buffer drains; used after the final response
    /// on non-keep-alive sockets.
    pub fn set_close_after_write(&self, close: bool) {
        self.close_after_write.store(close, Ordering::Release);
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap() = Instant::now();
    }

    fn notify_error(&self, message: &str) {
        warn!("connection error on fd {}: {message}", self.fd);
        let callback = self.on_error.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(message);
        }
    }

    /// Periodic idle check: close quiescent connections whose last
    /// activity is older than the configured timeout.
    fn check_idle(self: &Arc<Self>) {
        if !matches!(self.state(), ConnState::Connected | ConnState::Reading) {
            return;
        }
        let idle = self.last_active.lock().unwrap().elapsed();
        let timeout = *self.timeout.lock().unwrap();
        if idle > timeout && self.egress.lock().unwrap().is_empty() {
            info!("idle timeout, closing fd {}", self.fd);
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Reading,
            ConnState::Writing,
            ConnState::Closing,
            ConnState::Disconnected,
        ] {
            assert_eq!(ConnState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn unknown_state_value_maps_to_disconnected() {
        assert_eq!(ConnState::from_u8(42), ConnState::Disconnected);
    }
}
