use crate::error::{CommError, CommResult};
use crate::event::{
    ConnectionHandlerFactory, DispatchHandlerRef, SharedHandlerFactory,
};
use crate::handler_map::HandlerMap;
use crate::io_handler::{IoHandler, PendingResponse};
use crate::logmsg;
use crate::reactor::{run_reactor, ExpireTimer, Reactor, TimerAction};
use crate::wire::{CommBuf, FLAG_IGNORE_RESPONSE, FLAG_REQUEST};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

//====================================================================================
//            CommConfig
//====================================================================================

/// Engine tuning knobs. `Default` is suitable for production use.
#[derive(Debug, Clone)]
pub struct CommConfig {
    /// Number of I/O reactor threads. Timers get one dedicated extra thread.
    pub reactor_count: usize,
    /// Test hook: sleep this long between poll wakeup and event dispatch.
    pub dispatch_delay: Option<Duration>,
    /// Stamp inbound messages with their arrival `Instant`.
    pub timestamp_events: bool,
    /// Compute and verify payload checksums on framed messages.
    pub checksums: bool,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            reactor_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2),
            dispatch_delay: None,
            timestamp_events: false,
            checksums: true,
        }
    }
}

//====================================================================================
//            EngineShared
//====================================================================================

/// State shared by the facade and every reactor thread. No globals: independent
/// `Comm` instances in one process never see each other.
pub(crate) struct EngineShared {
    pub(crate) cfg: CommConfig,
    pub(crate) map: Arc<HandlerMap>,
    workers: Vec<Arc<Reactor>>,
    /// dedicated reactor for application timers; never polls sockets.
    timer_reactor: Arc<Reactor>,
    rr: AtomicUsize,
    shutdown: AtomicBool,
}

impl EngineShared {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Round-robin assignment of new sockets to reactor threads.
    pub(crate) fn next_reactor(&self) -> Arc<Reactor> {
        let idx = self.rr.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Arc::clone(&self.workers[idx])
    }
}

//====================================================================================
//            Comm
//====================================================================================

/// The engine facade: owns the reactor threads and exposes every operation the
/// application calls. All methods are callable from any thread.
pub struct Comm {
    shared: Arc<EngineShared>,
    threads: Vec<JoinHandle<()>>,
    request_id: AtomicU32,
    destroyed: AtomicBool,
}

impl Comm {
    pub fn new() -> CommResult<Self> {
        Self::with_config(CommConfig::default())
    }

    pub fn with_config(cfg: CommConfig) -> CommResult<Self> {
        let count = cfg.reactor_count.max(1);
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            workers.push(Reactor::new(format!("io-{}", i))?);
        }
        let timer_reactor = Reactor::new("timer".to_owned())?;
        let shared = Arc::new(EngineShared {
            cfg,
            map: HandlerMap::new(),
            workers,
            timer_reactor,
            rr: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let mut threads = Vec::with_capacity(count + 1);
        for reactor in shared
            .workers
            .iter()
            .chain(std::iter::once(&shared.timer_reactor))
        {
            let reactor = Arc::clone(reactor);
            let shared2 = Arc::clone(&shared);
            let name = format!("comm-{}", reactor.name);
            threads.push(
                std::thread::Builder::new()
                    .name(name)
                    .spawn(move || run_reactor(reactor, shared2))
                    .map_err(CommError::ThreadError)?,
            );
        }
        logmsg!("comm engine started with {} reactor threads", count);
        Ok(Self {
            shared,
            threads,
            request_id: AtomicU32::new(1),
            destroyed: AtomicBool::new(false),
        })
    }

    fn check_running(&self) -> CommResult<()> {
        if self.shared.is_shutdown() {
            Err(CommError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Unique nonzero request id; wraps around and skips zero.
    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    //------------------------------ connections ------------------------------

    /// Begin a nonblocking connect to `addr`. `Established` (or a terminal error
    /// event) is delivered to `handler` when the connect resolves.
    pub fn connect(&self, addr: SocketAddr, handler: DispatchHandlerRef) -> CommResult<()> {
        self.connect_impl(addr, None, handler)
    }

    /// Like `connect`, but binds the local end to `local` first.
    pub fn connect_with_local(
        &self,
        addr: SocketAddr,
        local: SocketAddr,
        handler: DispatchHandlerRef,
    ) -> CommResult<()> {
        self.connect_impl(addr, Some(local), handler)
    }

    fn connect_impl(
        &self,
        addr: SocketAddr,
        local: Option<SocketAddr>,
        handler: DispatchHandlerRef,
    ) -> CommResult<()> {
        self.check_running()?;
        if self.shared.map.contains_data(&addr) {
            return Err(CommError::AlreadyConnected(addr));
        }
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(CommError::SocketError)?;
        sock.set_nonblocking(true).map_err(CommError::SocketError)?;
        sock.set_nodelay(true).map_err(CommError::SocketError)?;
        if let Some(local) = local {
            sock.set_reuse_address(true).map_err(CommError::SocketError)?;
            sock.bind(&local.into())
                .map_err(|source| CommError::BindError { addr: local, source })?;
        }
        let connected = match sock.connect(&addr.into()) {
            Ok(()) => true,
            Err(err) if connect_in_progress(&err) => false,
            Err(source) => return Err(CommError::ConnectError { addr, source }),
        };
        let stream: TcpStream = sock.into();
        let local_addr = stream
            .local_addr()
            .unwrap_or_else(|_| unspecified_for(&addr));
        let io = IoHandler::new_data(
            stream,
            addr,
            local_addr,
            Arc::clone(&handler),
            self.shared.next_reactor(),
            connected,
        );
        self.shared.map.insert(Arc::clone(&io))?;
        if let Err(err) = io.start_polling() {
            self.shared.map.decommission_object(&io);
            io.shutdown();
            return Err(err);
        }
        if connected {
            // loopback connects can complete synchronously.
            handler.handle(crate::event::Event::Established { addr });
        }
        Ok(())
    }

    /// Listen on `addr`. Each accepted connection gets a dispatch handler from
    /// `factory` and an immediate `Established` event.
    pub fn listen(
        &self,
        addr: SocketAddr,
        factory: Arc<dyn ConnectionHandlerFactory>,
    ) -> CommResult<SocketAddr> {
        self.check_running()?;
        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(CommError::SocketError)?;
        sock.set_reuse_address(true).map_err(CommError::SocketError)?;
        sock.bind(&addr.into())
            .map_err(|source| CommError::BindError { addr, source })?;
        sock.listen(128)
            .map_err(|source| CommError::ListenError { addr, source })?;
        sock.set_nonblocking(true).map_err(CommError::SocketError)?;
        let listener: TcpListener = sock.into();
        let local = listener
            .local_addr()
            .map_err(CommError::SocketError)?;
        let dispatch = factory.make_handler();
        let io = IoHandler::new_accept(
            listener,
            local,
            factory,
            dispatch,
            self.shared.next_reactor(),
        );
        self.shared.map.insert(Arc::clone(&io))?;
        if let Err(err) = io.start_polling() {
            self.shared.map.decommission_object(&io);
            io.shutdown();
            return Err(err);
        }
        logmsg!("listening on {}", local);
        Ok(local)
    }

    /// Convenience: listen with one shared dispatch handler for every connection.
    pub fn listen_with_handler(
        &self,
        addr: SocketAddr,
        handler: DispatchHandlerRef,
    ) -> CommResult<SocketAddr> {
        self.listen(addr, Arc::new(SharedHandlerFactory(handler)))
    }

    //------------------------------ framed messaging ------------------------------

    /// Send a request over the connection to `addr`. Assigns a fresh nonzero id,
    /// and registers `response_handler` to receive exactly one of: the reply, or
    /// a timeout error when `timeout` passes or the connection dies first. A
    /// request with a zero `timeout` waits forever and receives a cancellation
    /// error if the connection dies. Returns the assigned id.
    pub fn send_request(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        mut buf: CommBuf,
        response_handler: DispatchHandlerRef,
    ) -> CommResult<u32> {
        self.check_running()?;
        let io = self.shared.map.lookup_data(&addr)?;
        let id = self.next_request_id();
        buf.header.id = id;
        buf.header.flags |= FLAG_REQUEST;
        buf.header.flags &= !FLAG_IGNORE_RESPONSE;
        buf.header.timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        self.stamp_checksum(&mut buf);
        let response = PendingResponse {
            handler: response_handler,
            timed: !timeout.is_zero(),
        };
        io.send_message(buf, Some((id, response)))?;
        if !timeout.is_zero() {
            io.reactor().add_timer(ExpireTimer {
                deadline: Instant::now() + timeout,
                action: TimerAction::RequestTimeout {
                    handler: Arc::downgrade(&io),
                    id,
                },
            });
        }
        Ok(id)
    }

    /// Fire-and-forget message: no id, no response expected.
    pub fn send_message(&self, addr: SocketAddr, mut buf: CommBuf) -> CommResult<()> {
        self.check_running()?;
        let io = self.shared.map.lookup_data(&addr)?;
        buf.header.id = 0;
        buf.header.flags &= !FLAG_REQUEST;
        self.stamp_checksum(&mut buf);
        io.send_message(buf, None)
    }

    /// Send a response to a previously received request. The caller must carry
    /// the request's id over into `buf.header.id` (echoing the request header
    /// via `CommBuf::response_for` does this).
    pub fn send_response(&self, addr: SocketAddr, mut buf: CommBuf) -> CommResult<()> {
        self.check_running()?;
        let io = self.shared.map.lookup_data(&addr)?;
        buf.header.flags &= !FLAG_REQUEST;
        self.stamp_checksum(&mut buf);
        io.send_message(buf, None)
    }

    fn stamp_checksum(&self, buf: &mut CommBuf) {
        if self.shared.cfg.checksums {
            buf.sign();
        } else {
            buf.header.checksum = 0;
        }
    }

    //------------------------------ datagrams ------------------------------

    /// Bind a UDP socket on `addr`; inbound datagrams go to `handler`.
    pub fn create_datagram_receive_socket(
        &self,
        addr: SocketAddr,
        handler: DispatchHandlerRef,
    ) -> CommResult<SocketAddr> {
        self.check_running()?;
        let sock = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(CommError::SocketError)?;
        sock.set_reuse_address(true).map_err(CommError::SocketError)?;
        sock.bind(&addr.into())
            .map_err(|source| CommError::BindError { addr, source })?;
        sock.set_nonblocking(true).map_err(CommError::SocketError)?;
        let udp: UdpSocket = sock.into();
        let local = udp.local_addr().map_err(CommError::SocketError)?;
        let io = IoHandler::new_datagram(udp, local, handler, self.shared.next_reactor());
        self.shared.map.insert(Arc::clone(&io))?;
        if let Err(err) = io.start_polling() {
            self.shared.map.decommission_object(&io);
            io.shutdown();
            return Err(err);
        }
        Ok(local)
    }

    /// Send one datagram to `dest` from the local socket bound at `from`.
    /// Datagrams share the framed header format but carry no delivery guarantees.
    pub fn send_datagram(
        &self,
        dest: SocketAddr,
        from: SocketAddr,
        mut buf: CommBuf,
    ) -> CommResult<()> {
        self.check_running()?;
        let io = self.shared.map.lookup_datagram(&from)?;
        self.stamp_checksum(&mut buf);
        io.send_datagram(dest, buf)
    }

    //------------------------------ timers ------------------------------

    /// Deliver `Event::Timer` to `handler` after `delay`. `None` wakes the timer
    /// thread and delivers nothing.
    pub fn set_timer(&self, delay: Duration, handler: Option<DispatchHandlerRef>) -> CommResult<()> {
        self.set_timer_absolute(Instant::now() + delay, handler)
    }

    pub fn set_timer_absolute(
        &self,
        deadline: Instant,
        handler: Option<DispatchHandlerRef>,
    ) -> CommResult<()> {
        self.check_running()?;
        self.shared.timer_reactor.add_timer(ExpireTimer {
            deadline,
            action: TimerAction::Dispatch(handler),
        });
        Ok(())
    }

    //------------------------------ proxies ------------------------------

    /// Bind a symbolic name to the connection at `addr`; later sends may address
    /// the name instead of the socket address.
    pub fn add_proxy(&self, name: &str, addr: SocketAddr) -> CommResult<()> {
        self.shared.map.add_proxy(name, addr)
    }

    pub fn remove_proxy(&self, name: &str) {
        self.shared.map.remove_proxy(name)
    }

    pub fn translate_proxy(&self, name: &str) -> CommResult<SocketAddr> {
        self.shared.map.translate_proxy(name)
    }

    /// Register `alias` as an additional lookup address for the connection at `addr`.
    pub fn set_alias(&self, addr: SocketAddr, alias: SocketAddr) -> CommResult<()> {
        self.shared.map.set_alias(&addr, alias)
    }

    //------------------------------ teardown ------------------------------

    /// Close the handler registered at `addr` (connection, listener or datagram
    /// socket). The close is quiet: no terminal event is delivered, and pending
    /// requests on the connection receive cancellation errors.
    pub fn close_socket(&self, addr: SocketAddr) -> CommResult<()> {
        let io = self.shared.map.decommission(&addr)?;
        io.suppress_terminal_event();
        io.shutdown();
        Ok(())
    }

    /// Block until all decommissioned handlers have been fully released.
    pub fn wait_for_empty(&self) {
        self.shared.map.wait_for_empty();
    }

    /// Orderly engine shutdown: close all sockets, stop the reactor threads and
    /// wait for them. Runs at most once; also invoked by `Drop`.
    pub fn destroy(&mut self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        for io in self.shared.map.decommission_all() {
            io.suppress_terminal_event();
            io.shutdown();
        }
        self.shared.shutdown.store(true, Ordering::Release);
        for reactor in self
            .shared
            .workers
            .iter()
            .chain(std::iter::once(&self.shared.timer_reactor))
        {
            reactor.interrupt();
        }
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                crate::logerr!("reactor thread panicked during shutdown");
            }
        }
        self.shared.map.wait_for_empty();
        debug_assert!(self.shared.map.is_idle());
        logmsg!("comm engine stopped");
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// EINPROGRESS (and the WouldBlock mapping some platforms use) means the
/// nonblocking connect was registered and completes via a writable event.
fn connect_in_progress(err: &std::io::Error) -> bool {
    if err.kind() == ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    false
}

fn unspecified_for(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
