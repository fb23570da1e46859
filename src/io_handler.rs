use crate::comm::EngineShared;
use crate::dbglog;
use crate::error::{CommError, CommResult};
use crate::event::{ConnectionHandlerFactory, DispatchHandlerRef, Event};
use crate::logerr;
use crate::logmsg;
use crate::reactor::Reactor;
use crate::wire::{fletcher32, CommBuf, CommHeader, COMM_HEADER_LEN};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Handler token before registration with a reactor.
pub(crate) const INVALID_TOKEN: usize = usize::MAX;

/// Send/receive buffer size applied to accepted sockets.
const SOCKET_BUF_SIZE: usize = 4 * 32768;

//====================================================================================
//            FrameReader
//====================================================================================

pub(crate) enum ReadOutcome {
    /// No more data available now; wait for the next readable event.
    NeedMore,
    /// Orderly peer close (read returned 0).
    Closed,
    /// Unrecoverable I/O error.
    Failed(std::io::Error),
    /// Header or checksum is bad; the stream can't be re-synchronized.
    Corrupt(CommError),
}

/// Inbound framing state machine: read a fixed-size header, then a payload of
/// `total_len - header_len` bytes, emit the frame and start over. Survives any
/// partial-read split because byte counts are tracked across calls.
pub(crate) struct FrameReader {
    hdr: [u8; COMM_HEADER_LEN],
    hdr_got: usize,
    header: Option<CommHeader>,
    /// extra header bytes (header_len beyond ours) followed by the payload.
    body: Vec<u8>,
    body_got: usize,
}

impl FrameReader {
    pub(crate) fn new() -> Self {
        Self {
            hdr: [0u8; COMM_HEADER_LEN],
            hdr_got: 0,
            header: None,
            body: Vec::new(),
            body_got: 0,
        }
    }

    /// Read as many complete frames as the socket yields, pushing them to `out`.
    pub(crate) fn read_frames(
        &mut self,
        sock: &mut impl Read,
        out: &mut Vec<(CommHeader, Vec<u8>)>,
    ) -> ReadOutcome {
        loop {
            if self.header.is_none() {
                while self.hdr_got < COMM_HEADER_LEN {
                    match sock.read(&mut self.hdr[self.hdr_got..]) {
                        Ok(0) => return ReadOutcome::Closed,
                        Ok(n) => self.hdr_got += n,
                        Err(err) => match err.kind() {
                            ErrorKind::WouldBlock => return ReadOutcome::NeedMore,
                            ErrorKind::Interrupted => continue,
                            _ => return ReadOutcome::Failed(err),
                        },
                    }
                }
                let header = match CommHeader::decode(&self.hdr) {
                    Ok(h) => h,
                    Err(err) => return ReadOutcome::Corrupt(err),
                };
                let extra = header.header_len as usize - COMM_HEADER_LEN;
                self.body = vec![0u8; extra + header.payload_len()];
                self.body_got = 0;
                self.header = Some(header);
            }
            while self.body_got < self.body.len() {
                match sock.read(&mut self.body[self.body_got..]) {
                    Ok(0) => return ReadOutcome::Closed,
                    Ok(n) => self.body_got += n,
                    Err(err) => match err.kind() {
                        ErrorKind::WouldBlock => return ReadOutcome::NeedMore,
                        ErrorKind::Interrupted => continue,
                        _ => return ReadOutcome::Failed(err),
                    },
                }
            }
            // full frame.
            let header = self.header.take().unwrap();
            let extra = header.header_len as usize - COMM_HEADER_LEN;
            let mut body = std::mem::take(&mut self.body);
            let payload = body.split_off(extra);
            self.hdr_got = 0;
            self.body_got = 0;
            if header.checksum != 0 && fletcher32(&payload) != header.checksum {
                return ReadOutcome::Corrupt(CommError::BadHeader("payload checksum mismatch"));
            }
            out.push((header, payload));
        }
    }
}

//====================================================================================
//            SendQueue
//====================================================================================

pub(crate) enum FlushResult {
    /// Queue fully drained.
    Done,
    /// Bytes remain queued; write interest should stay on.
    Pending,
    /// Unrecoverable write error; connection must be torn down.
    Broken(std::io::Error),
}

/// FIFO of outbound buffers. Only the head is ever partially sent, so enqueue
/// order is wire order.
pub(crate) struct SendQueue {
    queue: VecDeque<CommBuf>,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Append a frozen buffer and immediately try to drain.
    pub(crate) fn enqueue(&mut self, sock: &mut impl Write, buf: CommBuf) -> FlushResult {
        self.queue.push_back(buf);
        self.flush(sock)
    }

    pub(crate) fn flush(&mut self, sock: &mut impl Write) -> FlushResult {
        while let Some(front) = self.queue.front_mut() {
            match front.write_to(sock) {
                Ok(true) => {
                    self.queue.pop_front();
                }
                Ok(false) => {} // short write; retry until WouldBlock.
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return FlushResult::Pending,
                    ErrorKind::Interrupted => {}
                    _ => return FlushResult::Broken(err),
                },
            }
        }
        FlushResult::Done
    }
}

/// UDP variant: each queued buffer carries its own destination and is sent whole.
pub(crate) struct DatagramQueue {
    queue: VecDeque<(SocketAddr, Vec<u8>)>,
}

impl DatagramQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }
    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
    pub(crate) fn enqueue(
        &mut self,
        sock: &UdpSocket,
        dest: SocketAddr,
        wire: Vec<u8>,
    ) -> FlushResult {
        self.queue.push_back((dest, wire));
        self.flush(sock)
    }
    pub(crate) fn flush(&mut self, sock: &UdpSocket) -> FlushResult {
        while let Some((dest, wire)) = self.queue.front() {
            match sock.send_to(wire, dest) {
                Ok(_) => {
                    self.queue.pop_front();
                }
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => return FlushResult::Pending,
                    ErrorKind::Interrupted => {}
                    _ => return FlushResult::Broken(err),
                },
            }
        }
        FlushResult::Done
    }
}

//====================================================================================
//            IoHandler
//====================================================================================

pub(crate) struct AcceptState {
    pub(crate) sock: TcpListener,
    factory: Arc<dyn ConnectionHandlerFactory>,
}

/// A registered response handler plus whether the request carried a deadline.
/// When a connection fails before ever establishing, teardown reports timed
/// requests as timed out (the request was never written, so the caller's
/// deadline is the contract that was broken); open-ended requests and requests
/// on an established connection are reported as cancelled.
pub(crate) struct PendingResponse {
    pub(crate) handler: DispatchHandlerRef,
    pub(crate) timed: bool,
}

pub(crate) struct DataState {
    pub(crate) sock: TcpStream,
    reader: FrameReader,
    sendq: SendQueue,
    /// request id -> response handler for in-flight requests on this connection.
    pending: HashMap<u32, PendingResponse>,
    interested_writable: bool,
    connected: bool,
}

pub(crate) struct DatagramState {
    pub(crate) sock: UdpSocket,
    sendq: DatagramQueue,
    interested_writable: bool,
}

pub(crate) enum HandlerKind {
    Accept(AcceptState),
    Data(Mutex<DataState>),
    Datagram(Mutex<DatagramState>),
}

/// Tag used by the registry to pick the right address map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerTag {
    Accept,
    Data,
    Datagram,
}

/// One registered socket: listening, connected-stream, or datagram. Shared via
/// `Arc` by the handler map, the owning reactor's live set and any in-flight
/// send path; the object is freed when the last of those drops it, so a handler
/// "removed" mid-dispatch can never be a use-after-free.
pub(crate) struct IoHandler {
    /// remote address for data handlers; local bind address for accept/datagram.
    peer: SocketAddr,
    local: SocketAddr,
    proxy: Mutex<Option<String>>,
    dispatch: DispatchHandlerRef,
    reactor: Arc<Reactor>,
    token: AtomicUsize,
    decommissioned: AtomicBool,
    shut: AtomicBool,
    removal_scheduled: AtomicBool,
    terminal_sent: AtomicBool,
    kind: HandlerKind,
}

type Delivery = (DispatchHandlerRef, Event);

impl IoHandler {
    pub(crate) fn new_accept(
        sock: TcpListener,
        local: SocketAddr,
        factory: Arc<dyn ConnectionHandlerFactory>,
        dispatch: DispatchHandlerRef,
        reactor: Arc<Reactor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer: local,
            local,
            proxy: Mutex::new(None),
            dispatch,
            reactor,
            token: AtomicUsize::new(INVALID_TOKEN),
            decommissioned: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            removal_scheduled: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            kind: HandlerKind::Accept(AcceptState { sock, factory }),
        })
    }

    pub(crate) fn new_data(
        sock: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        dispatch: DispatchHandlerRef,
        reactor: Arc<Reactor>,
        connected: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            local,
            proxy: Mutex::new(None),
            dispatch,
            reactor,
            token: AtomicUsize::new(INVALID_TOKEN),
            decommissioned: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            removal_scheduled: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            kind: HandlerKind::Data(Mutex::new(DataState {
                sock,
                reader: FrameReader::new(),
                sendq: SendQueue::new(),
                pending: HashMap::new(),
                // a connect in progress starts with write interest on; writable
                // readiness is the completion signal.
                interested_writable: !connected,
                connected,
            })),
        })
    }

    pub(crate) fn new_datagram(
        sock: UdpSocket,
        local: SocketAddr,
        dispatch: DispatchHandlerRef,
        reactor: Arc<Reactor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer: local,
            local,
            proxy: Mutex::new(None),
            dispatch,
            reactor,
            token: AtomicUsize::new(INVALID_TOKEN),
            decommissioned: AtomicBool::new(false),
            shut: AtomicBool::new(false),
            removal_scheduled: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            kind: HandlerKind::Datagram(Mutex::new(DatagramState {
                sock,
                sendq: DatagramQueue::new(),
                interested_writable: false,
            })),
        })
    }

    pub(crate) fn tag(&self) -> HandlerTag {
        match self.kind {
            HandlerKind::Accept(_) => HandlerTag::Accept,
            HandlerKind::Data(_) => HandlerTag::Data,
            HandlerKind::Datagram(_) => HandlerTag::Datagram,
        }
    }
    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }
    pub(crate) fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }
    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }
    pub(crate) fn proxy(&self) -> Option<String> {
        self.proxy.lock().unwrap().clone()
    }
    pub(crate) fn set_proxy(&self, name: &str) {
        *self.proxy.lock().unwrap() = Some(name.to_owned());
    }

    pub(crate) fn mark_decommissioned(&self) {
        self.decommissioned.store(true, Ordering::Release);
    }
    pub(crate) fn is_decommissioned(&self) -> bool {
        self.decommissioned.load(Ordering::Acquire)
    }
    /// returns the previous value; the first caller wins the right to enqueue.
    pub(crate) fn mark_removal_scheduled(&self) -> bool {
        self.removal_scheduled.swap(true, Ordering::AcqRel)
    }
    pub(crate) fn is_removal_scheduled(&self) -> bool {
        self.removal_scheduled.load(Ordering::Acquire)
    }

    /// Stop all further I/O and hand the handler to its reactor for deferred
    /// teardown. Safe to call from any thread, idempotent.
    pub(crate) fn shutdown(self: &Arc<Self>) {
        self.shut.store(true, Ordering::Release);
        self.reactor.schedule_removal(Arc::clone(self));
    }
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    /// Application-initiated closes are quiet: claim the terminal-event slot so
    /// the teardown path delivers nothing.
    pub(crate) fn suppress_terminal_event(&self) {
        self.terminal_sent.store(true, Ordering::Release);
    }

    //------------------------------ registration ------------------------------

    /// Insert into the owning reactor's live set and register OS poll interest.
    pub(crate) fn start_polling(self: &Arc<Self>) -> CommResult<()> {
        let token = self.reactor.alloc_token(Arc::clone(self));
        self.token.store(token, Ordering::Release);
        let res = match &self.kind {
            HandlerKind::Accept(st) => self
                .reactor
                .add_poll_interest(&st.sock, polling::Event::readable(token)),
            HandlerKind::Data(m) => {
                let st = m.lock().unwrap();
                let interest = if st.connected {
                    polling::Event::readable(token)
                } else {
                    polling::Event::all(token)
                };
                self.reactor.add_poll_interest(&st.sock, interest)
            }
            HandlerKind::Datagram(m) => {
                let st = m.lock().unwrap();
                self.reactor
                    .add_poll_interest(&st.sock, polling::Event::readable(token))
            }
        };
        if res.is_err() {
            self.reactor.free_token(token);
            self.token.store(INVALID_TOKEN, Ordering::Release);
        }
        res
    }

    /// Unregister the descriptor from the reactor's poller. Part of the final
    /// cleanup pass; the socket itself closes when the last Arc drops.
    pub(crate) fn detach_poll(&self) {
        let res = match &self.kind {
            HandlerKind::Accept(st) => self.reactor.remove_poll_interest(&st.sock),
            HandlerKind::Data(m) => {
                let st = m.lock().unwrap();
                self.reactor.remove_poll_interest(&st.sock)
            }
            HandlerKind::Datagram(m) => {
                let st = m.lock().unwrap();
                self.reactor.remove_poll_interest(&st.sock)
            }
        };
        if let Err(err) = res {
            dbglog!("detach_poll on {}: {}", self.peer, err);
        }
    }

    //------------------------------ send paths ------------------------------

    /// Stamp-complete buffer goes onto the connection's FIFO. When `pending` names
    /// a response handler it is registered under the same lock as the enqueue, so
    /// a reply can never arrive before the registration is visible.
    pub(crate) fn send_message(
        self: &Arc<Self>,
        mut buf: CommBuf,
        pending: Option<(u32, PendingResponse)>,
    ) -> CommResult<()> {
        let m = match &self.kind {
            HandlerKind::Data(m) => m,
            _ => return Err(CommError::NotConnected(self.peer)),
        };
        if self.is_shutdown() || self.is_decommissioned() {
            return Err(CommError::NotConnected(self.peer));
        }
        buf.freeze();
        let mut st = m.lock().unwrap();
        if let Some((id, response)) = pending {
            st.pending.insert(id, response);
        }
        let result = if st.connected {
            let DataState {
                ref mut sock,
                ref mut sendq,
                ..
            } = *st;
            sendq.enqueue(sock, buf)
        } else {
            // connect still in progress: queue; the writable completion flushes.
            let DataState { ref mut sendq, .. } = *st;
            sendq.queue.push_back(buf);
            FlushResult::Pending
        };
        match result {
            FlushResult::Broken(err) => {
                drop(st);
                self.shutdown();
                Err(CommError::SendError(err))
            }
            _ => {
                self.update_write_interest(&mut st);
                Ok(())
            }
        }
    }

    pub(crate) fn send_datagram(self: &Arc<Self>, dest: SocketAddr, mut buf: CommBuf) -> CommResult<()> {
        let m = match &self.kind {
            HandlerKind::Datagram(m) => m,
            _ => return Err(CommError::NotConnected(self.peer)),
        };
        if self.is_shutdown() || self.is_decommissioned() {
            return Err(CommError::NotConnected(self.local));
        }
        buf.freeze();
        let mut st = m.lock().unwrap();
        let DatagramState {
            ref sock,
            ref mut sendq,
            ..
        } = *st;
        match sendq.enqueue(sock, dest, buf.to_datagram()) {
            FlushResult::Broken(err) => {
                drop(st);
                self.shutdown();
                Err(CommError::SendError(err))
            }
            _ => {
                self.update_datagram_write_interest(&mut st);
                Ok(())
            }
        }
    }

    /// Remove the response handler registered for `id`, if still pending.
    /// Used by the reply path and the timeout path; whichever runs first wins,
    /// which is what makes the timeout delivery exactly-once.
    pub(crate) fn take_pending(&self, id: u32) -> Option<DispatchHandlerRef> {
        match &self.kind {
            HandlerKind::Data(m) => m.lock().unwrap().pending.remove(&id).map(|p| p.handler),
            _ => None,
        }
    }

    /// Drain all pending response handlers on teardown. On a connection that
    /// never established, requests that carried a deadline are reported as timed
    /// out; everything else is reported as cancelled. Called by the reactor's
    /// cleanup pass.
    pub(crate) fn cancel_requests(&self) {
        let (connected, drained): (bool, Vec<(u32, PendingResponse)>) = match &self.kind {
            HandlerKind::Data(m) => {
                let mut st = m.lock().unwrap();
                (st.connected, st.pending.drain().collect())
            }
            _ => return,
        };
        for (id, response) in drained {
            let error = if response.timed && !connected {
                CommError::RequestTimeout { id }
            } else {
                CommError::Cancelled { id }
            };
            response.handler.handle(Event::Error {
                addr: self.peer,
                error,
            });
        }
    }

    //------------------------------ event dispatch ------------------------------

    /// Called by the owning reactor's runner on readiness. Returns true when the
    /// handler should be scheduled for removal; deletion never happens here.
    pub(crate) fn handle_event(
        self: &Arc<Self>,
        ev: &polling::Event,
        shared: &EngineShared,
    ) -> bool {
        if self.is_shutdown() {
            return true;
        }
        match &self.kind {
            HandlerKind::Accept(st) => {
                self.handle_accept_event(st, shared);
                // a listening socket is torn down only by explicit close_socket.
                false
            }
            HandlerKind::Data(m) => self.handle_data_event(m, ev, shared),
            HandlerKind::Datagram(m) => self.handle_datagram_event(m, ev, shared),
        }
    }

    fn handle_accept_event(self: &Arc<Self>, st: &AcceptState, shared: &EngineShared) {
        loop {
            let (sock, peer) = match st.sock.accept() {
                Ok(pair) => pair,
                Err(err) => {
                    match err.kind() {
                        ErrorKind::WouldBlock => {}
                        ErrorKind::Interrupted => continue,
                        _ => {
                            logerr!("accept on {} failed: {}", self.local, err);
                        }
                    }
                    return;
                }
            };
            if let Err(err) = configure_accepted(&sock) {
                logerr!("configuring accepted sock from {} failed: {}", peer, err);
                continue;
            }
            let local = sock.local_addr().unwrap_or(self.local);
            let dispatch = st.factory.make_handler();
            let reactor = shared.next_reactor();
            let handler = IoHandler::new_data(
                sock,
                peer,
                local,
                Arc::clone(&dispatch),
                reactor,
                true,
            );
            if let Err(err) = shared.map.insert(Arc::clone(&handler)) {
                logerr!("rejecting connection from {}: {}", peer, err);
                continue; // sock drops and closes.
            }
            if let Err(err) = handler.start_polling() {
                logerr!("start_polling for {} failed: {}", peer, err);
                shared.map.decommission_object(&handler);
                continue;
            }
            logmsg!("accepted connection from {}", peer);
            dispatch.handle(Event::Established { addr: peer });
        }
    }

    fn handle_data_event(
        self: &Arc<Self>,
        m: &Mutex<DataState>,
        ev: &polling::Event,
        shared: &EngineShared,
    ) -> bool {
        let mut deliveries: Vec<Delivery> = Vec::new();
        let mut remove = false;
        {
            let mut st = m.lock().unwrap();
            if ev.is_err().unwrap_or(false) {
                // a failed nonblocking connect also lands here; report it as such.
                let error = if st.connected {
                    CommError::BrokenConnection
                } else {
                    let source = match st.sock.take_error() {
                        Ok(Some(err)) | Err(err) => err,
                        Ok(None) => std::io::Error::new(ErrorKind::Other, "connect aborted"),
                    };
                    CommError::ConnectError {
                        addr: self.peer,
                        source,
                    }
                };
                self.push_terminal(&mut deliveries, error);
                remove = true;
            }
            if !remove && ev.writable {
                if !st.connected {
                    match st.sock.take_error() {
                        Ok(None) => {
                            st.connected = true;
                            deliveries.push((
                                Arc::clone(&self.dispatch),
                                Event::Established { addr: self.peer },
                            ));
                        }
                        Ok(Some(err)) | Err(err) => {
                            self.push_terminal(
                                &mut deliveries,
                                CommError::ConnectError {
                                    addr: self.peer,
                                    source: err,
                                },
                            );
                            remove = true;
                        }
                    }
                }
                if !remove && !st.sendq.is_empty() {
                    let DataState {
                        ref mut sock,
                        ref mut sendq,
                        ..
                    } = *st;
                    if let FlushResult::Broken(err) = sendq.flush(sock) {
                        self.push_terminal(&mut deliveries, CommError::SendError(err));
                        remove = true;
                    }
                }
            }
            if !remove && ev.readable && st.connected {
                let mut frames: Vec<(CommHeader, Vec<u8>)> = Vec::new();
                let DataState {
                    ref mut sock,
                    ref mut reader,
                    ..
                } = *st;
                let outcome = reader.read_frames(sock, &mut frames);
                let arrived = if shared.cfg.timestamp_events {
                    Some(Instant::now())
                } else {
                    None
                };
                for (header, payload) in frames {
                    // a reply to an outstanding request goes straight to the
                    // handler that traveled with send_request; everything else
                    // (including late replies to timed-out ids) goes to the
                    // connection's default target.
                    let target = if !header.is_request() && header.id != 0 {
                        st.pending
                            .remove(&header.id)
                            .map(|p| p.handler)
                            .unwrap_or_else(|| Arc::clone(&self.dispatch))
                    } else {
                        Arc::clone(&self.dispatch)
                    };
                    deliveries.push((
                        target,
                        Event::Message {
                            addr: self.peer,
                            header,
                            payload,
                            arrived,
                        },
                    ));
                }
                match outcome {
                    ReadOutcome::NeedMore => {}
                    ReadOutcome::Closed => {
                        self.push_terminal(&mut deliveries, CommError::BrokenConnection);
                        remove = true;
                    }
                    ReadOutcome::Failed(err) => {
                        self.push_terminal(&mut deliveries, CommError::ReceiveError(err));
                        remove = true;
                    }
                    ReadOutcome::Corrupt(err) => {
                        self.push_terminal(&mut deliveries, err);
                        remove = true;
                    }
                }
            }
            if !remove {
                self.update_write_interest(&mut st);
            }
        }
        for (handler, event) in deliveries {
            handler.handle(event);
        }
        remove
    }

    fn handle_datagram_event(
        self: &Arc<Self>,
        m: &Mutex<DatagramState>,
        ev: &polling::Event,
        shared: &EngineShared,
    ) -> bool {
        let mut deliveries: Vec<Delivery> = Vec::new();
        let mut remove = false;
        {
            let mut st = m.lock().unwrap();
            if ev.writable && !st.sendq.is_empty() {
                let DatagramState {
                    ref sock,
                    ref mut sendq,
                    ..
                } = *st;
                if let FlushResult::Broken(err) = sendq.flush(sock) {
                    self.push_terminal(&mut deliveries, CommError::SendError(err));
                    remove = true;
                }
            }
            if !remove && ev.readable {
                // drain every available datagram; level-triggered registration
                // makes a partial drain safe, but draining avoids extra wakeups.
                let mut dgram = [0u8; 65536];
                loop {
                    match st.sock.recv_from(&mut dgram) {
                        Ok((n, from)) => {
                            let arrived = if shared.cfg.timestamp_events {
                                Some(Instant::now())
                            } else {
                                None
                            };
                            match CommHeader::decode_datagram(&dgram[..n]) {
                                Ok((header, payload)) => {
                                    deliveries.push((
                                        Arc::clone(&self.dispatch),
                                        Event::Message {
                                            addr: from,
                                            header,
                                            payload: payload.to_vec(),
                                            arrived,
                                        },
                                    ));
                                }
                                Err(err) => {
                                    // bad datagram only poisons itself.
                                    dbglog!("dropping bad datagram from {}: {}", from, err);
                                }
                            }
                        }
                        Err(err) => match err.kind() {
                            ErrorKind::WouldBlock => break,
                            ErrorKind::Interrupted => continue,
                            _ => {
                                self.push_terminal(&mut deliveries, CommError::ReceiveError(err));
                                remove = true;
                                break;
                            }
                        },
                    }
                }
            }
            if !remove {
                self.update_datagram_write_interest(&mut st);
            }
        }
        for (handler, event) in deliveries {
            handler.handle(event);
        }
        remove
    }

    /// Deliver the single terminal event for this connection; later callers no-op.
    fn push_terminal(&self, deliveries: &mut Vec<Delivery>, error: CommError) {
        if !self.terminal_sent.swap(true, Ordering::AcqRel) {
            deliveries.push((
                Arc::clone(&self.dispatch),
                Event::Disconnect {
                    addr: self.peer,
                    error,
                },
            ));
        }
    }

    /// Keep OS write interest in sync with queue emptiness (and connect progress).
    fn update_write_interest(&self, st: &mut DataState) {
        let token = self.token();
        if token == INVALID_TOKEN {
            return;
        }
        let want = !st.connected || !st.sendq.is_empty();
        if want && !st.interested_writable {
            if self
                .reactor
                .modify_poll_interest(&st.sock, polling::Event::all(token))
                .is_ok()
            {
                st.interested_writable = true;
            }
        } else if !want && st.interested_writable {
            if self
                .reactor
                .modify_poll_interest(&st.sock, polling::Event::readable(token))
                .is_ok()
            {
                st.interested_writable = false;
            }
        }
    }

    fn update_datagram_write_interest(&self, st: &mut DatagramState) {
        let token = self.token();
        if token == INVALID_TOKEN {
            return;
        }
        let want = !st.sendq.is_empty();
        if want && !st.interested_writable {
            if self
                .reactor
                .modify_poll_interest(&st.sock, polling::Event::all(token))
                .is_ok()
            {
                st.interested_writable = true;
            }
        } else if !want && st.interested_writable {
            if self
                .reactor
                .modify_poll_interest(&st.sock, polling::Event::readable(token))
                .is_ok()
            {
                st.interested_writable = false;
            }
        }
    }
}

/// Non-blocking + TCP_NODELAY + send/recv buffer sizes on every accepted socket.
fn configure_accepted(sock: &TcpStream) -> std::io::Result<()> {
    sock.set_nonblocking(true)?;
    let sref = socket2::SockRef::from(sock);
    sref.set_nodelay(true)?;
    // buffer sizing is best effort.
    if let Err(err) = sref.set_send_buffer_size(SOCKET_BUF_SIZE) {
        dbglog!("set_send_buffer_size: {}", err);
    }
    if let Err(err) = sref.set_recv_buffer_size(SOCKET_BUF_SIZE) {
        dbglog!("set_recv_buffer_size: {}", err);
    }
    Ok(())
}
