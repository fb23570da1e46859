use crate::error::CommError;
use crate::wire::CommHeader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

//====================================================================================
//            Event, DispatchHandler
//====================================================================================

/// Everything a reactor thread hands to upper layers. Created by the reactor,
/// delivered by value to exactly one `DispatchHandler::handle` call.
#[derive(Debug)]
pub enum Event {
    /// A complete framed message arrived from `addr`.
    Message {
        addr: SocketAddr,
        header: CommHeader,
        payload: Vec<u8>,
        /// Arrival timestamp, present when `CommConfig::timestamp_events` is set.
        arrived: Option<Instant>,
    },
    /// The connection to `addr` is up (outbound connect completed, or inbound accept).
    Established { addr: SocketAddr },
    /// The connection to `addr` was lost. Exactly one terminal event per connection.
    Disconnect { addr: SocketAddr, error: CommError },
    /// A non-connection error, e.g. a request timeout or cancellation.
    Error { addr: SocketAddr, error: CommError },
    /// A timer armed via `Comm::set_timer` fired.
    Timer,
}

impl Event {
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Event::Message { addr, .. }
            | Event::Established { addr }
            | Event::Disconnect { addr, .. }
            | Event::Error { addr, .. } => Some(*addr),
            Event::Timer => None,
        }
    }
}

/// The only inbound callback contract upper layers implement. Called synchronously
/// on a reactor thread; implementations must not block.
pub trait DispatchHandler: Send + Sync {
    fn handle(&self, event: Event);
}

pub type DispatchHandlerRef = Arc<dyn DispatchHandler>;

/// Supplied to `Comm::listen`; produces one dispatch handler per accepted connection.
pub trait ConnectionHandlerFactory: Send + Sync {
    fn make_handler(&self) -> DispatchHandlerRef;
}

/// Factory returning the same handler for every accepted connection.
pub struct SharedHandlerFactory(pub DispatchHandlerRef);
impl ConnectionHandlerFactory for SharedHandlerFactory {
    fn make_handler(&self) -> DispatchHandlerRef {
        Arc::clone(&self.0)
    }
}

impl<F: Fn(Event) + Send + Sync> DispatchHandler for F {
    fn handle(&self, event: Event) {
        self(event)
    }
}
