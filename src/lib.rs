//! Nonblocking, multi-reactor network messaging engine.
//!
//! A [`Comm`] instance owns a pool of reactor threads, each running one poll
//! loop (via the `polling` crate, so epoll/kqueue/IOCP under the hood). Sockets
//! are registered with a reactor and all I/O happens on that reactor's thread;
//! applications only implement [`DispatchHandler`] and receive [`Event`]s.
//!
//! Messages are length-framed with a fixed [`CommHeader`]. Requests carry a
//! nonzero id and an optional per-request timeout; the reply, the timeout
//! error, or a cancellation is delivered to the response handler exactly once.
//! UDP datagrams share the same header format.
//!
//! ```no_run
//! use commio::{Comm, CommBuf, CommHeader, Event};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let comm = Comm::new().unwrap();
//! let addr = "127.0.0.1:15000".parse().unwrap();
//! comm.connect(addr, Arc::new(|ev: Event| println!("{:?}", ev))).unwrap();
//! // once Established arrives:
//! let buf = CommBuf::new(CommHeader::new_request(1, 0), b"ping".to_vec());
//! comm.send_request(addr, Duration::from_secs(5), buf,
//!     Arc::new(|ev: Event| println!("reply: {:?}", ev))).unwrap();
//! ```

pub mod comm;
pub mod error;
pub mod event;
pub(crate) mod flat_storage;
pub(crate) mod handler_map;
pub(crate) mod io_handler;
pub(crate) mod reactor;
pub mod utils;
pub mod wire;

pub use comm::{Comm, CommConfig};
pub use error::{CommError, CommResult};
pub use event::{
    ConnectionHandlerFactory, DispatchHandler, DispatchHandlerRef, Event, SharedHandlerFactory,
};
pub use wire::{CommBuf, CommHeader, COMM_HEADER_LEN, COMM_VERSION};
