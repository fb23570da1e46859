use std::net::SocketAddr;

/// Transport error taxonomy. None of these are fatal to the process: setup errors
/// are returned to the caller's thread, per-event I/O errors travel inside
/// `Event::Error`/`Event::Disconnect` and are fatal only to the affected connection.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("socket creation failed: {0}")]
    SocketError(#[source] std::io::Error),
    #[error("bind {addr} failed: {source}")]
    BindError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listen on {addr} failed: {source}")]
    ListenError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("connect to {addr} failed: {source}")]
    ConnectError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("already connected to {0}")]
    AlreadyConnected(SocketAddr),
    #[error("not connected to {0}")]
    NotConnected(SocketAddr),
    #[error("unknown proxy name: {0}")]
    InvalidProxy(String),
    #[error("send failed: {0}")]
    SendError(#[source] std::io::Error),
    #[error("receive failed: {0}")]
    ReceiveError(#[source] std::io::Error),
    #[error("connection broken")]
    BrokenConnection,
    #[error("polling subsystem error: {0}")]
    PollError(#[source] std::io::Error),
    #[error("spawning reactor thread failed: {0}")]
    ThreadError(#[source] std::io::Error),
    #[error("bad message header: {0}")]
    BadHeader(&'static str),
    #[error("request {id} timed out")]
    RequestTimeout { id: u32 },
    #[error("request {id} cancelled")]
    Cancelled { id: u32 },
    #[error("transport is shut down")]
    Shutdown,
}

pub type CommResult<T> = Result<T, CommError>;
