use crate::parser::ParseError;
use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Central error type for the tarn core engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket construction or option setup failed.
    #[error("socket setup failed: {0}")]
    SocketSetup(String),

    /// Poller or wake-up descriptor construction failed.
    #[error("reactor setup failed: {0}")]
    ReactorSetup(String),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A connection buffer reached its configured limit.
    #[error("{0} buffer overflow")]
    BufferOverflow(&'static str),

    /// Operation on a connection that is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A connection with the same descriptor is already registered.
    #[error("duplicate connection for fd {0}")]
    DuplicateConnection(RawFd),

    /// The server is at its configured connection limit.
    #[error("connection limit reached")]
    ConnectionLimit,

    /// Task submitted after the pool began shutting down.
    #[error("pool shutdown")]
    PoolShutdown,

    /// The pool task queue is at capacity.
    #[error("pool queue full")]
    PoolQueueFull,

    /// A pooled task panicked before producing its result.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;
