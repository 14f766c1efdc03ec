//! Error types for the acceptor and the event loop.

use std::io;
use std::net::SocketAddrV4;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Failures that stop startup or terminate the loop.
///
/// Accept errors, registry growth failures and handler errors are contained
/// to a single connection and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    #[error("socket(): {0}")]
    SocketCreateFailed(#[source] io::Error),

    #[error("set {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("bind({addr}): {source}")]
    BindFailed {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("listen(): {0}")]
    ListenFailed(#[source] io::Error),

    #[error("poll(): {0}")]
    Poll(#[source] io::Error),

    #[error("listening socket reported error/hangup (revents {revents:#x})")]
    ListenerFailed { revents: libc::c_short },
}
