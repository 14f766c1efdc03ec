//! Single-threaded, non-blocking TCP acceptor built on `poll(2)`.
//!
//! [`init_listen_server`] creates the listening socket, [`install_signal_handlers`]
//! wires SIGINT to the process [`AbortFlag`], and [`start_server_loop`] (or a
//! configured [`Server`]) multiplexes read readiness over every accepted
//! connection, handing ready ones to a [`ConnectionHandler`].

mod error;
mod handler;
mod listener;
mod registry;
mod server;
mod signal;
mod stats;

pub use error::{Result, ServerError};
pub use handler::{ConnectionHandler, Disposition};
pub use listener::init_listen_server;
pub use server::{
    DEFAULT_GROWTH_STEP, DEFAULT_POLL_TIMEOUT, LoopConfig, Server, StopReason, start_server_loop,
};
pub use signal::{AbortFlag, SignalInstall, diagnostic_signal_count, install_signal_handlers};
pub use stats::{LoopStats, StatsSnapshot};
