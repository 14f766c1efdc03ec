//! The poll-wait-dispatch loop.
//!
//! One thread owns the listener and every accepted connection. Each wake
//! scans the registry from slot 0: the listener drains all pending accepts
//! first, then ready connections are either handed to the handler or, on
//! error/hangup, closed without it. A removed slot is refilled by the last
//! entry and re-examined before the scan moves on.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, ServerError};
use crate::handler::{ConnectionHandler, Disposition};
use crate::registry::{LISTENER_SLOT, PushRefused, Pushed, Registry};
use crate::signal::AbortFlag;
use crate::stats::LoopStats;

/// Upper bound on how long a stop request goes unnoticed with no traffic.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Registry entries added per reallocation.
pub const DEFAULT_GROWTH_STEP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub poll_timeout: Duration,
    pub growth_step: usize,
    /// Accepted connections beyond this many are closed right away.
    pub max_connections: Option<usize>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            growth_step: DEFAULT_GROWTH_STEP,
            max_connections: None,
        }
    }
}

/// Why the loop returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The abort flag was raised.
    Aborted,
    /// A handler returned [`Disposition::Shutdown`].
    HandlerRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Readable,
    Hangup,
}

impl Readiness {
    /// Error and hangup take precedence over readable data: a reset peer
    /// reports `POLLIN` too, but there is nothing for a handler to do.
    fn from_revents(revents: libc::c_short) -> Option<Self> {
        if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            Some(Self::Hangup)
        } else if revents & libc::POLLIN != 0 {
            Some(Self::Readable)
        } else {
            None
        }
    }
}

/// Source of accepted connections for the drain.
trait Accept {
    type Conn: AsRawFd;

    fn accept_conn(&self) -> io::Result<Self::Conn>;
}

impl Accept for TcpListener {
    type Conn = TcpStream;

    fn accept_conn(&self) -> io::Result<TcpStream> {
        self.accept().map(|(conn, peer)| {
            debug!(fd = conn.as_raw_fd(), %peer, "accepted connection");
            conn
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    /// No more pending connections.
    Exhausted,
    AcceptError,
    /// The registry was full and could not take the connection.
    Refused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Drain {
    accepted: usize,
    end: DrainEnd,
}

/// Accept until the listener has nothing pending or an error ends the burst.
fn drain_accepts<A: Accept>(
    acceptor: &A,
    registry: &mut Registry<A::Conn>,
    stats: &LoopStats,
) -> Drain {
    let mut accepted = 0;
    loop {
        let conn = match acceptor.accept_conn() {
            Ok(conn) => conn,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Drain {
                    accepted,
                    end: DrainEnd::Exhausted,
                };
            }
            Err(e) => {
                warn!(error = %e, "accept() failed, ending burst");
                stats.record_accept_error();
                return Drain {
                    accepted,
                    end: DrainEnd::AcceptError,
                };
            }
        };

        match registry.try_push(conn) {
            Ok(Pushed::InPlace) => {}
            Ok(Pushed::Grew { capacity }) => {
                info!(capacity, "registry reallocated");
            }
            Err(failed) => {
                match failed.reason {
                    PushRefused::LimitReached(max) => warn!(
                        fd = failed.conn.as_raw_fd(),
                        max,
                        "connection limit reached, closing incoming connection"
                    ),
                    PushRefused::OutOfMemory(ref e) => error!(
                        fd = failed.conn.as_raw_fd(),
                        error = %e,
                        "no memory for incoming connection, closing it"
                    ),
                }
                stats.record_refused();
                drop(failed.conn);
                return Drain {
                    accepted,
                    end: DrainEnd::Refused,
                };
            }
        }
        accepted += 1;
        stats.record_accept();
    }
}

/// Event loop over one listening socket.
///
/// ```no_run
/// use std::io::Write;
/// use std::net::TcpStream;
/// use tcp_server::{Disposition, Server, init_listen_server};
///
/// let listener = init_listen_server("127.0.0.1", 8080)?;
/// Server::new(listener, |mut conn: TcpStream| -> std::io::Result<Disposition> {
///     conn.write_all(b"bye\n")?;
///     Ok(Disposition::Close)
/// })
/// .run()?;
/// # Ok::<(), tcp_server::ServerError>(())
/// ```
pub struct Server<H> {
    listener: TcpListener,
    handler: H,
    config: LoopConfig,
    abort: AbortFlag,
    stats: Arc<LoopStats>,
}

impl<H: ConnectionHandler> Server<H> {
    /// Loop with the default config, stopped by the process abort flag.
    pub fn new(listener: TcpListener, handler: H) -> Self {
        Self {
            listener,
            handler,
            config: LoopConfig::default(),
            abort: AbortFlag::process(),
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_abort_flag(mut self, abort: AbortFlag) -> Self {
        self.abort = abort;
        self
    }

    /// Counters shared with the running loop.
    pub fn stats(&self) -> Arc<LoopStats> {
        Arc::clone(&self.stats)
    }

    /// Run until stopped. Every connection still registered is closed and
    /// the listener is closed before this returns.
    pub fn run(mut self) -> Result<StopReason> {
        let mut registry = Registry::new(self.listener.as_raw_fd(), self.config.growth_step)
            .with_connection_limit(self.config.max_connections);
        self.stats.set_registry(0, registry.capacity());
        info!(
            fd = self.listener.as_raw_fd(),
            poll_timeout_ms = self.config.poll_timeout.as_millis() as u64,
            growth_step = registry.growth_step(),
            "server loop started"
        );

        let outcome = self.serve(&mut registry);

        let closed = registry.close_all();
        self.stats.set_registry(0, registry.capacity());
        let stats = self.stats.snapshot();
        match &outcome {
            Ok(reason) => info!(?reason, closed, ?stats, "server loop stopped"),
            Err(e) => error!(error = %e, closed, ?stats, "server loop failed"),
        }
        outcome
    }

    fn serve(&mut self, registry: &mut Registry<TcpStream>) -> Result<StopReason> {
        loop {
            if self.abort.is_raised() {
                return Ok(StopReason::Aborted);
            }

            match registry.wait(self.config.poll_timeout) {
                Ok(0) => continue,
                Ok(ready) => trace!(ready, "poll wake"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "poll() failed");
                    return Err(ServerError::Poll(e));
                }
            }

            let stop = self.dispatch(registry)?;
            self.stats
                .set_registry(registry.connections(), registry.capacity());
            if let Some(reason) = stop {
                return Ok(reason);
            }
        }
    }

    fn dispatch(&mut self, registry: &mut Registry<TcpStream>) -> Result<Option<StopReason>> {
        let mut stop = None;
        let mut slot = LISTENER_SLOT;

        while let Some(revents) = registry.revents(slot) {
            let Some(readiness) = Readiness::from_revents(revents) else {
                slot += 1;
                continue;
            };

            if slot == LISTENER_SLOT {
                if readiness == Readiness::Hangup {
                    error!(revents, "listening socket error/hangup");
                    self.abort.raise();
                    return Err(ServerError::ListenerFailed { revents });
                }
                let drain = drain_accepts(&self.listener, registry, &self.stats);
                trace!(accepted = drain.accepted, end = ?drain.end, "accept burst");
                slot += 1;
                continue;
            }

            // The slot now holds the former last entry; do not advance.
            let Some(conn) = registry.swap_remove(slot) else {
                break;
            };
            let fd = conn.as_raw_fd();

            match readiness {
                Readiness::Hangup => {
                    debug!(fd, revents, "connection error/hangup, closing");
                    self.stats.record_hangup();
                    drop(conn);
                }
                Readiness::Readable => {
                    self.stats.record_dispatch();
                    match self.handler.handle(conn) {
                        Ok(Disposition::Close) => debug!(fd, "connection handled"),
                        Ok(Disposition::Shutdown) => {
                            info!(fd, "handler requested shutdown");
                            stop = Some(StopReason::HandlerRequested);
                        }
                        Err(e) => {
                            warn!(fd, error = %e, "handler failed");
                            self.stats.record_handler_error();
                        }
                    }
                }
            }
        }

        Ok(stop)
    }
}

/// Run the loop on `listener` until SIGINT (see
/// [`install_signal_handlers`](crate::install_signal_handlers)), a handler
/// asks to stop, or an unrecoverable error.
pub fn start_server_loop<H: ConnectionHandler>(
    listener: TcpListener,
    handler: H,
) -> Result<StopReason> {
    Server::new(listener, handler).run()
}
