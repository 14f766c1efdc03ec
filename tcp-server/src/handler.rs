//! Per-connection handler seam.

use std::io;
use std::net::TcpStream;

/// What the loop should do after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The connection is done; the loop keeps running.
    Close,
    /// The connection is done and the loop should stop once the current
    /// wake has been processed.
    Shutdown,
}

/// Protocol logic invoked for a read-ready connection.
///
/// The handler receives ownership of the connection. Dropping it closes the
/// socket, so nothing stays registered after `handle` returns. Handlers run
/// on the loop thread: a slow handler stalls every other connection.
pub trait ConnectionHandler {
    fn handle(&mut self, conn: TcpStream) -> io::Result<Disposition>;
}

impl<F> ConnectionHandler for F
where
    F: FnMut(TcpStream) -> io::Result<Disposition>,
{
    fn handle(&mut self, conn: TcpStream) -> io::Result<Disposition> {
        self(conn)
    }
}
